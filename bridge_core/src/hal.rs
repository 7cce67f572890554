// Hardware capabilities consumed by the node runtime

use crate::error::{CheckFailure, NodeResult};
use colored::Colorize;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock {
    /// Time elapsed since the clock started
    fn now(&self) -> Duration;

    /// Block the caller for `duration`
    fn delay(&self, duration: Duration);
}

/// Host clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn delay(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Clock that only moves when told to. `delay` advances it instantly.
///
/// Clones share the same time, so a test can hold one copy while the
/// runtime owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// GPIO pin mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// Single binary status output (the board LED)
pub trait Indicator {
    /// Set pin mode
    fn set_mode(&mut self, mode: PinMode) -> NodeResult<()>;

    /// Read pin value
    fn read(&self) -> bool;

    /// Write pin value
    fn write(&mut self, high: bool) -> NodeResult<()>;

    /// Toggle pin value
    fn toggle(&mut self) -> NodeResult<()> {
        let level = self.read();
        self.write(!level)
    }
}

/// Indicator for hosts without a pin: tracks the level and traces changes.
#[derive(Debug)]
pub struct LogIndicator {
    pin: u8,
    mode: PinMode,
    level: bool,
}

impl LogIndicator {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            mode: PinMode::Input,
            level: false,
        }
    }
}

impl Indicator for LogIndicator {
    fn set_mode(&mut self, mode: PinMode) -> NodeResult<()> {
        self.mode = mode;
        tracing::debug!(pin = self.pin, ?mode, "indicator mode set");
        Ok(())
    }

    fn read(&self) -> bool {
        self.level
    }

    fn write(&mut self, high: bool) -> NodeResult<()> {
        if self.mode != PinMode::Output {
            tracing::trace!(pin = self.pin, "write to indicator not configured as output");
        }
        self.level = high;
        tracing::trace!(pin = self.pin, level = high, "indicator");
        Ok(())
    }
}

/// Indicator that records its level and toggle count; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndicator {
    level: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl MemoryIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }

    /// Number of writes (including toggles) since creation
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl Indicator for MemoryIndicator {
    fn set_mode(&mut self, _mode: PinMode) -> NodeResult<()> {
        Ok(())
    }

    fn read(&self) -> bool {
        self.level()
    }

    fn write(&mut self, high: bool) -> NodeResult<()> {
        self.level.store(high, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Diagnostic text stream (the serial console on the board)
pub trait Diagnostics {
    fn write_str(&mut self, text: &str);

    fn write_line(&mut self, text: &str) {
        self.write_str(text);
        self.write_str("\n");
    }

    /// Emit a failed check as a fatal diagnostic line
    fn report(&mut self, failure: &CheckFailure) {
        self.write_str(&failure.to_string());
    }
}

/// Diagnostic stream on stdout
#[derive(Debug, Default)]
pub struct ConsoleDiagnostics;

impl ConsoleDiagnostics {
    pub fn new() -> Self {
        Self
    }
}

impl Diagnostics for ConsoleDiagnostics {
    fn write_str(&mut self, text: &str) {
        emit(&mut io::stdout().lock(), text);
    }

    fn report(&mut self, failure: &CheckFailure) {
        self.write_str(&failure.to_string().red().to_string());
    }
}

/// Write and flush; a failing console is traced and otherwise ignored.
fn emit<W: Write>(out: &mut W, text: &str) -> bool {
    match out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        Ok(()) => true,
        Err(err) => {
            tracing::trace!(error = %err, "diagnostic stream write failed");
            false
        }
    }
}

/// Diagnostic stream captured in memory; clones share the transcript.
#[derive(Debug, Clone, Default)]
pub struct RecordingDiagnostics {
    transcript: Arc<Mutex<String>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> String {
        self.transcript.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.transcript.lock().contains(needle)
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn write_str(&mut self, text: &str) {
        self.transcript.lock().push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MwError, RetCode};

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.delay(Duration::from_millis(250));
        other.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), Duration::from_millis(300));
    }

    #[test]
    fn test_indicator_toggle() {
        let mut led = MemoryIndicator::new();
        let observer = led.clone();
        led.set_mode(PinMode::Output).unwrap();
        led.toggle().unwrap();
        assert!(observer.level());
        led.toggle().unwrap();
        assert!(!observer.level());
        assert_eq!(observer.writes(), 2);
    }

    #[test]
    fn test_recording_diagnostics_report() {
        let mut diag = RecordingDiagnostics::new();
        let observer = diag.clone();
        diag.write_str("Initializing ros");
        diag.report(&CheckFailure {
            code: RetCode::ERROR,
            line: 3,
            message: MwError::new(RetCode::ERROR, "x").message,
        });
        assert_eq!(observer.transcript(), "Initializing ros(!=1) [line 3] [x]");
    }

    struct BrokenConsole;

    impl Write for BrokenConsole {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "console gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_console_write_failure_is_absorbed() {
        assert!(!emit(&mut BrokenConsole, "Startup complete!"));

        let mut sink = Vec::new();
        assert!(emit(&mut sink, "[Looping]"));
        assert_eq!(sink, b"[Looping]");
    }
}
