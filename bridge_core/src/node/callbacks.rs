//! The node's two callbacks: periodic state publishing and the control
//! service.

use super::endpoint::{PollContext, ServiceHandler, TimerCallback};
use crate::communication::{PublisherHandle, TimerHandle};
use crate::error::NodeResult;
use crate::hal::Diagnostics;
use crate::memory::{BufferId, MessageBuffer, INT16_FIELD};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Process-wide publish counter.
///
/// Created once per process and handed to each bring-up, so it keeps
/// counting across teardown and re-initialization. Only the publish
/// callback advances it.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Current value, then advance by one
    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Timer callback publishing the counter as decimal text
pub struct StatePublisher {
    publisher: PublisherHandle,
    buffer: BufferId,
    counter: Counter,
}

impl StatePublisher {
    pub fn new(publisher: PublisherHandle, buffer: BufferId, counter: Counter) -> Self {
        Self {
            publisher,
            buffer,
            counter,
        }
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }
}

impl TimerCallback for StatePublisher {
    fn on_timer(&mut self, timer: Option<&TimerHandle>, ctx: &mut PollContext<'_>) -> NodeResult<()> {
        if timer.is_none() {
            ctx.diagnostics.write_str("_");
            return Ok(());
        }

        let message = ctx.buffers.get_mut(self.buffer)?;
        let value = self.counter.value();
        if let Err(err) = message.write_fmt(format_args!("{value}")) {
            error!(value, %err, "state message does not fit its buffer");
            return Err(err);
        }
        self.counter.advance();

        let message = ctx.buffers.get(self.buffer)?;
        ctx.diagnostics
            .write_str(&format!("^ [{}]", message.text().unwrap_or_default()));
        let published = ctx.session.publish(&self.publisher, message);
        if ctx.soft_check(published) {
            debug!(topic = %self.publisher.topic, value, "state published");
        }
        Ok(())
    }
}

/// Control service: responds with the request's int16 field minus one
#[derive(Debug, Default)]
pub struct DecrementService;

impl DecrementService {
    pub fn new() -> Self {
        Self
    }
}

impl ServiceHandler for DecrementService {
    fn handle(
        &mut self,
        request: &MessageBuffer,
        response: &mut MessageBuffer,
        diagnostics: &mut dyn Diagnostics,
    ) -> NodeResult<()> {
        diagnostics.write_str("~");
        let control = request.read_i16(INT16_FIELD)?;
        let state = control.wrapping_sub(1);
        response.write_i16(INT16_FIELD, state)?;
        diagnostics.write_str(&format!("Control/State: {control} / {state}~\n"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{MockSession, Session};
    use crate::error::NodeError;
    use crate::hal::{ManualClock, RecordingDiagnostics};
    use crate::memory::{BufferManager, MemoryConf, BASIC_TYPES_REQUEST, BASIC_TYPES_RESPONSE, STRING};
    use std::time::Duration;

    fn timer() -> TimerHandle {
        TimerHandle {
            id: 3,
            period: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_decrement() {
        let conf = MemoryConf::default();
        let mut request = MessageBuffer::standalone(&BASIC_TYPES_REQUEST, &conf);
        let mut response = MessageBuffer::standalone(&BASIC_TYPES_RESPONSE, &conf);
        let mut diag = RecordingDiagnostics::new();
        let observer = diag.clone();

        request.write_i16(INT16_FIELD, 5).unwrap();
        DecrementService::new()
            .handle(&request, &mut response, &mut diag)
            .unwrap();
        assert_eq!(response.read_i16(INT16_FIELD).unwrap(), 4);
        assert_eq!(observer.transcript(), "~Control/State: 5 / 4~\n");
    }

    #[test]
    fn test_decrement_wraps_at_minimum() {
        let conf = MemoryConf::default();
        let mut request = MessageBuffer::standalone(&BASIC_TYPES_REQUEST, &conf);
        let mut response = MessageBuffer::standalone(&BASIC_TYPES_RESPONSE, &conf);
        request.write_i16(INT16_FIELD, i16::MIN).unwrap();
        DecrementService
            .handle(&request, &mut response, &mut RecordingDiagnostics::new())
            .unwrap();
        assert_eq!(response.read_i16(INT16_FIELD).unwrap(), i16::MAX);
    }

    #[test]
    fn test_publishes_counter_text() {
        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let observer = session.clone();
        let publisher = session.init_publisher("chatter", &STRING).unwrap();
        let mut buffers = BufferManager::new(MemoryConf::default());
        let buffer = buffers.create(&STRING).unwrap();
        let mut diag = RecordingDiagnostics::new();
        let transcript = diag.clone();

        let counter = Counter::new();
        let mut callback = StatePublisher::new(publisher, buffer, counter.clone());
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);
        callback.on_timer(Some(&timer()), &mut ctx).unwrap();
        callback.on_timer(Some(&timer()), &mut ctx).unwrap();

        assert_eq!(observer.published(), vec!["0".to_string(), "1".to_string()]);
        assert_eq!(counter.value(), 2);
        assert_eq!(transcript.transcript(), "^ [0]^ [1]");
    }

    #[test]
    fn test_missing_timer_handle_is_noop() {
        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let observer = session.clone();
        let publisher = session.init_publisher("chatter", &STRING).unwrap();
        let mut buffers = BufferManager::new(MemoryConf::default());
        let buffer = buffers.create(&STRING).unwrap();
        let mut diag = RecordingDiagnostics::new();
        let transcript = diag.clone();

        let mut callback = StatePublisher::new(publisher, buffer, Counter::new());
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);
        callback.on_timer(None, &mut ctx).unwrap();

        assert!(observer.published().is_empty());
        assert_eq!(callback.counter().value(), 0);
        assert_eq!(transcript.transcript(), "_");
    }

    #[test]
    fn test_oversized_counter_refused() {
        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let observer = session.clone();
        let publisher = session.init_publisher("chatter", &STRING).unwrap();
        let mut buffers = BufferManager::new(MemoryConf {
            max_string_capacity: 1,
        });
        let buffer = buffers.create(&STRING).unwrap();
        let mut diag = RecordingDiagnostics::new();

        let counter = Counter::new();
        let mut callback = StatePublisher::new(publisher, buffer, counter.clone());
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);
        for _ in 0..10 {
            callback.on_timer(Some(&timer()), &mut ctx).unwrap();
        }
        let err = callback.on_timer(Some(&timer()), &mut ctx).unwrap_err();
        assert!(matches!(err, NodeError::BufferOverflow { needed: 2, capacity: 1 }));
        assert_eq!(counter.value(), 10);
        assert_eq!(observer.published().len(), 10);
    }
}
