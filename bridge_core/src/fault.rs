//! Terminal fault handling
//!
//! Once engaged the node is torn down and the indicator blinks at a fixed
//! cadence while the diagnostic stream repeats a fixed line. Only a process
//! restart leaves this state.

use crate::communication::Session;
use crate::config::RuntimeConfig;
use crate::error::NodeResult;
use crate::hal::{Clock, Indicator};
use crate::node::{NodeRuntime, TeardownReport};
use std::time::Duration;
use tracing::{error, warn};

pub const FAULT_LINE: &str = "error loop";

pub struct FaultController<I: Indicator> {
    indicator: I,
    interval: Duration,
    blinks: u64,
}

impl<I: Indicator> FaultController<I> {
    pub fn new(indicator: I, interval: Duration) -> Self {
        Self {
            indicator,
            interval,
            blinks: 0,
        }
    }

    pub fn from_config(indicator: I, config: &RuntimeConfig) -> Self {
        Self::new(indicator, config.fault_blink())
    }

    pub fn blinks(&self) -> u64 {
        self.blinks
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Tear the node down (a no-op if it never went live) and mark it faulted
    pub fn engage<S: Session, C: Clock>(
        &mut self,
        runtime: &mut NodeRuntime<S, C>,
    ) -> Option<TeardownReport> {
        error!(state = %runtime.state(), "fatal error, entering fault loop");
        let report = runtime.teardown();
        runtime.mark_faulted();
        report
    }

    /// One iteration of the fault loop
    pub fn blink<S: Session, C: Clock>(&mut self, runtime: &mut NodeRuntime<S, C>) -> NodeResult<()> {
        runtime.diagnostics_mut().write_line(FAULT_LINE);
        runtime.clock().delay(self.interval);
        self.indicator.toggle()?;
        self.blinks += 1;
        Ok(())
    }

    /// Tear down, then blink forever
    pub fn error_loop<S: Session, C: Clock>(mut self, runtime: &mut NodeRuntime<S, C>) -> ! {
        self.engage(runtime);
        loop {
            if let Err(err) = self.blink(runtime) {
                warn!(error = %err, "indicator write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{MockOp, MockSession};
    use crate::config::BridgeConfig;
    use crate::error::RetCode;
    use crate::hal::{ManualClock, MemoryIndicator, RecordingDiagnostics};
    use crate::node::NodeState;

    #[test]
    fn test_engage_on_failed_bring_up_skips_teardown() {
        let clock = ManualClock::new();
        let session = MockSession::new(clock.clone());
        session.fail(MockOp::Node, RetCode::NODE_INVALID);
        let diag = RecordingDiagnostics::new();
        let mut node = NodeRuntime::new(session.clone(), clock.clone(), Box::new(diag.clone()), BridgeConfig::default());
        assert!(node.initialize().is_err());

        let led = MemoryIndicator::new();
        let mut fault = FaultController::new(led.clone(), Duration::from_millis(200));
        assert!(fault.engage(&mut node).is_none());
        assert_eq!(node.state(), NodeState::Faulted);
        assert!(session.releases().is_empty());

        fault.blink(&mut node).unwrap();
        fault.blink(&mut node).unwrap();
        fault.blink(&mut node).unwrap();
        assert_eq!(fault.blinks(), 3);
        assert!(led.level());
        assert_eq!(led.writes(), 3);
        assert_eq!(clock.now(), Duration::from_millis(600));
        assert!(diag.transcript().ends_with("error loop\nerror loop\nerror loop\n"));
    }

    #[test]
    fn test_engage_on_live_node_tears_down() {
        let clock = ManualClock::new();
        let session = MockSession::new(clock.clone());
        let mut node = NodeRuntime::new(
            session.clone(),
            clock,
            Box::new(RecordingDiagnostics::new()),
            BridgeConfig::default(),
        );
        node.initialize().unwrap();

        let mut fault = FaultController::from_config(MemoryIndicator::new(), &node.config().runtime);
        let report = fault.engage(&mut node).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.buffers_released, 3);
        assert!(!node.is_live());
        assert_eq!(node.state(), NodeState::Faulted);
        assert_eq!(session.releases().len(), 5);
    }
}
