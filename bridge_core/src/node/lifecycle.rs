use super::callbacks::{Counter, DecrementService, StatePublisher};
use super::endpoint::{PollContext, ServiceEndpoint, TimerEndpoint};
use crate::communication::{
    PublisherHandle, RetryPolicy, ServiceHandle, Session, TimerHandle,
};
use crate::config::BridgeConfig;
use crate::error::{
    CheckFailure, MwError, MwResult, NodeError, NodeResult, RetCode, SetupError, SetupStep,
};
use crate::hal::{Clock, Diagnostics};
use crate::memory::{BufferId, BufferManager, MessageSchema, BASIC_TYPES, STRING};
use crate::scheduling::{PollStats, Scheduler};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Initializing,
    Running,
    /// Terminal until the process restarts
    Faulted,
    /// Torn down on the normal path
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Uninitialized => write!(f, "Uninitialized"),
            NodeState::Initializing => write!(f, "Initializing"),
            NodeState::Running => write!(f, "Running"),
            NodeState::Faulted => write!(f, "Faulted"),
            NodeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Runtime counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Publisher-creation attempts during the last bring-up
    pub publisher_attempts: usize,
    pub polls: u64,
    pub dispatched: u64,
    pub soft_errors: u64,
    pub failed_polls: u64,
}

/// Result of a teardown that actually ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Sum of the release return codes
    pub code: RetCode,
    pub buffers_released: usize,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.code.is_ok()
    }
}

/// The node and everything it owns.
///
/// Bring-up happens in [`initialize`](NodeRuntime::initialize); endpoints
/// are only used while the node is live, and [`teardown`](NodeRuntime::teardown)
/// releases everything exactly once.
pub struct NodeRuntime<S: Session, C: Clock> {
    session: S,
    clock: C,
    diagnostics: Box<dyn Diagnostics>,
    config: BridgeConfig,
    retry: RetryPolicy,
    state: NodeState,
    live: bool,
    scheduler: Option<Scheduler>,
    buffers: BufferManager,
    allocations: Vec<(BufferId, &'static MessageSchema)>,
    service: Option<ServiceHandle>,
    publisher: Option<PublisherHandle>,
    timer: Option<TimerHandle>,
    counter: Counter,
    stats: RuntimeStats,
}

impl<S: Session, C: Clock> NodeRuntime<S, C> {
    pub fn new(session: S, clock: C, diagnostics: Box<dyn Diagnostics>, config: BridgeConfig) -> Self {
        Self {
            session,
            clock,
            diagnostics,
            retry: RetryPolicy::from_config(&config.publisher.retry),
            buffers: BufferManager::new(config.buffers),
            config,
            state: NodeState::Uninitialized,
            live: false,
            scheduler: None,
            allocations: Vec::new(),
            service: None,
            publisher: None,
            timer: None,
            counter: Counter::new(),
            stats: RuntimeStats::default(),
        }
    }

    /// Use an existing process-wide counter instead of a fresh one
    pub fn with_counter(mut self, counter: Counter) -> Self {
        self.counter = counter;
        self
    }

    /// Override the publisher-creation retry policy from the config
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bring the node up. Steps run strictly in order; every step except
    /// publisher creation is fatal on failure. Publisher creation is
    /// retried per the retry policy, forever by default.
    ///
    /// The node is live only if every step succeeded.
    pub fn initialize(&mut self) -> NodeResult<()> {
        match self.state {
            NodeState::Uninitialized | NodeState::Stopped => {}
            NodeState::Faulted => return Err(NodeError::Faulted),
            NodeState::Initializing | NodeState::Running => {
                return Err(NodeError::AlreadyInitialized)
            }
        }

        self.state = NodeState::Initializing;
        info!(
            node = %self.config.node.name,
            namespace = %self.config.node.namespace,
            agent = %self.config.transport.agent_ip,
            port = self.config.transport.agent_port,
            "initializing node"
        );
        self.diagnostics.write_str("Initializing ros");

        match self.bring_up() {
            Ok(scheduler) => {
                self.scheduler = Some(scheduler);
                self.buffers.seal();
                self.live = true;
                self.state = NodeState::Running;
                self.diagnostics.write_line("Done");
                info!(
                    buffers = self.buffers.live_count(),
                    publisher_attempts = self.stats.publisher_attempts,
                    "node is live"
                );
                Ok(())
            }
            Err(err) => {
                self.state = NodeState::Faulted;
                error!(error = %err, "node bring-up failed");
                Err(err)
            }
        }
    }

    fn bring_up(&mut self) -> NodeResult<Scheduler> {
        self.progress();
        let result = self.session.init_transport(&self.config.transport);
        self.check(SetupStep::Transport, result)?;

        self.progress();
        let result = self.session.init_support();
        self.check(SetupStep::Support, result)?;

        self.progress();
        let result = self
            .session
            .init_node(&self.config.node.name, &self.config.node.namespace);
        self.check(SetupStep::Node, result)?;

        self.progress();
        let result = Scheduler::new(self.config.executor.handles).map_err(local_failure);
        let mut scheduler = self
            .check(SetupStep::Executor, result)?
            .with_name(&self.config.node.name);
        scheduler.set_timeout(self.config.executor_timeout());

        // Service endpoint
        self.progress();
        let result = self.allocate(BASIC_TYPES.request);
        let request = self.check(SetupStep::ServiceBuffers, result)?;
        let result = self.allocate(BASIC_TYPES.response);
        let response = self.check(SetupStep::ServiceBuffers, result)?;

        self.progress();
        let result = self
            .session
            .init_service(&self.config.service.topic, &BASIC_TYPES);
        let service = self.check(SetupStep::Service, result)?;
        self.service = Some(service.clone());

        self.progress();
        let endpoint = ServiceEndpoint::new(service, request, response, DecrementService::new());
        let result = scheduler
            .add(Box::new(endpoint))
            .map(|_| ())
            .map_err(local_failure);
        self.check(SetupStep::ServiceRegistration, result)?;

        // Publisher and its timer
        self.progress();
        let result = self.allocate(&STRING);
        let message = self.check(SetupStep::PublishBuffer, result)?;

        self.progress();
        let result = self.create_publisher();
        let publisher = self.check(SetupStep::Publisher, result)?;
        self.publisher = Some(publisher.clone());

        self.progress();
        let period = self.config.timer_period();
        let result = self.session.init_timer(period);
        let timer = self.check(SetupStep::Timer, result)?;
        self.timer = Some(timer.clone());

        self.progress();
        let name = format!("{}_timer", publisher.topic);
        let callback = StatePublisher::new(publisher, message, self.counter.clone());
        let endpoint = TimerEndpoint::new(name, Some(timer), period, self.clock.now(), callback);
        let result = scheduler
            .add(Box::new(endpoint))
            .map(|_| ())
            .map_err(local_failure);
        self.check(SetupStep::TimerRegistration, result)?;

        self.progress();
        Ok(scheduler)
    }

    /// Publisher creation races session establishment on the agent, so
    /// refusals are retried rather than treated as fatal.
    fn create_publisher(&mut self) -> MwResult<PublisherHandle> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.stats.publisher_attempts = attempt;
            match self
                .session
                .init_publisher(&self.config.publisher.topic, &STRING)
            {
                Ok(publisher) => return Ok(publisher),
                Err(err) => {
                    if !self.retry.should_retry(attempt) {
                        warn!(attempt, error = %err, "publisher creation retries exhausted");
                        return Err(err);
                    }
                    debug!(attempt, error = %err, "publisher creation refused, retrying");
                    self.clock.delay(self.retry.backoff_delay(attempt));
                }
            }
        }
    }

    fn allocate(&mut self, schema: &'static MessageSchema) -> MwResult<BufferId> {
        let id = self.buffers.create(schema).map_err(local_failure)?;
        self.allocations.push((id, schema));
        Ok(id)
    }

    fn progress(&mut self) {
        self.diagnostics.write_str(".");
    }

    /// Turn a failed step into a fatal setup error reported at the
    /// caller's line.
    #[track_caller]
    fn check<T>(&mut self, step: SetupStep, result: MwResult<T>) -> NodeResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let failure = CheckFailure::capture(err);
                error!(
                    %step,
                    code = %failure.code,
                    line = failure.line,
                    "{}",
                    failure.message
                );
                self.diagnostics.report(&failure);
                Err(SetupError { step, failure }.into())
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub fn diagnostics_mut(&mut self) -> &mut dyn Diagnostics {
        self.diagnostics.as_mut()
    }

    /// Buffers currently allocated for the node
    pub fn live_buffers(&self) -> usize {
        self.buffers.live_count()
    }

    /// Service every due endpoint, waiting at most `timeout` for one to
    /// become due.
    pub fn spin_some(&mut self, timeout: Duration) -> NodeResult<PollStats> {
        if !self.live {
            return Err(NodeError::NotLive);
        }
        let scheduler = self.scheduler.as_mut().ok_or(NodeError::NotLive)?;

        let mut ctx = PollContext::new(
            &mut self.session,
            &mut self.buffers,
            self.diagnostics.as_mut(),
            &self.clock,
        );
        let result = scheduler.poll(&mut ctx, timeout);
        let soft_errors = ctx.soft_errors;

        self.stats.polls += 1;
        self.stats.soft_errors += soft_errors;
        match &result {
            Ok(poll) => self.stats.dispatched += poll.dispatched as u64,
            Err(_) => self.stats.failed_polls += 1,
        }
        result
    }

    /// [`spin_some`](NodeRuntime::spin_some) with the executor's default timeout
    pub fn spin_some_default(&mut self) -> NodeResult<PollStats> {
        let timeout = self
            .scheduler
            .as_ref()
            .map_or_else(|| self.config.executor_timeout(), Scheduler::timeout);
        self.spin_some(timeout)
    }

    /// Release everything the node owns, in order: publisher, service,
    /// node, timer, scheduler, support, then every message buffer.
    ///
    /// Does nothing (and returns `None`) unless the node is live. Release
    /// failures are summed and reported but never stop the sequence; the
    /// node is not live afterwards.
    pub fn teardown(&mut self) -> Option<TeardownReport> {
        if !self.live {
            debug!(state = %self.state, "teardown skipped: node is not live");
            return None;
        }

        let mut code = RetCode::OK;
        if let Some(publisher) = self.publisher.take() {
            code = code.accumulate(self.session.fini_publisher(publisher));
        }
        if let Some(service) = self.service.take() {
            code = code.accumulate(self.session.fini_service(service));
        }
        code = code.accumulate(self.session.fini_node());
        if let Some(timer) = self.timer.take() {
            code = code.accumulate(self.session.fini_timer(timer));
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            code = code.accumulate(scheduler.fini());
        }
        code = code.accumulate(self.session.fini_support());

        let mut buffers_released = 0;
        for (id, schema) in self.allocations.drain(..) {
            match self.buffers.destroy(id, schema) {
                Ok(()) => buffers_released += 1,
                Err(err) => {
                    warn!(buffer = id.index(), error = %err, "buffer release failed");
                    code = code.accumulate(err.ret_code());
                }
            }
        }
        self.buffers.destroy_all();

        if !code.is_ok() {
            warn!(code = %code, "errors while tearing down node");
            self.diagnostics.write_line("Error while cleaning up!");
        }

        self.live = false;
        if self.state == NodeState::Running {
            self.state = NodeState::Stopped;
        }
        info!(state = %self.state, buffers_released, "node torn down");
        Some(TeardownReport {
            code,
            buffers_released,
        })
    }

    /// Enter the terminal state
    pub fn mark_faulted(&mut self) {
        self.state = NodeState::Faulted;
    }
}

impl<S: Session, C: Clock> Drop for NodeRuntime<S, C> {
    fn drop(&mut self) {
        if self.live {
            self.teardown();
        } else {
            self.allocations.clear();
            self.buffers.destroy_all();
        }
    }
}

/// Local failures standing in for a middleware step
fn local_failure(err: NodeError) -> MwError {
    MwError::new(err.ret_code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{MockOp, MockSession};
    use crate::hal::{ManualClock, RecordingDiagnostics};

    fn runtime(config: BridgeConfig) -> (NodeRuntime<MockSession, ManualClock>, MockSession, RecordingDiagnostics) {
        let clock = ManualClock::new();
        let session = MockSession::new(clock.clone());
        let diag = RecordingDiagnostics::new();
        let runtime = NodeRuntime::new(session.clone(), clock, Box::new(diag.clone()), config);
        (runtime, session, diag)
    }

    #[test]
    fn test_progress_markers() {
        let (mut node, _session, diag) = runtime(BridgeConfig::default());
        node.initialize().unwrap();
        assert_eq!(diag.transcript(), "Initializing ros............Done\n");
        assert_eq!(node.state(), NodeState::Running);
        assert_eq!(node.live_buffers(), 3);
    }

    #[test]
    fn test_initialize_twice_rejected() {
        let (mut node, _session, _diag) = runtime(BridgeConfig::default());
        node.initialize().unwrap();
        assert!(matches!(node.initialize(), Err(NodeError::AlreadyInitialized)));
    }

    #[test]
    fn test_faulted_node_cannot_reinitialize() {
        let (mut node, session, _diag) = runtime(BridgeConfig::default());
        session.fail(MockOp::Support, RetCode::BAD_ALLOC);
        let err = node.initialize().unwrap_err();
        assert_eq!(err.ret_code(), RetCode::BAD_ALLOC);
        assert_eq!(node.state(), NodeState::Faulted);
        assert!(matches!(node.initialize(), Err(NodeError::Faulted)));
    }

    #[test]
    fn test_too_few_handles_is_fatal() {
        let mut config = BridgeConfig::default();
        config.executor.handles = 1;
        let (mut node, session, diag) = runtime(config);

        let err = node.initialize().unwrap_err();
        match err {
            NodeError::Setup(setup) => {
                assert_eq!(setup.step, SetupStep::TimerRegistration);
                assert_eq!(setup.failure.code, RetCode::ERROR);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!node.is_live());
        assert!(diag.contains("(!=1) [line "));
        assert!(!session.calls().iter().any(|call| call.is_release()));
    }

    #[test]
    fn test_reinitialize_after_teardown_keeps_counter() {
        let (mut node, session, _diag) = runtime(BridgeConfig::default());
        node.initialize().unwrap();
        let period = node.config().timer_period();
        node.clock().advance(period);
        node.spin_some(Duration::from_millis(100)).unwrap();
        assert!(node.teardown().unwrap().is_clean());
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(node.live_buffers(), 0);

        node.initialize().unwrap();
        node.clock().advance(period);
        node.spin_some(Duration::from_millis(100)).unwrap();
        assert_eq!(session.published(), vec!["0".to_string(), "1".to_string()]);
        assert_eq!(node.counter().value(), 2);
    }

    #[test]
    fn test_default_spin_uses_executor_timeout() {
        let (mut node, _session, _diag) = runtime(BridgeConfig::default());
        node.initialize().unwrap();
        let before = node.clock().now();
        let stats = node.spin_some_default().unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(node.clock().now() - before, Duration::from_millis(2000));
    }
}
