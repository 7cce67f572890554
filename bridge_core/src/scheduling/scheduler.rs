use crate::error::{NodeError, NodeResult, RetCode};
use crate::node::endpoint::{Endpoint, EndpointKind, PollContext, Readiness};
use std::time::Duration;
use tracing::{debug, warn};

/// Endpoint registration with its dispatch bookkeeping
struct RegisteredEndpoint {
    endpoint: Box<dyn Endpoint>,
    dispatched: u64,
}

/// Outcome of one poll call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Callbacks invoked
    pub dispatched: usize,
    /// Time spent idle waiting before dispatch
    pub waited: Duration,
    /// Soft-check failures during dispatch
    pub soft_errors: u64,
}

/// Bounded-time cooperative dispatcher with a fixed endpoint capacity.
///
/// Endpoints are dispatched in registration order. A poll waits at most
/// its timeout for something to become due, then makes one dispatch pass.
/// The timeout bounds idle waiting only; callbacks run to completion.
pub struct Scheduler {
    endpoints: Vec<RegisteredEndpoint>,
    capacity: usize,
    timeout: Duration,
    name: String,
    dispatched_total: u64,
    finalized: bool,
}

impl Scheduler {
    /// Create a scheduler for exactly `capacity` endpoints.
    pub fn new(capacity: usize) -> NodeResult<Self> {
        if capacity == 0 {
            return Err(NodeError::config("scheduler needs at least one handle"));
        }
        Ok(Self {
            endpoints: Vec::with_capacity(capacity),
            capacity,
            timeout: Duration::from_millis(100),
            name: "executor".to_string(),
            dispatched_total: 0,
            finalized: false,
        })
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Default timeout for [`poll_default`](Scheduler::poll_default)
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an endpoint. Exceeding the declared capacity is an error
    /// and the endpoint is never dispatched.
    pub fn add(&mut self, endpoint: Box<dyn Endpoint>) -> NodeResult<&mut Self> {
        if self.finalized {
            return Err(NodeError::config("scheduler already finalized"));
        }
        if self.endpoints.len() >= self.capacity {
            warn!(
                scheduler = %self.name,
                endpoint = endpoint.name(),
                capacity = self.capacity,
                "endpoint rejected: scheduler is full"
            );
            return Err(NodeError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        debug!(
            scheduler = %self.name,
            endpoint = endpoint.name(),
            kind = %endpoint.kind(),
            "endpoint registered"
        );
        self.endpoints.push(RegisteredEndpoint {
            endpoint,
            dispatched: 0,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|registered| registered.endpoint.name().to_string())
            .collect()
    }

    /// Dispatch count per endpoint, in registration order
    pub fn dispatch_counts(&self) -> Vec<(String, u64)> {
        self.endpoints
            .iter()
            .map(|registered| (registered.endpoint.name().to_string(), registered.dispatched))
            .collect()
    }

    pub fn dispatched_total(&self) -> u64 {
        self.dispatched_total
    }

    pub fn poll_default(&mut self, ctx: &mut PollContext<'_>) -> NodeResult<PollStats> {
        let timeout = self.timeout;
        self.poll(ctx, timeout)
    }

    /// Wait up to `timeout` for an endpoint to become due, then service
    /// every due endpoint once.
    ///
    /// A callback error does not stop the pass; the first one is returned
    /// after every due endpoint has been serviced.
    pub fn poll(&mut self, ctx: &mut PollContext<'_>, timeout: Duration) -> NodeResult<PollStats> {
        let mut stats = PollStats::default();
        if self.finalized {
            return Ok(stats);
        }

        let started = ctx.now();
        let mut ready = false;
        let mut soonest: Option<Duration> = None;
        let mut event_driven = false;
        for registered in &self.endpoints {
            match registered.endpoint.readiness(&mut *ctx.session, started) {
                Readiness::Ready => {
                    ready = true;
                    break;
                }
                Readiness::DueIn(delay) => {
                    soonest = Some(soonest.map_or(delay, |current| current.min(delay)));
                }
                Readiness::OnEvent => event_driven = true,
            }
        }

        if !ready {
            let wait = soonest.map_or(timeout, |delay| delay.min(timeout));
            if event_driven {
                let waited = ctx.session.wait(wait).map(|_| ());
                ctx.soft_check(waited);
            } else {
                ctx.clock.delay(wait);
            }
            stats.waited = ctx.now().saturating_sub(started);
        }

        let soft_errors_before = ctx.soft_errors;
        let mut first_error = None;
        for registered in &mut self.endpoints {
            match registered.endpoint.service_if_due(ctx) {
                Ok(true) => {
                    registered.dispatched += 1;
                    stats.dispatched += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        scheduler = %self.name,
                        endpoint = registered.endpoint.name(),
                        error = %err,
                        "callback failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        self.dispatched_total += stats.dispatched as u64;
        stats.soft_errors = ctx.soft_errors - soft_errors_before;

        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// Number of registered endpoints of `kind`
    pub fn count_kind(&self, kind: EndpointKind) -> usize {
        self.endpoints
            .iter()
            .filter(|registered| registered.endpoint.kind() == kind)
            .count()
    }

    /// Drop every endpoint. A second call reports `NOT_INIT`.
    pub fn fini(&mut self) -> RetCode {
        if self.finalized {
            return RetCode::NOT_INIT;
        }
        debug!(scheduler = %self.name, endpoints = self.endpoints.len(), "scheduler finalized");
        self.endpoints.clear();
        self.finalized = true;
        RetCode::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{MockSession, TimerHandle};
    use crate::hal::{Clock, ManualClock, RecordingDiagnostics};
    use crate::memory::{BufferManager, MemoryConf};
    use crate::node::endpoint::{TimerCallback, TimerEndpoint};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Logged {
        label: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    }

    impl TimerCallback for Logged {
        fn on_timer(&mut self, _timer: Option<&TimerHandle>, _ctx: &mut PollContext<'_>) -> NodeResult<()> {
            self.log.borrow_mut().push(self.label);
            if self.fail {
                return Err(NodeError::config("callback refused"));
            }
            Ok(())
        }
    }

    fn timer(
        label: &'static str,
        period_ms: u64,
        log: &Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    ) -> Box<dyn Endpoint> {
        let period = Duration::from_millis(period_ms);
        Box::new(TimerEndpoint::new(
            label,
            Some(TimerHandle { id: 0, period }),
            period,
            Duration::ZERO,
            Logged {
                label,
                log: Rc::clone(log),
                fail,
            },
        ))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Scheduler::new(0).is_err());
    }

    #[test]
    fn test_capacity_enforced() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(1).unwrap();
        scheduler.add(timer("a", 10, &log, false)).unwrap();
        let err = scheduler.add(timer("b", 10, &log, false)).err().unwrap();
        assert!(matches!(err, NodeError::CapacityExceeded { capacity: 1 }));
        assert_eq!(scheduler.endpoint_names(), vec!["a".to_string()]);

        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let mut buffers = BufferManager::new(MemoryConf::default());
        let mut diag = RecordingDiagnostics::new();
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);
        clock.advance(Duration::from_millis(10));
        scheduler.poll(&mut ctx, Duration::from_millis(5)).unwrap();
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn test_idle_wait_bounded_by_timeout() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(1).unwrap();
        scheduler.add(timer("slow", 1000, &log, false)).unwrap();

        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let mut buffers = BufferManager::new(MemoryConf::default());
        let mut diag = RecordingDiagnostics::new();
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);

        let stats = scheduler.poll(&mut ctx, Duration::from_millis(100)).unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.waited, Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(100));
    }

    #[test]
    fn test_wait_stops_at_next_due_timer() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(1).unwrap();
        scheduler.add(timer("fast", 30, &log, false)).unwrap();

        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let mut buffers = BufferManager::new(MemoryConf::default());
        let mut diag = RecordingDiagnostics::new();
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);

        let stats = scheduler.poll(&mut ctx, Duration::from_millis(100)).unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.waited, Duration::from_millis(30));
        assert_eq!(scheduler.dispatched_total(), 1);
    }

    #[test]
    fn test_error_does_not_stop_pass() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(2).unwrap();
        scheduler.add(timer("first", 10, &log, true)).unwrap();
        scheduler.add(timer("second", 10, &log, false)).unwrap();

        let clock = ManualClock::new();
        let mut session = MockSession::new(clock.clone());
        let mut buffers = BufferManager::new(MemoryConf::default());
        let mut diag = RecordingDiagnostics::new();
        let mut ctx = PollContext::new(&mut session, &mut buffers, &mut diag, &clock);
        clock.advance(Duration::from_millis(10));

        assert!(scheduler.poll(&mut ctx, Duration::from_millis(5)).is_err());
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(scheduler.dispatch_counts()[1], ("second".to_string(), 1));
    }

    #[test]
    fn test_fini_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new(1).unwrap();
        scheduler.add(timer("a", 10, &log, false)).unwrap();
        assert_eq!(scheduler.fini(), RetCode::OK);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.fini(), RetCode::NOT_INIT);
        assert!(scheduler.add(timer("b", 10, &log, false)).is_err());
    }
}
