//! Schedulable endpoints
//!
//! An [`Endpoint`] is a passive object the scheduler asks two things: how
//! soon it wants servicing, and to service itself if it is due. Timers are
//! due on monotonic time; services are due when the session holds a request
//! for them.

use crate::communication::{ServiceHandle, Session, TimerHandle};
use crate::error::{CheckFailure, MwResult, NodeResult};
use crate::hal::{Clock, Diagnostics};
use crate::memory::{BufferId, BufferManager, MessageBuffer};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// How soon an endpoint wants to be serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Due now
    Ready,
    /// Due after the given delay
    DueIn(Duration),
    /// Due when an inbound request arrives
    OnEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Timer,
    Service,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Timer => write!(f, "timer"),
            EndpointKind::Service => write!(f, "service"),
        }
    }
}

/// Everything a callback may touch during one poll
pub struct PollContext<'a> {
    pub session: &'a mut dyn Session,
    pub buffers: &'a mut BufferManager,
    pub diagnostics: &'a mut dyn Diagnostics,
    pub clock: &'a dyn Clock,
    /// Soft-check failures seen during this poll
    pub soft_errors: u64,
}

impl<'a> PollContext<'a> {
    pub fn new(
        session: &'a mut dyn Session,
        buffers: &'a mut BufferManager,
        diagnostics: &'a mut dyn Diagnostics,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            session,
            buffers,
            diagnostics,
            clock,
            soft_errors: 0,
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Log a failed middleware call and carry on. Returns true on success.
    #[track_caller]
    pub fn soft_check(&mut self, result: MwResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                let failure = CheckFailure::capture(err);
                warn!(code = %failure.code, line = failure.line, "{}", failure.message);
                self.diagnostics.report(&failure);
                self.soft_errors += 1;
                false
            }
        }
    }
}

/// A communication endpoint known to the scheduler
pub trait Endpoint {
    fn name(&self) -> &str;

    fn kind(&self) -> EndpointKind;

    fn readiness(&self, session: &mut dyn Session, now: Duration) -> Readiness;

    /// Run the callback if the endpoint is due; returns whether it ran.
    fn service_if_due(&mut self, ctx: &mut PollContext<'_>) -> NodeResult<bool>;
}

/// Business logic run when a timer fires
pub trait TimerCallback {
    /// `timer` is `None` when the endpoint has no valid timer handle.
    fn on_timer(&mut self, timer: Option<&TimerHandle>, ctx: &mut PollContext<'_>) -> NodeResult<()>;
}

/// Business logic run for each inbound request
pub trait ServiceHandler {
    /// Fill `response` from `request`. Must not block.
    fn handle(
        &mut self,
        request: &MessageBuffer,
        response: &mut MessageBuffer,
        diagnostics: &mut dyn Diagnostics,
    ) -> NodeResult<()>;
}

/// Periodic endpoint: fires once per period of monotonic time
pub struct TimerEndpoint<C> {
    name: String,
    timer: Option<TimerHandle>,
    period: Duration,
    next_due: Duration,
    callback: C,
}

impl<C: TimerCallback> TimerEndpoint<C> {
    /// First firing is one period after `now`
    pub fn new(
        name: impl Into<String>,
        timer: Option<TimerHandle>,
        period: Duration,
        now: Duration,
        callback: C,
    ) -> Self {
        Self {
            name: name.into(),
            timer,
            period,
            next_due: now + period,
            callback,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_due(&self) -> Duration {
        self.next_due
    }

    pub fn callback(&self) -> &C {
        &self.callback
    }
}

impl<C: TimerCallback> Endpoint for TimerEndpoint<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Timer
    }

    fn readiness(&self, _session: &mut dyn Session, now: Duration) -> Readiness {
        if now >= self.next_due {
            Readiness::Ready
        } else {
            Readiness::DueIn(self.next_due - now)
        }
    }

    fn service_if_due(&mut self, ctx: &mut PollContext<'_>) -> NodeResult<bool> {
        let now = ctx.now();
        if now < self.next_due {
            return Ok(false);
        }
        // One firing per poll; periods missed while late are dropped
        while self.next_due <= now && !self.period.is_zero() {
            self.next_due += self.period;
        }
        self.callback.on_timer(self.timer.as_ref(), ctx)?;
        Ok(true)
    }
}

/// Request/response endpoint with its two buffers
pub struct ServiceEndpoint<H> {
    name: String,
    service: ServiceHandle,
    request: BufferId,
    response: BufferId,
    handler: H,
}

impl<H: ServiceHandler> ServiceEndpoint<H> {
    pub fn new(service: ServiceHandle, request: BufferId, response: BufferId, handler: H) -> Self {
        Self {
            name: service.topic.clone(),
            service,
            request,
            response,
            handler,
        }
    }
}

impl<H: ServiceHandler> Endpoint for ServiceEndpoint<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EndpointKind {
        EndpointKind::Service
    }

    fn readiness(&self, session: &mut dyn Session, _now: Duration) -> Readiness {
        if session.has_pending_request(&self.service) {
            Readiness::Ready
        } else {
            Readiness::OnEvent
        }
    }

    fn service_if_due(&mut self, ctx: &mut PollContext<'_>) -> NodeResult<bool> {
        let request = ctx.buffers.get_mut(self.request)?;
        let header = match ctx.session.take_request(&self.service, request) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(false),
            Err(err) => {
                ctx.soft_check(Err(err));
                return Ok(false);
            }
        };

        let (request, response) = ctx.buffers.pair_mut(self.request, self.response)?;
        self.handler.handle(request, response, &mut *ctx.diagnostics)?;

        let response = ctx.buffers.get(self.response)?;
        let sent = ctx.session.send_response(&self.service, &header, response);
        ctx.soft_check(sent);
        Ok(true)
    }
}
