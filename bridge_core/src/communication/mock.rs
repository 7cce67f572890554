//! Scripted session for tests
//!
//! Records every middleware call in order and fails whatever the test asks
//! it to. Clones share state, so a test keeps one handle for scripting and
//! inspection while the runtime owns another.

use super::traits::{PublisherHandle, RequestHeader, ServiceHandle, Session, TimerHandle};
use crate::config::TransportConfig;
use crate::error::{MwError, MwResult, RetCode};
use crate::hal::ManualClock;
use crate::memory::{MessageBuffer, MessageSchema, ServiceSchema, INT16_FIELD};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Middleware operations the mock can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Transport,
    Support,
    Node,
    Service,
    Publisher,
    Timer,
    FiniPublisher,
    FiniService,
    FiniNode,
    FiniTimer,
    FiniSupport,
}

/// One recorded middleware call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InitTransport { agent_ip: String, agent_port: u16 },
    InitSupport,
    InitNode { name: String, namespace: String },
    InitService { topic: String },
    InitPublisher { topic: String },
    InitTimer { period: Duration },
    Publish { topic: String, payload: String },
    Respond { sequence: i64, value: i16 },
    FiniPublisher,
    FiniService,
    FiniNode,
    FiniTimer,
    FiniSupport,
}

impl Call {
    /// Whether this call releases a middleware entity
    pub fn is_release(&self) -> bool {
        matches!(
            self,
            Call::FiniPublisher | Call::FiniService | Call::FiniNode | Call::FiniTimer | Call::FiniSupport
        )
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    failures: HashMap<MockOp, RetCode>,
    publisher_failures: u32,
    publisher_attempts: u32,
    publish_failures: u32,
    publish_attempts: u32,
    pending: VecDeque<(i64, i16)>,
    next_sequence: i64,
    next_id: u32,
}

/// Session double with scripted failures and a manual clock
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    clock: ManualClock,
}

impl MockSession {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            state: Arc::default(),
            clock,
        }
    }

    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    /// Make `op` fail with `code` every time it is called
    pub fn fail(&self, op: MockOp, code: RetCode) {
        self.state.lock().failures.insert(op, code);
    }

    /// Refuse the next `count` publisher creations
    pub fn fail_publisher_times(&self, count: u32) {
        self.state.lock().publisher_failures = count;
    }

    /// Refuse the next `count` publishes
    pub fn fail_publishes(&self, count: u32) {
        self.state.lock().publish_failures = count;
    }

    /// Queue a request carrying `value`; returns its sequence number
    pub fn queue_request(&self, value: i16) -> i64 {
        let mut state = self.state.lock();
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.pending.push_back((sequence, value));
        sequence
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Release calls only, in order
    pub fn releases(&self) -> Vec<Call> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.is_release())
            .cloned()
            .collect()
    }

    /// Payloads of successful publishes, in order
    pub fn published(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Publish { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Responses sent, as (sequence, int16 value)
    pub fn responses(&self) -> Vec<(i64, i16)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Respond { sequence, value } => Some((*sequence, *value)),
                _ => None,
            })
            .collect()
    }

    pub fn publisher_attempts(&self) -> u32 {
        self.state.lock().publisher_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    fn init_step(&self, op: MockOp, call: Call) -> MwResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.failures.get(&op) {
            Some(code) => Err(MwError::new(*code, format!("{op:?} refused by mock"))),
            None => Ok(()),
        }
    }

    fn fini_step(&self, op: MockOp, call: Call) -> RetCode {
        let mut state = self.state.lock();
        state.calls.push(call);
        state.failures.get(&op).copied().unwrap_or(RetCode::OK)
    }

    fn next_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }
}

impl Session for MockSession {
    fn init_transport(&mut self, config: &TransportConfig) -> MwResult<()> {
        self.init_step(
            MockOp::Transport,
            Call::InitTransport {
                agent_ip: config.agent_ip.clone(),
                agent_port: config.agent_port,
            },
        )
    }

    fn init_support(&mut self) -> MwResult<()> {
        self.init_step(MockOp::Support, Call::InitSupport)
    }

    fn init_node(&mut self, name: &str, namespace: &str) -> MwResult<()> {
        self.init_step(
            MockOp::Node,
            Call::InitNode {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
        )
    }

    fn init_service(
        &mut self,
        topic: &str,
        _schema: &'static ServiceSchema,
    ) -> MwResult<ServiceHandle> {
        self.init_step(
            MockOp::Service,
            Call::InitService {
                topic: topic.to_string(),
            },
        )?;
        Ok(ServiceHandle {
            id: self.next_id(),
            topic: topic.to_string(),
        })
    }

    fn init_publisher(
        &mut self,
        topic: &str,
        _schema: &'static MessageSchema,
    ) -> MwResult<PublisherHandle> {
        {
            let mut state = self.state.lock();
            state.publisher_attempts += 1;
            if state.publisher_failures > 0 {
                state.publisher_failures -= 1;
                return Err(MwError::new(RetCode::ERROR, "agent session not ready"));
            }
        }
        self.init_step(
            MockOp::Publisher,
            Call::InitPublisher {
                topic: topic.to_string(),
            },
        )?;
        Ok(PublisherHandle {
            id: self.next_id(),
            topic: topic.to_string(),
        })
    }

    fn init_timer(&mut self, period: Duration) -> MwResult<TimerHandle> {
        self.init_step(MockOp::Timer, Call::InitTimer { period })?;
        Ok(TimerHandle {
            id: self.next_id(),
            period,
        })
    }

    fn has_pending_request(&mut self, _service: &ServiceHandle) -> bool {
        !self.state.lock().pending.is_empty()
    }

    fn wait(&mut self, timeout: Duration) -> MwResult<bool> {
        if !self.state.lock().pending.is_empty() {
            return Ok(true);
        }
        self.clock.advance(timeout);
        Ok(false)
    }

    fn take_request(
        &mut self,
        _service: &ServiceHandle,
        request: &mut MessageBuffer,
    ) -> MwResult<Option<RequestHeader>> {
        let Some((sequence, value)) = self.state.lock().pending.pop_front() else {
            return Ok(None);
        };
        request
            .write_i16(INT16_FIELD, value)
            .map_err(|err| MwError::new(RetCode::SERVICE_TAKE_FAILED, err.to_string()))?;
        Ok(Some(RequestHeader { sequence }))
    }

    fn send_response(
        &mut self,
        _service: &ServiceHandle,
        header: &RequestHeader,
        response: &MessageBuffer,
    ) -> MwResult<()> {
        let value = response
            .read_i16(INT16_FIELD)
            .map_err(|err| MwError::new(RetCode::ERROR, err.to_string()))?;
        self.state.lock().calls.push(Call::Respond {
            sequence: header.sequence,
            value,
        });
        Ok(())
    }

    fn publish(&mut self, publisher: &PublisherHandle, message: &MessageBuffer) -> MwResult<()> {
        let mut state = self.state.lock();
        state.publish_attempts += 1;
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(MwError::new(RetCode::ERROR, "publish dropped by mock"));
        }
        state.calls.push(Call::Publish {
            topic: publisher.topic.clone(),
            payload: String::from_utf8_lossy(message.as_bytes()).into_owned(),
        });
        Ok(())
    }

    fn fini_publisher(&mut self, _publisher: PublisherHandle) -> RetCode {
        self.fini_step(MockOp::FiniPublisher, Call::FiniPublisher)
    }

    fn fini_service(&mut self, _service: ServiceHandle) -> RetCode {
        self.fini_step(MockOp::FiniService, Call::FiniService)
    }

    fn fini_node(&mut self) -> RetCode {
        self.fini_step(MockOp::FiniNode, Call::FiniNode)
    }

    fn fini_timer(&mut self, _timer: TimerHandle) -> RetCode {
        self.fini_step(MockOp::FiniTimer, Call::FiniTimer)
    }

    fn fini_support(&mut self) -> RetCode {
        self.fini_step(MockOp::FiniSupport, Call::FiniSupport)
    }
}
