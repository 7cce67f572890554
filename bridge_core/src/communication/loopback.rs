//! In-process agent link
//!
//! [`LoopbackSession`] is the node side and [`LoopbackAgent`] the agent side
//! of a pair of crossbeam channels. The agent can live on another thread:
//! it injects service requests and observes responses and publications,
//! which lets the firmware loop run end to end on a host.

use super::traits::{PublisherHandle, RequestHeader, ServiceHandle, Session, TimerHandle};
use crate::config::TransportConfig;
use crate::error::{MwError, MwResult, RetCode};
use crate::memory::{
    MemoryConf, MessageBuffer, MessageSchema, ServiceSchema, BASIC_TYPES_REQUEST,
    BASIC_TYPES_RESPONSE, INT16_FIELD,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A request travelling from the agent to the node
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub topic: String,
    pub sequence: i64,
    pub payload: Vec<u8>,
}

/// A response travelling back to the agent
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub topic: String,
    pub sequence: i64,
    pub payload: Vec<u8>,
}

/// A publication seen by the agent
#[derive(Debug, Clone)]
pub struct PublicationFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublicationFrame {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Create a connected node/agent pair.
///
/// `publisher_warmup` is the number of publisher-creation attempts the
/// agent refuses before accepting, modelling a session that is still being
/// established when bring-up reaches the publisher.
pub fn loopback(publisher_warmup: u32) -> (LoopbackSession, LoopbackAgent) {
    let (request_tx, request_rx) = channel::unbounded();
    let (response_tx, response_rx) = channel::unbounded();
    let (publication_tx, publication_rx) = channel::unbounded();

    let session = LoopbackSession {
        requests: request_rx,
        responses: response_tx,
        publications: publication_tx,
        pending: VecDeque::new(),
        connected: false,
        support: false,
        node: None,
        services: Vec::new(),
        publishers: Vec::new(),
        timers: Vec::new(),
        next_id: 1,
        publisher_warmup,
    };
    let agent = LoopbackAgent {
        requests: request_tx,
        responses: response_rx,
        publications: publication_rx,
        next_sequence: AtomicI64::new(1),
        memory: MemoryConf::default(),
    };
    (session, agent)
}

/// Node side of the loopback link
pub struct LoopbackSession {
    requests: Receiver<RequestFrame>,
    responses: Sender<ResponseFrame>,
    publications: Sender<PublicationFrame>,
    pending: VecDeque<RequestFrame>,
    connected: bool,
    support: bool,
    node: Option<String>,
    services: Vec<ServiceHandle>,
    publishers: Vec<PublisherHandle>,
    timers: Vec<TimerHandle>,
    next_id: u32,
    publisher_warmup: u32,
}

impl LoopbackSession {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn require_node(&self) -> MwResult<()> {
        if self.node.is_none() {
            return Err(MwError::new(RetCode::NODE_INVALID, "node is not initialized"));
        }
        Ok(())
    }

    /// Queue a request if a registered service can take it; returns
    /// whether it was queued.
    fn route(&mut self, frame: RequestFrame) -> bool {
        if !self.services.iter().any(|service| service.topic == frame.topic) {
            warn!(
                topic = %frame.topic,
                sequence = frame.sequence,
                "dropping request for unregistered service"
            );
            return false;
        }
        self.pending.push_back(frame);
        true
    }

    fn drain_inbound(&mut self) {
        while let Ok(frame) = self.requests.try_recv() {
            self.route(frame);
        }
    }

    /// Requests queued for registered services
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

impl Session for LoopbackSession {
    fn init_transport(&mut self, config: &TransportConfig) -> MwResult<()> {
        let ip: IpAddr = config.agent_ip.parse().map_err(|_| {
            MwError::new(
                RetCode::INVALID_ARGUMENT,
                format!("invalid agent address '{}'", config.agent_ip),
            )
        })?;
        if config.agent_port == 0 {
            return Err(MwError::new(RetCode::INVALID_ARGUMENT, "agent port must be non-zero"));
        }
        info!(agent = %ip, port = config.agent_port, ssid = %config.ssid, "loopback transport up");
        self.connected = true;
        Ok(())
    }

    fn init_support(&mut self) -> MwResult<()> {
        if !self.connected {
            return Err(MwError::new(RetCode::ERROR, "transport is not connected"));
        }
        self.support = true;
        Ok(())
    }

    fn init_node(&mut self, name: &str, namespace: &str) -> MwResult<()> {
        if !self.support {
            return Err(MwError::new(RetCode::NOT_INIT, "support context is not initialized"));
        }
        if name.is_empty() {
            return Err(MwError::new(RetCode::INVALID_ARGUMENT, "empty node name"));
        }
        self.node = Some(format!("/{}/{}", namespace.trim_matches('/'), name));
        Ok(())
    }

    fn init_service(
        &mut self,
        topic: &str,
        schema: &'static ServiceSchema,
    ) -> MwResult<ServiceHandle> {
        self.require_node()?;
        let handle = ServiceHandle {
            id: self.next_id(),
            topic: topic.to_string(),
        };
        debug!(topic, type_name = schema.type_name, "service registered with agent");
        self.services.push(handle.clone());
        Ok(handle)
    }

    fn init_publisher(
        &mut self,
        topic: &str,
        schema: &'static MessageSchema,
    ) -> MwResult<PublisherHandle> {
        self.require_node()?;
        if self.publisher_warmup > 0 {
            self.publisher_warmup -= 1;
            return Err(MwError::new(RetCode::ERROR, "agent session not ready"));
        }
        let handle = PublisherHandle {
            id: self.next_id(),
            topic: topic.to_string(),
        };
        debug!(topic, type_name = schema.type_name, "publisher registered with agent");
        self.publishers.push(handle.clone());
        Ok(handle)
    }

    fn init_timer(&mut self, period: Duration) -> MwResult<TimerHandle> {
        if !self.support {
            return Err(MwError::new(RetCode::NOT_INIT, "support context is not initialized"));
        }
        let handle = TimerHandle {
            id: self.next_id(),
            period,
        };
        self.timers.push(handle.clone());
        Ok(handle)
    }

    fn has_pending_request(&mut self, service: &ServiceHandle) -> bool {
        self.drain_inbound();
        self.pending.iter().any(|frame| frame.topic == service.topic)
    }

    fn wait(&mut self, timeout: Duration) -> MwResult<bool> {
        self.drain_inbound();
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.requests.recv_timeout(remaining) {
                Ok(frame) => {
                    if self.route(frame) {
                        return Ok(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    // No agent left; still honour the wait
                    std::thread::sleep(remaining);
                    return Ok(false);
                }
            }
        }
    }

    fn take_request(
        &mut self,
        service: &ServiceHandle,
        request: &mut MessageBuffer,
    ) -> MwResult<Option<RequestHeader>> {
        self.drain_inbound();
        let Some(index) = self.pending.iter().position(|frame| frame.topic == service.topic) else {
            return Ok(None);
        };
        let Some(frame) = self.pending.remove(index) else {
            return Ok(None);
        };
        request.write_bytes(&frame.payload).map_err(|err| {
            MwError::new(RetCode::SERVICE_TAKE_FAILED, err.to_string())
        })?;
        Ok(Some(RequestHeader {
            sequence: frame.sequence,
        }))
    }

    fn send_response(
        &mut self,
        service: &ServiceHandle,
        header: &RequestHeader,
        response: &MessageBuffer,
    ) -> MwResult<()> {
        self.responses
            .send(ResponseFrame {
                topic: service.topic.clone(),
                sequence: header.sequence,
                payload: response.as_bytes().to_vec(),
            })
            .map_err(|_| MwError::new(RetCode::ERROR, "agent disconnected"))
    }

    fn publish(&mut self, publisher: &PublisherHandle, message: &MessageBuffer) -> MwResult<()> {
        if !self.publishers.contains(publisher) {
            return Err(MwError::new(RetCode::PUBLISHER_INVALID, "publisher is not registered"));
        }
        self.publications
            .send(PublicationFrame {
                topic: publisher.topic.clone(),
                payload: message.as_bytes().to_vec(),
            })
            .map_err(|_| MwError::new(RetCode::ERROR, "agent disconnected"))
    }

    fn fini_publisher(&mut self, publisher: PublisherHandle) -> RetCode {
        remove_handle(&mut self.publishers, &publisher, RetCode::PUBLISHER_INVALID)
    }

    fn fini_service(&mut self, service: ServiceHandle) -> RetCode {
        self.pending.retain(|frame| frame.topic != service.topic);
        remove_handle(&mut self.services, &service, RetCode::SERVICE_INVALID)
    }

    fn fini_node(&mut self) -> RetCode {
        match self.node.take() {
            Some(_) => RetCode::OK,
            None => RetCode::NODE_INVALID,
        }
    }

    fn fini_timer(&mut self, timer: TimerHandle) -> RetCode {
        remove_handle(&mut self.timers, &timer, RetCode::INVALID_ARGUMENT)
    }

    fn fini_support(&mut self) -> RetCode {
        if !self.support {
            return RetCode::NOT_INIT;
        }
        self.support = false;
        self.connected = false;
        RetCode::OK
    }
}

fn remove_handle<T: PartialEq>(handles: &mut Vec<T>, handle: &T, missing: RetCode) -> RetCode {
    match handles.iter().position(|h| h == handle) {
        Some(index) => {
            handles.remove(index);
            RetCode::OK
        }
        None => missing,
    }
}

/// Agent side of the loopback link
pub struct LoopbackAgent {
    requests: Sender<RequestFrame>,
    responses: Receiver<ResponseFrame>,
    publications: Receiver<PublicationFrame>,
    next_sequence: AtomicI64,
    memory: MemoryConf,
}

impl LoopbackAgent {
    /// Send a `BasicTypes` request carrying `value` in its int16 field.
    /// Returns the request's sequence number.
    pub fn call(&self, topic: &str, value: i16) -> MwResult<i64> {
        let mut request = MessageBuffer::standalone(&BASIC_TYPES_REQUEST, &self.memory);
        request
            .write_i16(INT16_FIELD, value)
            .map_err(|err| MwError::new(RetCode::ERROR, err.to_string()))?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.requests
            .send(RequestFrame {
                topic: topic.to_string(),
                sequence,
                payload: request.as_bytes().to_vec(),
            })
            .map_err(|_| MwError::new(RetCode::ERROR, "node disconnected"))?;
        Ok(sequence)
    }

    /// Next response, decoded to (sequence, int16 value)
    pub fn try_response(&self) -> Option<(i64, i16)> {
        let frame = self.responses.try_recv().ok()?;
        let mut response = MessageBuffer::standalone(&BASIC_TYPES_RESPONSE, &self.memory);
        response.write_bytes(&frame.payload).ok()?;
        let value = response.read_i16(INT16_FIELD).ok()?;
        Some((frame.sequence, value))
    }

    pub fn recv_response(&self, timeout: Duration) -> Option<(i64, i16)> {
        let frame = self.responses.recv_timeout(timeout).ok()?;
        let mut response = MessageBuffer::standalone(&BASIC_TYPES_RESPONSE, &self.memory);
        response.write_bytes(&frame.payload).ok()?;
        let value = response.read_i16(INT16_FIELD).ok()?;
        Some((frame.sequence, value))
    }

    pub fn try_publication(&self) -> Option<PublicationFrame> {
        self.publications.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BASIC_TYPES, STRING};

    fn connected() -> (LoopbackSession, LoopbackAgent) {
        let (mut session, agent) = loopback(0);
        session.init_transport(&TransportConfig::default()).unwrap();
        session.init_support().unwrap();
        session.init_node("control_node", "robot").unwrap();
        (session, agent)
    }

    #[test]
    fn test_rejects_bad_agent_address() {
        let (mut session, _agent) = loopback(0);
        let config = TransportConfig {
            agent_ip: "not-an-ip".into(),
            ..TransportConfig::default()
        };
        let err = session.init_transport(&config).unwrap_err();
        assert_eq!(err.code, RetCode::INVALID_ARGUMENT);
    }

    #[test]
    fn test_node_requires_support() {
        let (mut session, _agent) = loopback(0);
        assert!(session.init_node("control_node", "robot").is_err());
    }

    #[test]
    fn test_publisher_warmup() {
        let (mut session, _agent) = loopback(2);
        session.init_transport(&TransportConfig::default()).unwrap();
        session.init_support().unwrap();
        session.init_node("control_node", "robot").unwrap();
        assert!(session.init_publisher("chatter", &STRING).is_err());
        assert!(session.init_publisher("chatter", &STRING).is_err());
        assert!(session.init_publisher("chatter", &STRING).is_ok());
    }

    #[test]
    fn test_request_response_roundtrip() {
        let (mut session, agent) = connected();
        let service = session.init_service("/control", &BASIC_TYPES).unwrap();
        let sequence = agent.call("/control", 12).unwrap();
        agent.call("/other", 1).unwrap();

        assert!(session.wait(Duration::from_millis(10)).unwrap());
        assert!(session.has_pending_request(&service));

        let conf = MemoryConf::default();
        let mut request = MessageBuffer::standalone(&BASIC_TYPES_REQUEST, &conf);
        let header = session.take_request(&service, &mut request).unwrap().unwrap();
        assert_eq!(header.sequence, sequence);
        assert_eq!(request.read_i16(INT16_FIELD).unwrap(), 12);
        assert!(session.take_request(&service, &mut request).unwrap().is_none());

        let mut response = MessageBuffer::standalone(&BASIC_TYPES_RESPONSE, &conf);
        response.write_i16(INT16_FIELD, 11).unwrap();
        session.send_response(&service, &header, &response).unwrap();
        assert_eq!(agent.try_response(), Some((sequence, 11)));
    }

    #[test]
    fn test_unregistered_topic_dropped() {
        let (mut session, agent) = connected();
        let service = session.init_service("/control", &BASIC_TYPES).unwrap();
        for _ in 0..100 {
            agent.call("/other", 1).unwrap();
        }

        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        assert!(!session.wait(timeout).unwrap());
        assert!(start.elapsed() >= timeout);
        assert_eq!(session.pending_requests(), 0);
        assert!(!session.has_pending_request(&service));

        agent.call("/control", 3).unwrap();
        assert!(session.wait(timeout).unwrap());
        assert_eq!(session.pending_requests(), 1);
        assert_eq!(session.fini_service(service), RetCode::OK);
        assert_eq!(session.pending_requests(), 0);
    }

    #[test]
    fn test_wait_times_out_without_requests() {
        let (mut session, _agent) = connected();
        assert!(!session.wait(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_publish_and_fini() {
        let (mut session, agent) = connected();
        let publisher = session.init_publisher("chatter", &STRING).unwrap();
        let mut message = MessageBuffer::standalone(&STRING, &MemoryConf::default());
        message.write_bytes(b"7").unwrap();
        session.publish(&publisher, &message).unwrap();
        let frame = agent.try_publication().unwrap();
        assert_eq!(frame.topic, "chatter");
        assert_eq!(frame.text(), Some("7"));

        assert_eq!(session.fini_publisher(publisher.clone()), RetCode::OK);
        assert_eq!(session.fini_publisher(publisher.clone()), RetCode::PUBLISHER_INVALID);
        assert!(session.publish(&publisher, &message).is_err());
        assert_eq!(session.fini_node(), RetCode::OK);
        assert_eq!(session.fini_support(), RetCode::OK);
        assert_eq!(session.fini_support(), RetCode::NOT_INIT);
    }
}
