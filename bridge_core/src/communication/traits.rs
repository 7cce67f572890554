//! The communication endpoint interface
//!
//! Every middleware call the node makes goes through [`Session`]. The
//! runtime never sees the wire protocol; it hands buffers in and gets
//! handles and return codes back, which keeps the transport swappable
//! (loopback agent on a host, scripted mock in tests, a real agent link on
//! the board).

use crate::config::TransportConfig;
use crate::error::{MwResult, RetCode};
use crate::memory::{MessageBuffer, MessageSchema, ServiceSchema};
use std::time::Duration;

/// Registered publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherHandle {
    pub id: u32,
    pub topic: String,
}

/// Registered service server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub id: u32,
    pub topic: String,
}

/// Middleware timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    pub id: u32,
    pub period: Duration,
}

/// Identifies a taken request so its response can be routed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub sequence: i64,
}

/// Middleware session used by the node runtime
pub trait Session {
    /// Bring up the transport with the externally supplied configuration
    fn init_transport(&mut self, config: &TransportConfig) -> MwResult<()>;

    /// Create the allocator and support context
    fn init_support(&mut self) -> MwResult<()>;

    /// Create the node with its fixed name and namespace
    fn init_node(&mut self, name: &str, namespace: &str) -> MwResult<()>;

    fn init_service(
        &mut self,
        topic: &str,
        schema: &'static ServiceSchema,
    ) -> MwResult<ServiceHandle>;

    fn init_publisher(
        &mut self,
        topic: &str,
        schema: &'static MessageSchema,
    ) -> MwResult<PublisherHandle>;

    fn init_timer(&mut self, period: Duration) -> MwResult<TimerHandle>;

    /// Whether a request is queued for `service`
    fn has_pending_request(&mut self, service: &ServiceHandle) -> bool;

    /// Block until a request is queued or `timeout` elapses.
    /// Returns true when a request is queued.
    fn wait(&mut self, timeout: Duration) -> MwResult<bool>;

    /// Move the next queued request for `service` into `request`
    fn take_request(
        &mut self,
        service: &ServiceHandle,
        request: &mut MessageBuffer,
    ) -> MwResult<Option<RequestHeader>>;

    fn send_response(
        &mut self,
        service: &ServiceHandle,
        header: &RequestHeader,
        response: &MessageBuffer,
    ) -> MwResult<()>;

    fn publish(&mut self, publisher: &PublisherHandle, message: &MessageBuffer) -> MwResult<()>;

    fn fini_publisher(&mut self, publisher: PublisherHandle) -> RetCode;

    fn fini_service(&mut self, service: ServiceHandle) -> RetCode;

    fn fini_node(&mut self) -> RetCode;

    fn fini_timer(&mut self, timer: TimerHandle) -> RetCode;

    fn fini_support(&mut self) -> RetCode;
}
