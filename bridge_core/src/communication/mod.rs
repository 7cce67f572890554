//! Communication layer
//!
//! The [`Session`] trait is the only way the runtime talks to the
//! middleware. Two sessions ship with the crate: an in-process loopback
//! agent for hosts and a scripted mock for tests.

pub mod loopback;
pub mod mock;
pub mod retry;
pub mod traits;

pub use loopback::{loopback, LoopbackAgent, LoopbackSession, PublicationFrame};
pub use mock::{Call, MockOp, MockSession};
pub use retry::RetryPolicy;
pub use traits::{PublisherHandle, RequestHeader, ServiceHandle, Session, TimerHandle};
