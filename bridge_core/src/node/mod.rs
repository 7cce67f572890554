//! The node: lifecycle, endpoints and callbacks

pub mod callbacks;
pub mod endpoint;
pub mod lifecycle;

pub use callbacks::{Counter, DecrementService, StatePublisher};
pub use endpoint::{
    Endpoint, EndpointKind, PollContext, Readiness, ServiceEndpoint, ServiceHandler, TimerCallback,
    TimerEndpoint,
};
pub use lifecycle::{NodeRuntime, NodeState, RuntimeStats, TeardownReport};
