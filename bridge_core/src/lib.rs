//! # Bridge Core
//!
//! Runtime for a microcontroller node bridging a device to a pub/sub and
//! request/response middleware bus.
//!
//! - **Node**: ordered bring-up, exactly-once teardown, the live flag
//! - **Scheduling**: bounded-time cooperative dispatch of timer and service endpoints
//! - **Memory**: fixed-capacity payload buffers with checked writes
//! - **Communication**: the session interface every middleware call goes through
//! - **Fault**: the terminal teardown-and-blink path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bridge_core::communication::loopback;
//! use bridge_core::hal::{ConsoleDiagnostics, SystemClock};
//! use bridge_core::{BridgeConfig, NodeRuntime};
//! use std::time::Duration;
//!
//! let (session, _agent) = loopback(0);
//! let mut node = NodeRuntime::new(
//!     session,
//!     SystemClock::new(),
//!     Box::new(ConsoleDiagnostics::new()),
//!     BridgeConfig::default(),
//! );
//! node.initialize().unwrap();
//! node.spin_some(Duration::from_millis(100)).unwrap();
//! ```

pub mod communication;
pub mod config;
pub mod error;
pub mod fault;
pub mod hal;
pub mod memory;
pub mod node;
pub mod scheduling;

// Re-export commonly used types for easy access
pub use communication::{RetryPolicy, Session};
pub use config::BridgeConfig;
pub use error::{NodeError, NodeResult, RetCode};
pub use fault::FaultController;
pub use node::{Counter, NodeRuntime, NodeState, RuntimeStats, TeardownReport};
pub use scheduling::{PollStats, Scheduler};
