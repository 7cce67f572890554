//! Error types for the bridge runtime
//!
//! Middleware calls return [`MwResult`]; the lifecycle controller turns a
//! failed bring-up step into a [`SetupError`] that carries the source line of
//! the failing check, and everything else surfaces as [`NodeError`].

use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Integer return code reported by the middleware. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RetCode(pub i32);

impl RetCode {
    pub const OK: RetCode = RetCode(0);
    pub const ERROR: RetCode = RetCode(1);
    pub const TIMEOUT: RetCode = RetCode(2);
    pub const UNSUPPORTED: RetCode = RetCode(3);
    pub const BAD_ALLOC: RetCode = RetCode(10);
    pub const INVALID_ARGUMENT: RetCode = RetCode(11);
    pub const NOT_INIT: RetCode = RetCode(101);
    pub const NODE_INVALID: RetCode = RetCode(200);
    pub const PUBLISHER_INVALID: RetCode = RetCode(300);
    pub const SERVICE_INVALID: RetCode = RetCode(600);
    pub const SERVICE_TAKE_FAILED: RetCode = RetCode(601);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Fold another code into a running total, the way teardown sums the
    /// codes of its release calls.
    pub fn accumulate(self, other: RetCode) -> RetCode {
        RetCode(self.0.wrapping_add(other.0))
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure reported by a middleware call: its code plus the middleware's
/// error string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct MwError {
    pub code: RetCode,
    pub message: String,
}

impl MwError {
    pub fn new(code: RetCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type MwResult<T> = Result<T, MwError>;

/// A failed check, rendered as the fatal diagnostic line
/// `(!=<code>) [line <n>] [<message>]`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("(!={code}) [line {line}] [{message}]")]
pub struct CheckFailure {
    pub code: RetCode,
    pub line: u32,
    pub message: String,
}

impl CheckFailure {
    /// Capture a failure at the caller's source line.
    #[track_caller]
    pub fn capture(err: MwError) -> Self {
        Self::at(Location::caller(), err)
    }

    pub fn at(location: &Location<'_>, err: MwError) -> Self {
        Self {
            code: err.code,
            line: location.line(),
            message: err.message,
        }
    }
}

/// Bring-up steps, in the order `NodeRuntime::initialize` performs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    Transport,
    Support,
    Node,
    Executor,
    ServiceBuffers,
    Service,
    ServiceRegistration,
    PublishBuffer,
    Publisher,
    Timer,
    TimerRegistration,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::Transport => "transport session",
            SetupStep::Support => "support context",
            SetupStep::Node => "node creation",
            SetupStep::Executor => "executor creation",
            SetupStep::ServiceBuffers => "service buffer allocation",
            SetupStep::Service => "service creation",
            SetupStep::ServiceRegistration => "service registration",
            SetupStep::PublishBuffer => "publish buffer allocation",
            SetupStep::Publisher => "publisher creation",
            SetupStep::Timer => "timer creation",
            SetupStep::TimerRegistration => "timer registration",
        };
        f.write_str(name)
    }
}

/// A bring-up step that failed; always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {failure}")]
pub struct SetupError {
    pub step: SetupStep,
    pub failure: CheckFailure,
}

/// Main error type for the bridge runtime
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("transport error: {0}")]
    Transport(#[from] MwError),

    #[error("scheduler capacity of {capacity} endpoints exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("buffer overflow: {needed} bytes needed, capacity is {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },

    #[error("field '{field}' is not part of {type_name} or lies outside the buffer")]
    FieldOutOfBounds {
        type_name: &'static str,
        field: String,
    },

    #[error("buffer {0} is not allocated")]
    UnknownBuffer(usize),

    #[error("node is not live")]
    NotLive,

    #[error("node already initialized")]
    AlreadyInitialized,

    #[error("node is faulted; restart required")]
    Faulted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        NodeError::Config(msg.into())
    }

    /// Middleware-style code for local failures that stand in for a
    /// middleware step (executor creation and registration).
    pub fn ret_code(&self) -> RetCode {
        match self {
            NodeError::Setup(err) => err.failure.code,
            NodeError::Transport(err) => err.code,
            NodeError::CapacityExceeded { .. } => RetCode::ERROR,
            NodeError::BufferOverflow { .. } => RetCode::BAD_ALLOC,
            NodeError::NotLive => RetCode::NOT_INIT,
            NodeError::Config(_) => RetCode::INVALID_ARGUMENT,
            _ => RetCode::ERROR,
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
