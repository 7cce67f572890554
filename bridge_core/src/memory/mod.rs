//! # Payload memory
//!
//! Fixed-capacity message buffers and the manager that owns them for the
//! lifetime of the node:
//!
//! - **MessageSchema**: type descriptors that size each buffer
//! - **BufferManager**: allocation during bring-up, release during teardown
//! - **MessageBuffer**: bounded storage with checked writes

pub mod buffer;
pub mod schema;

pub use buffer::{BufferId, BufferManager, MessageBuffer};
pub use schema::{
    Field, FieldKind, MemoryConf, MessageSchema, ServiceSchema, BASIC_TYPES, BASIC_TYPES_REQUEST,
    BASIC_TYPES_RESPONSE, INT16_FIELD, STRING,
};
