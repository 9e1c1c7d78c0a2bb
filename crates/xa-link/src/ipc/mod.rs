//! # IPC Layer
//!
//! Context propagation headers and the enlistment wire protocol.

pub mod headers;
pub mod messages;

pub use headers::{extract, inject, RpcMetadata};
pub use messages::{EnlistmentRequest, EnlistmentResponse, ErrorKind, WireFrame};
