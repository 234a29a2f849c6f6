//! Control-channel bridge between a worker and its parent orchestrator.
//!
//! # Architecture
//!
//! - **envelope**: wire types (request/response/notification framing)
//! - **codec**: length-prefixed JSON framing over AsyncRead/AsyncWrite
//! - **channel**: lazily-connected duplex transport with a pending queue
//! - **endpoint**: correlation, command handlers, notifications, close

pub mod channel;
pub mod codec;
pub mod endpoint;
pub mod envelope;
