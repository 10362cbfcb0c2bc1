//! IPC bridge between the client and the data server.
//!
//! - **protocol**: Request types, endpoint roles
//! - **codec**: Binary request encoding, response scalars, stream framing
//! - **transport**: FIFO, message-queue and shared-memory transports
//! - **channel**: Named request/response channel over one transport

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;
