//! Byte channels between the broker and its guests
//!
//! The broker core only sees the [`Channel`] trait: a synchronous, non-blocking
//! send plus close. Inbound frames are pushed into the host task by whatever
//! owns the read side (see [`tcp`] and [`local`]).

pub mod local;
pub mod tcp;

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::Transmission;

/// Failure of the underlying channel
#[derive(Error, Debug)]
pub enum TransportError {
    /// The other side went away
    #[error("channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

/// Outbound half of a connection as seen by the broker
///
/// `send` must not block: implementations queue the frame for a writer task.
pub trait Channel: Send {
    fn send(&mut self, transmission: &Arc<Transmission>) -> Result<(), TransportError>;

    /// Stop reading and writing; idempotent
    fn close(&mut self);

    /// Human-readable address of the remote side, for logs
    fn remote_endpoint(&self) -> String {
        "<unknown>".to_string()
    }
}
