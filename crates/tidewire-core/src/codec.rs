//! Wire encoding for transmissions
//!
//! Frames are postcard-encoded [`WireMessage`]s. The version envelope lets a
//! later protocol revision coexist with guests that only speak V1. Framing
//! (length prefixes) is the transport's concern.

use serde::{Deserialize, Serialize};

use crate::protocol::Transmission;
use crate::transport::TransportError;

/// Versioned envelope around a transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    V1(Transmission),
}

/// Borrowing twin of [`WireMessage`]; serializes to the same bytes
#[derive(Serialize)]
enum WireMessageRef<'a> {
    V1(&'a Transmission),
}

impl WireMessage {
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }

    pub fn into_transmission(self) -> Transmission {
        match self {
            WireMessage::V1(transmission) => transmission,
        }
    }
}

/// Encode a transmission into one frame body
pub fn encode(transmission: &Transmission) -> Result<Vec<u8>, TransportError> {
    postcard::to_allocvec(&WireMessageRef::V1(transmission))
        .map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode one frame body
pub fn decode(bytes: &[u8]) -> Result<Transmission, TransportError> {
    postcard::from_bytes::<WireMessage>(bytes)
        .map(WireMessage::into_transmission)
        .map_err(|e| TransportError::Codec(e.to_string()))
}
