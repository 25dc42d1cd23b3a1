//! Tidewire Core Library
//!
//! A typed publish/subscribe broker with cached object replay.
//!
//! ## Overview
//!
//! Guests connect to a host, complete a short handshake and join groups named
//! after object types. Every object a guest publishes is merged into the
//! host's cache for its type (when the type is cached) and fanned out to the
//! members of the type's group. A guest joining a group first receives the
//! current cache content, then live traffic.
//!
//! ## Core Principles
//!
//! - **Single writer**: one task owns all broker state; transports only post
//!   frames to it
//! - **Arrival order is authoritative**: the cache is a field-wise merge of
//!   writes in the order the host accepted them
//! - **Failure isolation**: a broken guest is closed without affecting
//!   delivery to anyone else
//!
//! ## Quick Start
//!
//! ```ignore
//! use tidewire_core::{host, transport::tcp, BrokerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::load("tidewire.json")?;
//!     let (handle, task) = host::spawn(config.build_broker()?, config.sweep_interval());
//!
//!     let listener = tokio::net::TcpListener::bind(&config.listen).await?;
//!     tcp::serve(listener, handle.clone(), CancellationToken::new()).await?;
//!
//!     handle.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod group;
pub mod guest;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod schema;
pub mod transport;
pub mod types;

// Re-exports
pub use broker::{Broker, BrokerEvent, Flow};
pub use config::BrokerConfig;
pub use connection::{Connection, ControlRequest, Received, Transition};
pub use container::{CloneInfo, Container, ContainerPool, Entry, Operation};
pub use dispatcher::{Dispatcher, ObjectEvent, SubscriptionId};
pub use error::{BrokerError, BrokerResult};
pub use group::{Group, GroupTable};
pub use guest::Guest;
pub use host::{HostHandle, LocalPeer};
pub use protocol::{ConnectionState, ControlMessage, Header, MemberEvent, Payload, Transmission};
pub use schema::{EnumSchema, Registered, Registry, StructFlags, StructSchema, ValueKind};
pub use transport::{Channel, TransportError};
pub use types::*;
