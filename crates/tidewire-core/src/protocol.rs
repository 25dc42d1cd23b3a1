//! Broker ⇄ guest protocol
//!
//! Every frame on the wire is a [`Transmission`]: a [`Header`] plus either an
//! application object or a typed [`ControlMessage`]. Control messages always
//! travel in the reserved [`CONTROL_NAMESPACE`].
//!
//! ## Handshake
//!
//! ```text
//! Guest                                  Host
//!   |<------------- Hello ------------------|   (host name, auth challenge)
//!   |--- Connect {name, preload_cache} ---->|   connecting
//!   |<-- ConnectResponse {id, preload} -----|   -> early_subscribe | connected
//!   |                                       |
//!   |--- Member {join, "Widget"} ---------->|   (replay + CacheInfo sentinel)
//!   |--- Connect {preload_finished} ------->|
//!   |<-- ConnectResponse {preload_finished}-|   -> connected
//! ```

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::schema::{EnumSchema, StructFlags, StructSchema, ValueKind};
use crate::types::{Instance, PeerId, PropertySet, Timestamp, Value};

/// Namespace carried by every control message
pub const CONTROL_NAMESPACE: &str = "SYS";

/// Built-in cached type holding one record per peer and its connection state
pub const PEER_STATE_TYPE: &str = "PeerState";

/// Built-in cached type announcing every type known to the broker
pub const TYPE_ANNOUNCE_TYPE: &str = "TypeAnnounce";

/// Built-in enum mirroring [`ConnectionState`]
pub const CONNECTION_STATE_ENUM: &str = "ConnectionState";

/// Group receiving forwarded struct schema announcements
pub const STRUCT_SCHEMA_GROUP: &str = "StructSchema";

/// Group receiving forwarded enum schema announcements
pub const ENUM_SCHEMA_GROUP: &str = "EnumSchema";

/// Group receiving forwarded cache-clear requests
pub const CLEAR_CACHE_GROUP: &str = "ClearCache";

/// Error codes carried by [`ControlMessage::Error`]
pub mod error_code {
    /// Orderly close
    pub const GOODBYE: u32 = 0;
    /// Message not valid for the current state; the connection stays open
    pub const PROTOCOL_VIOLATION: u32 = 1;
    /// Unexpected failure while processing; the connection is closed
    pub const PROCESSING_FAILURE: u32 = 2;
}

/// Protocol state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    EarlySubscribe,
    Connected,
    Suspended,
    Closed,
}

impl ConnectionState {
    /// Enumerator value used in [`PEER_STATE_TYPE`] records
    pub fn to_enum_value(self) -> i32 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::EarlySubscribe => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Suspended => 3,
            ConnectionState::Closed => 4,
        }
    }

    pub fn from_enum_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(ConnectionState::Connecting),
            1 => Some(ConnectionState::EarlySubscribe),
            2 => Some(ConnectionState::Connected),
            3 => Some(ConnectionState::Suspended),
            4 => Some(ConnectionState::Closed),
            _ => None,
        }
    }

    /// Whether group fanout may target a connection in this state
    pub fn receives_fanout(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Suspended)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::EarlySubscribe => write!(f, "early_subscribe"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Suspended => write!(f, "suspended"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Membership change requested by a guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberEvent {
    Join,
    Leave,
    Kill,
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberEvent::Join => write!(f, "join"),
            MemberEvent::Leave => write!(f, "leave"),
            MemberEvent::Kill => write!(f, "kill"),
        }
    }
}

/// Typed protocol messages exchanged in the control namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Greeting sent by the host right after accepting a channel
    Hello {
        server_name: String,
        /// Placeholder challenge; authentication is not enforced
        auth_challenge: u64,
        authentication_required: bool,
    },
    /// Handshake request, or "preload finished" when `preload_client_finished` is set
    Connect {
        client_name: Option<String>,
        preload_cache: bool,
        preload_client_finished: bool,
    },
    /// Handshake acceptance, or the acknowledgment of a finished preload
    ConnectResponse {
        server_name: Option<String>,
        client_id: Option<PeerId>,
        accepted: bool,
        preload: bool,
        preload_finished: bool,
    },
    /// Group membership change
    Member {
        group_name: String,
        event: MemberEvent,
    },
    /// Schema discovery request
    DescriptorRequest {
        whitelist: Option<Vec<String>>,
        blacklist: Option<Vec<String>>,
    },
    /// Evict every cached entry of the listed types
    ClearCache { type_names: Vec<String> },
    /// End-of-replay or end-of-discovery sentinel
    CacheInfo {
        type_name: Option<String>,
        end_transmission: bool,
        end_descriptor_request: bool,
    },
    /// Error notice; code 0 is an orderly goodbye
    Error { code: u32, text: String },
    /// Struct type definition
    StructSchema(StructSchema),
    /// Enum type definition
    EnumSchema(EnumSchema),
}

impl ControlMessage {
    /// Name used as the header type name of this message kind
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "Hello",
            ControlMessage::Connect { .. } => "Connect",
            ControlMessage::ConnectResponse { .. } => "ConnectResponse",
            ControlMessage::Member { .. } => "Member",
            ControlMessage::DescriptorRequest { .. } => "DescriptorRequest",
            ControlMessage::ClearCache { .. } => "ClearCache",
            ControlMessage::CacheInfo { .. } => "CacheInfo",
            ControlMessage::Error { .. } => "Error",
            ControlMessage::StructSchema(_) => "StructSchema",
            ControlMessage::EnumSchema(_) => "EnumSchema",
        }
    }

    /// Handshake request from a guest
    pub fn connect(client_name: impl Into<String>, preload_cache: bool) -> Self {
        ControlMessage::Connect {
            client_name: Some(client_name.into()),
            preload_cache,
            preload_client_finished: false,
        }
    }

    /// Guest signal that it finished its preload joins
    pub fn preload_client_finished() -> Self {
        ControlMessage::Connect {
            client_name: None,
            preload_cache: false,
            preload_client_finished: true,
        }
    }

    /// Host acknowledgment of a finished preload
    pub fn preload_finished() -> Self {
        ControlMessage::ConnectResponse {
            server_name: None,
            client_id: None,
            accepted: true,
            preload: false,
            preload_finished: true,
        }
    }

    pub fn member(group_name: impl Into<String>, event: MemberEvent) -> Self {
        ControlMessage::Member {
            group_name: group_name.into(),
            event,
        }
    }

    /// Sentinel closing the replay of one group
    pub fn end_of_replay(type_name: impl Into<String>) -> Self {
        ControlMessage::CacheInfo {
            type_name: Some(type_name.into()),
            end_transmission: true,
            end_descriptor_request: false,
        }
    }

    /// Sentinel closing a schema discovery stream
    pub fn end_of_discovery() -> Self {
        ControlMessage::CacheInfo {
            type_name: None,
            end_transmission: false,
            end_descriptor_request: true,
        }
    }

    pub fn error(code: u32, text: impl Into<String>) -> Self {
        ControlMessage::Error {
            code,
            text: text.into(),
        }
    }
}

/// Metadata accompanying every transmitted object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub type_name: String,
    /// Set by the host on receipt; never trusted from the peer
    pub sender: Option<PeerId>,
    pub sent_time: Option<Timestamp>,
    pub server_sent_time: Option<Timestamp>,
    /// Properties included in this transmission
    pub attributes: PropertySet,
    pub remove: bool,
    /// Items remaining in the current cache replay batch
    pub from_cache: Option<u32>,
    pub destination_group: Option<String>,
    pub namespace: Option<String>,
    pub is_from_myself: bool,
}

impl Header {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            sender: None,
            sent_time: None,
            server_sent_time: None,
            attributes: PropertySet::NONE,
            remove: false,
            from_cache: None,
            destination_group: None,
            namespace: None,
            is_from_myself: false,
        }
    }

    /// Header for publishing an object of the given type
    ///
    /// Internal types are tagged with the control namespace. Key properties
    /// are always part of the included set.
    pub fn for_object(schema: &StructSchema, included: PropertySet, remove: bool) -> Self {
        let mut header = Header::new(&schema.name);
        header.sent_time = Some(Utc::now());
        header.attributes = included | schema.key_properties();
        header.remove = remove;
        if schema.is_internal() {
            header.namespace = Some(CONTROL_NAMESPACE.to_string());
        }
        header
    }

    pub fn is_control(&self) -> bool {
        self.namespace.as_deref() == Some(CONTROL_NAMESPACE)
    }

    /// Group this transmission is fanned out to
    pub fn group(&self) -> &str {
        self.destination_group.as_deref().unwrap_or(&self.type_name)
    }
}

/// Body of a transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Object(Instance),
    Control(ControlMessage),
}

/// A (header, payload) pair moving through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    pub header: Header,
    pub payload: Payload,
}

impl Transmission {
    pub fn object(header: Header, instance: Instance) -> Self {
        Self {
            header,
            payload: Payload::Object(instance),
        }
    }

    /// Wrap a control message with a control-namespace header
    pub fn control(message: ControlMessage) -> Self {
        let mut header = Header::new(message.type_name());
        header.namespace = Some(CONTROL_NAMESPACE.to_string());
        header.sent_time = Some(Utc::now());
        Self {
            header,
            payload: Payload::Control(message),
        }
    }

    pub fn is_control(&self) -> bool {
        self.header.is_control()
    }

    pub fn instance(&self) -> Option<&Instance> {
        match &self.payload {
            Payload::Object(instance) => Some(instance),
            Payload::Control(_) => None,
        }
    }

    pub fn control_message(&self) -> Option<&ControlMessage> {
        match &self.payload {
            Payload::Control(message) => Some(message),
            Payload::Object(_) => None,
        }
    }
}

/// Property tags of [`PEER_STATE_TYPE`]
pub mod peer_state {
    pub const ID: u32 = 1;
    pub const NAME: u32 = 2;
    pub const STATE: u32 = 3;
}

/// Property tags of [`TYPE_ANNOUNCE_TYPE`]
pub mod type_announce {
    pub const ID: u32 = 1;
    pub const NAME: u32 = 2;
    pub const FLAGS: u32 = 3;
}

/// Struct types every registry starts with
pub fn builtin_schemas() -> Vec<StructSchema> {
    let internal_cached = StructFlags {
        cached: true,
        internal: true,
        ..StructFlags::default()
    };

    vec![
        StructSchema::new(PEER_STATE_TYPE)
            .with_flags(internal_cached)
            .key_property("id", peer_state::ID, ValueKind::UInt)
            .property("name", peer_state::NAME, ValueKind::String)
            .property(
                "connectionState",
                peer_state::STATE,
                ValueKind::Enum(CONNECTION_STATE_ENUM.to_string()),
            ),
        StructSchema::new(TYPE_ANNOUNCE_TYPE)
            .with_flags(internal_cached)
            .key_property("id", type_announce::ID, ValueKind::UInt)
            .property("name", type_announce::NAME, ValueKind::String)
            .property("flags", type_announce::FLAGS, ValueKind::String),
    ]
}

/// Enum types every registry starts with
pub fn builtin_enums() -> Vec<EnumSchema> {
    let states = [
        ConnectionState::Connecting,
        ConnectionState::EarlySubscribe,
        ConnectionState::Connected,
        ConnectionState::Suspended,
        ConnectionState::Closed,
    ];
    let mut schema = EnumSchema::new(CONNECTION_STATE_ENUM);
    for state in states {
        schema = schema.enumerator(state.to_string(), state.to_enum_value());
    }
    vec![schema]
}

/// Peer-state record for one connection
pub fn peer_state_instance(id: PeerId, name: &str, state: ConnectionState) -> Instance {
    Instance::new(PEER_STATE_TYPE)
        .with(peer_state::ID, id)
        .with(peer_state::NAME, name)
        .with(peer_state::STATE, Value::Enum(state.to_enum_value()))
}

/// Read the peer id and state back from a peer-state record
pub fn peer_state_of(instance: &Instance) -> Option<(PeerId, ConnectionState)> {
    let id = instance.get(peer_state::ID)?.as_u64()?;
    let state = match instance.get(peer_state::STATE)? {
        Value::Enum(v) => ConnectionState::from_enum_value(*v)?,
        _ => return None,
    };
    Some((PeerId::try_from(id).ok()?, state))
}

/// Announcement record for a newly known type
pub fn type_announce_instance(id: u32, schema: &StructSchema) -> Instance {
    Instance::new(TYPE_ANNOUNCE_TYPE)
        .with(type_announce::ID, id)
        .with(type_announce::NAME, schema.name.as_str())
        .with(type_announce::FLAGS, schema.flags.to_flag_string())
}
