//! The broker core: connections, groups, caches and the schema registry
//!
//! [`Broker`] is a plain synchronous state machine. It never spawns or awaits;
//! the [`host`](crate::host) task feeds it accepted channels, inbound frames
//! and timer ticks one at a time, which makes every accepted transmission
//! (cache update plus fanout) atomic with respect to every other.
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Broker                                                          │
//! │  ├── connections: open Connections by PeerId                     │
//! │  ├── closed: closed Connections awaiting the sweep               │
//! │  ├── groups: GroupTable (fanout)                                 │
//! │  ├── dispatcher: ContainerPool + local subscribers               │
//! │  ├── registry: known struct/enum types                           │
//! │  └── events: broadcast::Sender<BrokerEvent>                      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connections never call back into the broker. They queue state
//! transitions which the broker drains after every operation; a transition
//! may publish more objects (peer-state records, cleanup removals) whose
//! fanout may close more connections, so draining loops until quiet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ControlRequest, Received, Transition};
use crate::container::Container;
use crate::dispatcher::{Dispatched, Dispatcher, EventHandler, ObjectEvent, SubscriptionId};
use crate::error::{BrokerError, BrokerResult};
use crate::group::{Group, GroupTable};
use crate::protocol::{
    self, error_code, ConnectionState, ControlMessage, Header, MemberEvent, Payload, Transmission,
    CLEAR_CACHE_GROUP, ENUM_SCHEMA_GROUP, PEER_STATE_TYPE, STRUCT_SCHEMA_GROUP,
    TYPE_ANNOUNCE_TYPE,
};
use crate::schema::{EnumSchema, Registered, Registry, StructSchema, ValueKind};
use crate::transport::{Channel, TransportError};
use crate::types::{Instance, PeerId, PropertySet, HOST_ID};

/// Default capacity for the event broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications for observers of the broker
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A connection changed protocol state
    PeerStateChanged {
        peer: PeerId,
        name: String,
        state: ConnectionState,
        /// Why a connection closed abnormally; set at most once per peer
        cause: Option<String>,
    },
    /// An object was created, updated or removed
    Object(ObjectEvent),
    /// A type became known to the broker
    TypeAnnounced { id: u32, name: String },
}

/// Whether the reader of a connection should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct Broker {
    name: String,
    registry: Registry,
    dispatcher: Dispatcher,
    groups: GroupTable,
    connections: HashMap<PeerId, Connection>,
    closed: HashMap<PeerId, Connection>,
    cleanup_types: Vec<String>,
    type_ids: HashMap<String, u32>,
    next_peer_id: PeerId,
    next_type_id: u32,
    events: broadcast::Sender<BrokerEvent>,
    draining: bool,
}

impl Broker {
    /// Create a broker knowing only the built-in types
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, Registry::new(), DEFAULT_EVENT_CAPACITY)
    }

    /// Create a broker around an existing registry
    ///
    /// Every type in the registry is announced as if it had just been
    /// registered.
    pub fn with_registry(name: impl Into<String>, registry: Registry, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let known: Vec<Arc<StructSchema>> = registry.structs().cloned().collect();
        let mut broker = Self {
            name: name.into(),
            registry,
            dispatcher: Dispatcher::new(),
            groups: GroupTable::new(),
            connections: HashMap::new(),
            closed: HashMap::new(),
            cleanup_types: Vec::new(),
            type_ids: HashMap::new(),
            next_peer_id: HOST_ID + 1,
            next_type_id: 1,
            events,
            draining: false,
        };
        for schema in known {
            broker.on_new_type(&schema);
        }
        broker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Receive every [`BrokerEvent`] from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<BrokerEvent> {
        self.events.clone()
    }

    /// State of an open or not yet swept connection
    pub fn connection_state(&self, peer: PeerId) -> Option<ConnectionState> {
        self.connections
            .get(&peer)
            .or_else(|| self.closed.get(&peer))
            .map(Connection::state)
    }

    pub fn peer_name(&self, peer: PeerId) -> Option<&str> {
        self.connections
            .get(&peer)
            .or_else(|| self.closed.get(&peer))
            .map(Connection::peer_name)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connections closed since the last sweep
    pub fn closed_connections(&self) -> usize {
        self.closed.len()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn container(&self, type_name: &str) -> Option<&Container> {
        self.dispatcher.pool().get(type_name)
    }

    /// Sequence id assigned when the type became known
    pub fn type_id(&self, type_name: &str) -> Option<u32> {
        self.type_ids.get(type_name).copied()
    }

    /// Register a local handler for objects of one type
    pub fn subscribe(&mut self, type_name: &str, handler: EventHandler) -> BrokerResult<SubscriptionId> {
        let schema = self.registry.resolve(type_name)?;
        Ok(self.dispatcher.subscribe(&schema, handler))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> BrokerResult<()> {
        self.dispatcher.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Make a struct type known; a new type is announced to the system group
    pub fn register_struct(&mut self, schema: StructSchema) -> BrokerResult<Registered> {
        let name = schema.name.clone();
        let registered = self.registry.register_struct(schema)?;
        if registered == Registered::New {
            let schema = self.registry.resolve(&name)?;
            self.on_new_type(&schema);
            self.process_transitions();
        }
        Ok(registered)
    }

    pub fn register_enum(&mut self, schema: EnumSchema) -> BrokerResult<Registered> {
        let name = schema.name.clone();
        let registered = self.registry.register_enum(schema)?;
        if registered == Registered::New {
            info!(enum_name = %name, "registered enum type");
        }
        Ok(registered)
    }

    fn on_new_type(&mut self, schema: &Arc<StructSchema>) {
        let id = self.next_type_id;
        self.next_type_id += 1;
        self.type_ids.insert(schema.name.clone(), id);
        info!(
            type_id = id,
            type_name = %schema.name,
            flags = %schema.flags.to_flag_string(),
            "registered struct type"
        );

        if schema.is_cached() {
            self.dispatcher.pool_mut().get_or_create(schema);
            if schema.is_cleanup_on_disconnect() {
                self.cleanup_types.push(schema.name.clone());
            }
        }

        let _ = self.events.send(BrokerEvent::TypeAnnounced {
            id,
            name: schema.name.clone(),
        });
        let record = protocol::type_announce_instance(id, schema);
        if let Err(e) = self.publish_internal(record, None, false) {
            error!(type_name = %schema.name, error = %e, "failed to announce type");
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Take ownership of a new channel and greet the guest
    pub fn accept(&mut self, channel: Box<dyn Channel>) -> PeerId {
        let peer = self.next_peer_id;
        self.next_peer_id += 1;

        let mut connection = Connection::new(peer, channel);
        info!(peer, endpoint = %connection.remote_endpoint(), "accepted connection");
        if let Err(e) = connection.begin_handshake(&self.name) {
            connection.fail(e);
        }
        self.connections.insert(peer, connection);
        self.process_transitions();
        peer
    }

    /// Process one inbound frame from a guest
    pub fn handle_frame(&mut self, peer: PeerId, transmission: Transmission) -> Flow {
        let Some(connection) = self.connections.get_mut(&peer) else {
            debug!(peer, "frame for unknown or closed connection dropped");
            return Flow::Stop;
        };

        match connection.receive(transmission) {
            Received::Handled => {}
            Received::Regular(transmission) => {
                if let Err(e) = self.handle_regular(transmission) {
                    self.report(peer, e);
                }
            }
            Received::Control(request) => {
                if let Err(e) = self.handle_control(peer, request) {
                    self.report(peer, e);
                }
            }
            Received::Rejected(reason) => self.report(peer, BrokerError::Protocol(reason)),
            Received::Fatal(error) => self.report(peer, error),
        }

        self.process_transitions();
        match self.connections.get(&peer) {
            Some(c) if !c.is_closed() => Flow::Continue,
            _ => Flow::Stop,
        }
    }

    /// The transport of a connection failed
    pub fn handle_transport_error(&mut self, peer: PeerId, error: TransportError) {
        if let Some(connection) = self.connections.get_mut(&peer) {
            connection.handle_transport_error(error);
            self.process_transitions();
        }
    }

    /// Send an error notice to a peer; anything but a protocol violation also closes it
    fn report(&mut self, peer: PeerId, error: BrokerError) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        if error.is_protocol_violation() {
            warn!(peer, name = %connection.peer_name(), %error, "protocol violation");
            connection.send_error(error_code::PROTOCOL_VIOLATION, error.to_string());
        } else {
            connection.send_error(error_code::PROCESSING_FAILURE, error.to_string());
            connection.fail(error);
        }
    }

    fn handle_regular(&mut self, mut transmission: Transmission) -> BrokerResult<()> {
        let schema = self.registry.resolve(&transmission.header.type_name)?;
        let Payload::Object(instance) = &transmission.payload else {
            return Err(BrokerError::Protocol(format!(
                "control payload for type '{}'",
                schema.name
            )));
        };
        if transmission.header.is_control() != schema.is_internal() {
            return Err(BrokerError::Protocol(format!(
                "type '{}' sent in the wrong namespace",
                schema.name
            )));
        }
        schema.validate(instance)?;
        if transmission.header.attributes.is_empty() {
            transmission.header.attributes = schema.valid_properties(instance);
        }
        transmission.header.attributes =
            (transmission.header.attributes & schema.all_properties()) | schema.key_properties();

        self.dispatch_and_fanout(&schema, Arc::new(transmission))
    }

    fn handle_control(&mut self, peer: PeerId, request: ControlRequest) -> BrokerResult<()> {
        match request {
            ControlRequest::Member { group, event } => self.handle_member(peer, &group, event),
            ControlRequest::DescriptorRequest {
                whitelist,
                blacklist,
            } => self.handle_descriptor_request(peer, whitelist.as_deref(), blacklist.as_deref()),
            ControlRequest::ClearCache { type_names, header } => {
                self.clear_cache(&type_names);
                let forwarded = Transmission {
                    header,
                    payload: Payload::Control(ControlMessage::ClearCache { type_names }),
                };
                self.forward(CLEAR_CACHE_GROUP, forwarded);
                Ok(())
            }
            ControlRequest::ImportStruct { schema, header } => {
                match self.register_struct(schema.clone())? {
                    Registered::New => info!(peer, type_name = %schema.name, "imported struct type"),
                    Registered::Unchanged => debug!(peer, type_name = %schema.name, "struct type already known"),
                }
                self.confirm_import(peer, &schema.name);
                self.forward(
                    STRUCT_SCHEMA_GROUP,
                    Transmission {
                        header,
                        payload: Payload::Control(ControlMessage::StructSchema(schema)),
                    },
                );
                Ok(())
            }
            ControlRequest::ImportEnum { schema, header } => {
                self.register_enum(schema.clone())?;
                self.confirm_import(peer, &schema.name);
                self.forward(
                    ENUM_SCHEMA_GROUP,
                    Transmission {
                        header,
                        payload: Payload::Control(ControlMessage::EnumSchema(schema)),
                    },
                );
                Ok(())
            }
        }
    }

    /// Later copies of a schema the guest already sent are dropped
    fn confirm_import(&mut self, peer: PeerId, type_name: &str) {
        if let Some(connection) = self.connections.get_mut(&peer) {
            connection.remember_import(type_name);
        }
    }

    fn handle_member(&mut self, peer: PeerId, group: &str, event: MemberEvent) -> BrokerResult<()> {
        match event {
            MemberEvent::Join => {
                if self.groups.join(group, peer) {
                    info!(peer, group, "guest joined group");
                }
                // A repeated join replays the cache again.
                if let Some(schema) = self.registry.find_struct(group) {
                    if schema.is_cached() {
                        self.replay_to(peer, &schema)?;
                    }
                }
            }
            MemberEvent::Leave => {
                if self.groups.leave(group, peer) {
                    info!(peer, group, "guest left group");
                }
            }
            MemberEvent::Kill => {
                warn!(peer, group, "kill membership event is not supported");
            }
        }
        Ok(())
    }

    fn replay_to(&mut self, peer: PeerId, schema: &Arc<StructSchema>) -> BrokerResult<()> {
        let replay = self
            .dispatcher
            .pool_mut()
            .get_or_create(schema)
            .replay();
        let connection = self
            .connections
            .get_mut(&peer)
            .ok_or(BrokerError::UnknownConnection(peer))?;
        debug!(peer, type_name = %schema.name, items = replay.len(), "replaying cache");
        for transmission in &replay {
            connection.send_transmission(transmission);
        }
        connection.send_control(ControlMessage::end_of_replay(&schema.name));
        Ok(())
    }

    fn handle_descriptor_request(
        &mut self,
        peer: PeerId,
        whitelist: Option<&[String]>,
        blacklist: Option<&[String]>,
    ) -> BrokerResult<()> {
        let whitelist = whitelist.unwrap_or_default();
        let blacklist = blacklist.unwrap_or_default();
        let selected: Vec<Arc<StructSchema>> = self
            .registry
            .structs()
            .filter(|s| !s.is_internal())
            .filter(|s| whitelist.is_empty() || whitelist.contains(&s.name))
            .filter(|s| !blacklist.contains(&s.name))
            .cloned()
            .collect();

        let mut enums_sent: Vec<String> = Vec::new();
        let mut messages = Vec::new();
        for schema in &selected {
            for property in &schema.properties {
                if let ValueKind::Enum(enum_name) = &property.kind {
                    if enums_sent.contains(enum_name) {
                        continue;
                    }
                    if let Some(enum_schema) = self.registry.find_enum(enum_name) {
                        enums_sent.push(enum_name.clone());
                        messages.push(ControlMessage::EnumSchema((*enum_schema).clone()));
                    }
                }
            }
            messages.push(ControlMessage::StructSchema((**schema).clone()));
        }

        let connection = self
            .connections
            .get_mut(&peer)
            .ok_or(BrokerError::UnknownConnection(peer))?;
        info!(peer, name = %connection.peer_name(), types = selected.len(), "answering schema discovery");
        for message in messages {
            connection.send_control(message);
        }
        connection.send_control(ControlMessage::end_of_discovery());
        Ok(())
    }

    fn forward(&mut self, group: &str, transmission: Transmission) {
        let transmission = Arc::new(transmission);
        self.groups
            .deliver(group, &transmission, &mut self.connections);
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish an object as the broker itself
    ///
    /// `included` defaults to the properties set on the instance.
    pub fn publish(&mut self, instance: Instance, included: Option<PropertySet>, remove: bool) -> BrokerResult<()> {
        self.publish_internal(instance, included, remove)?;
        self.process_transitions();
        Ok(())
    }

    /// Remove an object; only its key properties need to be set
    pub fn remove(&mut self, instance: Instance) -> BrokerResult<()> {
        let schema = self.registry.resolve(instance.type_name())?;
        self.publish(instance, Some(schema.key_properties()), true)
    }

    fn publish_internal(
        &mut self,
        instance: Instance,
        included: Option<PropertySet>,
        remove: bool,
    ) -> BrokerResult<()> {
        let schema = self.registry.resolve(instance.type_name())?;
        schema.validate(&instance)?;
        let included = included.unwrap_or_else(|| schema.valid_properties(&instance));
        let mut header = Header::for_object(&schema, included, remove);
        header.sender = Some(HOST_ID);
        header.server_sent_time = Some(Utc::now());
        header.is_from_myself = true;
        self.dispatch_and_fanout(&schema, Arc::new(Transmission::object(header, instance)))
    }

    fn dispatch_and_fanout(&mut self, schema: &Arc<StructSchema>, transmission: Arc<Transmission>) -> BrokerResult<()> {
        let Some(instance) = transmission.instance() else {
            return Err(BrokerError::InvalidOperation(
                "only objects can be dispatched".to_string(),
            ));
        };
        let header = &transmission.header;
        let Dispatched { event, .. } =
            self.dispatcher
                .apply(schema, header, instance, header.is_from_myself)?;
        if let Some(event) = event {
            let _ = self.events.send(BrokerEvent::Object(event));
        }

        let delivery = self
            .groups
            .deliver(header.group(), &transmission, &mut self.connections);
        if !delivery.failed.is_empty() {
            debug!(group = header.group(), failed = ?delivery.failed, "fanout closed members");
        }
        Ok(())
    }

    /// Remove every cached entry of the named types
    ///
    /// A failed removal is logged and the clear carries on.
    pub fn clear_cache(&mut self, type_names: &[String]) {
        for type_name in type_names {
            let Some(container) = self.dispatcher.pool().get(type_name) else {
                continue;
            };
            let instances: Vec<Instance> = container
                .iter()
                .map(|(_, entry)| entry.instance.clone())
                .collect();
            info!(type_name = %type_name, entries = instances.len(), "clearing cache");
            let key_properties = container.schema().key_properties();
            for instance in instances {
                if let Err(e) = self.publish_internal(instance, Some(key_properties), true) {
                    error!(type_name = %type_name, error = %e, "cache clear removal failed");
                }
            }
        }
        self.process_transitions();
    }

    // ------------------------------------------------------------------
    // Transitions and cleanup
    // ------------------------------------------------------------------

    fn process_transitions(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        loop {
            let pending: Vec<(PeerId, Vec<Transition>)> = self
                .connections
                .iter_mut()
                .filter(|(_, c)| c.has_transitions())
                .map(|(id, c)| (*id, c.take_transitions()))
                .collect();
            if pending.is_empty() {
                break;
            }
            for (peer, transitions) in pending {
                for transition in transitions {
                    self.on_transition(peer, transition);
                }
            }
        }
        self.draining = false;
    }

    fn on_transition(&mut self, peer: PeerId, transition: Transition) {
        let name = self
            .peer_name(peer)
            .unwrap_or(crate::connection::UNNAMED_PEER)
            .to_string();
        let state = transition.state;
        match (&transition.cause, state) {
            (None, ConnectionState::Closed) => info!(peer, name = %name, "guest disconnected"),
            (Some(cause), ConnectionState::Closed) => {
                error!(peer, name = %name, cause = %cause, "guest connection failed")
            }
            (_, ConnectionState::Connected) => info!(peer, name = %name, "guest is connected"),
            _ => debug!(peer, name = %name, state = %state, "guest state change"),
        }

        if state == ConnectionState::Closed {
            self.on_closed(peer);
        }

        let _ = self.events.send(BrokerEvent::PeerStateChanged {
            peer,
            name: name.clone(),
            state,
            cause: transition.cause,
        });
        let record = protocol::peer_state_instance(peer, &name, state);
        if let Err(e) = self.publish_internal(record, None, false) {
            error!(peer, error = %e, "failed to publish peer state");
        }
    }

    fn on_closed(&mut self, peer: PeerId) {
        if let Some(connection) = self.connections.remove(&peer) {
            self.closed.insert(peer, connection);
        }

        let cleanup_types = self.cleanup_types.clone();
        for type_name in cleanup_types {
            let Some(container) = self.dispatcher.pool().get(&type_name) else {
                continue;
            };
            let owned = container.written_by(peer);
            if owned.is_empty() {
                continue;
            }
            info!(peer, type_name = %type_name, entries = owned.len(), "removing objects of closed guest");
            let key_properties = container.schema().key_properties();
            for instance in owned {
                if let Err(e) = self.publish_internal(instance, Some(key_properties), true) {
                    error!(peer, type_name = %type_name, error = %e, "cleanup removal failed");
                }
            }
        }
    }

    /// Periodic housekeeping
    ///
    /// Drops group membership of closed connections and retracts peer-state
    /// records of closed peers nothing else refers to.
    pub fn sweep(&mut self) {
        let closed: Vec<PeerId> = self.closed.keys().copied().collect();
        for peer in &closed {
            self.groups.drop_connection(*peer);
        }
        if !closed.is_empty() {
            debug!(peers = ?closed, "swept closed connections");
        }
        self.closed.clear();

        let Some(peer_states) = self.dispatcher.pool().get(PEER_STATE_TYPE) else {
            return;
        };
        let stale: Vec<Instance> = peer_states
            .iter()
            .filter_map(|(_, entry)| {
                let (peer, state) = protocol::peer_state_of(&entry.instance)?;
                (state == ConnectionState::Closed).then_some((peer, entry.instance.clone()))
            })
            .filter(|(peer, _)| !self.is_referenced(*peer))
            .map(|(_, instance)| instance)
            .collect();
        let key_properties = peer_states.schema().key_properties();

        for record in stale {
            if let Err(e) = self.publish_internal(record, Some(key_properties), true) {
                error!(error = %e, "failed to retract peer state");
            }
        }
        self.process_transitions();
    }

    /// Whether any cached object of a non peer-state type names the peer
    fn is_referenced(&self, peer: PeerId) -> bool {
        self.dispatcher
            .pool()
            .iter()
            .filter(|c| {
                let name = c.schema().name.as_str();
                name != PEER_STATE_TYPE && name != TYPE_ANNOUNCE_TYPE
            })
            .any(|c| c.referenced_by(peer))
    }

    /// Say goodbye to every guest and close their connections
    pub fn shutdown(&mut self) {
        info!(connections = self.connections.len(), "broker shutting down");
        for connection in self.connections.values_mut() {
            connection.send_error(error_code::GOODBYE, "host shutting down");
            connection.close(None);
        }
        self.process_transitions();
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StructFlags, ValueKind};
    use crate::transport::local;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn broker() -> Broker {
        let mut broker = Broker::new("test-host");
        broker
            .register_struct(
                StructSchema::new("Widget")
                    .with_flags(StructFlags::cached())
                    .key_property("id", 1, ValueKind::UInt)
                    .property("color", 2, ValueKind::String),
            )
            .unwrap();
        broker
    }

    fn connect(broker: &mut Broker, name: &str) -> (PeerId, UnboundedReceiver<Arc<Transmission>>) {
        let (channel, mut rx) = local::channel(name);
        let peer = broker.accept(Box::new(channel));
        broker.handle_frame(peer, Transmission::control(ControlMessage::connect(name, false)));
        while rx.try_recv().is_ok() {}
        (peer, rx)
    }

    #[test]
    fn test_builtin_types_are_announced() {
        let broker = Broker::new("host");
        assert!(broker.type_id(PEER_STATE_TYPE).is_some());
        assert!(broker.type_id(TYPE_ANNOUNCE_TYPE).is_some());
        assert_eq!(broker.container(TYPE_ANNOUNCE_TYPE).unwrap().len(), 2);
    }

    #[test]
    fn test_register_struct_twice() {
        let mut broker = broker();
        let id = broker.type_id("Widget").unwrap();
        let again = broker
            .register_struct(
                StructSchema::new("Widget")
                    .with_flags(StructFlags::cached())
                    .key_property("id", 1, ValueKind::UInt)
                    .property("color", 2, ValueKind::String),
            )
            .unwrap();
        assert_eq!(again, Registered::Unchanged);
        assert_eq!(broker.type_id("Widget"), Some(id));
    }

    #[test]
    fn test_accept_assigns_increasing_ids() {
        let mut broker = broker();
        let (a, _rx_a) = connect(&mut broker, "a");
        let (b, _rx_b) = connect(&mut broker, "b");
        assert!(b > a);
        assert!(a > HOST_ID);
        assert_eq!(broker.connection_state(a), Some(ConnectionState::Connected));
        assert_eq!(broker.peer_name(b), Some("b"));
    }

    #[test]
    fn test_peer_state_record_follows_connection() {
        let mut broker = broker();
        let (peer, _rx) = connect(&mut broker, "guest");
        let record = broker
            .container(PEER_STATE_TYPE)
            .unwrap()
            .find(&protocol::peer_state_instance(peer, "", ConnectionState::Closed))
            .unwrap();
        assert_eq!(
            protocol::peer_state_of(&record.instance),
            Some((peer, ConnectionState::Connected))
        );
    }

    #[test]
    fn test_unknown_type_is_protocol_violation() {
        let mut broker = broker();
        let (peer, mut rx) = connect(&mut broker, "guest");

        let t = Transmission::object(Header::new("Gadget"), Instance::new("Gadget").with(1, 1u64));
        assert_eq!(broker.handle_frame(peer, t), Flow::Continue);
        let reply = rx.try_recv().unwrap();
        assert!(matches!(
            reply.control_message(),
            Some(ControlMessage::Error {
                code: error_code::PROTOCOL_VIOLATION,
                ..
            })
        ));
        assert_eq!(broker.connection_state(peer), Some(ConnectionState::Connected));
    }

    #[test]
    fn test_local_publish_reaches_members() {
        let mut broker = broker();
        let (peer, mut rx) = connect(&mut broker, "guest");
        broker.handle_frame(
            peer,
            Transmission::control(ControlMessage::member("Widget", MemberEvent::Join)),
        );
        while rx.try_recv().is_ok() {}

        broker
            .publish(Instance::new("Widget").with(1, 3u64).with(2, "green"), None, false)
            .unwrap();
        let t = rx.try_recv().unwrap();
        assert_eq!(t.header.sender, Some(HOST_ID));
        assert!(t.header.is_from_myself);
        assert_eq!(broker.container("Widget").unwrap().len(), 1);
    }

    #[test]
    fn test_local_remove_sends_key_only() {
        let mut broker = broker();
        let (peer, mut rx) = connect(&mut broker, "guest");
        broker
            .publish(Instance::new("Widget").with(1, 3u64).with(2, "green"), None, false)
            .unwrap();
        broker.handle_frame(
            peer,
            Transmission::control(ControlMessage::member("Widget", MemberEvent::Join)),
        );
        while rx.try_recv().is_ok() {}

        broker.remove(Instance::new("Widget").with(1, 3u64)).unwrap();
        let t = rx.try_recv().unwrap();
        assert!(t.header.remove);
        assert_eq!(t.header.attributes, PropertySet::from_tags([1]));
        assert!(broker.container("Widget").unwrap().is_empty());

        // Unknown types are refused before anything is sent
        assert!(matches!(
            broker.remove(Instance::new("Gadget").with(1, 1u64)),
            Err(BrokerError::UnknownType(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clear_cache_continues_past_failed_removal() {
        let mut broker = broker();
        let schema = broker.registry.resolve("Widget").unwrap();
        // An entry that no longer validates, so its removal fails
        let corrupt = Instance::new("Widget").with(1, 1u64).with(2, 99u64);
        let header = Header::for_object(&schema, corrupt.valid_properties(), false);
        broker
            .dispatcher
            .pool_mut()
            .get_or_create(&schema)
            .insert(&header, &corrupt)
            .unwrap();
        for id in 2..5u64 {
            broker
                .publish(Instance::new("Widget").with(1, id).with(2, "red"), None, false)
                .unwrap();
        }

        broker.clear_cache(&["Widget".to_string()]);

        let remaining = broker.container("Widget").unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.find(&Instance::new("Widget").with(1, 1u64)).is_some());
    }

    #[test]
    fn test_goodbye_moves_connection_to_closed_bucket() {
        let mut broker = broker();
        let (peer, _rx) = connect(&mut broker, "guest");
        let flow = broker.handle_frame(
            peer,
            Transmission::control(ControlMessage::error(error_code::GOODBYE, "bye")),
        );
        assert_eq!(flow, Flow::Stop);
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.closed_connections(), 1);

        broker.sweep();
        assert_eq!(broker.closed_connections(), 0);
        assert_eq!(broker.connection_state(peer), None);
    }

    #[test]
    fn test_frame_for_unknown_peer_stops() {
        let mut broker = broker();
        let t = Transmission::control(ControlMessage::end_of_discovery());
        assert_eq!(broker.handle_frame(42, t), Flow::Stop);
    }

    #[test]
    fn test_shutdown_says_goodbye() {
        let mut broker = broker();
        let (_, mut rx) = connect(&mut broker, "guest");
        broker.shutdown();

        let t = rx.try_recv().unwrap();
        assert!(matches!(
            t.control_message(),
            Some(ControlMessage::Error {
                code: error_code::GOODBYE,
                ..
            })
        ));
        assert_eq!(broker.open_connections(), 0);
    }
}
