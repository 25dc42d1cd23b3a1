//! Per-guest connection state machine
//!
//! A [`Connection`] owns one [`Channel`] and tracks the handshake:
//!
//! ```text
//! connecting --Connect--> early_subscribe --preload finished--> connected <--> suspended
//!      |                        |                                  |
//!      +------------------------+------------ error/goodbye -------+--> closed
//! ```
//!
//! Inbound frames go through [`Connection::receive`], which stamps the header
//! and classifies the frame. Work that needs the rest of the broker (groups,
//! caches, the registry) is handed back as a [`Received`] value; the connection
//! never calls into the broker. State changes are queued and drained by the
//! broker with [`Connection::take_transitions`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{
    error_code, ConnectionState, ControlMessage, Header, MemberEvent, Payload, Transmission,
    PEER_STATE_TYPE, TYPE_ANNOUNCE_TYPE,
};
use crate::schema::{EnumSchema, StructSchema};
use crate::transport::{Channel, TransportError};
use crate::types::{Instance, PeerId, PropertySet};

/// Name reported for a peer before its handshake names it
pub const UNNAMED_PEER: &str = "<not_set>";

/// A state change waiting to be processed by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ConnectionState,
    /// Error that caused a close; `None` for a graceful close
    pub cause: Option<String>,
}

/// Control work a connection hands to the broker
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Member {
        group: String,
        event: MemberEvent,
    },
    DescriptorRequest {
        whitelist: Option<Vec<String>>,
        blacklist: Option<Vec<String>>,
    },
    ClearCache {
        type_names: Vec<String>,
        header: Header,
    },
    ImportStruct {
        schema: StructSchema,
        header: Header,
    },
    ImportEnum {
        schema: EnumSchema,
        header: Header,
    },
}

/// Classification of one inbound frame
#[derive(Debug)]
pub enum Received {
    /// Fully handled by the connection itself
    Handled,
    /// Application object to be dispatched and fanned out
    Regular(Transmission),
    /// Control message needing broker state
    Control(ControlRequest),
    /// Not valid here; report a protocol violation and keep the connection
    Rejected(String),
    /// Unrecoverable; report with a processing failure and close
    Fatal(BrokerError),
}

pub struct Connection {
    peer_id: PeerId,
    peer_name: String,
    state: ConnectionState,
    started: bool,
    channel: Box<dyn Channel>,
    imported_types: HashSet<String>,
    transitions: Vec<Transition>,
    host_name: String,
}

impl Connection {
    pub fn new(peer_id: PeerId, channel: Box<dyn Channel>) -> Self {
        Self {
            peer_id,
            peer_name: UNNAMED_PEER.to_string(),
            state: ConnectionState::Connecting,
            started: false,
            channel,
            imported_types: HashSet::new(),
            transitions: Vec::new(),
            host_name: String::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn remote_endpoint(&self) -> String {
        self.channel.remote_endpoint()
    }

    /// Start the handshake by greeting the guest
    ///
    /// Fails if called more than once.
    pub fn begin_handshake(&mut self, host_name: &str) -> BrokerResult<()> {
        if self.started {
            return Err(BrokerError::HandshakeAlreadyStarted);
        }
        self.started = true;
        self.host_name = host_name.to_string();
        self.set_state(ConnectionState::Connecting, None);
        self.send_control(ControlMessage::Hello {
            server_name: host_name.to_string(),
            auth_challenge: 0,
            authentication_required: false,
        });
        Ok(())
    }

    /// Stamp and classify one inbound frame
    pub fn receive(&mut self, mut transmission: Transmission) -> Received {
        if self.is_closed() {
            return Received::Handled;
        }

        let now = Utc::now();
        let header = &mut transmission.header;
        header.sender = Some(self.peer_id);
        header.server_sent_time = Some(now);
        header.sent_time.get_or_insert(now);
        header.is_from_myself = false;

        if transmission.is_control() {
            self.receive_control(transmission)
        } else {
            self.receive_regular(transmission)
        }
    }

    fn receive_regular(&mut self, transmission: Transmission) -> Received {
        if let Payload::Control(message) = &transmission.payload {
            return Received::Rejected(format!(
                "control message '{}' outside the control namespace",
                message.type_name()
            ));
        }
        match self.state {
            ConnectionState::Connected => Received::Regular(transmission),
            state => Received::Rejected(format!(
                "received instance of non-control type '{}' while in state {}",
                transmission.header.type_name, state
            )),
        }
    }

    fn receive_control(&mut self, transmission: Transmission) -> Received {
        let Transmission { header, payload } = transmission;
        let message = match payload {
            Payload::Control(message) => message,
            Payload::Object(instance) => return self.receive_internal_object(header, instance),
        };

        if let ControlMessage::Error { code, text } = &message {
            self.handle_peer_error(*code, text);
            return Received::Handled;
        }

        let kind = message.type_name();
        match self.state {
            ConnectionState::Connecting => match message {
                ControlMessage::Connect {
                    client_name: Some(name),
                    preload_cache,
                    preload_client_finished: false,
                } => {
                    self.accept_connect(name, preload_cache);
                    Received::Handled
                }
                _ => self.unexpected(kind),
            },
            ConnectionState::EarlySubscribe => {
                let finished = matches!(
                    message,
                    ControlMessage::Connect {
                        preload_client_finished: true,
                        ..
                    }
                );
                if finished {
                    self.finish_preload();
                }
                match self.connected_control(header, message) {
                    Some(received) => received,
                    None if finished => Received::Handled,
                    None => self.unexpected(kind),
                }
            }
            ConnectionState::Connected => match self.connected_control(header, message) {
                Some(received) => received,
                None => self.unexpected(kind),
            },
            ConnectionState::Suspended | ConnectionState::Closed => self.unexpected(kind),
        }
    }

    /// Objects of internal types travel in the control namespace
    fn receive_internal_object(&self, header: Header, instance: Instance) -> Received {
        let type_name = instance.type_name();
        if type_name == PEER_STATE_TYPE || type_name == TYPE_ANNOUNCE_TYPE {
            return Received::Fatal(BrokerError::InvalidOperation(format!(
                "'{}' records are written by the host only",
                type_name
            )));
        }
        match self.state {
            ConnectionState::EarlySubscribe | ConnectionState::Connected => {
                Received::Regular(Transmission::object(header, instance))
            }
            state => Received::Rejected(format!(
                "received instance of internal type '{}' while in state {}",
                type_name, state
            )),
        }
    }

    /// Control messages accepted once the guest is named
    fn connected_control(&mut self, header: Header, message: ControlMessage) -> Option<Received> {
        let request = match message {
            ControlMessage::Member { group_name, event } => ControlRequest::Member {
                group: group_name,
                event,
            },
            ControlMessage::DescriptorRequest {
                whitelist,
                blacklist,
            } => ControlRequest::DescriptorRequest {
                whitelist,
                blacklist,
            },
            ControlMessage::ClearCache { type_names } => {
                ControlRequest::ClearCache { type_names, header }
            }
            ControlMessage::StructSchema(schema) => {
                if self.has_imported(&schema.name) {
                    return Some(Received::Handled);
                }
                ControlRequest::ImportStruct { schema, header }
            }
            ControlMessage::EnumSchema(schema) => {
                if self.has_imported(&schema.name) {
                    return Some(Received::Handled);
                }
                ControlRequest::ImportEnum { schema, header }
            }
            _ => return None,
        };
        Some(Received::Control(request))
    }

    fn has_imported(&self, type_name: &str) -> bool {
        let known = self.imported_types.contains(type_name);
        if known {
            trace!(peer = self.peer_id, type_name, "schema already imported");
        }
        known
    }

    /// Record a schema from this guest that the broker has registered
    ///
    /// Only confirmed names are skipped on resend, so a rejected schema can
    /// be corrected and sent again.
    pub fn remember_import(&mut self, type_name: &str) {
        self.imported_types.insert(type_name.to_string());
    }

    fn unexpected(&self, kind: &str) -> Received {
        Received::Rejected(format!(
            "unexpected control message '{}' in state {}",
            kind, self.state
        ))
    }

    fn accept_connect(&mut self, name: String, preload_cache: bool) {
        info!(peer = self.peer_id, name = %name, preload_cache, "guest connected");
        self.peer_name = name;
        self.send_control(ControlMessage::ConnectResponse {
            server_name: Some(self.host_name.clone()),
            client_id: Some(self.peer_id),
            accepted: true,
            preload: preload_cache,
            preload_finished: false,
        });
        let next = if preload_cache {
            ConnectionState::EarlySubscribe
        } else {
            ConnectionState::Connected
        };
        self.set_state(next, None);
    }

    fn finish_preload(&mut self) {
        self.set_state(ConnectionState::Connected, None);
        self.send_control(ControlMessage::preload_finished());
    }

    fn handle_peer_error(&mut self, code: u32, text: &str) {
        if code == error_code::GOODBYE {
            debug!(peer = self.peer_id, "guest said goodbye");
            self.close(None);
        } else {
            let error = BrokerError::PeerError {
                code,
                text: text.to_string(),
            };
            warn!(peer = self.peer_id, %error, "guest reported an error");
            self.close(Some(error.to_string()));
        }
    }

    /// Send an object of the given type
    ///
    /// `included` defaults to the instance's valid properties; key properties
    /// are always sent.
    pub fn send_object(
        &mut self,
        schema: &StructSchema,
        instance: &Instance,
        included: Option<PropertySet>,
        remove: bool,
    ) {
        let included = included.unwrap_or_else(|| schema.valid_properties(instance));
        let mut header = Header::for_object(schema, included, remove);
        header.sender = Some(crate::types::HOST_ID);
        header.server_sent_time = header.sent_time;
        let transmission = Arc::new(Transmission::object(header, instance.clone()));
        self.send_transmission(&transmission);
    }

    pub fn send_control(&mut self, message: ControlMessage) {
        let transmission = Arc::new(Transmission::control(message));
        self.send_transmission(&transmission);
    }

    /// Report an error code and text to the guest
    pub fn send_error(&mut self, code: u32, text: impl Into<String>) {
        self.send_control(ControlMessage::error(code, text));
    }

    /// Send a prepared transmission
    ///
    /// Dropped while suspended or closed. A channel failure closes the
    /// connection instead of surfacing to the caller.
    pub fn send_transmission(&mut self, transmission: &Arc<Transmission>) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Suspended => {
                trace!(peer = self.peer_id, type_name = %transmission.header.type_name, "dropping frame while suspended");
                return;
            }
            _ => {}
        }
        if let Err(e) = self.channel.send(transmission) {
            self.handle_transport_error(e);
        }
    }

    /// Close because the channel failed
    pub fn handle_transport_error(&mut self, error: TransportError) {
        if self.is_closed() {
            return;
        }
        match error {
            TransportError::Closed => debug!(peer = self.peer_id, "channel closed by peer"),
            ref e => error!(peer = self.peer_id, error = %e, "channel failed"),
        }
        self.close(Some(BrokerError::Transport(error).to_string()));
    }

    /// Close because processing failed
    pub fn fail(&mut self, error: BrokerError) {
        error!(peer = self.peer_id, name = %self.peer_name, %error, "closing connection");
        self.close(Some(error.to_string()));
    }

    /// Close the connection; further calls are no-ops
    pub fn close(&mut self, cause: Option<String>) {
        if self.is_closed() {
            return;
        }
        self.set_state(ConnectionState::Closed, cause);
        self.channel.close();
    }

    /// Pause delivery; only a connected connection can be suspended
    pub fn suspend(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.set_state(ConnectionState::Suspended, None);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != ConnectionState::Suspended {
            return false;
        }
        self.set_state(ConnectionState::Connected, None);
        true
    }

    pub fn has_transitions(&self) -> bool {
        !self.transitions.is_empty()
    }

    /// Drain queued state changes in the order they happened
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    fn set_state(&mut self, state: ConnectionState, cause: Option<String>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(peer = self.peer_id, from = %self.state, to = %state, "connection state change");
        self.state = state;
        self.transitions.push(Transition { state, cause });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CONTROL_NAMESPACE;
    use crate::transport::local;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connection() -> (Connection, UnboundedReceiver<Arc<Transmission>>) {
        let (channel, rx) = local::channel("test");
        (Connection::new(7, Box::new(channel)), rx)
    }

    fn sent(rx: &mut UnboundedReceiver<Arc<Transmission>>) -> Vec<Arc<Transmission>> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t);
        }
        out
    }

    fn control(message: ControlMessage) -> Transmission {
        Transmission::control(message)
    }

    fn states(conn: &mut Connection) -> Vec<ConnectionState> {
        conn.take_transitions().into_iter().map(|t| t.state).collect()
    }

    #[test]
    fn test_handshake_sends_hello() {
        let (mut conn, mut rx) = connection();
        conn.begin_handshake("host").unwrap();

        let frames = sent(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].control_message(),
            Some(ControlMessage::Hello {
                auth_challenge: 0,
                authentication_required: false,
                ..
            })
        ));
        assert_eq!(states(&mut conn), vec![ConnectionState::Connecting]);
    }

    #[test]
    fn test_handshake_twice_fails() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        assert!(matches!(
            conn.begin_handshake("host"),
            Err(BrokerError::HandshakeAlreadyStarted)
        ));
    }

    #[test]
    fn test_connect_with_preload() {
        let (mut conn, mut rx) = connection();
        conn.begin_handshake("host").unwrap();
        sent(&mut rx);

        let r = conn.receive(control(ControlMessage::connect("guest", true)));
        assert!(matches!(r, Received::Handled));
        assert_eq!(conn.state(), ConnectionState::EarlySubscribe);
        assert_eq!(conn.peer_name(), "guest");

        let frames = sent(&mut rx);
        assert!(matches!(
            frames[0].control_message(),
            Some(ControlMessage::ConnectResponse {
                client_id: Some(7),
                accepted: true,
                preload: true,
                ..
            })
        ));

        // Membership is allowed during preload
        let r = conn.receive(control(ControlMessage::member("Widget", MemberEvent::Join)));
        assert!(matches!(r, Received::Control(ControlRequest::Member { .. })));

        let r = conn.receive(control(ControlMessage::preload_client_finished()));
        assert!(matches!(r, Received::Handled));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(matches!(
            sent(&mut rx)[0].control_message(),
            Some(ControlMessage::ConnectResponse {
                preload_finished: true,
                ..
            })
        ));
        assert_eq!(
            states(&mut conn),
            vec![
                ConnectionState::Connecting,
                ConnectionState::EarlySubscribe,
                ConnectionState::Connected
            ]
        );
    }

    #[test]
    fn test_connect_without_preload_goes_straight_to_connected() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_early_subscribe_rejects_second_connect() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", true)));

        let r = conn.receive(control(ControlMessage::connect("again", true)));
        assert!(matches!(r, Received::Rejected(_)));
        assert_eq!(conn.state(), ConnectionState::EarlySubscribe);
    }

    #[test]
    fn test_regular_before_connected_is_rejected() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();

        let t = Transmission::object(Header::new("Widget"), Instance::new("Widget").with(1, 1u64));
        match conn.receive(t) {
            Received::Rejected(reason) => assert!(reason.contains("non-control type 'Widget'")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_inbound_header_is_stamped() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));

        let mut header = Header::new("Widget");
        header.sender = Some(999);
        header.is_from_myself = true;
        let t = Transmission::object(header, Instance::new("Widget").with(1, 1u64));

        match conn.receive(t) {
            Received::Regular(t) => {
                assert_eq!(t.header.sender, Some(7));
                assert!(t.header.server_sent_time.is_some());
                assert_eq!(t.header.sent_time, t.header.server_sent_time);
                assert!(!t.header.is_from_myself);
            }
            other => panic!("expected regular, got {:?}", other),
        }
    }

    #[test]
    fn test_control_payload_outside_namespace_is_rejected() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));

        let mut t = control(ControlMessage::member("Widget", MemberEvent::Join));
        t.header.namespace = None;
        assert!(matches!(conn.receive(t), Received::Rejected(_)));
    }

    fn internal_object(type_name: &str) -> Transmission {
        let mut header = Header::new(type_name);
        header.namespace = Some(CONTROL_NAMESPACE.to_string());
        Transmission::object(header, Instance::new(type_name).with(1, 1u64))
    }

    #[test]
    fn test_internal_object_is_regular_once_named() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();

        match conn.receive(internal_object("AuditMark")) {
            Received::Rejected(reason) => assert!(reason.contains("internal type 'AuditMark'")),
            other => panic!("expected rejection, got {:?}", other),
        }

        conn.receive(control(ControlMessage::connect("guest", true)));
        assert!(matches!(
            conn.receive(internal_object("AuditMark")),
            Received::Regular(_)
        ));

        conn.receive(control(ControlMessage::preload_client_finished()));
        match conn.receive(internal_object("AuditMark")) {
            Received::Regular(t) => {
                assert!(t.header.is_control());
                assert_eq!(t.header.sender, Some(7));
            }
            other => panic!("expected regular, got {:?}", other),
        }
    }

    #[test]
    fn test_host_records_from_guest_are_fatal() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));

        for type_name in [PEER_STATE_TYPE, TYPE_ANNOUNCE_TYPE] {
            assert!(matches!(
                conn.receive(internal_object(type_name)),
                Received::Fatal(BrokerError::InvalidOperation(_))
            ));
        }
    }

    #[test]
    fn test_goodbye_closes_gracefully() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.take_transitions();

        conn.receive(control(ControlMessage::error(error_code::GOODBYE, "bye")));
        assert!(conn.is_closed());
        let transitions = conn.take_transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].cause, None);
    }

    #[test]
    fn test_peer_error_closes_with_cause() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));
        conn.take_transitions();

        conn.receive(control(ControlMessage::error(5, "bad things")));
        let transitions = conn.take_transitions();
        assert_eq!(transitions[0].state, ConnectionState::Closed);
        assert!(transitions[0].cause.as_deref().unwrap().contains("bad things"));
    }

    #[test]
    fn test_closed_is_terminal() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.close(None);
        conn.close(Some("again".to_string()));
        assert!(!conn.suspend());
        assert!(!conn.resume());

        let r = conn.receive(control(ControlMessage::connect("guest", false)));
        assert!(matches!(r, Received::Handled));
        assert_eq!(
            states(&mut conn),
            vec![ConnectionState::Connecting, ConnectionState::Closed]
        );
    }

    #[test]
    fn test_send_failure_closes_connection() {
        let (mut conn, rx) = connection();
        drop(rx);
        conn.begin_handshake("host").unwrap();

        assert!(conn.is_closed());
        let transitions = conn.take_transitions();
        assert_eq!(transitions.last().unwrap().state, ConnectionState::Closed);
        assert!(transitions.last().unwrap().cause.is_some());
    }

    #[test]
    fn test_suspended_drops_outbound_and_rejects_inbound() {
        let (mut conn, mut rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));
        sent(&mut rx);

        assert!(conn.suspend());
        conn.send_control(ControlMessage::end_of_discovery());
        assert!(sent(&mut rx).is_empty());

        let r = conn.receive(control(ControlMessage::member("Widget", MemberEvent::Join)));
        assert!(matches!(r, Received::Rejected(_)));

        assert!(conn.resume());
        conn.send_control(ControlMessage::end_of_discovery());
        assert_eq!(sent(&mut rx).len(), 1);
    }

    #[test]
    fn test_schema_import_is_remembered_once_confirmed() {
        let (mut conn, _rx) = connection();
        conn.begin_handshake("host").unwrap();
        conn.receive(control(ControlMessage::connect("guest", false)));

        let schema = StructSchema::new("Widget");
        for _ in 0..2 {
            let r = conn.receive(control(ControlMessage::StructSchema(schema.clone())));
            assert!(matches!(r, Received::Control(ControlRequest::ImportStruct { .. })));
        }

        conn.remember_import("Widget");
        let r = conn.receive(control(ControlMessage::StructSchema(schema)));
        assert!(matches!(r, Received::Handled));

        let shade = EnumSchema::new("Shade");
        let r = conn.receive(control(ControlMessage::EnumSchema(shade.clone())));
        assert!(matches!(r, Received::Control(ControlRequest::ImportEnum { .. })));
        conn.remember_import("Shade");
        let r = conn.receive(control(ControlMessage::EnumSchema(shade)));
        assert!(matches!(r, Received::Handled));
    }
}
