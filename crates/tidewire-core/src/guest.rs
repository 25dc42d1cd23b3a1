//! Guest client for a tidewire host over TCP
//!
//! Performs the guest half of the handshake and exposes membership,
//! publishing and schema discovery as async methods.
//!
//! ```ignore
//! let mut guest = Guest::connect("127.0.0.1:11235", "watcher", true).await?;
//! guest.join("Widget").await?;
//! guest.finish_preload().await?;
//! while let Some(t) = guest.recv().await? { /* ... */ }
//! ```

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::codec;
use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{
    error_code, ConnectionState, ControlMessage, Header, MemberEvent, Payload, Transmission,
};
use crate::schema::{EnumSchema, Registry, StructSchema};
use crate::transport::tcp::frame_codec;
use crate::transport::TransportError;
use crate::types::{Instance, PeerId, PropertySet};

pub struct Guest {
    peer_id: PeerId,
    host_name: String,
    state: ConnectionState,
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    registry: Registry,
}

impl Guest {
    /// Connect and complete the handshake up to `connected` or `early_subscribe`
    ///
    /// With `preload` set the guest stays in `early_subscribe` until
    /// [`Guest::finish_preload`] is called, so it can join groups and
    /// receive their replays first.
    pub async fn connect(addr: impl ToSocketAddrs, name: &str, preload: bool) -> BrokerResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut guest = Self {
            peer_id: 0,
            host_name: String::new(),
            state: ConnectionState::Connecting,
            reader: FramedRead::new(read_half, frame_codec()),
            writer: FramedWrite::new(write_half, frame_codec()),
            registry: Registry::new(),
        };

        match guest.expect_control().await? {
            ControlMessage::Hello { server_name, .. } => guest.host_name = server_name,
            other => return Err(unexpected("Hello", &other)),
        }

        guest
            .send_control(ControlMessage::connect(name, preload))
            .await?;
        match guest.expect_control().await? {
            ControlMessage::ConnectResponse {
                client_id: Some(id),
                accepted: true,
                ..
            } => guest.peer_id = id,
            other => return Err(unexpected("ConnectResponse", &other)),
        }
        guest.state = if preload {
            ConnectionState::EarlySubscribe
        } else {
            ConnectionState::Connected
        };
        info!(peer = guest.peer_id, host = %guest.host_name, "connected to host");
        Ok(guest)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Types learned through schema discovery
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Leave `early_subscribe` and wait for the host's acknowledgment
    ///
    /// Frames that arrive before the acknowledgment (replays of groups joined
    /// during preload) are returned in arrival order.
    pub async fn finish_preload(&mut self) -> BrokerResult<Vec<Transmission>> {
        if self.state != ConnectionState::EarlySubscribe {
            return Err(BrokerError::InvalidOperation(format!(
                "cannot finish preload in state {}",
                self.state
            )));
        }
        self.send_control(ControlMessage::preload_client_finished())
            .await?;

        let mut buffered = Vec::new();
        loop {
            let transmission = self.next_frame().await?;
            if let Some(ControlMessage::ConnectResponse {
                preload_finished: true,
                ..
            }) = transmission.control_message()
            {
                self.state = ConnectionState::Connected;
                return Ok(buffered);
            }
            check_error(&transmission)?;
            buffered.push(transmission);
        }
    }

    pub async fn join(&mut self, group: &str) -> BrokerResult<()> {
        self.send_control(ControlMessage::member(group, MemberEvent::Join))
            .await
    }

    pub async fn leave(&mut self, group: &str) -> BrokerResult<()> {
        self.send_control(ControlMessage::member(group, MemberEvent::Leave))
            .await
    }

    /// Publish an object; `included` defaults to its set properties
    pub async fn publish(
        &mut self,
        schema: &StructSchema,
        instance: Instance,
        included: Option<PropertySet>,
    ) -> BrokerResult<()> {
        let included = included.unwrap_or_else(|| schema.valid_properties(&instance));
        let header = Header::for_object(schema, included, false);
        self.send(Transmission::object(header, instance)).await
    }

    /// Remove an object by key
    pub async fn remove(&mut self, schema: &StructSchema, instance: Instance) -> BrokerResult<()> {
        let header = Header::for_object(schema, schema.key_properties(), true);
        self.send(Transmission::object(header, instance)).await
    }

    /// Announce a struct type to the host
    pub async fn announce_struct(&mut self, schema: StructSchema) -> BrokerResult<()> {
        self.send_control(ControlMessage::StructSchema(schema))
            .await
    }

    pub async fn announce_enum(&mut self, schema: EnumSchema) -> BrokerResult<()> {
        self.send_control(ControlMessage::EnumSchema(schema)).await
    }

    /// Ask for every public type definition, optionally filtered
    ///
    /// Discovered types are added to [`Guest::registry`]. Frames unrelated to
    /// discovery that arrive meanwhile are discarded.
    pub async fn request_schemas(
        &mut self,
        whitelist: Option<Vec<String>>,
        blacklist: Option<Vec<String>>,
    ) -> BrokerResult<Vec<StructSchema>> {
        self.send_control(ControlMessage::DescriptorRequest {
            whitelist,
            blacklist,
        })
        .await?;

        let mut structs = Vec::new();
        loop {
            let transmission = self.next_frame().await?;
            check_error(&transmission)?;
            match transmission.control_message() {
                Some(ControlMessage::StructSchema(schema)) => {
                    self.registry.register_struct(schema.clone())?;
                    structs.push(schema.clone());
                }
                Some(ControlMessage::EnumSchema(schema)) => {
                    self.registry.register_enum(schema.clone())?;
                }
                Some(ControlMessage::CacheInfo {
                    end_descriptor_request: true,
                    ..
                }) => return Ok(structs),
                _ => debug!(type_name = %transmission.header.type_name, "skipping frame during discovery"),
            }
        }
    }

    pub async fn clear_cache(&mut self, type_names: Vec<String>) -> BrokerResult<()> {
        self.send_control(ControlMessage::ClearCache { type_names })
            .await
    }

    /// Next frame from the host; `None` once the host closed the connection
    ///
    /// An error notice with a non-zero code is returned as `PeerError`.
    pub async fn recv(&mut self) -> BrokerResult<Option<Transmission>> {
        match self.next_frame().await {
            Ok(transmission) => {
                if let Some(ControlMessage::Error { code, .. }) = transmission.control_message() {
                    if *code == error_code::GOODBYE {
                        self.state = ConnectionState::Closed;
                        return Ok(None);
                    }
                }
                check_error(&transmission)?;
                Ok(Some(transmission))
            }
            Err(BrokerError::Transport(TransportError::Closed)) => {
                self.state = ConnectionState::Closed;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Say goodbye and close the connection
    pub async fn close(mut self) -> BrokerResult<()> {
        self.send_control(ControlMessage::error(error_code::GOODBYE, "goodbye"))
            .await?;
        SinkExt::<Bytes>::close(&mut self.writer).await?;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Send a raw transmission
    pub async fn send(&mut self, transmission: Transmission) -> BrokerResult<()> {
        let bytes = codec::encode(&transmission)?;
        self.writer.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    async fn send_control(&mut self, message: ControlMessage) -> BrokerResult<()> {
        self.send(Transmission::control(message)).await
    }

    async fn next_frame(&mut self) -> BrokerResult<Transmission> {
        match self.reader.next().await {
            Some(Ok(bytes)) => Ok(codec::decode(&bytes)?),
            Some(Err(e)) => Err(TransportError::Io(e).into()),
            None => Err(TransportError::Closed.into()),
        }
    }

    async fn expect_control(&mut self) -> BrokerResult<ControlMessage> {
        let transmission = self.next_frame().await?;
        check_error(&transmission)?;
        match transmission.payload {
            Payload::Control(message) => Ok(message),
            Payload::Object(instance) => Err(BrokerError::Protocol(format!(
                "expected control message, got object of type '{}'",
                instance.type_name()
            ))),
        }
    }
}

fn check_error(transmission: &Transmission) -> BrokerResult<()> {
    match transmission.control_message() {
        Some(ControlMessage::Error { code, text }) if *code != error_code::GOODBYE => {
            Err(BrokerError::PeerError {
                code: *code,
                text: text.clone(),
            })
        }
        _ => Ok(()),
    }
}

fn unexpected(expected: &str, got: &ControlMessage) -> BrokerError {
    BrokerError::Protocol(format!(
        "expected {}, got {}",
        expected,
        got.type_name()
    ))
}
