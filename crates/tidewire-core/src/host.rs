//! Async host service around a [`Broker`]
//!
//! One tokio task owns the broker. Everything else talks to it through a
//! cloneable [`HostHandle`] that posts commands on an mpsc queue, so all
//! broker state is mutated by a single writer.
//!
//! ```text
//! ┌────────────┐  Frame/Accept/...   ┌──────────────────────────┐
//! │ tcp reader │ ──────────────────► │ host task                │
//! │ local peer │                     │  select! {               │
//! │ CLI / API  │                     │    commands.recv()       │
//! └────────────┘                     │    sweep.tick()          │
//!        ▲        broadcast events   │    cancel.cancelled()    │
//!        └────────────────────────── │  }                       │
//!                                    └──────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerEvent, Flow};
use crate::container::Entry;
use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{ConnectionState, Transmission};
use crate::schema::{EnumSchema, Registered, StructSchema};
use crate::transport::{local, Channel, TransportError};
use crate::types::{Instance, PeerId, PropertySet};

/// Default period of the cleanup sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Requests processed by the host task
pub enum HostCommand {
    Accept {
        channel: Box<dyn Channel>,
        reply: oneshot::Sender<PeerId>,
    },
    Frame {
        peer: PeerId,
        transmission: Transmission,
    },
    TransportError {
        peer: PeerId,
        error: TransportError,
    },
    Publish {
        instance: Instance,
        included: Option<PropertySet>,
        remove: bool,
        reply: oneshot::Sender<BrokerResult<()>>,
    },
    RegisterStruct {
        schema: StructSchema,
        reply: oneshot::Sender<BrokerResult<Registered>>,
    },
    RegisterEnum {
        schema: EnumSchema,
        reply: oneshot::Sender<BrokerResult<Registered>>,
    },
    Snapshot {
        type_name: String,
        reply: oneshot::Sender<Option<Vec<Entry>>>,
    },
    PeerState {
        peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
    Sweep,
}

/// Cloneable handle to a running host task
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    events: broadcast::Sender<BrokerEvent>,
    cancel: CancellationToken,
}

/// Spawn the host task; the join handle yields the broker after shutdown
pub fn spawn(broker: Broker, sweep_interval: Duration) -> (HostHandle, JoinHandle<Broker>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = HostHandle {
        commands: tx,
        events: broker.event_sender(),
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(run(broker, rx, sweep_interval, cancel));
    (handle, task)
}

async fn run(
    mut broker: Broker,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> Broker {
    info!(name = %broker.name(), "host started");
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => broker.sweep(),
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut broker, command),
                None => break,
            },
        }
    }

    broker.shutdown();
    info!(name = %broker.name(), "host stopped");
    broker
}

fn handle_command(broker: &mut Broker, command: HostCommand) {
    match command {
        HostCommand::Accept { channel, reply } => {
            let peer = broker.accept(channel);
            let _ = reply.send(peer);
        }
        HostCommand::Frame { peer, transmission } => {
            if broker.handle_frame(peer, transmission) == Flow::Stop {
                debug!(peer, "connection stopped");
            }
        }
        HostCommand::TransportError { peer, error } => broker.handle_transport_error(peer, error),
        HostCommand::Publish {
            instance,
            included,
            remove,
            reply,
        } => {
            let _ = reply.send(broker.publish(instance, included, remove));
        }
        HostCommand::RegisterStruct { schema, reply } => {
            let _ = reply.send(broker.register_struct(schema));
        }
        HostCommand::RegisterEnum { schema, reply } => {
            let _ = reply.send(broker.register_enum(schema));
        }
        HostCommand::Snapshot { type_name, reply } => {
            let _ = reply.send(broker.container(&type_name).map(|c| c.snapshot()));
        }
        HostCommand::PeerState { peer, reply } => {
            let _ = reply.send(broker.connection_state(peer));
        }
        HostCommand::Sweep => broker.sweep(),
    }
}

impl HostHandle {
    fn post(&self, command: HostCommand) -> BrokerResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BrokerError::HostStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HostCommand) -> BrokerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| BrokerError::HostStopped)
    }

    /// Hand a new channel to the broker
    pub async fn accept(&self, channel: Box<dyn Channel>) -> BrokerResult<PeerId> {
        self.request(|reply| HostCommand::Accept { channel, reply }).await
    }

    /// Queue an inbound frame; frames of one peer are processed in order
    pub fn frame(&self, peer: PeerId, transmission: Transmission) -> BrokerResult<()> {
        self.post(HostCommand::Frame { peer, transmission })
    }

    pub fn transport_error(&self, peer: PeerId, error: TransportError) -> BrokerResult<()> {
        self.post(HostCommand::TransportError { peer, error })
    }

    pub async fn publish(&self, instance: Instance, included: Option<PropertySet>, remove: bool) -> BrokerResult<()> {
        self.request(|reply| HostCommand::Publish {
            instance,
            included,
            remove,
            reply,
        })
        .await?
    }

    pub async fn register_struct(&self, schema: StructSchema) -> BrokerResult<Registered> {
        self.request(|reply| HostCommand::RegisterStruct { schema, reply })
            .await?
    }

    pub async fn register_enum(&self, schema: EnumSchema) -> BrokerResult<Registered> {
        self.request(|reply| HostCommand::RegisterEnum { schema, reply })
            .await?
    }

    /// Copy of a type's cache, `None` if the type is not cached
    pub async fn snapshot(&self, type_name: impl Into<String>) -> BrokerResult<Option<Vec<Entry>>> {
        let type_name = type_name.into();
        self.request(|reply| HostCommand::Snapshot { type_name, reply })
            .await
    }

    pub async fn peer_state(&self, peer: PeerId) -> BrokerResult<Option<ConnectionState>> {
        self.request(|reply| HostCommand::PeerState { peer, reply })
            .await
    }

    /// Run the cleanup sweep now instead of waiting for the timer
    pub fn sweep(&self) -> BrokerResult<()> {
        self.post(HostCommand::Sweep)
    }

    /// Connect an in-process guest
    pub async fn connect_local(&self, name: impl Into<String>) -> BrokerResult<LocalPeer> {
        let (channel, inbound) = local::channel(name);
        let peer = self.accept(Box::new(channel)).await?;
        Ok(LocalPeer {
            peer,
            host: self.clone(),
            inbound,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Stop the host task; it closes every connection on the way out
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.commands.is_closed()
    }
}

/// Guest side of an in-process connection
pub struct LocalPeer {
    peer: PeerId,
    host: HostHandle,
    inbound: mpsc::UnboundedReceiver<Arc<Transmission>>,
}

impl LocalPeer {
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn send(&self, transmission: Transmission) -> BrokerResult<()> {
        self.host.frame(self.peer, transmission)
    }

    /// Next frame from the broker; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<Arc<Transmission>> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Transmission>> {
        self.inbound.try_recv().ok()
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        let _ = self.host.transport_error(self.peer, TransportError::Closed);
    }
}
