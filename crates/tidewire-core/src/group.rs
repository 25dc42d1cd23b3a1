//! Named fanout sets of connections
//!
//! A group is named after the type (or destination) its traffic carries.
//! Members are peer ids; the connections themselves live in the broker's
//! connection table and are looked up at delivery time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::protocol::Transmission;
use crate::types::PeerId;

/// Result of fanning one transmission out to a group
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Members the transmission was handed to
    pub delivered: usize,
    /// Members whose connection closed while sending
    pub failed: Vec<PeerId>,
}

#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    members: BTreeSet<PeerId>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member; joining twice is logged and ignored
    pub fn join(&mut self, peer: PeerId) -> bool {
        let added = self.members.insert(peer);
        if !added {
            warn!(group = %self.name, peer, "peer already member of group");
        }
        added
    }

    /// Remove a member; leaving without membership is logged and ignored
    pub fn leave(&mut self, peer: PeerId) -> bool {
        let removed = self.members.remove(&peer);
        if !removed {
            warn!(group = %self.name, peer, "peer is not a member of group");
        }
        removed
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.members.contains(&peer)
    }

    pub fn members(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Send to every connected or suspended member
    ///
    /// A failing member is closed by its own connection; delivery to the
    /// others continues.
    pub fn deliver(
        &self,
        transmission: &Arc<Transmission>,
        connections: &mut HashMap<PeerId, Connection>,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for peer in &self.members {
            let Some(connection) = connections.get_mut(peer) else {
                continue;
            };
            if !connection.state().receives_fanout() {
                continue;
            }
            connection.send_transmission(transmission);
            if connection.is_closed() {
                delivery.failed.push(*peer);
            } else {
                delivery.delivered += 1;
            }
        }
        delivery
    }
}

/// All groups by name, created on first join
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<String, Group>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, name: &str, peer: PeerId) -> bool {
        debug!(group = name, peer, "join");
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
            .join(peer)
    }

    pub fn leave(&mut self, name: &str, peer: PeerId) -> bool {
        match self.groups.get_mut(name) {
            Some(group) => {
                debug!(group = name, peer, "leave");
                group.leave(peer)
            }
            None => {
                error!(group = name, peer, "leave for unknown group");
                false
            }
        }
    }

    /// Remove a peer from every group it belongs to
    pub fn drop_connection(&mut self, peer: PeerId) {
        for group in self.groups.values_mut() {
            group.members.remove(&peer);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Groups the peer is a member of, in name order
    pub fn memberships(&self, peer: PeerId) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .groups
            .values()
            .filter(|g| g.contains(peer))
            .map(|g| g.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Fan out to a group; a group nobody joined yet receives nothing
    pub fn deliver(
        &self,
        name: &str,
        transmission: &Arc<Transmission>,
        connections: &mut HashMap<PeerId, Connection>,
    ) -> Delivery {
        match self.groups.get(name) {
            Some(group) => group.deliver(transmission, connections),
            None => Delivery::default(),
        }
    }
}
