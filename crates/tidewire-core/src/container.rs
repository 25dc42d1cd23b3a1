//! Keyed caches of the latest instance per object
//!
//! Each cached type gets one [`Container`]. Writes are merged per property:
//! an update only touches the properties its header includes, so guests can
//! publish partial objects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;
use crate::protocol::{Header, Transmission, CONTROL_NAMESPACE};
use crate::schema::StructSchema;
use crate::types::{Instance, ObjectKey, PeerId, Timestamp, HOST_ID};

/// Kind of write that produced the current state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Remove,
}

/// Provenance of a cached entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneInfo {
    pub last_operation: Operation,
    pub created_from: PeerId,
    pub created: Timestamp,
    pub last_update_from: PeerId,
    pub modified: Timestamp,
    /// Broker clock when the last write was applied
    pub local_update_time: Timestamp,
}

impl CloneInfo {
    fn created(sender: PeerId, sent: Timestamp) -> Self {
        Self {
            last_operation: Operation::Create,
            created_from: sender,
            created: sent,
            last_update_from: sender,
            modified: sent,
            local_update_time: Utc::now(),
        }
    }

    fn followed_by(&self, operation: Operation, sender: PeerId, sent: Timestamp) -> Self {
        Self {
            last_operation: operation,
            created_from: self.created_from,
            created: self.created,
            last_update_from: sender,
            modified: sent,
            local_update_time: Utc::now(),
        }
    }

    /// Provenance for an object that never enters a cache
    pub fn uncached(header: &Header) -> Self {
        let (sender, sent) = origin(header);
        Self::created(sender, sent)
    }

    pub fn touches(&self, peer: PeerId) -> bool {
        self.created_from == peer || self.last_update_from == peer
    }
}

/// One cached object
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub instance: Instance,
    pub clone_info: CloneInfo,
}

fn origin(header: &Header) -> (PeerId, Timestamp) {
    (
        header.sender.unwrap_or(HOST_ID),
        header.sent_time.unwrap_or_else(Utc::now),
    )
}

/// Cache of one type keyed by its key properties
#[derive(Debug)]
pub struct Container {
    schema: Arc<StructSchema>,
    entries: HashMap<ObjectKey, Entry>,
}

impl Container {
    pub fn new(schema: Arc<StructSchema>) -> Self {
        Self {
            schema,
            entries: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<StructSchema> {
        &self.schema
    }

    /// Create or update the entry for `instance`
    ///
    /// Only the properties listed in the header are written. Key properties
    /// identify the entry and are never overwritten by an update.
    pub fn insert(&mut self, header: &Header, instance: &Instance) -> BrokerResult<&Entry> {
        let key = self.schema.key_of(instance)?;
        let (sender, sent) = origin(header);
        let key_properties = self.schema.key_properties();

        let entry = match self.entries.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => slot.insert(Entry {
                instance: instance.restricted_to(header.attributes | key_properties),
                clone_info: CloneInfo::created(sender, sent),
            }),
            std::collections::hash_map::Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                entry
                    .instance
                    .merge_from(instance, header.attributes - key_properties);
                entry.clone_info = entry
                    .clone_info
                    .followed_by(Operation::Update, sender, sent);
                entry
            }
        };
        Ok(entry)
    }

    /// Take the entry for `instance` out of the cache
    ///
    /// The returned copy carries the removal's included properties and a
    /// `Remove` clone info. Removing an unknown key yields `None`.
    pub fn remove(&mut self, header: &Header, instance: &Instance) -> BrokerResult<Option<Entry>> {
        let key = self.schema.key_of(instance)?;
        let Some(mut entry) = self.entries.remove(&key) else {
            return Ok(None);
        };
        let (sender, sent) = origin(header);
        entry
            .instance
            .merge_from(instance, header.attributes - self.schema.key_properties());
        entry.clone_info = entry
            .clone_info
            .followed_by(Operation::Remove, sender, sent);
        Ok(Some(entry))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Entry with the same key as `instance`
    pub fn find(&self, instance: &Instance) -> Option<&Entry> {
        let key = self.schema.key_of(instance).ok()?;
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Entry)> {
        self.entries.iter()
    }

    /// Copy of every entry, detached from later writes
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.values().cloned().collect()
    }

    /// Instances whose last write came from `peer`
    pub fn written_by(&self, peer: PeerId) -> Vec<Instance> {
        self.entries
            .values()
            .filter(|e| e.clone_info.last_update_from == peer)
            .map(|e| e.instance.clone())
            .collect()
    }

    pub fn referenced_by(&self, peer: PeerId) -> bool {
        self.entries.values().any(|e| e.clone_info.touches(peer))
    }

    /// Build the replay stream for a joining guest
    ///
    /// Works on a snapshot; `from_cache` counts down to 0 on the last item.
    pub fn replay(&self) -> Vec<Arc<Transmission>> {
        let now = Utc::now();
        let snapshot = self.snapshot();
        let total = snapshot.len();
        snapshot
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let mut header = Header::new(&self.schema.name);
                header.from_cache = Some((total - i - 1) as u32);
                header.sent_time = Some(entry.clone_info.modified);
                header.server_sent_time = Some(now);
                header.sender = Some(entry.clone_info.last_update_from);
                header.attributes = self.schema.valid_properties(&entry.instance);
                if self.schema.is_internal() {
                    header.namespace = Some(CONTROL_NAMESPACE.to_string());
                }
                Arc::new(Transmission::object(header, entry.instance))
            })
            .collect()
    }
}

/// Containers for every cached type, created on first use
#[derive(Debug, Default)]
pub struct ContainerPool {
    containers: HashMap<String, Container>,
}

impl ContainerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, schema: &Arc<StructSchema>) -> &mut Container {
        self.containers
            .entry(schema.name.clone())
            .or_insert_with(|| Container::new(Arc::clone(schema)))
    }

    pub fn get(&self, type_name: &str) -> Option<&Container> {
        self.containers.get(type_name)
    }

    pub fn get_mut(&mut self, type_name: &str) -> Option<&mut Container> {
        self.containers.get_mut(type_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}
