//! Applies incoming objects to the caches and notifies local subscribers

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::container::{CloneInfo, ContainerPool, Operation};
use crate::error::{BrokerError, BrokerResult};
use crate::protocol::Header;
use crate::schema::StructSchema;
use crate::types::Instance;

/// What happened to one object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEvent {
    pub header: Header,
    /// Cached state after the write (the transmitted instance for uncached types)
    pub instance: Instance,
    /// The instance as it arrived
    pub transmitted: Instance,
    pub clone_info: CloneInfo,
    pub is_from_myself: bool,
}

impl ObjectEvent {
    pub fn operation(&self) -> Operation {
        self.clone_info.last_operation
    }

    pub fn type_name(&self) -> &str {
        &self.header.type_name
    }
}

/// Outcome of [`Dispatcher::apply`]
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Whether the type is cached
    pub cached: bool,
    /// Event delivered to subscribers; `None` when nothing changed
    pub event: Option<ObjectEvent>,
}

pub type EventHandler = Box<dyn FnMut(&ObjectEvent) + Send>;

/// Handle for removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Dispatcher {
    pool: ContainerPool,
    handlers: HashMap<String, Vec<(SubscriptionId, EventHandler)>>,
    next_subscription: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ContainerPool {
        &mut self.pool
    }

    /// Apply one object to its cache and notify subscribers of its type
    pub fn apply(
        &mut self,
        schema: &Arc<StructSchema>,
        header: &Header,
        instance: &Instance,
        is_from_myself: bool,
    ) -> BrokerResult<Dispatched> {
        let event = if schema.is_cached() {
            let container = self.pool.get_or_create(schema);
            if header.remove {
                container.remove(header, instance)?.map(|entry| ObjectEvent {
                    header: header.clone(),
                    instance: entry.instance,
                    transmitted: instance.clone(),
                    clone_info: entry.clone_info,
                    is_from_myself,
                })
            } else {
                let entry = container.insert(header, instance)?;
                Some(ObjectEvent {
                    header: header.clone(),
                    instance: entry.instance.clone(),
                    transmitted: instance.clone(),
                    clone_info: entry.clone_info.clone(),
                    is_from_myself,
                })
            }
        } else if header.remove {
            warn!(type_name = %schema.name, "remove of uncached type ignored");
            None
        } else {
            Some(ObjectEvent {
                header: header.clone(),
                instance: instance.clone(),
                transmitted: instance.clone(),
                clone_info: CloneInfo::uncached(header),
                is_from_myself,
            })
        };

        if let Some(event) = &event {
            self.notify(event);
        }
        Ok(Dispatched {
            cached: schema.is_cached(),
            event,
        })
    }

    fn notify(&mut self, event: &ObjectEvent) {
        let Some(handlers) = self.handlers.get_mut(event.type_name()) else {
            return;
        };
        trace!(type_name = %event.type_name(), handlers = handlers.len(), "notifying subscribers");
        for (_, handler) in handlers.iter_mut() {
            handler(event);
        }
    }

    /// Register a handler for one type
    ///
    /// Entries already cached are replayed to the new handler as creates.
    pub fn subscribe(&mut self, schema: &Arc<StructSchema>, mut handler: EventHandler) -> SubscriptionId {
        if let Some(container) = self.pool.get(&schema.name) {
            for transmission in container.replay() {
                if let Some(instance) = transmission.instance() {
                    let mut clone_info = CloneInfo::uncached(&transmission.header);
                    if let Some(entry) = container.find(instance) {
                        clone_info = entry.clone_info.clone();
                    }
                    clone_info.last_operation = Operation::Create;
                    handler(&ObjectEvent {
                        header: transmission.header.clone(),
                        instance: instance.clone(),
                        transmitted: instance.clone(),
                        clone_info,
                        is_from_myself: false,
                    });
                }
            }
        }

        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.handlers
            .entry(schema.name.clone())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> BrokerResult<()> {
        for handlers in self.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(h, _)| *h == id) {
                handlers.remove(pos);
                return Ok(());
            }
        }
        Err(BrokerError::InvalidOperation(format!(
            "no subscription with id {}",
            id.0
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StructFlags, ValueKind};
    use crate::types::PropertySet;
    use parking_lot::Mutex;

    fn schema(cached: bool) -> Arc<StructSchema> {
        let flags = StructFlags {
            cached,
            ..StructFlags::default()
        };
        Arc::new(
            StructSchema::new("Widget")
                .with_flags(flags)
                .key_property("id", 1, ValueKind::UInt)
                .property("color", 2, ValueKind::String),
        )
    }

    fn header(remove: bool) -> Header {
        let mut header = Header::new("Widget");
        header.sender = Some(2);
        header.attributes = PropertySet::from_tags([1, 2]);
        header.remove = remove;
        header
    }

    fn recorder() -> (Arc<Mutex<Vec<ObjectEvent>>>, EventHandler) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, Box::new(move |e: &ObjectEvent| sink.lock().push(e.clone())))
    }

    #[test]
    fn test_cached_create_update_remove() {
        let schema = schema(true);
        let mut dispatcher = Dispatcher::new();
        let (events, handler) = recorder();
        dispatcher.subscribe(&schema, handler);

        let red = Instance::new("Widget").with(1, 1u64).with(2, "red");
        let blue = Instance::new("Widget").with(1, 1u64).with(2, "blue");
        dispatcher.apply(&schema, &header(false), &red, false).unwrap();
        dispatcher.apply(&schema, &header(false), &blue, true).unwrap();
        let removed = dispatcher.apply(&schema, &header(true), &blue, false).unwrap();
        assert!(removed.cached);

        let ops: Vec<Operation> = events.lock().iter().map(|e| e.operation()).collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Update, Operation::Remove]);
        assert!(events.lock()[1].is_from_myself);
        assert!(dispatcher.pool().get("Widget").unwrap().is_empty());
    }

    #[test]
    fn test_remove_of_missing_key_emits_nothing() {
        let schema = schema(true);
        let mut dispatcher = Dispatcher::new();
        let instance = Instance::new("Widget").with(1, 9u64);
        let dispatched = dispatcher.apply(&schema, &header(true), &instance, false).unwrap();
        assert!(dispatched.event.is_none());
    }

    #[test]
    fn test_uncached_type() {
        let schema = schema(false);
        let mut dispatcher = Dispatcher::new();
        let instance = Instance::new("Widget").with(1, 1u64).with(2, "red");

        let created = dispatcher.apply(&schema, &header(false), &instance, false).unwrap();
        assert!(!created.cached);
        assert_eq!(created.event.unwrap().operation(), Operation::Create);
        assert!(dispatcher.pool().get("Widget").is_none());

        let removed = dispatcher.apply(&schema, &header(true), &instance, false).unwrap();
        assert!(removed.event.is_none());
    }

    #[test]
    fn test_subscribe_replays_existing_entries() {
        let schema = schema(true);
        let mut dispatcher = Dispatcher::new();
        for id in 0..3u64 {
            let instance = Instance::new("Widget").with(1, id).with(2, "red");
            dispatcher.apply(&schema, &header(false), &instance, false).unwrap();
        }

        let (events, handler) = recorder();
        dispatcher.subscribe(&schema, handler);
        assert_eq!(events.lock().len(), 3);
        assert!(events
            .lock()
            .iter()
            .all(|e| e.operation() == Operation::Create && e.header.from_cache.is_some()));
    }

    #[test]
    fn test_unsubscribe() {
        let schema = schema(true);
        let mut dispatcher = Dispatcher::new();
        let (events, handler) = recorder();
        let id = dispatcher.subscribe(&schema, handler);
        dispatcher.unsubscribe(id).unwrap();
        assert!(dispatcher.unsubscribe(id).is_err());

        let instance = Instance::new("Widget").with(1, 1u64);
        dispatcher.apply(&schema, &header(false), &instance, false).unwrap();
        assert!(events.lock().is_empty());
    }
}
