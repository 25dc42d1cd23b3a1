//! Type schemas and the schema registry
//!
//! A [`StructSchema`] describes one object type: its properties, which of
//! them form the key, and the flags that decide how the broker treats it
//! (cached, internal, cleanup-on-disconnect, ...).
//!
//! The broker never looks inside instances except through the schema:
//! [`StructSchema::key_of`] and [`StructSchema::valid_properties`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::protocol;
use crate::types::{Instance, ObjectKey, PropertySet, Value, MAX_PROPERTY_TAG};

/// Kind of value a property holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    String,
    Bytes,
    Time,
    /// Enumerator of the named enum type
    Enum(String),
    List(Box<ValueKind>),
}

impl ValueKind {
    /// Check whether a value fits this kind
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueKind::Bool, Value::Bool(_))
            | (ValueKind::Int, Value::Int(_))
            | (ValueKind::UInt, Value::UInt(_))
            | (ValueKind::Float, Value::Float(_))
            | (ValueKind::String, Value::Str(_))
            | (ValueKind::Bytes, Value::Bytes(_))
            | (ValueKind::Time, Value::Time(_))
            | (ValueKind::Enum(_), Value::Enum(_)) => true,
            (ValueKind::List(inner), Value::List(items)) => items.iter().all(|v| inner.matches(v)),
            _ => false,
        }
    }

    /// Convert a JSON value into a property value of this kind
    pub fn value_from_json(&self, json: &serde_json::Value) -> Option<Value> {
        match self {
            ValueKind::Bool => json.as_bool().map(Value::Bool),
            ValueKind::Int => json.as_i64().map(Value::Int),
            ValueKind::UInt => json.as_u64().map(Value::UInt),
            ValueKind::Float => json.as_f64().map(Value::Float),
            ValueKind::String => json.as_str().map(|s| Value::Str(s.to_string())),
            ValueKind::Bytes => json
                .as_array()?
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(Value::Bytes),
            ValueKind::Time => json
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| Value::Time(t.with_timezone(&chrono::Utc))),
            ValueKind::Enum(_) => json
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Enum),
            ValueKind::List(inner) => json
                .as_array()?
                .iter()
                .map(|item| inner.value_from_json(item))
                .collect::<Option<Vec<Value>>>()
                .map(Value::List),
        }
    }
}

/// Convert a property value to JSON for display
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(v) => serde_json::Value::Bool(*v),
        Value::Int(v) => serde_json::Value::from(*v),
        Value::UInt(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(v) => serde_json::Value::String(v.clone()),
        Value::Bytes(v) => serde_json::Value::from(v.clone()),
        Value::Time(v) => serde_json::Value::String(v.to_rfc3339()),
        Value::Enum(v) => serde_json::Value::from(*v),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
    }
}

/// Flags controlling how the broker treats a type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructFlags {
    /// Latest instance per key is kept and replayed to joiners
    pub cached: bool,
    /// Reserved for broker/protocol use; hidden from schema discovery
    pub internal: bool,
    /// Entries are retracted when their last writer disconnects
    pub cleanup: bool,
    /// Never leaves the process that publishes it
    pub local: bool,
    /// Persistence hint; kept for compatibility, the broker stores nothing on disk
    pub persistent: bool,
}

impl StructFlags {
    /// Flags for a plain cached type
    pub fn cached() -> Self {
        Self {
            cached: true,
            ..Self::default()
        }
    }

    /// Five-character summary used in logs
    ///
    /// ```text
    /// "CIPcL"
    ///  ||||\- local
    ///  |||\-- cleanup
    ///  ||\--- persistent
    ///  |\---- internal
    ///  \----- cached
    /// ```
    pub fn to_flag_string(&self) -> String {
        let flag = |set: bool, c: char| if set { c } else { '.' };
        [
            flag(self.cached, 'C'),
            flag(self.internal, 'I'),
            flag(self.persistent, 'P'),
            flag(self.cleanup, 'c'),
            flag(self.local, 'L'),
        ]
        .iter()
        .collect()
    }
}

/// One property of a struct type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    /// Tag in 1..=32, unique within the struct
    pub tag: u32,
    pub kind: ValueKind,
    /// Part of the object key
    #[serde(default)]
    pub key: bool,
}

/// Descriptor of an object type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructSchema {
    pub name: String,
    #[serde(default)]
    pub flags: StructFlags,
    pub properties: Vec<PropertySchema>,
}

impl StructSchema {
    /// Start a schema with no properties and default flags
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: StructFlags::default(),
            properties: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: StructFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Add a non-key property
    pub fn property(mut self, name: impl Into<String>, tag: u32, kind: ValueKind) -> Self {
        self.properties.push(PropertySchema {
            name: name.into(),
            tag,
            kind,
            key: false,
        });
        self
    }

    /// Add a key property
    pub fn key_property(mut self, name: impl Into<String>, tag: u32, kind: ValueKind) -> Self {
        self.properties.push(PropertySchema {
            name: name.into(),
            tag,
            kind,
            key: true,
        });
        self
    }

    pub fn is_cached(&self) -> bool {
        self.flags.cached
    }

    pub fn is_internal(&self) -> bool {
        self.flags.internal
    }

    pub fn is_cleanup_on_disconnect(&self) -> bool {
        self.flags.cleanup
    }

    pub fn find_property(&self, tag: u32) -> Option<&PropertySchema> {
        self.properties.iter().find(|p| p.tag == tag)
    }

    pub fn find_property_by_name(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// All tags declared by the type
    pub fn all_properties(&self) -> PropertySet {
        PropertySet::from_tags(self.properties.iter().map(|p| p.tag))
    }

    /// Tags that together identify an entry
    pub fn key_properties(&self) -> PropertySet {
        PropertySet::from_tags(self.properties.iter().filter(|p| p.key).map(|p| p.tag))
    }

    /// Declared properties that are set on the instance
    pub fn valid_properties(&self, instance: &Instance) -> PropertySet {
        instance.valid_properties() & self.all_properties()
    }

    /// Extract the key of an instance
    ///
    /// Fails when a key property is unset.
    pub fn key_of(&self, instance: &Instance) -> BrokerResult<ObjectKey> {
        let mut parts = Vec::new();
        for tag in self.key_properties().iter() {
            match instance.get(tag) {
                Some(value) => parts.push(value.clone()),
                None => {
                    return Err(BrokerError::Protocol(format!(
                        "instance of '{}' lacks key property {}",
                        self.name, tag
                    )))
                }
            }
        }
        Ok(ObjectKey(parts))
    }

    /// Check that the definition itself is well formed
    pub fn check_definition(&self) -> BrokerResult<()> {
        let mut seen = PropertySet::NONE;
        for property in &self.properties {
            if property.tag == 0 || property.tag > MAX_PROPERTY_TAG {
                return Err(BrokerError::SchemaConflict(format!(
                    "'{}.{}' uses tag {} outside 1..={}",
                    self.name, property.name, property.tag, MAX_PROPERTY_TAG
                )));
            }
            if seen.contains(property.tag) {
                return Err(BrokerError::SchemaConflict(format!(
                    "'{}' declares tag {} twice",
                    self.name, property.tag
                )));
            }
            seen.insert(property.tag);
        }
        Ok(())
    }

    /// Check that an instance conforms to this schema
    pub fn validate(&self, instance: &Instance) -> BrokerResult<()> {
        if instance.type_name() != self.name {
            return Err(BrokerError::Protocol(format!(
                "instance of '{}' does not match schema '{}'",
                instance.type_name(),
                self.name
            )));
        }
        for (tag, value) in instance.iter() {
            let property = self.find_property(tag).ok_or_else(|| {
                BrokerError::Protocol(format!("'{}' has no property with tag {}", self.name, tag))
            })?;
            if !property.kind.matches(value) {
                return Err(BrokerError::Protocol(format!(
                    "'{}.{}' expects {:?}, got {}",
                    self.name,
                    property.name,
                    property.kind,
                    value.kind_name()
                )));
            }
        }
        Ok(())
    }

    /// Build an instance from a JSON object keyed by property name
    pub fn instance_from_json(&self, json: &serde_json::Value) -> BrokerResult<Instance> {
        let object = json.as_object().ok_or_else(|| {
            BrokerError::InvalidOperation(format!("'{}' instance must be a JSON object", self.name))
        })?;

        let mut instance = Instance::new(&self.name);
        for (name, raw) in object {
            let property = self.find_property_by_name(name).ok_or_else(|| {
                BrokerError::InvalidOperation(format!("'{}' has no property '{}'", self.name, name))
            })?;
            let value = property.kind.value_from_json(raw).ok_or_else(|| {
                BrokerError::InvalidOperation(format!(
                    "'{}.{}' cannot hold {}",
                    self.name, name, raw
                ))
            })?;
            instance.set(property.tag, value);
        }
        Ok(instance)
    }

    /// Render an instance as a JSON object keyed by property name
    pub fn instance_to_json(&self, instance: &Instance) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (tag, value) in instance.iter() {
            let name = self
                .find_property(tag)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| format!("#{}", tag));
            object.insert(name, value_to_json(value));
        }
        serde_json::Value::Object(object)
    }
}

/// One named value of an enum type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enumerator {
    pub name: String,
    pub value: i32,
}

/// Descriptor of an enum type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumSchema {
    pub name: String,
    pub enumerators: Vec<Enumerator>,
}

impl EnumSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enumerators: Vec::new(),
        }
    }

    pub fn enumerator(mut self, name: impl Into<String>, value: i32) -> Self {
        self.enumerators.push(Enumerator {
            name: name.into(),
            value,
        });
        self
    }

    pub fn name_of(&self, value: i32) -> Option<&str> {
        self.enumerators
            .iter()
            .find(|e| e.value == value)
            .map(|e| e.name.as_str())
    }
}

/// Outcome of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// The type was not known before
    New,
    /// An identical definition was already registered
    Unchanged,
}

/// Registry of known struct and enum types
#[derive(Debug, Clone, Default)]
pub struct Registry {
    structs: BTreeMap<String, Arc<StructSchema>>,
    enums: BTreeMap<String, Arc<EnumSchema>>,
}

impl Registry {
    /// Create a registry holding the built-in protocol types
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for schema in protocol::builtin_schemas() {
            registry
                .structs
                .insert(schema.name.clone(), Arc::new(schema));
        }
        for schema in protocol::builtin_enums() {
            registry.enums.insert(schema.name.clone(), Arc::new(schema));
        }
        registry
    }

    /// Create a registry without any types
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a struct type
    ///
    /// Registering an identical definition again is a no-op; a different
    /// definition under a known name is rejected.
    pub fn register_struct(&mut self, schema: StructSchema) -> BrokerResult<Registered> {
        schema.check_definition()?;
        match self.structs.get(&schema.name) {
            Some(existing) if **existing == schema => Ok(Registered::Unchanged),
            Some(_) => Err(BrokerError::SchemaConflict(format!(
                "struct '{}' is already registered with a different definition",
                schema.name
            ))),
            None => {
                self.structs.insert(schema.name.clone(), Arc::new(schema));
                Ok(Registered::New)
            }
        }
    }

    /// Register an enum type
    pub fn register_enum(&mut self, schema: EnumSchema) -> BrokerResult<Registered> {
        match self.enums.get(&schema.name) {
            Some(existing) if **existing == schema => Ok(Registered::Unchanged),
            Some(_) => Err(BrokerError::SchemaConflict(format!(
                "enum '{}' is already registered with a different definition",
                schema.name
            ))),
            None => {
                self.enums.insert(schema.name.clone(), Arc::new(schema));
                Ok(Registered::New)
            }
        }
    }

    pub fn find_struct(&self, name: &str) -> Option<Arc<StructSchema>> {
        self.structs.get(name).cloned()
    }

    /// Look up a struct type, failing with `UnknownType`
    pub fn resolve(&self, name: &str) -> BrokerResult<Arc<StructSchema>> {
        self.find_struct(name)
            .ok_or_else(|| BrokerError::UnknownType(name.to_string()))
    }

    pub fn find_enum(&self, name: &str) -> Option<Arc<EnumSchema>> {
        self.enums.get(name).cloned()
    }

    /// All struct types in name order
    pub fn structs(&self) -> impl Iterator<Item = &Arc<StructSchema>> {
        self.structs.values()
    }

    /// All enum types in name order
    pub fn enums(&self) -> impl Iterator<Item = &Arc<EnumSchema>> {
        self.enums.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> StructSchema {
        StructSchema::new("Widget")
            .with_flags(StructFlags::cached())
            .key_property("id", 1, ValueKind::UInt)
            .property("color", 2, ValueKind::String)
            .property("size", 3, ValueKind::Float)
    }

    #[test]
    fn test_key_of_uses_key_properties() {
        let schema = widget();
        let instance = Instance::new("Widget").with(1, 5u32).with(2, "red");

        let key = schema.key_of(&instance).unwrap();
        assert_eq!(key, ObjectKey(vec![Value::UInt(5)]));
        assert_eq!(schema.key_properties(), PropertySet::from_tags([1]));
    }

    #[test]
    fn test_key_of_fails_without_key() {
        let schema = widget();
        let instance = Instance::new("Widget").with(2, "red");
        assert!(matches!(
            schema.key_of(&instance),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_rejects_wrong_kind() {
        let schema = widget();
        let bad = Instance::new("Widget").with(1, 5u32).with(2, 7i64);
        assert!(schema.validate(&bad).is_err());

        let unknown_tag = Instance::new("Widget").with(1, 5u32).with(9, "x");
        assert!(schema.validate(&unknown_tag).is_err());

        let good = Instance::new("Widget").with(1, 5u32).with(3, 1.5);
        assert!(schema.validate(&good).is_ok());
    }

    #[test]
    fn test_flag_string() {
        let flags = StructFlags {
            cached: true,
            cleanup: true,
            ..StructFlags::default()
        };
        assert_eq!(flags.to_flag_string(), "C..c.");
        assert_eq!(StructFlags::default().to_flag_string(), ".....");
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = Registry::empty();
        assert_eq!(registry.register_struct(widget()).unwrap(), Registered::New);
        assert_eq!(
            registry.register_struct(widget()).unwrap(),
            Registered::Unchanged
        );

        let conflicting = StructSchema::new("Widget").key_property("id", 1, ValueKind::String);
        assert!(matches!(
            registry.register_struct(conflicting),
            Err(BrokerError::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicate_tags() {
        let mut registry = Registry::empty();
        let schema = StructSchema::new("Broken")
            .key_property("a", 1, ValueKind::UInt)
            .property("b", 1, ValueKind::UInt);
        assert!(registry.register_struct(schema).is_err());
        assert!(registry.find_struct("Broken").is_none());
    }

    #[test]
    fn test_new_registry_has_builtins() {
        let registry = Registry::new();
        let peer_state = registry.resolve(protocol::PEER_STATE_TYPE).unwrap();
        assert!(peer_state.is_cached());
        assert!(peer_state.is_internal());
        assert!(registry.resolve("Nope").is_err());
    }

    #[test]
    fn test_json_conversion() {
        let schema = widget();
        let json = serde_json::json!({ "id": 3, "color": "blue", "size": 2.5 });
        let instance = schema.instance_from_json(&json).unwrap();
        assert_eq!(instance.get(1), Some(&Value::UInt(3)));
        assert_eq!(instance.get(2), Some(&Value::from("blue")));

        let back = schema.instance_to_json(&instance);
        assert_eq!(back, json);

        let bad = serde_json::json!({ "id": "three" });
        assert!(schema.instance_from_json(&bad).is_err());
    }

    #[test]
    fn test_schema_deserializes_from_json() {
        let raw = r#"{
            "name": "Sensor",
            "flags": { "cached": true, "cleanup": true },
            "properties": [
                { "name": "id", "tag": 1, "kind": "string", "key": true },
                { "name": "readings", "tag": 2, "kind": { "list": "float" } }
            ]
        }"#;
        let schema: StructSchema = serde_json::from_str(raw).unwrap();
        assert!(schema.is_cleanup_on_disconnect());
        assert_eq!(schema.properties[1].kind, ValueKind::List(Box::new(ValueKind::Float)));
    }
}
