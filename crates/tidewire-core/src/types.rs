//! Core value types for tidewire
//!
//! Objects moving through the broker are dynamic [`Instance`]s: a type name
//! plus a sparse map from property tag to [`Value`]. Which properties are
//! present in a given transmission is described by a [`PropertySet`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{BitAnd, BitOr, Sub};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point in time used for all header and provenance timestamps
pub type Timestamp = DateTime<Utc>;

/// Numeric identifier of a connected peer (the host uses [`HOST_ID`])
pub type PeerId = u32;

/// Peer id reserved for the broker itself
pub const HOST_ID: PeerId = 1;

/// Highest property tag a struct type may use
pub const MAX_PROPERTY_TAG: u32 = 32;

/// A single property value
///
/// Equality and hashing are total: floats compare by bit pattern so that
/// values can be used as parts of an [`ObjectKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Time(Timestamp),
    /// Enumerator value of an enum type
    Enum(i32),
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in validation errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Time(_) => "time",
            Value::Enum(_) => "enum",
            Value::List(_) => "list",
        }
    }

    /// Borrow the string content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read an integral value as u64 when it fits
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::UInt(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Time(v) => v.hash(state),
            Value::Enum(v) => v.hash(state),
            Value::List(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Enum(v) => write!(f, "#{}", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Time(v)
    }
}

/// Set of property tags (1..=32) present in a transmission or instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertySet(u32);

impl PropertySet {
    /// The empty set
    pub const NONE: PropertySet = PropertySet(0);

    /// Every representable tag
    pub const ALL: PropertySet = PropertySet(u32::MAX);

    /// Create an empty set
    pub fn new() -> Self {
        Self::NONE
    }

    /// Create a set from its raw bit representation
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit representation (bit `tag - 1` is set for each member)
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Build a set from tags; tags outside 1..=32 are ignored
    pub fn from_tags(tags: impl IntoIterator<Item = u32>) -> Self {
        let mut set = Self::NONE;
        for tag in tags {
            set.insert(tag);
        }
        set
    }

    fn bit(tag: u32) -> Option<u32> {
        if (1..=MAX_PROPERTY_TAG).contains(&tag) {
            Some(1u32 << (tag - 1))
        } else {
            None
        }
    }

    /// Add a tag; returns false if the tag is out of range
    pub fn insert(&mut self, tag: u32) -> bool {
        match Self::bit(tag) {
            Some(bit) => {
                self.0 |= bit;
                true
            }
            None => false,
        }
    }

    /// Remove a tag
    pub fn remove(&mut self, tag: u32) {
        if let Some(bit) = Self::bit(tag) {
            self.0 &= !bit;
        }
    }

    /// Check whether a tag is a member
    pub fn contains(&self, tag: u32) -> bool {
        Self::bit(tag).is_some_and(|bit| self.0 & bit != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Check whether every member of `self` is also in `other`
    pub fn is_subset_of(&self, other: PropertySet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterate member tags in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (1..=MAX_PROPERTY_TAG).filter(move |tag| self.contains(*tag))
    }
}

impl BitOr for PropertySet {
    type Output = PropertySet;

    fn bitor(self, rhs: PropertySet) -> PropertySet {
        PropertySet(self.0 | rhs.0)
    }
}

impl BitAnd for PropertySet {
    type Output = PropertySet;

    fn bitand(self, rhs: PropertySet) -> PropertySet {
        PropertySet(self.0 & rhs.0)
    }
}

impl Sub for PropertySet {
    type Output = PropertySet;

    fn sub(self, rhs: PropertySet) -> PropertySet {
        PropertySet(self.0 & !rhs.0)
    }
}

impl fmt::Display for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "{{{}}}", tags.join(","))
    }
}

/// A dynamically typed object instance
///
/// Only properties that are set are stored. The schema layer decides which
/// tags exist and which of them form the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    type_name: String,
    values: BTreeMap<u32, Value>,
}

impl Instance {
    /// Create an empty instance of the given type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter
    pub fn with(mut self, tag: u32, value: impl Into<Value>) -> Self {
        self.set(tag, value);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set(&mut self, tag: u32, value: impl Into<Value>) {
        self.values.insert(tag, value.into());
    }

    pub fn get(&self, tag: u32) -> Option<&Value> {
        self.values.get(&tag)
    }

    /// Unset a property
    pub fn clear(&mut self, tag: u32) -> Option<Value> {
        self.values.remove(&tag)
    }

    /// Tags of all properties that currently hold a value
    pub fn valid_properties(&self) -> PropertySet {
        PropertySet::from_tags(self.values.keys().copied())
    }

    /// Iterate over set properties in tag order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.values.iter().map(|(tag, value)| (*tag, value))
    }

    /// Copy of this instance keeping only the given properties
    pub fn restricted_to(&self, properties: PropertySet) -> Instance {
        Instance {
            type_name: self.type_name.clone(),
            values: self
                .values
                .iter()
                .filter(|(tag, _)| properties.contains(**tag))
                .map(|(tag, value)| (*tag, value.clone()))
                .collect(),
        }
    }

    /// Overwrite the listed properties with the values from `other`
    ///
    /// A listed property that is unset in `other` becomes unset here.
    /// Properties outside `properties` are left untouched.
    pub fn merge_from(&mut self, other: &Instance, properties: PropertySet) {
        for tag in properties.iter() {
            match other.get(tag) {
                Some(value) => {
                    self.values.insert(tag, value.clone());
                }
                None => {
                    self.values.remove(&tag);
                }
            }
        }
    }
}

/// Identity of a cached entry: the values of the type's key properties in tag order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey(pub Vec<Value>);

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_set_ops() {
        let a = PropertySet::from_tags([1, 2, 3]);
        let b = PropertySet::from_tags([3, 4]);

        assert_eq!((a | b).iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!((a & b).iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!((a - b).iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(PropertySet::from_tags([1]).is_subset_of(a));
        assert!(!b.is_subset_of(a));
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_property_set_rejects_out_of_range_tags() {
        let mut set = PropertySet::new();
        assert!(!set.insert(0));
        assert!(!set.insert(33));
        assert!(set.insert(32));
        assert!(set.contains(32));
        assert!(!set.contains(0));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_float_values_are_hashable_keys() {
        use std::collections::HashSet;

        let mut keys = HashSet::new();
        keys.insert(ObjectKey(vec![Value::Float(1.5)]));
        assert!(keys.contains(&ObjectKey(vec![Value::Float(1.5)])));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Int(1), Value::UInt(1));
    }

    #[test]
    fn test_instance_valid_properties() {
        let instance = Instance::new("Widget").with(1, 7u32).with(3, "red");
        assert_eq!(instance.valid_properties(), PropertySet::from_tags([1, 3]));
        assert_eq!(instance.get(3), Some(&Value::from("red")));
        assert_eq!(instance.get(2), None);
    }

    #[test]
    fn test_merge_from_is_per_field() {
        let mut current = Instance::new("Widget")
            .with(1, 7u32)
            .with(2, "red")
            .with(3, 10i64);
        let update = Instance::new("Widget").with(1, 7u32).with(3, 11i64);

        // Only tag 3 is included; tag 2 must survive.
        current.merge_from(&update, PropertySet::from_tags([3]));
        assert_eq!(current.get(2), Some(&Value::from("red")));
        assert_eq!(current.get(3), Some(&Value::Int(11)));

        // An included tag that is unset in the update clears the field.
        current.merge_from(&update, PropertySet::from_tags([2]));
        assert_eq!(current.get(2), None);
    }

    #[test]
    fn test_restricted_to() {
        let instance = Instance::new("Widget").with(1, 1u32).with(2, "a").with(3, "b");
        let restricted = instance.restricted_to(PropertySet::from_tags([1, 3]));
        assert_eq!(restricted.valid_properties(), PropertySet::from_tags([1, 3]));
        assert_eq!(restricted.type_name(), "Widget");
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey(vec![Value::UInt(1), Value::from("a")]);
        assert_eq!(key.to_string(), "1/\"a\"");
    }
}
