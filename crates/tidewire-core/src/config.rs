//! Broker configuration loaded from JSON

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::{Broker, DEFAULT_EVENT_CAPACITY};
use crate::error::{BrokerError, BrokerResult};
use crate::schema::{EnumSchema, Registry, StructSchema};

/// Default address guests connect to
pub const DEFAULT_LISTEN: &str = "127.0.0.1:11235";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name announced to guests in the greeting
    pub name: String,
    pub listen: String,
    pub sweep_interval_ms: u64,
    /// Capacity of the broker event broadcast channel
    pub event_capacity: usize,
    /// Struct types known from startup
    pub schemas: Vec<StructSchema>,
    pub enums: Vec<EnumSchema>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "tidewire".to_string(),
            listen: DEFAULT_LISTEN.to_string(),
            sweep_interval_ms: 1000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            schemas: Vec::new(),
            enums: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Read a config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.name.trim().is_empty() {
            return Err(BrokerError::Config("name must not be empty".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(BrokerError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(BrokerError::Config(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Build a broker with the built-in and configured types
    pub fn build_broker(&self) -> BrokerResult<Broker> {
        self.validate()?;
        let mut registry = Registry::new();
        for schema in &self.enums {
            registry.register_enum(schema.clone())?;
        }
        for schema in &self.schemas {
            registry.register_struct(schema.clone())?;
        }
        info!(
            name = %self.name,
            structs = self.schemas.len(),
            enums = self.enums.len(),
            "building broker"
        );
        Ok(Broker::with_registry(
            self.name.clone(),
            registry,
            self.event_capacity,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.name, "tidewire");
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "edge",
                "schemas": [{{
                    "name": "Widget",
                    "flags": {{ "cached": true, "cleanup": true }},
                    "properties": [
                        {{ "name": "id", "tag": 1, "kind": "uint", "key": true }},
                        {{ "name": "color", "tag": 2, "kind": "string" }}
                    ]
                }}]
            }}"#
        )
        .unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.sweep_interval_ms, 1000);
        assert_eq!(config.schemas.len(), 1);

        let broker = config.build_broker().unwrap();
        assert!(broker.container("Widget").is_some());
        assert!(broker.type_id("Widget").is_some());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            BrokerConfig::load(file.path()),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = BrokerConfig {
            sweep_interval_ms: 0,
            ..BrokerConfig::default()
        };
        assert!(matches!(config.validate(), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            BrokerConfig::load("/nonexistent/tidewire.json"),
            Err(BrokerError::Io(_))
        ));
    }
}
