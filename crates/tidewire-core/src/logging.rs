//! JSONL audit log of broker activity
//!
//! [`AuditLayer`] is a `tracing_subscriber::Layer` that appends every event to
//! `<dir>/<date>_<broker>.jsonl`, one JSON object per line. The `peer` and
//! `group` fields most broker events carry are lifted into top-level columns
//! so the file can be sliced per guest:
//!
//! ```bash
//! jq 'select(.peer == 4)' logs/*_tidewire.jsonl
//! jq 'select(.level == "error")' logs/*.jsonl
//! ```

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    pub level: String,
    /// Broker name
    pub broker: String,
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Append-only JSONL file for one broker
pub struct AuditLog {
    broker: String,
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open (or create) today's log file for `broker` under `dir`
    pub fn open(dir: impl AsRef<Path>, broker: impl Into<String>) -> io::Result<Self> {
        let broker = broker.into();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_{}.jsonl",
            chrono::Local::now().format("%Y-%m-%d"),
            broker
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            broker,
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn append(&self, record: &AuditRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = self.file.lock();
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        let _ = self.file.lock().flush();
    }
}

/// Read back every record of a log file, skipping lines that do not parse
pub fn read_records(path: impl AsRef<Path>) -> io::Result<Vec<AuditRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Tracing layer feeding an [`AuditLog`]
#[derive(Clone)]
pub struct AuditLayer {
    log: Arc<AuditLog>,
}

impl AuditLayer {
    pub fn new(dir: impl AsRef<Path>, broker: impl Into<String>) -> io::Result<Self> {
        Ok(Self {
            log: Arc::new(AuditLog::open(dir, broker)?),
        })
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

impl<S> Layer<S> for AuditLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let record = AuditRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: metadata.level().as_str().to_lowercase(),
            broker: self.log.broker().to_string(),
            target: metadata.target().to_string(),
            msg: visitor.message.unwrap_or_default(),
            peer: visitor.peer,
            group: visitor.group,
            fields: visitor.fields,
        };
        // A failing log write must never take the broker down.
        let _ = self.log.append(&record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    peer: Option<u64>,
    group: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut text = String::new();
        let _ = write!(text, "{:?}", value);
        match field.name() {
            "message" => self.message = Some(text),
            "group" => self.group = Some(text),
            _ => self.insert(field, serde_json::Value::String(text)),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "group" => self.group = Some(value.to_string()),
            _ => self.insert(field, value.into()),
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "peer" {
            self.peer = Some(value);
        } else {
            self.insert(field, value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        match (field.name(), u64::try_from(value)) {
            ("peer", Ok(peer)) => self.peer = Some(peer),
            _ => self.insert(field, value.into()),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, value.to_string().into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_layer_lifts_peer_and_group() {
        let dir = tempfile::tempdir().unwrap();
        let layer = AuditLayer::new(dir.path(), "test-broker").unwrap();
        let path = layer.path().to_path_buf();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(peer = 4u32, group = "Widget", items = 3, "replaying cache");
            tracing::warn!(flag = true, "plain event");
        });

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].msg, "replaying cache");
        assert_eq!(records[0].peer, Some(4));
        assert_eq!(records[0].group.as_deref(), Some("Widget"));
        assert_eq!(records[0].fields["items"], 3);
        assert_eq!(records[0].broker, "test-broker");
        assert_eq!(records[1].level, "warn");
        assert_eq!(records[1].peer, None);
    }

    #[test]
    fn test_file_name_carries_broker() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), "edge").unwrap();
        let name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_edge.jsonl"));
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        fs::write(&path, "not json\n").unwrap();
        assert!(read_records(&path).unwrap().is_empty());
    }
}
