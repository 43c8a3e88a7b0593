//! Built-in producer items.
//!
//! The pipeline treats items as opaque; these types exist so the bundled
//! transforms in [`crate::transform`] have something concrete to map. Each
//! item captures its creation time and, when available, the trace context
//! of the operation that produced it.

use std::collections::BTreeMap;
use std::thread;

use chrono::{DateTime, Utc};

use crate::level::Severity;

/// Identifiers linking an item to a distributed trace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 hex character trace id.
    pub trace_id: String,
    /// 16 hex character span id.
    pub span_id: String,
}

/// One frame of a captured stack trace, innermost last.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub method: String,
    pub file_name: String,
    pub line: u32,
}

/// Exception details attached to a log record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExceptionInfo {
    /// Name of the exception type, if known.
    pub type_name: Option<String>,
    pub message: String,
    /// Frames ordered outermost first, as captured.
    pub frames: Vec<StackFrame>,
}

/// Source location and runtime context for a log record.
#[derive(Clone, Debug)]
pub struct RecordMetadata {
    /// Module path where the log call originated.
    pub module_path: String,
    /// Source file name for the log call.
    pub filename: String,
    /// Line number in the source file.
    pub line_number: u32,
    /// Time the record was created.
    pub timestamp: DateTime<Utc>,
    /// Name of the thread that created the record (if any).
    pub thread_name: Option<String>,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            module_path: String::new(),
            filename: String::new(),
            line_number: 0,
            timestamp: Utc::now(),
            thread_name: thread::current().name().map(ToString::to_string),
        }
    }
}

/// A log line destined for the ingestion endpoint.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Name of the logger that created this record.
    pub logger: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: RecordMetadata,
    /// Caller-supplied dimensions copied into the envelope properties.
    pub properties: BTreeMap<String, String>,
    pub exception: Option<ExceptionInfo>,
    pub trace: Option<TraceContext>,
}

impl LogRecord {
    /// Construct a record from logger `name`, `severity`, and `message`.
    pub fn new(logger: &str, severity: Severity, message: &str) -> Self {
        Self {
            logger: logger.to_owned(),
            severity,
            message: message.to_owned(),
            metadata: RecordMetadata::default(),
            properties: BTreeMap::new(),
            exception: None,
            trace: None,
        }
    }

    /// Construct a record with explicit source location.
    ///
    /// The timestamp and thread name are always captured from the calling
    /// context, overriding whatever `metadata` carried.
    pub fn with_metadata(
        logger: &str,
        severity: Severity,
        message: &str,
        mut metadata: RecordMetadata,
    ) -> Self {
        let captured = RecordMetadata::default();
        metadata.timestamp = captured.timestamp;
        metadata.thread_name = captured.thread_name;
        Self {
            metadata,
            ..Self::new(logger, severity, message)
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}

/// A named business event.
#[derive(Clone, Debug)]
pub struct CustomEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
    pub measurements: BTreeMap<String, f64>,
    pub trace: Option<TraceContext>,
}

impl CustomEvent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
            measurements: BTreeMap::new(),
            trace: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_measurement(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }
}

/// A pre-aggregated metric sample.
#[derive(Clone, Debug)]
pub struct MetricPoint {
    pub namespace: Option<String>,
    pub name: String,
    /// Sum of the aggregated samples, or the single observed value.
    pub value: f64,
    pub count: Option<u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std_dev: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
}

impl MetricPoint {
    /// A single observation of `value`.
    pub fn gauge(name: &str, value: f64) -> Self {
        Self {
            namespace: None,
            name: name.to_owned(),
            value,
            count: None,
            min: None,
            max: None,
            std_dev: None,
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
