//! Wire-ready telemetry envelopes.
//!
//! An [`Envelope`] carries a schema name, a timestamp, a tag map, and a
//! typed [`Payload`]. Envelopes serialise to the JSON shape accepted by the
//! ingestion endpoint and are also the unit persisted by the overflow store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Schema names for the built-in payload kinds.
pub mod schema {
    pub const MESSAGE: &str = "Microsoft.ApplicationInsights.Message";
    pub const EXCEPTION: &str = "Microsoft.ApplicationInsights.Exception";
    pub const EVENT: &str = "Microsoft.ApplicationInsights.Event";
    pub const METRIC: &str = "Microsoft.ApplicationInsights.Metric";
}

/// Tag keys stamped onto envelopes.
pub mod tags {
    pub const CLOUD_ROLE: &str = "ai.cloud.role";
    pub const CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
    pub const DEVICE_ID: &str = "ai.device.id";
    pub const DEVICE_TYPE: &str = "ai.device.type";
    pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";
    pub const OPERATION_ID: &str = "ai.operation.id";
    pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";
}

pub(crate) const EMPTY_TRACE_ID: &str = "00000000000000000000000000000000";
pub(crate) const EMPTY_SPAN_ID: &str = "0000000000000000";

static DEFAULT_CONTEXT: Lazy<BTreeMap<String, String>> = Lazy::new(|| {
    let role = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_owned());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_owned());
    BTreeMap::from([
        (tags::CLOUD_ROLE.to_owned(), role),
        (tags::CLOUD_ROLE_INSTANCE.to_owned(), host.clone()),
        (tags::DEVICE_ID.to_owned(), host),
        (tags::DEVICE_TYPE.to_owned(), "Other".to_owned()),
        (
            tags::INTERNAL_SDK_VERSION.to_owned(),
            format!("rs:femtoexport:{}", env!("CARGO_PKG_VERSION")),
        ),
    ])
});

/// Context tags describing this process, computed once.
pub fn default_context_tags() -> &'static BTreeMap<String, String> {
    &DEFAULT_CONTEXT
}

/// A single wire-ready telemetry unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema name, e.g. [`schema::MESSAGE`].
    pub name: String,
    pub time: DateTime<Utc>,
    /// Destination key for the ingestion endpoint, if one is configured.
    #[serde(rename = "iKey", default, skip_serializing_if = "Option::is_none")]
    pub instrumentation_key: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub data: Payload,
}

impl Envelope {
    pub fn new(name: impl Into<String>, time: DateTime<Utc>, data: Payload) -> Self {
        Self {
            name: name.into(),
            time,
            instrumentation_key: None,
            tags: BTreeMap::new(),
            data,
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_instrumentation_key(mut self, key: Option<String>) -> Self {
        self.instrumentation_key = key;
        self
    }

    /// Name of the first numeric field holding NaN or an infinity.
    ///
    /// JSON cannot represent such values; `serde_json` writes them as
    /// `null`, which the typed payloads then refuse to read back.
    pub fn non_finite_field(&self) -> Option<String> {
        match &self.data {
            Payload::EventData(data) => data
                .measurements
                .iter()
                .find(|(_, v)| !v.is_finite())
                .map(|(key, _)| format!("measurements.{key}")),
            Payload::MetricData(data) => data.metrics.iter().find_map(|point| {
                [
                    ("value", Some(point.value)),
                    ("min", point.min),
                    ("max", point.max),
                    ("std_dev", point.std_dev),
                ]
                .into_iter()
                .find(|(_, v)| v.is_some_and(|v| !v.is_finite()))
                .map(|(field, _)| format!("metrics.{}.{field}", point.name))
            }),
            Payload::MessageData(_) | Payload::ExceptionData(_) => None,
        }
    }
}

/// Typed body of an envelope, tagged by its base type on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum Payload {
    MessageData(MessageData),
    ExceptionData(ExceptionData),
    EventData(EventData),
    MetricData(MetricData),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub ver: u8,
    pub message: String,
    pub severity_level: u8,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFrame {
    pub level: u32,
    pub method: String,
    pub file_name: String,
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub id: u32,
    pub outer_id: u32,
    pub type_name: String,
    pub message: String,
    pub has_full_stack: bool,
    #[serde(default)]
    pub parsed_stack: Vec<ParsedFrame>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub ver: u8,
    pub exceptions: Vec<ExceptionDetails>,
    pub severity_level: u8,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub ver: u8,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricData {
    pub ver: u8,
    pub metrics: Vec<DataPoint>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}
