//! Transforms for the bundled item types.

use std::collections::BTreeMap;

use crate::{
    envelope::{
        DataPoint, EMPTY_SPAN_ID, EMPTY_TRACE_ID, Envelope, EventData, ExceptionData,
        ExceptionDetails, MessageData, MetricData, ParsedFrame, Payload, default_context_tags,
        schema, tags,
    },
    error::TransformError,
    items::{CustomEvent, ExceptionInfo, LogRecord, MetricPoint, TraceContext},
};

use super::EnvelopeTransform;

const PAYLOAD_VERSION: u8 = 2;

/// Values stamped onto every envelope a built-in transform produces.
#[derive(Clone, Debug)]
pub struct TransformContext {
    pub instrumentation_key: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl Default for TransformContext {
    fn default() -> Self {
        Self {
            instrumentation_key: None,
            tags: default_context_tags().clone(),
        }
    }
}

impl TransformContext {
    pub fn with_instrumentation_key(key: impl Into<String>) -> Self {
        Self {
            instrumentation_key: Some(key.into()),
            ..Self::default()
        }
    }

    fn envelope(
        &self,
        name: &str,
        time: chrono::DateTime<chrono::Utc>,
        trace: Option<&TraceContext>,
        data: Payload,
    ) -> Envelope {
        let mut stamped = self.tags.clone();
        let trace_id = trace.map_or(EMPTY_TRACE_ID, |t| t.trace_id.as_str());
        let span_id = trace.map_or(EMPTY_SPAN_ID, |t| t.span_id.as_str());
        stamped.insert(tags::OPERATION_ID.to_owned(), trace_id.to_owned());
        stamped.insert(
            tags::OPERATION_PARENT_ID.to_owned(),
            format!("|{trace_id}.{span_id}."),
        );
        Envelope::new(name, time, data)
            .with_tags(stamped)
            .with_instrumentation_key(self.instrumentation_key.clone())
    }
}

/// Maps [`LogRecord`]s to message envelopes, or exception envelopes when
/// the record carries an [`ExceptionInfo`].
#[derive(Clone, Debug, Default)]
pub struct LogTransform {
    context: TransformContext,
}

impl LogTransform {
    pub fn new(context: TransformContext) -> Self {
        Self { context }
    }

    fn properties(record: &LogRecord) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::from([
            ("logger".to_owned(), record.logger.clone()),
            ("module".to_owned(), record.metadata.module_path.clone()),
            ("fileName".to_owned(), record.metadata.filename.clone()),
            (
                "lineNumber".to_owned(),
                record.metadata.line_number.to_string(),
            ),
            ("level".to_owned(), record.severity.to_string()),
        ]);
        if let Some(thread) = &record.metadata.thread_name {
            properties.insert("thread".to_owned(), thread.clone());
        }
        properties.extend(record.properties.clone());
        properties
    }

    fn exception_details(record: &LogRecord, exception: &ExceptionInfo) -> ExceptionDetails {
        let depth = exception.frames.len();
        // Innermost frame first, numbered from zero at the outermost call.
        let parsed_stack = exception
            .frames
            .iter()
            .enumerate()
            .rev()
            .map(|(level, frame)| ParsedFrame {
                level: level as u32,
                method: frame.method.clone(),
                file_name: frame.file_name.clone(),
                line: frame.line,
            })
            .collect();
        let message = if exception.message.is_empty() {
            record.message.clone()
        } else {
            exception.message.clone()
        };
        ExceptionDetails {
            id: 1,
            outer_id: 0,
            type_name: exception
                .type_name
                .clone()
                .unwrap_or_else(|| "N/A".to_owned()),
            message,
            has_full_stack: depth > 0,
            parsed_stack,
        }
    }
}

impl EnvelopeTransform<LogRecord> for LogTransform {
    fn transform(&self, record: LogRecord) -> Result<Envelope, TransformError> {
        let properties = Self::properties(&record);
        let severity_level = record.severity.wire_level();
        let (name, data) = match &record.exception {
            Some(exception) => (
                schema::EXCEPTION,
                Payload::ExceptionData(ExceptionData {
                    ver: PAYLOAD_VERSION,
                    exceptions: vec![Self::exception_details(&record, exception)],
                    severity_level,
                    properties,
                }),
            ),
            None => (
                schema::MESSAGE,
                Payload::MessageData(MessageData {
                    ver: PAYLOAD_VERSION,
                    message: record.message.clone(),
                    severity_level,
                    properties,
                }),
            ),
        };
        Ok(self.context.envelope(
            name,
            record.metadata.timestamp,
            record.trace.as_ref(),
            data,
        ))
    }
}

/// Maps [`CustomEvent`]s to event envelopes.
#[derive(Clone, Debug, Default)]
pub struct EventTransform {
    context: TransformContext,
}

impl EventTransform {
    pub fn new(context: TransformContext) -> Self {
        Self { context }
    }
}

impl EnvelopeTransform<CustomEvent> for EventTransform {
    fn transform(&self, event: CustomEvent) -> Result<Envelope, TransformError> {
        if event.name.trim().is_empty() {
            return Err(TransformError::Invalid("event name must not be empty".into()));
        }
        if let Some((key, _)) = event.measurements.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TransformError::Invalid(format!(
                "measurement {key:?} is not finite"
            )));
        }
        let data = Payload::EventData(EventData {
            ver: PAYLOAD_VERSION,
            name: event.name,
            properties: event.properties,
            measurements: event.measurements,
        });
        Ok(self
            .context
            .envelope(schema::EVENT, event.timestamp, event.trace.as_ref(), data))
    }
}

/// Maps [`MetricPoint`]s to metric envelopes.
#[derive(Clone, Debug, Default)]
pub struct MetricTransform {
    context: TransformContext,
}

impl MetricTransform {
    pub fn new(context: TransformContext) -> Self {
        Self { context }
    }
}

impl EnvelopeTransform<MetricPoint> for MetricTransform {
    fn transform(&self, point: MetricPoint) -> Result<Envelope, TransformError> {
        let fields = [
            ("value", Some(point.value)),
            ("min", point.min),
            ("max", point.max),
            ("std_dev", point.std_dev),
        ];
        if let Some((field, _)) = fields
            .iter()
            .find(|(_, v)| v.is_some_and(|v| !v.is_finite()))
        {
            return Err(TransformError::Invalid(format!(
                "metric {:?} has non-finite {field}",
                point.name
            )));
        }
        if point.count == Some(0) {
            return Err(TransformError::Unsupported(format!(
                "metric {:?} aggregates zero samples",
                point.name
            )));
        }
        let data = Payload::MetricData(MetricData {
            ver: PAYLOAD_VERSION,
            metrics: vec![DataPoint {
                ns: point.namespace,
                name: point.name,
                value: point.value,
                count: point.count,
                min: point.min,
                max: point.max,
                std_dev: point.std_dev,
            }],
            properties: point.properties,
        });
        Ok(self.context.envelope(schema::METRIC, point.timestamp, None, data))
    }
}
