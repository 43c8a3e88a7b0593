//! HTTP transmitter posting envelope batches as JSON.
//!
//! The transmitter keeps a `ureq::Agent` for connection pooling and maps
//! responses onto [`TransmitOutcome`]:
//!
//! - **200 / other 2xx**: accepted.
//! - **206**: partially accepted; the body lists failed indices and only
//!   those with a retryable status are reported for retry.
//! - **408, 429, 439, 500, 503**: transient; the whole batch is retried,
//!   honouring `Retry-After` when present.
//! - **Other statuses**: permanent rejection; the batch is dropped.
//! - **Transport errors**: transient.

use std::{collections::HashMap, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use log::{debug, warn};
use serde::Deserialize;
use ureq::{Agent, AgentBuilder};

use super::{TransmitOutcome, Transmitter};
use crate::{
    envelope::Envelope,
    error::{BuildError, TransmitError},
};

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default whole-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication applied to every request.
#[derive(Clone, Debug, Default)]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// HTTP Basic authentication with username and password.
    Basic { username: String, password: String },
    /// Bearer token authentication.
    Bearer { token: String },
}

/// Settings for [`HttpTransmitter`].
#[derive(Clone, Debug)]
pub struct HttpTransmitterConfig {
    /// Full URL batches are posted to.
    pub endpoint: String,
    pub auth: AuthConfig,
    /// Additional HTTP headers to include in requests.
    pub headers: HashMap<String, String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpTransmitterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth: AuthConfig::default(),
            headers: HashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HttpTransmitterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

/// Classification of an HTTP status for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Partial,
    Retryable,
    Permanent,
}

/// Classifies an HTTP status code.
///
/// * **206** → [`ResponseClass::Partial`]
/// * **other 2xx** → [`ResponseClass::Success`]
/// * **408, 429, 439, 500, 503** → [`ResponseClass::Retryable`]
/// * **anything else** → [`ResponseClass::Permanent`]
pub fn classify_status(status: u16) -> ResponseClass {
    match status {
        206 => ResponseClass::Partial,
        200..=299 => ResponseClass::Success,
        s if is_retryable(s) => ResponseClass::Retryable,
        _ => ResponseClass::Permanent,
    }
}

fn is_retryable(status: u16) -> bool {
    matches!(status, 408 | 429 | 439 | 500 | 503)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    #[serde(default)]
    items_received: usize,
    #[serde(default)]
    items_accepted: usize,
    #[serde(default)]
    errors: Vec<TrackError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackError {
    index: usize,
    status_code: u16,
    #[serde(default)]
    message: String,
}

/// Reduce a partial-success body to the indices worth retrying.
fn retry_indices(body: &str, batch_len: usize) -> Result<Vec<usize>, TransmitError> {
    let response: TrackResponse = serde_json::from_str(body)?;
    debug!(
        "ingestion accepted {}/{} envelopes",
        response.items_accepted, response.items_received
    );
    let mut retry = Vec::new();
    for error in response.errors {
        if error.index >= batch_len {
            warn!("ingestion reported out-of-range index {}", error.index);
        } else if is_retryable(error.status_code) {
            retry.push(error.index);
        } else {
            warn!(
                "ingestion rejected envelope {} with status {}: {}",
                error.index, error.status_code, error.message
            );
        }
    }
    retry.sort_unstable();
    retry.dedup();
    Ok(retry)
}

fn parse_retry_after(response: &ureq::Response) -> Option<Duration> {
    response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Posts batches to an HTTP ingestion endpoint.
pub struct HttpTransmitter {
    config: HttpTransmitterConfig,
    agent: Agent,
}

impl HttpTransmitter {
    pub fn new(config: HttpTransmitterConfig) -> Result<Self, BuildError> {
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty() {
            return Err(BuildError::InvalidConfig(
                "HTTP transmitter requires an endpoint".into(),
            ));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(BuildError::InvalidConfig(format!(
                "endpoint must be an http(s) URL, got {endpoint:?}"
            )));
        }
        if config.connect_timeout.is_zero() || config.request_timeout.is_zero() {
            return Err(BuildError::InvalidConfig(
                "HTTP timeouts must be greater than zero".into(),
            ));
        }
        let tls = native_tls::TlsConnector::new()?;
        let agent = AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .tls_connector(Arc::new(tls))
            .build();
        Ok(Self { config, agent })
    }

    fn post(&self, body: &str) -> Result<ureq::Response, Box<ureq::Error>> {
        let mut req = self
            .agent
            .post(&self.config.endpoint)
            .set("Content-Type", "application/json; charset=utf-8")
            .set("Accept", "application/json");
        req = self.apply_auth(req);
        for (key, value) in &self.config.headers {
            req = req.set(key, value);
        }
        req.send_string(body).map_err(Box::new)
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        match &self.config.auth {
            AuthConfig::None => req,
            AuthConfig::Basic { username, password } => {
                let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
                req.set("Authorization", &format!("Basic {encoded}"))
            }
            AuthConfig::Bearer { token } => req.set("Authorization", &format!("Bearer {token}")),
        }
    }

    fn interpret(&self, response: ureq::Response, batch_len: usize) -> TransmitOutcome {
        let status = response.status();
        match classify_status(status) {
            ResponseClass::Success => TransmitOutcome::Accepted,
            ResponseClass::Partial => {
                let parsed = response
                    .into_string()
                    .map_err(TransmitError::from)
                    .and_then(|body| retry_indices(&body, batch_len));
                match parsed {
                    Ok(retry) if retry.is_empty() => TransmitOutcome::Accepted,
                    Ok(retry) => TransmitOutcome::PartiallyAccepted { retry },
                    Err(err) => {
                        warn!("unreadable partial-success response: {err}");
                        TransmitOutcome::Failed
                    }
                }
            }
            ResponseClass::Retryable => TransmitOutcome::TransientError {
                reason: format!("server returned status {status}"),
                retry_after: parse_retry_after(&response),
            },
            ResponseClass::Permanent => TransmitOutcome::Rejected {
                reason: format!("server returned status {status}"),
            },
        }
    }
}

impl Transmitter for HttpTransmitter {
    fn send(&self, envelopes: &[Envelope]) -> TransmitOutcome {
        let body = match serde_json::to_string(envelopes) {
            Ok(body) => body,
            Err(err) => {
                let err = TransmitError::from(err);
                warn!("{err}");
                return TransmitOutcome::Rejected {
                    reason: err.to_string(),
                };
            }
        };
        match self.post(&body) {
            Ok(response) => self.interpret(response, envelopes.len()),
            Err(err) => match *err {
                ureq::Error::Status(_, response) => self.interpret(response, envelopes.len()),
                ureq::Error::Transport(transport) => {
                    let err = TransmitError::Transport(transport.to_string());
                    warn!("transmission failed: {err}");
                    TransmitOutcome::TransientError {
                        reason: err.to_string(),
                        retry_after: None,
                    }
                }
            },
        }
    }
}

impl std::fmt::Debug for HttpTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransmitter")
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, ResponseClass::Success)]
    #[case(204, ResponseClass::Success)]
    #[case(206, ResponseClass::Partial)]
    #[case(408, ResponseClass::Retryable)]
    #[case(429, ResponseClass::Retryable)]
    #[case(439, ResponseClass::Retryable)]
    #[case(500, ResponseClass::Retryable)]
    #[case(503, ResponseClass::Retryable)]
    #[case(400, ResponseClass::Permanent)]
    #[case(401, ResponseClass::Permanent)]
    #[case(502, ResponseClass::Permanent)]
    fn classify_statuses(#[case] status: u16, #[case] expected: ResponseClass) {
        assert_eq!(classify_status(status), expected);
    }

    #[test]
    fn retry_indices_keep_only_retryable_errors() {
        let body = r#"{
            "itemsReceived": 5,
            "itemsAccepted": 2,
            "errors": [
                {"index": 4, "statusCode": 500, "message": "internal"},
                {"index": 1, "statusCode": 400, "message": "bad"},
                {"index": 2, "statusCode": 429},
                {"index": 9, "statusCode": 500}
            ]
        }"#;
        assert_eq!(retry_indices(body, 5).expect("parse"), vec![2, 4]);
    }

    #[test]
    fn retry_indices_reject_garbage() {
        assert!(retry_indices("not json", 3).is_err());
    }

    #[rstest]
    #[case("")]
    #[case("ftp://example.com")]
    fn rejects_bad_endpoints(#[case] endpoint: &str) {
        let err = HttpTransmitter::new(HttpTransmitterConfig::new(endpoint)).expect_err("bad url");
        assert!(matches!(err, BuildError::InvalidConfig(_)));
    }
}
