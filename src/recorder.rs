//! Connection recording - one record per finished connection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

/// HTTP sub-record filled by the sniffer or the HTTP handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRecord {
    pub method: String,
    pub host: String,
    pub uri: String,
    pub status: u16,
    pub request_len: u64,
    pub response_len: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<(String, String)>,
}

/// Audit object for one connection.
///
/// Built at accept, enriched during the session, written once at teardown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderObject {
    pub service: String,
    pub network: String,
    pub remote_addr: String,
    pub local_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    pub sid: String,
    pub time: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub proto: String,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRecord>,
}

impl RecorderObject {
    pub fn new(service: &str, network: &str) -> Self {
        Self {
            service: service.to_string(),
            network: network.to_string(),
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            ..Default::default()
        }
    }

    pub fn set_duration(&mut self, d: Duration) {
        self.duration_ms = d.as_millis() as u64;
    }
}

/// Sink receiving one record per finished connection.
#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record(&self, ro: &RecorderObject);
}

/// The in-tree recorder: structured JSON via tracing (target `recorder`).
pub struct LogRecorder;

#[async_trait]
impl Recorder for LogRecorder {
    async fn record(&self, ro: &RecorderObject) {
        match serde_json::to_string(ro) {
            Ok(json) => info!(target: "recorder", "{}", json),
            Err(e) => info!(target: "recorder", "record serialization failed: {}", e),
        }
    }
}

/// Recorder that drops everything (used when no recorder is configured).
pub struct NopRecorder;

#[async_trait]
impl Recorder for NopRecorder {
    async fn record(&self, _ro: &RecorderObject) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_skips_empty_fields() {
        let ro = RecorderObject::new("svc", "tcp");
        let json = serde_json::to_string(&ro).unwrap();
        assert!(json.contains("\"service\":\"svc\""));
        assert!(!json.contains("client_id"));
        assert!(!json.contains("http"));
    }

    #[test]
    fn test_http_sub_record_serialized() {
        let mut ro = RecorderObject::new("svc", "tcp");
        ro.http = Some(HttpRecord {
            method: "GET".into(),
            status: 200,
            ..Default::default()
        });
        let json = serde_json::to_string(&ro).unwrap();
        assert!(json.contains("\"method\":\"GET\""));
        assert!(json.contains("\"status\":200"));
    }
}
