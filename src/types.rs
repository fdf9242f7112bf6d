use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Observed status of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Open,
    Closed,
    Timeout,
    Filtered,
    Error,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Open => "open",
            ObservationStatus::Closed => "closed",
            ObservationStatus::Timeout => "timeout",
            ObservationStatus::Filtered => "filtered",
            ObservationStatus::Error => "error",
        }
    }
}

/// Uniform record produced by every probe for a single (ip, port) attempt.
///
/// Pure value: never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub status: ObservationStatus,
    pub latency_ms: u64,
    pub timestamp: f64,
    pub error_reason: Option<String>,
    pub banner: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub cert_info: BTreeMap<String, String>,
    pub response_code: Option<u16>,
}

impl Observation {
    pub fn new(
        ip: String,
        port: u16,
        service: impl Into<String>,
        status: ObservationStatus,
        latency_ms: u64,
    ) -> Self {
        Self {
            ip,
            port,
            protocol: "tcp".to_string(),
            service: service.into(),
            status,
            latency_ms,
            timestamp: now_epoch_secs(),
            error_reason: None,
            banner: None,
            headers: BTreeMap::new(),
            body: None,
            cert_info: BTreeMap::new(),
            response_code: None,
        }
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn with_error(mut self, reason: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self
    }
}

pub fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Weighted identity derived from an Observation by the fingerprinter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Analysis {
    pub service_type: String,
    pub vendor: String,
    pub product: String,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub confidence: u8,
    pub evidence: Vec<String>,
}

/// Host row: one per distinct IP ever observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub first_seen: String,
    pub last_seen: String,
}

/// Service row: unique by (ip, port, protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service_type: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub banner: Option<String>,
    pub confidence: Option<u8>,
    pub tags: Vec<String>,
    pub first_seen: String,
    pub last_seen: String,
}

/// Append-only record of an observed state/banner change on a Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: i64,
    pub service_id: i64,
    pub timestamp: String,
    pub banner: String,
    pub state: String,
}

/// Lifecycle status of a scheduled scan chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkStatus {
    Queued,
    Scanning,
    Retrying,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Queued => "QUEUED",
            ChunkStatus::Scanning => "SCANNING",
            ChunkStatus::Retrying => "RETRYING",
            ChunkStatus::Completed => "COMPLETED",
            ChunkStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(ChunkStatus::Queued),
            "SCANNING" => Some(ChunkStatus::Scanning),
            "RETRYING" => Some(ChunkStatus::Retrying),
            "COMPLETED" => Some(ChunkStatus::Completed),
            "FAILED" => Some(ChunkStatus::Failed),
            _ => None,
        }
    }
}

/// Unit of scheduling: a contiguous inclusive IPv4 range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanChunk {
    pub id: i64,
    pub cidr: String,
    pub chunk_start: String,
    pub chunk_end: String,
    pub status: ChunkStatus,
    pub priority: i64,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
