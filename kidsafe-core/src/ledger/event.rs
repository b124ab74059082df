//! Audit event model and its canonical byte form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Event severity. `Error` and above bypass batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Whether the event must be durable before `log_event` returns.
    pub fn requires_immediate_flush(&self) -> bool {
        *self >= Severity::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Compliance area an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    ContentSafety,
    Privacy,
    Consent,
    DataAccess,
    Security,
    System,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::ContentSafety => write!(f, "content_safety"),
            EventCategory::Privacy => write!(f, "privacy"),
            EventCategory::Consent => write!(f, "consent"),
            EventCategory::DataAccess => write!(f, "data_access"),
            EventCategory::Security => write!(f, "security"),
            EventCategory::System => write!(f, "system"),
        }
    }
}

/// Who and where an event concerns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_child(child_id: impl Into<String>) -> Self {
        Self {
            child_id: Some(child_id.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// One append-only ledger entry. Persisted as a single NDJSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: Severity,
    pub category: EventCategory,
    pub description: String,
    pub context: EventContext,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    /// HMAC-SHA256 over [`AuditEvent::canonical_bytes`], hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
    pub retention_date: DateTime<Utc>,
}

/// Everything except `integrity_hash`, in a fixed field order.
#[derive(Serialize)]
struct CanonicalView<'a> {
    event_id: &'a Uuid,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a str,
    severity: Severity,
    category: EventCategory,
    description: &'a str,
    context: &'a EventContext,
    details: &'a BTreeMap<String, serde_json::Value>,
    retention_date: &'a DateTime<Utc>,
}

impl AuditEvent {
    /// Bytes the integrity hash is computed over: compact JSON of the event
    /// without its hash. Map keys are ordered, so the form is stable across
    /// serialize/deserialize round trips.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&CanonicalView {
            event_id: &self.event_id,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            severity: self.severity,
            category: self.category,
            description: &self.description,
            context: &self.context,
            details: &self.details,
            retention_date: &self.retention_date,
        })
    }

    /// Render as one NDJSON line (without the trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
