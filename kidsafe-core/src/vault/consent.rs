//! Parental consent records and their lifecycle.
//!
//! ```text
//! no_consent                      (terminal until a new record is created)
//! active --revoke--> revoked --delete--> deleted
//! active --(now > retention_expiry)--> expired --delete--> deleted
//! ```
//!
//! Every lifecycle action appends one entry to the audit trail. Expiry only
//! moves forward, except on revocation, which pulls it back to the
//! revocation time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConsentError;

/// How verifiable parental consent was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    Email,
    CreditCard,
    SignedForm,
    VideoCall,
    KnowledgeBased,
    Other,
}

impl ConsentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentMethod::Email => "email",
            ConsentMethod::CreditCard => "credit_card",
            ConsentMethod::SignedForm => "signed_form",
            ConsentMethod::VideoCall => "video_call",
            ConsentMethod::KnowledgeBased => "knowledge_based",
            ConsentMethod::Other => "other",
        }
    }

    /// Parse a method name like "email" or "signed_form".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Some(ConsentMethod::Email),
            "credit_card" => Some(ConsentMethod::CreditCard),
            "signed_form" => Some(ConsentMethod::SignedForm),
            "video_call" => Some(ConsentMethod::VideoCall),
            "knowledge_based" => Some(ConsentMethod::KnowledgeBased),
            "other" => Some(ConsentMethod::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    Granted,
    Accessed,
    Renewed,
    Revoked,
    Deleted,
}

impl std::fmt::Display for ConsentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentAction::Granted => write!(f, "granted"),
            ConsentAction::Accessed => write!(f, "accessed"),
            ConsentAction::Renewed => write!(f, "renewed"),
            ConsentAction::Revoked => write!(f, "revoked"),
            ConsentAction::Deleted => write!(f, "deleted"),
        }
    }
}

/// One immutable audit-trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub action: ConsentAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Derived lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    NoConsent,
    Active,
    /// Past retention, awaiting deletion.
    Expired,
    Revoked,
    Deleted,
}

impl std::fmt::Display for ConsentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentState::NoConsent => write!(f, "no_consent"),
            ConsentState::Active => write!(f, "active"),
            ConsentState::Expired => write!(f, "expired"),
            ConsentState::Revoked => write!(f, "revoked"),
            ConsentState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Parental consent for one child. Fields change only through the
/// lifecycle methods, each of which appends to the audit trail.
///
/// ```compile_fail
/// # use chrono::{Duration, Utc};
/// # use kidsafe_core::vault::{ConsentMethod, ConsentRecord};
/// let mut c = ConsentRecord::grant("c", ConsentMethod::Email, None, Utc::now(), Duration::days(90));
/// c.retention_expiry = Utc::now() + Duration::days(3650);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    child_id: String,
    consent_given: bool,
    consent_timestamp: DateTime<Utc>,
    method: ConsentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    retention_expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    audit_trail: Vec<TrailEntry>,
}

impl ConsentRecord {
    /// A fresh grant valid until `now + window`.
    pub fn grant(
        child_id: impl Into<String>,
        method: ConsentMethod,
        ip: Option<String>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Self {
        let mut record = Self {
            child_id: child_id.into(),
            consent_given: true,
            consent_timestamp: now,
            method,
            ip,
            retention_expiry: now + window,
            revoked_at: None,
            deleted_at: None,
            audit_trail: Vec::new(),
        };
        record.append(ConsentAction::Granted, now, Some(format!("method={}", method)));
        record
    }

    /// A record stating that no consent was obtained.
    pub fn without_consent(child_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            child_id: child_id.into(),
            consent_given: false,
            consent_timestamp: now,
            method: ConsentMethod::Other,
            ip: None,
            retention_expiry: now,
            revoked_at: None,
            deleted_at: None,
            audit_trail: Vec::new(),
        }
    }

    pub fn child_id(&self) -> &str {
        &self.child_id
    }

    pub fn consent_given(&self) -> bool {
        self.consent_given
    }

    pub fn consent_timestamp(&self) -> DateTime<Utc> {
        self.consent_timestamp
    }

    pub fn method(&self) -> ConsentMethod {
        self.method
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn retention_expiry(&self) -> DateTime<Utc> {
        self.retention_expiry
    }

    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revoked_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn audit_trail(&self) -> &[TrailEntry] {
        &self.audit_trail
    }

    fn append(&mut self, action: ConsentAction, timestamp: DateTime<Utc>, note: Option<String>) {
        self.audit_trail.push(TrailEntry {
            action,
            timestamp,
            note,
        });
    }

    /// Lifecycle state at `now`. The expiry instant itself is still active.
    pub fn state(&self, now: DateTime<Utc>) -> ConsentState {
        if self.deleted_at.is_some() {
            ConsentState::Deleted
        } else if self.revoked_at.is_some() {
            ConsentState::Revoked
        } else if !self.consent_given {
            ConsentState::NoConsent
        } else if now > self.retention_expiry {
            ConsentState::Expired
        } else {
            ConsentState::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == ConsentState::Active
    }

    /// True once the data covered by this record must be purged.
    pub fn should_delete(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state(now),
            ConsentState::Expired | ConsentState::Revoked | ConsentState::NoConsent
        )
    }

    /// Whole days left before expiry; negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.retention_expiry - now).num_days()
    }

    fn require_active(&self, now: DateTime<Utc>, to: &str) -> Result<(), ConsentError> {
        match self.state(now) {
            ConsentState::Active => Ok(()),
            ConsentState::NoConsent => Err(ConsentError::NotGranted {
                child_id: self.child_id.clone(),
            }),
            other => Err(self.invalid(other, to)),
        }
    }

    fn invalid(&self, from: ConsentState, to: &str) -> ConsentError {
        ConsentError::InvalidTransition {
            child_id: self.child_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn record_access(
        &mut self,
        now: DateTime<Utc>,
        purpose: impl Into<String>,
    ) -> Result<(), ConsentError> {
        self.require_active(now, "accessed")?;
        self.append(ConsentAction::Accessed, now, Some(purpose.into()));
        Ok(())
    }

    /// Extend expiry to `now + window`. Never shortens it.
    pub fn renew(&mut self, now: DateTime<Utc>, window: Duration) -> Result<(), ConsentError> {
        self.require_active(now, "renewed")?;
        self.retention_expiry = self.retention_expiry.max(now + window);
        self.append(ConsentAction::Renewed, now, None);
        Ok(())
    }

    pub fn revoke(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<(), ConsentError> {
        self.require_active(now, "revoked")?;
        self.revoked_at = Some(now);
        self.retention_expiry = self.retention_expiry.min(now);
        self.append(ConsentAction::Revoked, now, Some(reason.into()));
        Ok(())
    }

    /// Record that the covered data was securely deleted.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) -> Result<(), ConsentError> {
        let state = self.state(now);
        if !self.should_delete(now) {
            return Err(self.invalid(state, "deleted"));
        }
        self.deleted_at = Some(now);
        self.append(ConsentAction::Deleted, now, Some(format!("from={}", state)));
        Ok(())
    }
}
