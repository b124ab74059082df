//! Compliance checks over a record and its consent.
//!
//! Violations are hard failures and make a record non-compliant. Warnings
//! never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::consent::{ConsentRecord, ConsentState};
use super::record::{DataRecord, ENCRYPTED_MARKER};
use crate::config::VaultConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceViolation {
    NoConsent,
    ConsentRevoked,
    AgeOverLimit { age: u64, max: u8 },
    RetentionExpired { expired_at: DateTime<Utc> },
    PiiWithoutConsent { fields: Vec<String> },
}

impl std::fmt::Display for ComplianceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceViolation::NoConsent => write!(f, "no parental consent on record"),
            ComplianceViolation::ConsentRevoked => write!(f, "parental consent was revoked"),
            ComplianceViolation::AgeOverLimit { age, max } => {
                write!(f, "child age {} exceeds policy limit {}", age, max)
            }
            ComplianceViolation::RetentionExpired { expired_at } => {
                write!(f, "retention expired at {}", expired_at.to_rfc3339())
            }
            ComplianceViolation::PiiWithoutConsent { fields } => {
                write!(f, "personal data held without consent: {}", fields.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceWarning {
    MissingIp,
    EmptyAuditTrail,
    ExpiringSoon { days_left: i64 },
    PlaintextSensitiveFields { fields: Vec<String> },
}

impl std::fmt::Display for ComplianceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplianceWarning::MissingIp => write!(f, "consent has no IP address recorded"),
            ComplianceWarning::EmptyAuditTrail => write!(f, "consent audit trail is empty"),
            ComplianceWarning::ExpiringSoon { days_left } => {
                write!(f, "consent expires in {} days", days_left)
            }
            ComplianceWarning::PlaintextSensitiveFields { fields } => {
                write!(f, "sensitive fields stored unencrypted: {}", fields.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub violations: Vec<ComplianceViolation>,
    pub warnings: Vec<ComplianceWarning>,
    pub required_actions: Vec<String>,
}

fn push_action(actions: &mut Vec<String>, action: &str) {
    if !actions.iter().any(|a| a == action) {
        actions.push(action.to_string());
    }
}

fn record_age(record: &DataRecord, field: &str) -> Option<u64> {
    match record.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn validate_compliance(
    record: &DataRecord,
    consent: Option<&ConsentRecord>,
    config: &VaultConfig,
    now: DateTime<Utc>,
) -> ComplianceReport {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();
    let mut actions = Vec::new();

    let pii: Vec<String> = config
        .sensitive_fields
        .iter()
        .filter(|name| record.fields.contains_key(name.as_str()))
        .cloned()
        .collect();
    let plaintext_pii: Vec<String> = pii
        .iter()
        .filter(|name| record.get_str(name) != Some(ENCRYPTED_MARKER))
        .cloned()
        .collect();

    let state = consent.map(|c| c.state(now));
    match state {
        None | Some(ConsentState::NoConsent) => {
            violations.push(ComplianceViolation::NoConsent);
            push_action(&mut actions, "obtain verifiable parental consent");
        }
        Some(ConsentState::Revoked) => {
            violations.push(ComplianceViolation::ConsentRevoked);
            push_action(&mut actions, "delete child data");
        }
        Some(ConsentState::Expired) => {
            if let Some(c) = consent {
                violations.push(ComplianceViolation::RetentionExpired {
                    expired_at: c.retention_expiry(),
                });
            }
            push_action(&mut actions, "delete child data");
        }
        Some(ConsentState::Deleted) => {
            violations.push(ComplianceViolation::NoConsent);
            push_action(&mut actions, "delete child data");
        }
        Some(ConsentState::Active) => {}
    }

    if state != Some(ConsentState::Active) && !pii.is_empty() {
        violations.push(ComplianceViolation::PiiWithoutConsent { fields: pii });
        push_action(&mut actions, "delete child data");
    }

    if let Some(age) = record_age(record, &config.age_field)
        && age > u64::from(config.max_child_age)
    {
        violations.push(ComplianceViolation::AgeOverLimit {
            age,
            max: config.max_child_age,
        });
        push_action(&mut actions, "verify child age eligibility");
    }

    if let Some(c) = consent {
        if c.ip().is_none_or(str::is_empty) {
            warnings.push(ComplianceWarning::MissingIp);
        }
        if c.audit_trail().is_empty() {
            warnings.push(ComplianceWarning::EmptyAuditTrail);
        }
        if state == Some(ConsentState::Active) {
            let days_left = c.days_until_expiry(now);
            if days_left <= i64::from(config.renewal_warning_days) {
                warnings.push(ComplianceWarning::ExpiringSoon { days_left });
                push_action(&mut actions, "renew parental consent");
            }
        }
    }

    if !plaintext_pii.is_empty() {
        warnings.push(ComplianceWarning::PlaintextSensitiveFields {
            fields: plaintext_pii,
        });
        push_action(&mut actions, "encrypt sensitive fields");
    }

    ComplianceReport {
        compliant: violations.is_empty(),
        violations,
        warnings,
        required_actions: actions,
    }
}
