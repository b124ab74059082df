//! HMAC-SHA256 signing and verification of audit events.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::event::AuditEvent;
use crate::config::MIN_SECRET_BYTES;
use crate::error::{ConfigError, IntegrityError};
use crate::hex;

type HmacSha256 = Hmac<Sha256>;

/// Keyed signer for audit events. Cloning the prepared MAC avoids re-keying
/// on every event.
#[derive(Clone)]
pub struct IntegritySigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for IntegritySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegritySigner").finish_non_exhaustive()
    }
}

impl IntegritySigner {
    pub fn new(secret: &[u8]) -> Result<Self, ConfigError> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::WeakKey {
                field: "ledger.hmac_secret".into(),
                min: MIN_SECRET_BYTES,
                actual: secret.len(),
            });
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|e| ConfigError::Invalid {
            message: format!("HMAC key rejected: {}", e),
        })?;
        Ok(Self { mac })
    }

    /// Hex HMAC over the event's canonical bytes.
    pub fn sign(&self, event: &AuditEvent) -> Result<String, serde_json::Error> {
        let bytes = event.canonical_bytes()?;
        let mut mac = self.mac.clone();
        mac.update(&bytes);
        Ok(hex::encode(&mac.finalize().into_bytes()))
    }

    /// Check the stored hash in constant time.
    pub fn verify(&self, event: &AuditEvent) -> Result<(), IntegrityError> {
        let stored = event
            .integrity_hash
            .as_deref()
            .ok_or(IntegrityError::MissingHash {
                event_id: event.event_id,
            })?;
        let mismatch = IntegrityError::HashMismatch {
            event_id: event.event_id,
        };
        let expected = hex::decode(stored).map_err(|_| mismatch.clone())?;
        let bytes = event.canonical_bytes().map_err(|_| mismatch.clone())?;
        let mut mac = self.mac.clone();
        mac.update(&bytes);
        mac.verify_slice(&expected).map_err(|_| mismatch)
    }

    /// Verify every event, collecting failures instead of stopping at the
    /// first one.
    pub fn verify_events<'a, I>(&self, events: I) -> VerificationReport
    where
        I: IntoIterator<Item = &'a AuditEvent>,
    {
        let mut report = VerificationReport::default();
        for event in events {
            report.checked += 1;
            match self.verify(event) {
                Ok(()) => report.valid += 1,
                Err(IntegrityError::MissingHash { event_id }) => report.missing.push(event_id),
                Err(_) => report.tampered.push(event.event_id),
            }
        }
        report
    }
}

/// Result of verifying a batch of persisted events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub checked: usize,
    pub valid: usize,
    pub tampered: Vec<Uuid>,
    pub missing: Vec<Uuid>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.tampered.is_empty() && self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::{EventCategory, EventContext, Severity};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn event() -> AuditEvent {
        let now = Utc::now();
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: now,
            event_type: "consent_granted".into(),
            severity: Severity::Info,
            category: EventCategory::Consent,
            description: "Parental consent recorded".into(),
            context: EventContext::for_child("child-7"),
            details: BTreeMap::new(),
            integrity_hash: None,
            retention_date: now + Duration::days(10),
        }
    }

    fn signed(signer: &IntegritySigner) -> AuditEvent {
        let mut e = event();
        e.integrity_hash = Some(signer.sign(&e).unwrap());
        e
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            IntegritySigner::new(b"short"),
            Err(ConfigError::WeakKey { actual: 5, .. })
        ));
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let e = signed(&signer);
        assert_eq!(e.integrity_hash.as_ref().unwrap().len(), 64);
        assert!(signer.verify(&e).is_ok());
    }

    #[test]
    fn test_sign_is_deterministic() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let e = event();
        assert_eq!(signer.sign(&e).unwrap(), signer.sign(&e).unwrap());
    }

    #[test]
    fn test_tampered_description_detected() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let mut e = signed(&signer);
        e.description = "Nothing happened".into();
        assert_eq!(
            signer.verify(&e),
            Err(IntegrityError::HashMismatch {
                event_id: e.event_id
            })
        );
    }

    #[test]
    fn test_tampered_details_detected() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let mut e = signed(&signer);
        e.details.insert("risk_level".into(), serde_json::json!("SAFE"));
        assert!(signer.verify(&e).is_err());
    }

    #[test]
    fn test_missing_hash() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let e = event();
        assert!(matches!(
            signer.verify(&e),
            Err(IntegrityError::MissingHash { .. })
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let other = IntegritySigner::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        let e = signed(&signer);
        assert!(other.verify(&e).is_err());
    }

    #[test]
    fn test_verify_events_report() {
        let signer = IntegritySigner::new(SECRET).unwrap();
        let good = signed(&signer);
        let mut bad = signed(&signer);
        bad.event_type = "consent_revoked".into();
        let unsigned = event();
        let report = signer.verify_events([&good, &bad, &unsigned]);
        assert_eq!(report.checked, 3);
        assert_eq!(report.valid, 1);
        assert_eq!(report.tampered, vec![bad.event_id]);
        assert_eq!(report.missing, vec![unsigned.event_id]);
        assert!(!report.is_clean());
    }
}
