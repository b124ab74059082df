//! Compliance vault: envelope encryption, consent lifecycle, retention,
//! anonymization, and compliance validation for child data.
//!
//! The vault never stores anything itself. It transforms records and consent
//! state, and reports every operation to the audit ledger.

pub mod anonymize;
pub mod clock;
pub mod compliance;
pub mod consent;
pub mod deletion;
pub mod encryption;
pub mod record;

pub use anonymize::{ANONYMIZED_SENTINEL, AgeBucket, Anonymizer, LINKAGE_HASH_FIELD};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compliance::{ComplianceReport, ComplianceViolation, ComplianceWarning, validate_compliance};
pub use consent::{ConsentAction, ConsentMethod, ConsentRecord, ConsentState, TrailEntry};
pub use deletion::DeletionReceipt;
pub use encryption::{EncryptedEnvelope, FieldCipher};
pub use record::{DataRecord, ENCRYPTED_MARKER, decrypt_record, encrypt_record};

use chrono::Duration;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::VaultConfig;
use crate::error::{ConfigError, ConsentError, KidsafeError, VaultError};
use crate::ledger::{AuditLedger, EventCategory, EventContext, Severity};

pub struct ComplianceVault {
    config: VaultConfig,
    cipher: FieldCipher,
    anonymizer: Anonymizer,
    ledger: Arc<AuditLedger>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ComplianceVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceVault")
            .field("retention_window_days", &self.config.retention_window_days)
            .finish_non_exhaustive()
    }
}

impl ComplianceVault {
    pub fn new(config: &VaultConfig, ledger: Arc<AuditLedger>) -> Result<Self, ConfigError> {
        config.validate()?;
        let master = config.master_key_bytes()?;
        let linkage_key: Vec<u8> = match &config.anonymization_salt {
            Some(salt) => salt.as_bytes().to_vec(),
            None => master.to_vec(),
        };
        let anonymizer =
            Anonymizer::new(config, &linkage_key).map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;
        Ok(Self {
            config: config.clone(),
            cipher: FieldCipher::new(master),
            anonymizer,
            ledger,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    fn retention_window(&self) -> Duration {
        Duration::days(i64::from(self.config.retention_window_days))
    }

    fn child_of(&self, record: &DataRecord) -> String {
        record
            .get(&self.config.linkage_field)
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .unwrap_or_default()
    }

    async fn log_integrity_failure(&self, child_id: &str, error: &KidsafeError) {
        let details = BTreeMap::from([("error".to_string(), json!(error.to_string()))]);
        self.ledger
            .log_event(
                "integrity_failure",
                Severity::Critical,
                EventCategory::Security,
                "Encrypted record failed verification",
                EventContext::for_child(child_id),
                details,
            )
            .await;
    }

    pub async fn encrypt_record(&self, record: &DataRecord) -> Result<DataRecord, KidsafeError> {
        let sealed = encrypt_record(&self.cipher, record, &self.config.sensitive_fields)?;
        let fields = sealed.marker_fields();
        if !fields.is_empty() {
            self.ledger
                .log_data_access(&self.child_of(record), "encrypt", &fields)
                .await;
        }
        Ok(sealed)
    }

    /// Decrypt a record. Integrity failures and malformed envelopes are
    /// logged as CRITICAL security events and returned.
    pub async fn decrypt_record(&self, record: &DataRecord) -> Result<DataRecord, KidsafeError> {
        let child_id = self.child_of(record);
        match decrypt_record(&self.cipher, record) {
            Ok(opened) => {
                if record.is_encrypted() {
                    self.ledger
                        .log_data_access(&child_id, "decrypt", &record.marker_fields())
                        .await;
                }
                Ok(opened)
            }
            Err(e) => {
                warn!(child_id = %child_id, error = %e, "Record failed decryption");
                if matches!(
                    e,
                    KidsafeError::Integrity(_)
                        | KidsafeError::Vault(VaultError::MalformedEnvelope { .. })
                ) {
                    self.log_integrity_failure(&child_id, &e).await;
                }
                Err(e)
            }
        }
    }

    pub async fn create_consent(
        &self,
        child_id: &str,
        method: ConsentMethod,
        ip: Option<&str>,
    ) -> ConsentRecord {
        let now = self.clock.now();
        let record = ConsentRecord::grant(
            child_id,
            method,
            ip.map(String::from),
            now,
            self.retention_window(),
        );
        let details = BTreeMap::from([
            ("method".to_string(), json!(method)),
            ("retention_expiry".to_string(), json!(record.retention_expiry())),
            ("ip_recorded".to_string(), json!(record.ip().is_some())),
        ]);
        self.ledger
            .log_consent_event(child_id, "granted", Severity::Info, details)
            .await;
        info!(child_id, method = %method, "Parental consent recorded");
        record
    }

    pub async fn record_access(
        &self,
        consent: &mut ConsentRecord,
        purpose: &str,
    ) -> Result<(), ConsentError> {
        let result = consent.record_access(self.clock.now(), purpose);
        match &result {
            Ok(()) => {
                self.ledger
                    .log_consent_event(
                        consent.child_id(),
                        "accessed",
                        Severity::Info,
                        BTreeMap::from([("purpose".to_string(), json!(purpose))]),
                    )
                    .await;
            }
            Err(e) => self.log_rejected(consent.child_id(), e).await,
        }
        result
    }

    pub async fn renew_consent(&self, consent: &mut ConsentRecord) -> Result<(), ConsentError> {
        let result = consent.renew(self.clock.now(), self.retention_window());
        match &result {
            Ok(()) => {
                self.ledger
                    .log_consent_event(
                        consent.child_id(),
                        "renewed",
                        Severity::Info,
                        BTreeMap::from([(
                            "retention_expiry".to_string(),
                            json!(consent.retention_expiry()),
                        )]),
                    )
                    .await;
            }
            Err(e) => self.log_rejected(consent.child_id(), e).await,
        }
        result
    }

    pub async fn revoke_consent(
        &self,
        consent: &mut ConsentRecord,
        reason: &str,
    ) -> Result<(), ConsentError> {
        let result = consent.revoke(self.clock.now(), reason);
        match &result {
            Ok(()) => {
                self.ledger
                    .log_consent_event(
                        consent.child_id(),
                        "revoked",
                        Severity::Warning,
                        BTreeMap::from([("reason".to_string(), json!(reason))]),
                    )
                    .await;
            }
            Err(e) => self.log_rejected(consent.child_id(), e).await,
        }
        result
    }

    async fn log_rejected(&self, child_id: &str, error: &ConsentError) {
        self.ledger
            .log_consent_event(
                child_id,
                "transition_rejected",
                Severity::Warning,
                BTreeMap::from([("error".to_string(), json!(error.to_string()))]),
            )
            .await;
    }

    pub fn consent_state(&self, consent: &ConsentRecord) -> ConsentState {
        consent.state(self.clock.now())
    }

    /// Whether the data covered by `consent` must be purged now.
    pub fn should_delete(&self, consent: &ConsentRecord) -> bool {
        consent.should_delete(self.clock.now())
    }

    /// Issue a deletion receipt for `child_id` and log it. Overwriting the
    /// stored bytes is up to the storage layer.
    pub async fn secure_delete(&self, child_id: &str) -> DeletionReceipt {
        let receipt = DeletionReceipt::issue(child_id, self.clock.now());
        let details = BTreeMap::from([
            ("receipt_id".to_string(), json!(receipt.receipt_id)),
            ("receipt_hash".to_string(), json!(receipt.receipt_hash)),
        ]);
        self.ledger
            .log_event(
                "data_deleted",
                Severity::Warning,
                EventCategory::Privacy,
                "Child data scheduled for secure deletion",
                EventContext::for_child(child_id),
                details,
            )
            .await;
        receipt
    }

    /// Delete the data behind one consent record, if it is due.
    pub async fn delete_consent(
        &self,
        consent: &mut ConsentRecord,
    ) -> Result<DeletionReceipt, ConsentError> {
        let now = self.clock.now();
        consent.mark_deleted(now)?;
        Ok(self.secure_delete(consent.child_id()).await)
    }

    /// Delete every record that is due. Already-deleted records are skipped,
    /// so repeated sweeps issue no new receipts.
    pub async fn sweep_expired(&self, consents: &mut [ConsentRecord]) -> Vec<DeletionReceipt> {
        let mut receipts = Vec::new();
        for consent in consents.iter_mut() {
            if !self.should_delete(consent) {
                continue;
            }
            match self.delete_consent(consent).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => warn!(child_id = %consent.child_id(), error = %e, "Retention sweep skipped record"),
            }
        }
        if !receipts.is_empty() {
            info!(deleted = receipts.len(), "Retention sweep completed");
        }
        receipts
    }

    pub async fn anonymize(&self, record: &DataRecord) -> Result<DataRecord, VaultError> {
        let anonymized = self.anonymizer.anonymize(record)?;
        let hash = anonymized
            .get_str(LINKAGE_HASH_FIELD)
            .unwrap_or_default()
            .to_string();
        let details = BTreeMap::from([("linkage_hash".to_string(), json!(hash))]);
        self.ledger
            .log_event(
                "data_anonymized",
                Severity::Info,
                EventCategory::Privacy,
                "Child record anonymized",
                EventContext::new(),
                details,
            )
            .await;
        Ok(anonymized)
    }

    pub async fn validate_compliance(
        &self,
        record: &DataRecord,
        consent: Option<&ConsentRecord>,
    ) -> ComplianceReport {
        let report = validate_compliance(record, consent, &self.config, self.clock.now());
        if !report.compliant {
            let violations: Vec<String> = report.violations.iter().map(|v| v.to_string()).collect();
            let child_id = consent
                .map(|c| c.child_id().to_string())
                .unwrap_or_else(|| self.child_of(record));
            self.ledger
                .log_event(
                    "compliance_violation",
                    Severity::Warning,
                    EventCategory::Privacy,
                    "Record failed compliance validation",
                    EventContext::for_child(child_id),
                    BTreeMap::from([
                        ("violations".to_string(), json!(violations)),
                        ("required_actions".to_string(), json!(report.required_actions)),
                    ]),
                )
                .await;
        }
        report
    }
}
