//! Error types for the Kidsafe safety & compliance core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, integrity, storage, vault, and consent domains.
//! Compliance violations are deliberately absent: they are reported as data
//! in [`crate::vault::ComplianceReport`] so callers can act on them.

use uuid::Uuid;

/// Top-level error type for the Kidsafe core library.
#[derive(Debug, thiserror::Error)]
pub enum KidsafeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Consent error: {0}")]
    Consent(#[from] ConsentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Rule pattern for '{category}' failed to compile: {message}")]
    BadPattern { category: String, message: String },

    #[error("Key material '{field}' too short: need at least {min} bytes, got {actual}")]
    WeakKey {
        field: String,
        min: usize,
        actual: usize,
    },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Tampering or corruption signals. These are always surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("Audit event {event_id} carries no integrity hash")]
    MissingHash { event_id: Uuid },

    #[error("Audit event {event_id} failed HMAC verification")]
    HashMismatch { event_id: Uuid },

    #[error("No integrity secret configured; audit events cannot be verified")]
    NoSecret,

    #[error("Envelope field count mismatch: declared {declared}, decrypted {actual}")]
    FieldCountMismatch { declared: usize, actual: usize },

    #[error("Envelope checksum does not match decrypted payload")]
    ChecksumMismatch,

    #[error("Envelope authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Record holds encrypted markers for {fields:?} but no envelope")]
    OrphanMarkers { fields: Vec<String> },

    #[error("Envelope field '{field}' has no matching marker in the record")]
    MarkerMissing { field: String },

    #[error("Unsupported envelope version {version}")]
    UnsupportedVersion { version: u32 },
}

/// Transient persistence failures from audit sinks.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Audit sink write failed: {message}")]
    WriteFailed { message: String },

    #[error("Audit sink read failed: {message}")]
    ReadFailed { message: String },

    #[error("Audit sink purge failed: {message}")]
    PurgeFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from vault operations that are not integrity failures.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Record is already encrypted")]
    AlreadyEncrypted,

    #[error("Record must be decrypted before it can be anonymized")]
    EncryptedRecord,

    #[error("Encryption failed: {message}")]
    EncryptFailed { message: String },

    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("Field '{field}' holds the reserved encryption marker")]
    ReservedMarker { field: String },
}

/// Illegal consent lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsentError {
    #[error("Invalid consent transition for '{child_id}': {from} -> {to}")]
    InvalidTransition {
        child_id: String,
        from: String,
        to: String,
    },

    #[error("Consent record for '{child_id}' was created without consent")]
    NotGranted { child_id: String },
}

/// A type alias for results using the top-level `KidsafeError`.
pub type Result<T> = std::result::Result<T, KidsafeError>;
