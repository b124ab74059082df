//! # Kidsafe Core
//!
//! Safety and compliance engine for a children's conversational companion.
//! Provides the content safety analyzer and bias detector, the
//! tamper-evident audit ledger, the compliance vault for child data, and
//! the configuration and logging they share.

pub mod analyzer;
pub mod bias;
pub mod config;
pub mod engine;
pub mod error;
mod hex;
pub mod ledger;
pub mod logging;
pub mod rules;
pub mod types;
pub mod vault;

// Re-export commonly used types at the crate root.
pub use analyzer::{
    AnalysisOutcome, ContentSafetyAnalyzer, ExternalModerator, ModerationError, ModerationVerdict,
};
pub use bias::{
    BiasCategory, BiasContext, BiasDetector, BiasResult, BiasRiskLevel, BiasStatistics,
    BiasStatsSnapshot,
};
pub use config::{EngineConfig, load_config};
pub use engine::SafetyEngine;
pub use error::{
    ConfigError, ConsentError, IntegrityError, KidsafeError, Result, StorageError, VaultError,
};
pub use ledger::{
    AuditEvent, AuditLedger, AuditQuery, AuditSink, EventCategory, EventContext, JsonlFileSink,
    LedgerHandle, LedgerStats, MemorySink, Severity,
};
pub use logging::init_tracing;
pub use types::{ContentItem, RiskLevel, SafetyAnalysisResult, SafetyCategory};
pub use vault::{
    Clock, ComplianceReport, ComplianceVault, ConsentMethod, ConsentRecord, ConsentState,
    DataRecord, DeletionReceipt, EncryptedEnvelope, ManualClock, SystemClock,
};
