//! Safety engine facade: analysis with audited decisions.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::analyzer::{AnalysisOutcome, ContentSafetyAnalyzer, ExternalModerator};
use crate::bias::{BiasDetector, BiasStatistics};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::{AuditLedger, EventCategory, EventContext, LedgerHandle, Severity};
use crate::types::{ContentItem, SafetyAnalysisResult};
use crate::vault::ComplianceVault;

/// Wires the analyzer, ledger and (when a master key is configured) vault
/// together. Every analysis is recorded as a `safety_decision` event.
pub struct SafetyEngine {
    analyzer: ContentSafetyAnalyzer,
    ledger: Arc<AuditLedger>,
    vault: Option<ComplianceVault>,
}

impl SafetyEngine {
    pub fn new(analyzer: ContentSafetyAnalyzer, ledger: Arc<AuditLedger>) -> Self {
        Self {
            analyzer,
            ledger,
            vault: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(BiasStatistics::new());
        let bias = Arc::new(BiasDetector::new(&config.bias, stats)?);
        let analyzer = ContentSafetyAnalyzer::new(&config.analyzer, bias)?;
        let ledger = Arc::new(AuditLedger::from_config(&config.ledger)?);
        let vault = match config.vault.master_key {
            Some(_) => Some(ComplianceVault::new(&config.vault, Arc::clone(&ledger))?),
            None => None,
        };
        info!(vault = vault.is_some(), "Safety engine initialized");
        Ok(Self {
            analyzer,
            ledger,
            vault,
        })
    }

    pub fn with_vault(mut self, vault: ComplianceVault) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn ExternalModerator>) -> Self {
        self.analyzer = self.analyzer.with_moderator(moderator);
        self
    }

    pub fn analyzer(&self) -> &ContentSafetyAnalyzer {
        &self.analyzer
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn vault(&self) -> Option<&ComplianceVault> {
        self.vault.as_ref()
    }

    pub fn bias_statistics(&self) -> &Arc<BiasStatistics> {
        self.analyzer.bias_detector().statistics()
    }

    /// Start the ledger's background flush and rotation loops.
    pub fn start(&self) -> LedgerHandle {
        self.ledger.start()
    }

    /// Analyze and record the decision. A failed analysis is logged at
    /// ERROR and returned as a fail-closed verdict.
    pub async fn analyze(&self, item: &ContentItem, context: EventContext) -> SafetyAnalysisResult {
        match self.analyzer.evaluate(item) {
            AnalysisOutcome::Verdict(result) => {
                self.ledger.log_safety_decision(&result, context).await;
                result
            }
            AnalysisOutcome::Failed { reason } => {
                error!(reason = %reason, child_age = item.child_age, "Content analysis failed");
                let details = BTreeMap::from([
                    ("reason".to_string(), json!(reason)),
                    ("child_age".to_string(), json!(item.child_age)),
                ]);
                self.ledger
                    .log_event(
                        "analysis_failed",
                        Severity::Error,
                        EventCategory::ContentSafety,
                        "Content analysis failed; content treated as unsafe",
                        context,
                        details,
                    )
                    .await;
                SafetyAnalysisResult::fail_closed(&reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{ModerationError, ModerationVerdict};
    use crate::ledger::{AuditQuery, MemorySink};
    use crate::types::RiskLevel;

    struct DownModerator;

    impl ExternalModerator for DownModerator {
        fn moderate(&self, _text: &str) -> std::result::Result<ModerationVerdict, ModerationError> {
            Err(ModerationError {
                message: "timeout".into(),
            })
        }
    }

    fn engine() -> (SafetyEngine, Arc<MemorySink>) {
        let mut config = EngineConfig::default();
        config.ledger.hmac_secret = Some("engine-test-secret-engine-test-secret".into());
        let sink = Arc::new(MemorySink::new());
        let ledger = Arc::new(AuditLedger::new(&config.ledger, sink.clone()).unwrap());
        let bias = Arc::new(
            BiasDetector::new(&config.bias, Arc::new(BiasStatistics::new())).unwrap(),
        );
        let analyzer = ContentSafetyAnalyzer::new(&config.analyzer, bias).unwrap();
        (SafetyEngine::new(analyzer, ledger), sink)
    }

    #[tokio::test]
    async fn test_personal_info_logged_critical() {
        let (engine, sink) = engine();
        let result = engine
            .analyze(
                &ContentItem::new("What's your address?", 8),
                EventContext::for_child("child-1"),
            )
            .await;
        assert!(!result.is_appropriate());
        // CRITICAL decisions are durable immediately.
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
        assert!(engine.ledger().verify_integrity(&events[0]));
    }

    #[tokio::test]
    async fn test_safe_content_logged_info() {
        let (engine, sink) = engine();
        let result = engine
            .analyze(
                &ContentItem::new("Let's learn about planets", 8),
                EventContext::for_child("child-1"),
            )
            .await;
        assert_eq!(result.risk_level(), RiskLevel::Safe);
        assert!(sink.is_empty());
        let pending = engine.ledger().pending_events().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_moderator_failure_fails_closed_and_logs_error() {
        let (engine, sink) = engine();
        let engine = engine.with_moderator(Arc::new(DownModerator));
        let result = engine
            .analyze(&ContentItem::new("Tell me a story", 8), EventContext::new())
            .await;
        assert!(!result.is_appropriate());
        assert_eq!(result.risk_level(), RiskLevel::Critical);
        assert_eq!(result.confidence(), 0.0);
        let events = sink.events();
        let failed = AuditQuery::new().of_type("analysis_failed").filter(&events);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].severity, Severity::Error);
    }

    #[test]
    fn test_from_config_without_master_key_has_no_vault() {
        let engine = SafetyEngine::from_config(&EngineConfig::default()).unwrap();
        assert!(engine.vault().is_none());
        assert_eq!(engine.bias_statistics().snapshot().total_analyses, 0);
    }
}
