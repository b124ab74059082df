//! Content safety analyzer: age-gated appropriateness verdicts.
//!
//! Evaluation order:
//! 1. Veto categories (personal information, inappropriate contact)
//! 2. Weighted score categories and the risk level derived from them
//! 3. Age-band limits
//! 4. Bias signal and optional external moderation
//!
//! Veto results never depend on age, score, or moderator availability.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::bias::{BiasContext, BiasDetector, BiasRiskLevel};
use crate::config::{AgeBand, AnalyzerConfig, RiskThresholds, RuleAction};
use crate::error::ConfigError;
use crate::rules::{RuleRegistry, normalize_text};
use crate::types::{ContentItem, RiskLevel, SafetyAnalysisResult, SafetyCategory};

/// Confidence for inputs with enough words to judge.
const BASE_CONFIDENCE: f64 = 0.9;
/// Confidence for inputs shorter than `short_text_words`.
const SHORT_TEXT_CONFIDENCE: f64 = 0.7;
/// Confidence for empty input.
const EMPTY_CONFIDENCE: f64 = 0.5;
/// Confidence penalty when the bias detector reports medium or high risk.
const BIAS_CONFIDENCE_PENALTY: f64 = 0.1;

/// Verdict from an external moderation service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationVerdict {
    pub flagged: bool,
    pub labels: Vec<String>,
}

/// Moderation service failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("moderation unavailable: {message}")]
pub struct ModerationError {
    pub message: String,
}

/// A second-opinion classifier consulted after the local rules.
pub trait ExternalModerator: Send + Sync {
    fn moderate(&self, text: &str) -> Result<ModerationVerdict, ModerationError>;
}

/// Distinguishes a completed analysis from an infrastructure failure.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Verdict(SafetyAnalysisResult),
    Failed { reason: String },
}

impl AnalysisOutcome {
    /// Collapse to a verdict, failing closed.
    pub fn into_result(self) -> SafetyAnalysisResult {
        match self {
            AnalysisOutcome::Verdict(result) => result,
            AnalysisOutcome::Failed { reason } => SafetyAnalysisResult::fail_closed(&reason),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, AnalysisOutcome::Failed { .. })
    }
}

/// Rule-driven content safety analyzer. Stateless apart from the shared
/// bias counters; safe to call concurrently.
pub struct ContentSafetyAnalyzer {
    registry: RuleRegistry,
    age_bands: Vec<AgeBand>,
    thresholds: RiskThresholds,
    inappropriate_score: f64,
    short_text_words: usize,
    bias: Arc<BiasDetector>,
    moderator: Option<Arc<dyn ExternalModerator>>,
}

impl ContentSafetyAnalyzer {
    pub fn new(config: &AnalyzerConfig, bias: Arc<BiasDetector>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry: RuleRegistry::from_config(config)?,
            age_bands: config.age_bands.clone(),
            thresholds: config.thresholds.clone(),
            inappropriate_score: config.inappropriate_score,
            short_text_words: config.short_text_words,
            bias,
            moderator: None,
        })
    }

    /// Attach an external moderation service.
    pub fn with_moderator(mut self, moderator: Arc<dyn ExternalModerator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    pub fn bias_detector(&self) -> &Arc<BiasDetector> {
        &self.bias
    }

    /// Analyze `content` for a child of `age`. Never fails: infrastructure
    /// errors produce a CRITICAL, inappropriate verdict.
    pub fn analyze(&self, content: &str, age: u8) -> SafetyAnalysisResult {
        let outcome = self.evaluate(&ContentItem::new(content, age));
        if let AnalysisOutcome::Failed { reason } = &outcome {
            warn!(age, reason = %reason, "Content analysis failed; failing closed");
        }
        outcome.into_result()
    }

    /// Run the analysis and report infrastructure failure explicitly.
    pub fn evaluate(&self, item: &ContentItem) -> AnalysisOutcome {
        let normalized = normalize_text(&item.text);
        if normalized.is_empty() {
            debug!("Empty content treated as safe");
            return AnalysisOutcome::Verdict(SafetyAnalysisResult::new(
                RiskLevel::Safe,
                0.0,
                Default::default(),
                Vec::new(),
                true,
                EMPTY_CONFIDENCE,
                0.0,
                Vec::new(),
            ));
        }

        let evaluation = self.registry.evaluate(&normalized);
        let mut violations = Vec::new();

        for hits in evaluation
            .hits
            .iter()
            .filter(|h| h.action == RuleAction::Veto)
        {
            violations.push(format!(
                "{}: {} match(es) [{}]",
                hits.category,
                hits.count,
                hits.matched.join(", ")
            ));
        }
        let vetoed = evaluation.vetoed();

        let risk_score = evaluation.max_score();
        let risk_level = self.risk_level_for(risk_score);

        let band = self.band_for(item.child_age);
        let mut age_band_exceeded = Vec::new();
        for category in SafetyCategory::ALL {
            let count = evaluation.count(category);
            if let Some(limit) = band.limit_for(category)
                && count > limit
            {
                age_band_exceeded.push(category);
                violations.push(format!(
                    "{}: {} match(es) exceeds limit {} for age {}",
                    category, count, limit, item.child_age
                ));
            }
        }

        let mut is_appropriate = !vetoed && age_band_exceeded.is_empty();
        if risk_score >= self.inappropriate_score {
            is_appropriate = false;
            violations.push(format!(
                "risk_score: {:.2} at or above {:.2}",
                risk_score, self.inappropriate_score
            ));
        }

        let bias = self.bias.detect_bias(
            &item.text,
            &BiasContext {
                child_age: Some(item.child_age),
                topic: item.context.clone(),
            },
        );
        if bias.risk_level == BiasRiskLevel::High {
            for category in &bias.detected_categories {
                violations.push(format!("bias: {category}"));
            }
        }

        // Moderation only runs when the local rules have not already vetoed.
        if !vetoed && let Some(moderator) = &self.moderator {
            match moderator.moderate(&item.text) {
                Ok(verdict) if verdict.flagged => {
                    is_appropriate = false;
                    if verdict.labels.is_empty() {
                        violations.push("moderation: flagged".to_string());
                    }
                    for label in &verdict.labels {
                        violations.push(format!("moderation: {label}"));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    return AnalysisOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
            }
        }

        let word_count = normalized.split(' ').count();
        let mut confidence = if word_count < self.short_text_words {
            SHORT_TEXT_CONFIDENCE
        } else {
            BASE_CONFIDENCE
        };
        if bias.risk_level >= BiasRiskLevel::Medium {
            confidence -= BIAS_CONFIDENCE_PENALTY;
        }

        let category_scores = evaluation
            .hits
            .iter()
            .map(|h| (h.category, h.score))
            .collect();

        debug!(
            age = item.child_age,
            risk = %risk_level,
            score = risk_score,
            appropriate = is_appropriate,
            "Content analyzed"
        );

        AnalysisOutcome::Verdict(SafetyAnalysisResult::new(
            risk_level,
            risk_score,
            category_scores,
            violations,
            is_appropriate,
            confidence,
            bias.overall_bias_score,
            age_band_exceeded,
        ))
    }

    /// Map a score in `[0, 1]` to a risk level. Non-decreasing in `score`.
    pub fn risk_level_for(&self, score: f64) -> RiskLevel {
        let t = &self.thresholds;
        if score >= t.critical {
            RiskLevel::Critical
        } else if score >= t.high {
            RiskLevel::High
        } else if score >= t.medium {
            RiskLevel::Medium
        } else if score > 0.0 {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }

    /// The band with the greatest `min_age` not above `age`.
    fn band_for(&self, age: u8) -> &AgeBand {
        self.age_bands
            .iter()
            .rev()
            .find(|b| b.min_age <= age)
            .unwrap_or(&self.age_bands[0])
    }
}
