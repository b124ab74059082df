//! Core types shared by the analyzer, ledger, and vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordinal content risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// No rule matched (level 0).
    Safe = 0,
    /// Some signal, well below any action threshold (level 1).
    Low = 1,
    /// Needs review for younger children (level 2).
    Medium = 2,
    /// Inappropriate for any child (level 3).
    High = 3,
    /// Veto-grade content, e.g. requests for personal information (level 4).
    Critical = 4,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "SAFE"),
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Content rule categories known to the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    PersonalInfo,
    InappropriateContact,
    Inappropriate,
    Violence,
    Scary,
    Profanity,
}

impl SafetyCategory {
    pub const ALL: [SafetyCategory; 6] = [
        SafetyCategory::PersonalInfo,
        SafetyCategory::InappropriateContact,
        SafetyCategory::Inappropriate,
        SafetyCategory::Violence,
        SafetyCategory::Scary,
        SafetyCategory::Profanity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyCategory::PersonalInfo => "personal_info",
            SafetyCategory::InappropriateContact => "inappropriate_contact",
            SafetyCategory::Inappropriate => "inappropriate",
            SafetyCategory::Violence => "violence",
            SafetyCategory::Scary => "scary",
            SafetyCategory::Profanity => "profanity",
        }
    }
}

impl std::fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A piece of text to analyze, with the age of the child who will see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub text: String,
    pub child_age: u8,
    /// Free-form conversation context, e.g. the current topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ContentItem {
    pub fn new(text: impl Into<String>, child_age: u8) -> Self {
        Self {
            text: text.into(),
            child_age,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Verdict produced by [`crate::analyzer::ContentSafetyAnalyzer`].
///
/// Fields are private so a result cannot be altered after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAnalysisResult {
    risk_level: RiskLevel,
    risk_score: f64,
    category_scores: BTreeMap<SafetyCategory, f64>,
    violations: Vec<String>,
    is_appropriate: bool,
    confidence: f64,
    bias_score: f64,
    age_band_exceeded: Vec<SafetyCategory>,
    timestamp: DateTime<Utc>,
}

impl SafetyAnalysisResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        risk_level: RiskLevel,
        risk_score: f64,
        category_scores: BTreeMap<SafetyCategory, f64>,
        violations: Vec<String>,
        is_appropriate: bool,
        confidence: f64,
        bias_score: f64,
        age_band_exceeded: Vec<SafetyCategory>,
    ) -> Self {
        Self {
            risk_level,
            risk_score,
            category_scores,
            violations,
            is_appropriate,
            confidence: confidence.clamp(0.0, 1.0),
            bias_score,
            age_band_exceeded,
            timestamp: Utc::now(),
        }
    }

    /// The verdict returned when analysis infrastructure failed.
    pub(crate) fn fail_closed(reason: &str) -> Self {
        Self::new(
            RiskLevel::Critical,
            1.0,
            BTreeMap::new(),
            vec![format!("analysis_failed: {reason}")],
            false,
            0.0,
            0.0,
            Vec::new(),
        )
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    /// Continuous score in `[0, 1]` the risk level was derived from.
    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    pub fn category_scores(&self) -> &BTreeMap<SafetyCategory, f64> {
        &self.category_scores
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn is_appropriate(&self) -> bool {
        self.is_appropriate
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn bias_score(&self) -> f64 {
        self.bias_score
    }

    /// Categories whose match count exceeded the child's age band.
    pub fn age_band_exceeded(&self) -> &[SafetyCategory] {
        &self.age_band_exceeded
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether the given category matched at least once.
    pub fn flagged(&self, category: SafetyCategory) -> bool {
        self.category_scores.contains_key(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_risk_level_serde() {
        let json = serde_json::to_string(&RiskLevel::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let level: RiskLevel = serde_json::from_str("\"MEDIUM\"").unwrap();
        assert_eq!(level, RiskLevel::Medium);
    }

    #[test]
    fn test_category_display_matches_serde() {
        for category in SafetyCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }

    #[test]
    fn test_fail_closed_result() {
        let result = SafetyAnalysisResult::fail_closed("moderator unavailable");
        assert_eq!(result.risk_level(), RiskLevel::Critical);
        assert!(!result.is_appropriate());
        assert_eq!(result.confidence(), 0.0);
        assert!(result.violations()[0].contains("moderator unavailable"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let result = SafetyAnalysisResult::new(
            RiskLevel::Safe,
            0.0,
            BTreeMap::new(),
            Vec::new(),
            true,
            1.7,
            0.0,
            Vec::new(),
        );
        assert_eq!(result.confidence(), 1.0);
    }

    #[test]
    fn test_content_item_builder() {
        let item = ContentItem::new("hello", 7).with_context("space");
        assert_eq!(item.child_age, 7);
        assert_eq!(item.context.as_deref(), Some("space"));
    }
}
