//! Bias detection for generated responses.
//!
//! Phrase-pattern scoring across fixed categories (gender, cultural,
//! socioeconomic, age, ability). Categories are matched independently and
//! several may fire for one text. Aggregate counters live in an injected
//! [`BiasStatistics`] so concurrent callers never lose an increment.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::BiasConfig;
use crate::error::ConfigError;
use crate::rules::normalize_text;

/// Bias categories tracked by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasCategory {
    Gender = 0,
    Cultural = 1,
    Socioeconomic = 2,
    Age = 3,
    Ability = 4,
}

impl BiasCategory {
    pub const ALL: [BiasCategory; 5] = [
        BiasCategory::Gender,
        BiasCategory::Cultural,
        BiasCategory::Socioeconomic,
        BiasCategory::Age,
        BiasCategory::Ability,
    ];

    fn recommendation(&self) -> &'static str {
        match self {
            BiasCategory::Gender => {
                "Avoid gender stereotypes; describe abilities and interests without tying them to gender."
            }
            BiasCategory::Cultural => {
                "Describe cultures respectfully and avoid us-versus-them framing."
            }
            BiasCategory::Socioeconomic => {
                "Avoid judging people by wealth, income, or where they live."
            }
            BiasCategory::Age => "Avoid assumptions about what people can do at a given age.",
            BiasCategory::Ability => {
                "Use person-first, respectful language when talking about disability."
            }
        }
    }
}

impl std::fmt::Display for BiasCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BiasCategory::Gender => write!(f, "gender"),
            BiasCategory::Cultural => write!(f, "cultural"),
            BiasCategory::Socioeconomic => write!(f, "socioeconomic"),
            BiasCategory::Age => write!(f, "age"),
            BiasCategory::Ability => write!(f, "ability"),
        }
    }
}

/// Coarse bias risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BiasRiskLevel {
    Low,
    Medium,
    High,
}

/// Conversation context for a bias check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BiasContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_age: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Result of a bias check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasResult {
    pub bias_detected: bool,
    /// Maximum score among fired categories.
    pub overall_bias_score: f64,
    pub risk_level: BiasRiskLevel,
    pub category_scores: BTreeMap<BiasCategory, f64>,
    pub detected_categories: Vec<BiasCategory>,
    pub matched_phrases: Vec<String>,
    pub recommendations: Vec<String>,
}

impl BiasResult {
    fn clean() -> Self {
        Self {
            bias_detected: false,
            overall_bias_score: 0.0,
            risk_level: BiasRiskLevel::Low,
            category_scores: BTreeMap::new(),
            detected_categories: Vec::new(),
            matched_phrases: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Thread-safe aggregate counters shared by every detector that holds it.
#[derive(Debug, Default)]
pub struct BiasStatistics {
    total_analyses: AtomicU64,
    analyses_with_bias: AtomicU64,
    category_hits: [AtomicU64; 5],
}

/// Point-in-time copy of [`BiasStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasStatsSnapshot {
    pub total_analyses: u64,
    pub analyses_with_bias: u64,
    pub bias_rate: f64,
    pub category_hits: BTreeMap<BiasCategory, u64>,
}

impl BiasStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, result: &BiasResult) {
        self.total_analyses.fetch_add(1, Ordering::Relaxed);
        if result.bias_detected {
            self.analyses_with_bias.fetch_add(1, Ordering::Relaxed);
        }
        for category in &result.detected_categories {
            self.category_hits[*category as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BiasStatsSnapshot {
        let total_analyses = self.total_analyses.load(Ordering::Relaxed);
        let analyses_with_bias = self.analyses_with_bias.load(Ordering::Relaxed);
        let bias_rate = if total_analyses > 0 {
            analyses_with_bias as f64 / total_analyses as f64
        } else {
            0.0
        };
        let category_hits = BiasCategory::ALL
            .iter()
            .map(|c| (*c, self.category_hits[*c as usize].load(Ordering::Relaxed)))
            .collect();
        BiasStatsSnapshot {
            total_analyses,
            analyses_with_bias,
            bias_rate,
            category_hits,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

struct CategoryMatcher {
    category: BiasCategory,
    regex: Regex,
    weight_per_match: f64,
}

/// Phrase-pattern bias detector.
pub struct BiasDetector {
    matchers: Vec<CategoryMatcher>,
    high_threshold: f64,
    medium_threshold: f64,
    stats: Arc<BiasStatistics>,
}

impl BiasDetector {
    /// Compile the configured phrase lists. Counters are recorded into `stats`.
    pub fn new(config: &BiasConfig, stats: Arc<BiasStatistics>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut matchers = Vec::with_capacity(config.categories.len());
        for spec in &config.categories {
            if spec.phrases.is_empty() {
                continue;
            }
            // Longest phrases first so alternation prefers the most specific match.
            let mut phrases: Vec<String> = spec
                .phrases
                .iter()
                .map(|p| regex::escape(&normalize_text(p)))
                .collect();
            phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));
            let pattern = format!(r"\b(?:{})\b", phrases.join("|"));
            let regex = Regex::new(&pattern).map_err(|e| ConfigError::BadPattern {
                category: spec.category.to_string(),
                message: e.to_string(),
            })?;
            matchers.push(CategoryMatcher {
                category: spec.category,
                regex,
                weight_per_match: spec.weight_per_match,
            });
        }
        Ok(Self {
            matchers,
            high_threshold: config.high_threshold,
            medium_threshold: config.medium_threshold,
            stats,
        })
    }

    /// Shared counters this detector records into.
    pub fn statistics(&self) -> &Arc<BiasStatistics> {
        &self.stats
    }

    /// Score `text` for bias in every category.
    pub fn detect_bias(&self, text: &str, context: &BiasContext) -> BiasResult {
        let result = self.score(text, context);
        self.stats.record(&result);
        result
    }

    /// Analyze many texts, preserving input order. Indexes without a context
    /// use [`BiasContext::default`].
    pub fn batch_analyze_bias<S: AsRef<str>>(
        &self,
        texts: &[S],
        contexts: &[BiasContext],
    ) -> Vec<BiasResult> {
        let fallback = BiasContext::default();
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| self.detect_bias(text.as_ref(), contexts.get(i).unwrap_or(&fallback)))
            .collect()
    }

    fn score(&self, text: &str, context: &BiasContext) -> BiasResult {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return BiasResult::clean();
        }

        let mut result = BiasResult::clean();
        for matcher in &self.matchers {
            let hits: Vec<&str> = matcher
                .regex
                .find_iter(&normalized)
                .map(|m| m.as_str())
                .collect();
            if hits.is_empty() {
                continue;
            }
            let score = (hits.len() as f64 * matcher.weight_per_match).min(1.0);
            result.category_scores.insert(matcher.category, score);
            if !result.detected_categories.contains(&matcher.category) {
                result.detected_categories.push(matcher.category);
                result
                    .recommendations
                    .push(matcher.category.recommendation().to_string());
            }
            result
                .matched_phrases
                .extend(hits.into_iter().map(str::to_string));
        }

        result.overall_bias_score = result
            .category_scores
            .values()
            .copied()
            .fold(0.0_f64, f64::max);
        result.bias_detected = !result.detected_categories.is_empty();
        result.risk_level = self.risk_for(result.overall_bias_score);

        if result.bias_detected && context.child_age.is_some_and(|age| age < 8) {
            result.recommendations.push(
                "Young audience: rephrase with simple, inclusive examples before delivery."
                    .to_string(),
            );
        }
        result
    }

    fn risk_for(&self, score: f64) -> BiasRiskLevel {
        if score > self.high_threshold {
            BiasRiskLevel::High
        } else if score > self.medium_threshold {
            BiasRiskLevel::Medium
        } else {
            BiasRiskLevel::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> BiasDetector {
        BiasDetector::new(&BiasConfig::default(), Arc::new(BiasStatistics::new())).unwrap()
    }

    #[test]
    fn test_clean_text_has_no_bias() {
        let result = detector().detect_bias("Planets orbit the sun.", &BiasContext::default());
        assert!(!result.bias_detected);
        assert_eq!(result.overall_bias_score, 0.0);
        assert_eq!(result.risk_level, BiasRiskLevel::Low);
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn test_single_gender_match_is_medium() {
        let result = detector().detect_bias(
            "Girls can't be good engineers.",
            &BiasContext::default(),
        );
        assert!(result.bias_detected);
        assert_eq!(result.detected_categories, vec![BiasCategory::Gender]);
        assert!((result.overall_bias_score - 0.3).abs() < 1e-9);
        assert_eq!(result.risk_level, BiasRiskLevel::Medium);
    }

    #[test]
    fn test_multiple_categories_fire_independently() {
        let result = detector().detect_bias(
            "Man up! Those people are different and poor people are lazy.",
            &BiasContext::default(),
        );
        assert!(result.category_scores.contains_key(&BiasCategory::Gender));
        assert!(result.category_scores.contains_key(&BiasCategory::Cultural));
        assert!(result.category_scores.contains_key(&BiasCategory::Socioeconomic));
        assert_eq!(result.recommendations.len(), 3);
    }

    #[test]
    fn test_repeated_matches_reach_high() {
        let result = detector().detect_bias(
            "Boys don't cry. Man up, you throw like a girl.",
            &BiasContext::default(),
        );
        assert!(result.overall_bias_score > 0.5);
        assert_eq!(result.risk_level, BiasRiskLevel::High);
        assert_eq!(result.matched_phrases.len(), 3);
    }

    #[test]
    fn test_overall_is_max_of_categories() {
        let result = detector().detect_bias(
            "Man up, like a girl. Those people.",
            &BiasContext::default(),
        );
        let max = result.category_scores.values().copied().fold(0.0, f64::max);
        assert_eq!(result.overall_bias_score, max);
    }

    #[test]
    fn test_young_child_gets_extra_recommendation() {
        let ctx = BiasContext {
            child_age: Some(6),
            topic: None,
        };
        let result = detector().detect_bias("That's a girl thing.", &ctx);
        assert_eq!(result.recommendations.len(), 2);
    }

    #[test]
    fn test_batch_preserves_order_and_defaults_context() {
        let detector = detector();
        let texts = ["Man up", "Stars are hot", "Those people"];
        let results = detector.batch_analyze_bias(&texts, &[BiasContext::default()]);
        assert_eq!(results.len(), 3);
        assert!(results[0].bias_detected);
        assert!(!results[1].bias_detected);
        assert_eq!(results[2].detected_categories, vec![BiasCategory::Cultural]);
    }

    #[test]
    fn test_statistics_accumulate() {
        let detector = detector();
        detector.detect_bias("Man up", &BiasContext::default());
        detector.detect_bias("Hello", &BiasContext::default());
        let snap = detector.statistics().snapshot();
        assert_eq!(snap.total_analyses, 2);
        assert_eq!(snap.analyses_with_bias, 1);
        assert_eq!(snap.category_hits[&BiasCategory::Gender], 1);
        assert!((snap.bias_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_statistics_no_lost_updates_across_threads() {
        let stats = Arc::new(BiasStatistics::new());
        let detector =
            Arc::new(BiasDetector::new(&BiasConfig::default(), stats.clone()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = detector.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        detector.detect_bias("man up", &BiasContext::default());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_analyses, 2_000);
        assert_eq!(snap.category_hits[&BiasCategory::Gender], 2_000);
    }

    #[test]
    fn test_empty_stats_rate_is_zero() {
        let snap = BiasStatistics::new().snapshot();
        assert_eq!(snap.bias_rate, 0.0);
        assert_eq!(snap.category_hits.len(), 5);
    }
}
