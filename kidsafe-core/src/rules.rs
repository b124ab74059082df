//! Declarative content rule registry.
//!
//! Every rule is a tagged `{category, pattern, weight, action}` entry from
//! [`AnalyzerConfig`]. Patterns are compiled once; a single evaluator walks
//! veto rules before score rules and aggregates match counts per category.

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::config::{AnalyzerConfig, RuleAction};
use crate::error::ConfigError;
use crate::types::SafetyCategory;

/// Normalize text for matching: NFKD decomposition, strip combining marks,
/// fold typographic apostrophes, collapse whitespace, and lowercase.
pub(crate) fn normalize_text(text: &str) -> String {
    let nfkd: String = text.nfkd().collect();
    let mut result = String::with_capacity(nfkd.len());
    let mut prev_space = false;
    for c in nfkd
        .chars()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
    {
        if c.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
        } else if matches!(c, '\u{2018}' | '\u{2019}' | '\u{02bc}') {
            result.push('\'');
            prev_space = false;
        } else {
            result.extend(c.to_lowercase());
            prev_space = false;
        }
    }
    result.trim().to_string()
}

struct CompiledRule {
    category: SafetyCategory,
    regex: Regex,
    weight: f64,
    action: RuleAction,
}

/// Matches aggregated for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryHits {
    pub category: SafetyCategory,
    pub action: RuleAction,
    pub count: u32,
    /// Sum of `weight * count` over the category's rules, clamped to `[0, 1]`.
    pub score: f64,
    pub matched: Vec<String>,
}

/// Outcome of running the registry over one text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEvaluation {
    /// Veto categories first, then score categories, in rule order.
    pub hits: Vec<CategoryHits>,
}

impl RuleEvaluation {
    pub fn vetoed(&self) -> bool {
        self.hits.iter().any(|h| h.action == RuleAction::Veto)
    }

    pub fn count(&self, category: SafetyCategory) -> u32 {
        self.get(category).map_or(0, |h| h.count)
    }

    pub fn get(&self, category: SafetyCategory) -> Option<&CategoryHits> {
        self.hits.iter().find(|h| h.category == category)
    }

    /// `max(weight_c * count_c)` over categories, clamped to `[0, 1]`.
    pub fn max_score(&self) -> f64 {
        self.hits.iter().map(|h| h.score).fold(0.0_f64, f64::max)
    }
}

/// Compiled rule set shared by all analyzer calls.
pub struct RuleRegistry {
    rules: Vec<CompiledRule>,
}

impl RuleRegistry {
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for spec in &config.rules {
            let regex = Regex::new(&spec.pattern).map_err(|e| ConfigError::BadPattern {
                category: spec.category.to_string(),
                message: e.to_string(),
            })?;
            rules.push(CompiledRule {
                category: spec.category,
                regex,
                weight: spec.weight,
                action: spec.action,
            });
        }
        // Veto rules are evaluated first; sort is stable so rule order is kept.
        rules.sort_by_key(|r| match r.action {
            RuleAction::Veto => 0,
            RuleAction::Score => 1,
        });
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate already-normalized text.
    pub fn evaluate(&self, normalized: &str) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();
        if normalized.is_empty() {
            return evaluation;
        }

        for rule in &self.rules {
            let matched: Vec<String> = rule
                .regex
                .find_iter(normalized)
                .map(|m| m.as_str().to_string())
                .collect();
            if matched.is_empty() {
                continue;
            }
            let count = matched.len() as u32;
            let contribution = rule.weight * f64::from(count);

            match evaluation
                .hits
                .iter_mut()
                .find(|h| h.category == rule.category)
            {
                Some(hits) => {
                    hits.count += count;
                    hits.score = (hits.score + contribution).clamp(0.0, 1.0);
                    hits.matched.extend(matched);
                    if rule.action == RuleAction::Veto {
                        hits.action = RuleAction::Veto;
                    }
                }
                None => evaluation.hits.push(CategoryHits {
                    category: rule.category,
                    action: rule.action,
                    count,
                    score: contribution.clamp(0.0, 1.0),
                    matched,
                }),
            }
        }
        evaluation
    }
}
