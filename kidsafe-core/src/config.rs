//! Configuration system for Kidsafe.
//!
//! A single validated [`EngineConfig`] is injected into every component at
//! construction time. It can be built directly, or loaded with `figment`
//! layering: defaults -> TOML file -> environment (`KIDSAFE_`) -> overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bias::BiasCategory;
use crate::error::ConfigError;
use crate::types::SafetyCategory;

/// Minimum length for the ledger HMAC secret and anonymization salt.
pub const MIN_SECRET_BYTES: usize = 32;

/// Top-level configuration for the safety & compliance engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub analyzer: AnalyzerConfig,
    pub bias: BiasConfig,
    pub ledger: LedgerConfig,
    pub vault: VaultConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Validate every section. Constructors call this before use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.analyzer.validate()?;
        self.bias.validate()?;
        self.ledger.validate()?;
        self.vault.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// What a matching rule does to the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Any match makes the content inappropriate, regardless of age or score.
    Veto,
    /// Matches contribute `weight * count` to the category score.
    Score,
}

/// One entry of the declarative rule registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub category: SafetyCategory,
    /// Regex applied to normalized (lowercased) text.
    pub pattern: String,
    pub weight: f64,
    pub action: RuleAction,
}

impl RuleSpec {
    pub fn veto(category: SafetyCategory, pattern: &str) -> Self {
        Self {
            category,
            pattern: pattern.to_string(),
            weight: 1.0,
            action: RuleAction::Veto,
        }
    }

    pub fn score(category: SafetyCategory, pattern: &str, weight: f64) -> Self {
        Self {
            category,
            pattern: pattern.to_string(),
            weight,
            action: RuleAction::Score,
        }
    }
}

/// Per-age maximum match counts. The band with the greatest `min_age` not
/// above the child's age applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeBand {
    pub min_age: u8,
    pub max_violence: u32,
    pub max_scary: u32,
    pub max_profanity: u32,
    pub max_inappropriate: u32,
}

impl AgeBand {
    /// Allowed matches for a category; `None` for veto-only categories.
    pub fn limit_for(&self, category: SafetyCategory) -> Option<u32> {
        match category {
            SafetyCategory::Violence => Some(self.max_violence),
            SafetyCategory::Scary => Some(self.max_scary),
            SafetyCategory::Profanity => Some(self.max_profanity),
            SafetyCategory::Inappropriate => Some(self.max_inappropriate),
            SafetyCategory::PersonalInfo | SafetyCategory::InappropriateContact => None,
        }
    }
}

/// Score cut-offs mapping the continuous risk score to a [`crate::RiskLevel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 0.8,
            medium: 0.5,
        }
    }
}

/// Content safety analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub rules: Vec<RuleSpec>,
    pub age_bands: Vec<AgeBand>,
    pub thresholds: RiskThresholds,
    /// Scores at or above this are inappropriate for any age.
    pub inappropriate_score: f64,
    /// Inputs with fewer words than this get reduced confidence.
    pub short_text_words: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        use SafetyCategory::*;
        Self {
            rules: vec![
                RuleSpec::veto(
                    PersonalInfo,
                    r"\b(what is|what's|whats|tell me|give me) your (home |street |school )?(address|phone number|number|email|password|birthday|full name|last name|real name)\b",
                ),
                RuleSpec::veto(PersonalInfo, r"\bwhere do you (live|go to school)\b"),
                RuleSpec::veto(PersonalInfo, r"\bwhat school do you go to\b"),
                RuleSpec::veto(PersonalInfo, r"\b\d{3}[-. ]?\d{3}[-. ]?\d{4}\b"),
                RuleSpec::veto(PersonalInfo, r"\b[a-z0-9._%+-]+@[a-z0-9-]+(\.[a-z0-9-]+)+\b"),
                RuleSpec::veto(
                    PersonalInfo,
                    r"\b\d{1,5} [a-z]+ (street|st|avenue|ave|road|rd|lane|ln|drive|dr)\b",
                ),
                RuleSpec::veto(
                    InappropriateContact,
                    r"\b(meet|see) me (in person|alone|somewhere|after school)\b",
                ),
                RuleSpec::veto(
                    InappropriateContact,
                    r"\bdon'?t tell (your )?(parents|mom|dad|mum|teacher|anyone)\b",
                ),
                RuleSpec::veto(InappropriateContact, r"\b(our|a) (little )?secret\b"),
                RuleSpec::veto(
                    InappropriateContact,
                    r"\bsend (me )?(a )?(photo|picture|pic|selfie|video)s?\b",
                ),
                RuleSpec::veto(InappropriateContact, r"\bare you (home )?alone\b"),
                RuleSpec::score(
                    Inappropriate,
                    r"\b(sex|sexy|sexual|nude|naked|porn\w*)\b",
                    0.9,
                ),
                RuleSpec::score(
                    Inappropriate,
                    r"\b(drugs?|cocaine|heroin|meth|marijuana|weed|alcohol|beer|vodka|drunk)\b",
                    0.9,
                ),
                RuleSpec::score(Inappropriate, r"\b(suicide|self[- ]harm)\b", 0.9),
                RuleSpec::score(
                    Violence,
                    r"\b(kill\w*|murder\w*|stab\w*|shoot\w*|guns?|weapons?|blood\w*|attack\w*|punch\w*)\b",
                    0.7,
                ),
                RuleSpec::score(
                    Scary,
                    r"\b(monsters?|ghosts?|demons?|nightmares?|haunted|zombies?|creepy|terrifying|horror)\b",
                    0.5,
                ),
                RuleSpec::score(
                    Profanity,
                    r"\b(damn|hell|crap|stupid|idiot|shut up|fuck\w*|shit\w*|bitch\w*|ass|asshole)\b",
                    0.3,
                ),
            ],
            age_bands: vec![
                AgeBand {
                    min_age: 0,
                    max_violence: 0,
                    max_scary: 0,
                    max_profanity: 0,
                    max_inappropriate: 0,
                },
                AgeBand {
                    min_age: 5,
                    max_violence: 1,
                    max_scary: 1,
                    max_profanity: 0,
                    max_inappropriate: 0,
                },
                AgeBand {
                    min_age: 8,
                    max_violence: 2,
                    max_scary: 2,
                    max_profanity: 0,
                    max_inappropriate: 0,
                },
                AgeBand {
                    min_age: 13,
                    max_violence: 3,
                    max_scary: 3,
                    max_profanity: 1,
                    max_inappropriate: 0,
                },
            ],
            thresholds: RiskThresholds::default(),
            inappropriate_score: 0.8,
            short_text_words: 3,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.is_empty() {
            return Err(invalid("analyzer.rules must not be empty"));
        }
        for rule in &self.rules {
            if !(0.0..=1.0).contains(&rule.weight) {
                return Err(invalid(format!(
                    "analyzer rule weight for '{}' must be within [0, 1], got {}",
                    rule.category, rule.weight
                )));
            }
        }

        let Some(first) = self.age_bands.first() else {
            return Err(invalid("analyzer.age_bands must not be empty"));
        };
        if first.min_age != 0 {
            return Err(invalid("the first age band must start at age 0"));
        }
        if self
            .age_bands
            .windows(2)
            .any(|pair| pair[0].min_age >= pair[1].min_age)
        {
            return Err(invalid("analyzer.age_bands must be strictly ascending"));
        }

        let t = &self.thresholds;
        if !(0.0 < t.medium && t.medium < t.high && t.high <= t.critical && t.critical <= 1.0) {
            return Err(invalid(
                "analyzer.thresholds must satisfy 0 < medium < high <= critical <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.inappropriate_score) {
            return Err(invalid("analyzer.inappropriate_score must be within [0, 1]"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bias
// ---------------------------------------------------------------------------

/// Phrase list and weight for one bias category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasCategorySpec {
    pub category: BiasCategory,
    pub phrases: Vec<String>,
    /// Score added per matched phrase, capped at 1.0 per category.
    pub weight_per_match: f64,
}

impl BiasCategorySpec {
    fn new(category: BiasCategory, phrases: &[&str]) -> Self {
        Self {
            category,
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
            weight_per_match: 0.3,
        }
    }
}

/// Bias detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    pub categories: Vec<BiasCategorySpec>,
    /// Overall scores above this are HIGH.
    pub high_threshold: f64,
    /// Overall scores above this are MEDIUM.
    pub medium_threshold: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            categories: vec![
                BiasCategorySpec::new(
                    BiasCategory::Gender,
                    &[
                        "girls can't",
                        "girls cannot",
                        "girls are bad at",
                        "boys are better at",
                        "boys don't cry",
                        "like a girl",
                        "man up",
                        "that's a boy thing",
                        "that's a girl thing",
                        "girls should just",
                    ],
                ),
                BiasCategorySpec::new(
                    BiasCategory::Cultural,
                    &[
                        "those people",
                        "people like them",
                        "where are you really from",
                        "your kind",
                        "go back to your country",
                        "all immigrants",
                        "weird food",
                    ],
                ),
                BiasCategorySpec::new(
                    BiasCategory::Socioeconomic,
                    &[
                        "poor people are",
                        "poor people are lazy",
                        "rich people are better",
                        "trailer trash",
                        "ghetto",
                        "welfare kids",
                    ],
                ),
                BiasCategorySpec::new(
                    BiasCategory::Age,
                    &[
                        "too old to",
                        "old people can't",
                        "old people are",
                        "kids are too dumb",
                        "act your age",
                    ],
                ),
                BiasCategorySpec::new(
                    BiasCategory::Ability,
                    &[
                        "retarded",
                        "crippled",
                        "handicapped",
                        "confined to a wheelchair",
                        "suffers from autism",
                        "that's so lame",
                    ],
                ),
            ],
            high_threshold: 0.5,
            medium_threshold: 0.2,
        }
    }
}

impl BiasConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for spec in &self.categories {
            if !(0.0..=1.0).contains(&spec.weight_per_match) {
                return Err(invalid(format!(
                    "bias weight for '{}' must be within [0, 1]",
                    spec.category
                )));
            }
        }
        if self.medium_threshold >= self.high_threshold {
            return Err(invalid(
                "bias.medium_threshold must be below bias.high_threshold",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Audit ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Buffered events that trigger a background flush.
    pub batch_size: usize,
    /// Maximum time an event waits in the buffer, in milliseconds.
    pub flush_interval_ms: u64,
    /// Days persisted segments are kept (COPPA default: 7 years).
    pub retention_days: u32,
    /// How often the rotation task runs, in seconds.
    pub rotation_interval_secs: u64,
    /// Background flush attempts before escalating.
    pub max_flush_retries: u32,
    /// Initial backoff between flush attempts; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// HMAC-SHA256 key. Events are hashed only when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_secret: Option<String>,
    /// Directory for the daily NDJSON files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            retention_days: 2_555,
            rotation_interval_secs: 86_400,
            max_flush_retries: 3,
            retry_backoff_ms: 100,
            hmac_secret: None,
            log_dir: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("ledger.batch_size must be > 0"));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("ledger.flush_interval_ms must be > 0"));
        }
        if self.retention_days == 0 {
            return Err(invalid("ledger.retention_days must be > 0"));
        }
        if self.rotation_interval_secs == 0 {
            return Err(invalid("ledger.rotation_interval_secs must be > 0"));
        }
        if let Some(secret) = &self.hmac_secret {
            check_secret("ledger.hmac_secret", secret.as_bytes())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Compliance vault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Base64-encoded 32-byte AES master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    /// Fields moved into the encrypted envelope.
    pub sensitive_fields: Vec<String>,
    /// Direct identifiers replaced by a sentinel on anonymization.
    pub identifier_fields: Vec<String>,
    /// Field whose value links anonymized records (hashed, never kept).
    pub linkage_field: String,
    /// Numeric age field bucketed on anonymization.
    pub age_field: String,
    pub retention_window_days: u32,
    /// Oldest age covered by the parental-consent policy.
    pub max_child_age: u8,
    /// Consents expiring within this many days produce a renewal warning.
    pub renewal_warning_days: u32,
    /// Key for the one-way linkage hash. Falls back to the master key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymization_salt: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            sensitive_fields: [
                "child_name",
                "date_of_birth",
                "parent_email",
                "parent_phone",
                "home_address",
                "school_name",
                "ip_address",
                "voice_recording",
                "conversation_content",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            identifier_fields: [
                "child_id",
                "child_name",
                "user_id",
                "parent_email",
                "parent_phone",
                "home_address",
                "ip_address",
                "date_of_birth",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            linkage_field: "child_id".to_string(),
            age_field: "age".to_string(),
            retention_window_days: 90,
            max_child_age: 12,
            renewal_warning_days: 30,
            anonymization_salt: None,
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_window_days == 0 {
            return Err(invalid("vault.retention_window_days must be > 0"));
        }
        if self.sensitive_fields.is_empty() {
            return Err(invalid("vault.sensitive_fields must not be empty"));
        }
        if let Some(salt) = &self.anonymization_salt {
            check_secret("vault.anonymization_salt", salt.as_bytes())?;
        }
        if let Some(key) = &self.master_key {
            decode_master_key(key)?;
        }
        Ok(())
    }

    /// Decode and length-check the master key.
    pub fn master_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let key = self.master_key.as_deref().ok_or_else(|| ConfigError::Invalid {
            message: "vault.master_key is required".into(),
        })?;
        decode_master_key(key)
    }
}

fn decode_master_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ConfigError::ParseError {
            message: format!("vault.master_key is not valid base64: {e}"),
        })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ConfigError::WeakKey {
            field: "vault.master_key".into(),
            min: 32,
            actual: bytes.len(),
        })
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// `tracing` subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write JSON logs to a daily rolling file in this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration with layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `KIDSAFE_`, `__` separates sections)
/// 3. The TOML file at `path`, if it exists
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(path) = path
        && path.exists()
    {
        figment = figment.merge(Toml::file(path));
    }

    // KIDSAFE_LEDGER__BATCH_SIZE, KIDSAFE_VAULT__RETENTION_WINDOW_DAYS, etc.
    figment = figment.merge(Env::prefixed("KIDSAFE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: EngineConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

fn check_secret(field: &str, bytes: &[u8]) -> Result<(), ConfigError> {
    if bytes.len() < MIN_SECRET_BYTES {
        return Err(ConfigError::WeakKey {
            field: field.to_string(),
            min: MIN_SECRET_BYTES,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ledger.retention_days, 2_555);
        assert_eq!(config.vault.retention_window_days, 90);
        assert_eq!(config.analyzer.age_bands.len(), 4);
        assert!(config.ledger.hmac_secret.is_none());
    }

    #[test]
    fn test_default_rule_weights() {
        let config = AnalyzerConfig::default();
        for rule in &config.rules {
            let expected = match rule.category {
                SafetyCategory::PersonalInfo | SafetyCategory::InappropriateContact => 1.0,
                SafetyCategory::Inappropriate => 0.9,
                SafetyCategory::Violence => 0.7,
                SafetyCategory::Scary => 0.5,
                SafetyCategory::Profanity => 0.3,
            };
            assert_eq!(rule.weight, expected, "weight for {}", rule.category);
        }
    }

    #[test]
    fn test_unordered_age_bands_rejected() {
        let mut config = AnalyzerConfig::default();
        config.age_bands.swap(1, 2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_age_band_must_start_at_zero() {
        let mut config = AnalyzerConfig::default();
        config.age_bands.remove(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        let mut config = AnalyzerConfig::default();
        config.rules[0].weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_hmac_secret_rejected() {
        let config = LedgerConfig {
            hmac_secret: Some("short".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WeakKey { actual: 5, .. })
        ));
    }

    #[test]
    fn test_master_key_decoding() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let config = VaultConfig {
            master_key: Some(encoded),
            ..Default::default()
        };
        assert_eq!(config.master_key_bytes().unwrap(), [7u8; 32]);

        let short = VaultConfig {
            master_key: Some(base64::engine::general_purpose::STANDARD.encode([1u8; 16])),
            ..Default::default()
        };
        assert!(matches!(
            short.master_key_bytes(),
            Err(ConfigError::WeakKey { actual: 16, .. })
        ));
    }

    #[test]
    fn test_missing_master_key() {
        let config = VaultConfig::default();
        assert!(config.master_key_bytes().is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.analyzer.rules, config.analyzer.rules);
        assert_eq!(deserialized.ledger.batch_size, config.ledger.batch_size);
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config.vault.max_child_age, 12);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = EngineConfig::default();
        overrides.ledger.batch_size = 7;
        overrides.vault.retention_window_days = 30;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.ledger.batch_size, 7);
        assert_eq!(config.vault.retention_window_days, 30);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kidsafe.toml");
        std::fs::write(
            &path,
            r#"
[ledger]
batch_size = 25
flush_interval_ms = 1000

[vault]
retention_window_days = 45
"#,
        )
        .unwrap();

        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.ledger.batch_size, 25);
        assert_eq!(config.ledger.flush_interval_ms, 1000);
        assert_eq!(config.vault.retention_window_days, 45);
        // Untouched sections keep their defaults.
        assert_eq!(config.ledger.retention_days, 2_555);
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kidsafe.toml");
        std::fs::write(&path, "[ledger]\nbatch_size = 0\n").unwrap();
        assert!(load_config(Some(&path), None).is_err());
    }
}
