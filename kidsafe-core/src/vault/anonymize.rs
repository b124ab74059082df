//! Irreversible anonymization of child records.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use super::record::DataRecord;
use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::hex;

type HmacSha256 = Hmac<Sha256>;

/// Replacement value for direct identifiers.
pub const ANONYMIZED_SENTINEL: &str = "[ANONYMIZED]";
/// Field holding the keyed one-way hash of the linkage identifier.
pub const LINKAGE_HASH_FIELD: &str = "linkage_hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBucket {
    Toddler,
    Preschool,
    EarlyElementary,
    Elementary,
    Preteen,
}

impl AgeBucket {
    pub const ALL: [AgeBucket; 5] = [
        AgeBucket::Toddler,
        AgeBucket::Preschool,
        AgeBucket::EarlyElementary,
        AgeBucket::Elementary,
        AgeBucket::Preteen,
    ];

    pub fn for_age(age: u64) -> Self {
        match age {
            0..=2 => AgeBucket::Toddler,
            3..=5 => AgeBucket::Preschool,
            6..=8 => AgeBucket::EarlyElementary,
            9..=10 => AgeBucket::Elementary,
            _ => AgeBucket::Preteen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBucket::Toddler => "toddler",
            AgeBucket::Preschool => "preschool",
            AgeBucket::EarlyElementary => "early_elementary",
            AgeBucket::Elementary => "elementary",
            AgeBucket::Preteen => "preteen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == s)
    }
}

impl std::fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an age value to its bucket name. Existing bucket names pass through;
/// anything unreadable becomes the sentinel.
fn bucket_value(value: &Value) -> Value {
    let bucket = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(AgeBucket::for_age),
        Value::String(s) => AgeBucket::parse(s)
            .or_else(|| s.trim().parse::<u64>().ok().map(AgeBucket::for_age)),
        _ => None,
    };
    match bucket {
        Some(b) => Value::String(b.as_str().to_string()),
        None => Value::String(ANONYMIZED_SENTINEL.to_string()),
    }
}

fn is_sentinel(value: &Value) -> bool {
    value.as_str() == Some(ANONYMIZED_SENTINEL)
}

/// Strips identifiers and coarsens ages. Keyed so linkage hashes cannot be
/// recomputed without the salt.
#[derive(Clone)]
pub struct Anonymizer {
    mac: HmacSha256,
    identifier_fields: Vec<String>,
    linkage_field: String,
    age_field: String,
}

impl std::fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anonymizer")
            .field("identifier_fields", &self.identifier_fields)
            .field("linkage_field", &self.linkage_field)
            .field("age_field", &self.age_field)
            .finish_non_exhaustive()
    }
}

impl Anonymizer {
    pub fn new(config: &VaultConfig, key: &[u8]) -> Result<Self, VaultError> {
        let mac = HmacSha256::new_from_slice(key).map_err(|e| VaultError::EncryptFailed {
            message: format!("linkage key rejected: {}", e),
        })?;
        Ok(Self {
            mac,
            identifier_fields: config.identifier_fields.clone(),
            linkage_field: config.linkage_field.clone(),
            age_field: config.age_field.clone(),
        })
    }

    pub fn linkage_hash(&self, identifier: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(identifier.as_bytes());
        hex::encode(&mac.finalize().into_bytes())
    }

    /// Anonymize a plaintext record. Running it again on the output changes
    /// nothing.
    pub fn anonymize(&self, record: &DataRecord) -> Result<DataRecord, VaultError> {
        if record.is_encrypted() {
            return Err(VaultError::EncryptedRecord);
        }
        let mut out = record.clone();

        if let Some(value) = out.fields.get(&self.linkage_field)
            && !is_sentinel(value)
            && !out.fields.contains_key(LINKAGE_HASH_FIELD)
        {
            let identifier = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let hash = self.linkage_hash(&identifier);
            out.insert(LINKAGE_HASH_FIELD, hash);
        }

        if let Some(age) = out.fields.get_mut(&self.age_field) {
            *age = bucket_value(age);
        }

        for name in self
            .identifier_fields
            .iter()
            .chain(std::iter::once(&self.linkage_field))
        {
            if let Some(value) = out.fields.get_mut(name) {
                *value = Value::String(ANONYMIZED_SENTINEL.to_string());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn anonymizer() -> Anonymizer {
        Anonymizer::new(&VaultConfig::default(), &[9u8; 32]).unwrap()
    }

    fn record(age: Value) -> DataRecord {
        DataRecord::new()
            .with_field("child_id", "child-42")
            .with_field("child_name", "Ada")
            .with_field("parent_email", "parent@example.com")
            .with_field("age", age)
            .with_field("favorite_color", "green")
    }

    #[test]
    fn test_age_buckets() {
        let cases = [
            (0, AgeBucket::Toddler),
            (2, AgeBucket::Toddler),
            (3, AgeBucket::Preschool),
            (5, AgeBucket::Preschool),
            (6, AgeBucket::EarlyElementary),
            (8, AgeBucket::EarlyElementary),
            (9, AgeBucket::Elementary),
            (10, AgeBucket::Elementary),
            (11, AgeBucket::Preteen),
            (17, AgeBucket::Preteen),
        ];
        for (age, bucket) in cases {
            assert_eq!(AgeBucket::for_age(age), bucket, "age {age}");
        }
    }

    #[test]
    fn test_anonymize_replaces_identifiers() {
        let out = anonymizer().anonymize(&record(json!(7))).unwrap();
        assert_eq!(out.get_str("child_name"), Some(ANONYMIZED_SENTINEL));
        assert_eq!(out.get_str("parent_email"), Some(ANONYMIZED_SENTINEL));
        assert_eq!(out.get_str("child_id"), Some(ANONYMIZED_SENTINEL));
        assert_eq!(out.get_str("age"), Some("early_elementary"));
        assert_eq!(out.get_str("favorite_color"), Some("green"));
        let hash = out.get_str(LINKAGE_HASH_FIELD).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("child-42"));
    }

    #[test]
    fn test_linkage_hash_is_stable_and_keyed() {
        let a = anonymizer().anonymize(&record(json!(7))).unwrap();
        let b = anonymizer().anonymize(&record(json!(10))).unwrap();
        assert_eq!(a.get(LINKAGE_HASH_FIELD), b.get(LINKAGE_HASH_FIELD));

        let other = Anonymizer::new(&VaultConfig::default(), &[1u8; 32]).unwrap();
        assert_ne!(other.linkage_hash("child-42"), anonymizer().linkage_hash("child-42"));
    }

    #[test]
    fn test_anonymize_is_idempotent() {
        let anon = anonymizer();
        let once = anon.anonymize(&record(json!(4))).unwrap();
        let twice = anon.anonymize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_string_and_unreadable_ages() {
        let anon = anonymizer();
        let out = anon.anonymize(&record(json!("12"))).unwrap();
        assert_eq!(out.get_str("age"), Some("preteen"));
        let out = anon.anonymize(&record(json!("about six"))).unwrap();
        assert_eq!(out.get_str("age"), Some(ANONYMIZED_SENTINEL));
        let out = anon.anonymize(&record(json!(null))).unwrap();
        assert_eq!(out.get_str("age"), Some(ANONYMIZED_SENTINEL));
    }

    #[test]
    fn test_encrypted_record_rejected() {
        use crate::vault::encryption::FieldCipher;
        use crate::vault::record::encrypt_record;

        let sealed = encrypt_record(
            &FieldCipher::new([3u8; 32]),
            &record(json!(7)),
            &VaultConfig::default().sensitive_fields,
        )
        .unwrap();
        assert!(matches!(
            anonymizer().anonymize(&sealed),
            Err(VaultError::EncryptedRecord)
        ));
    }
}
