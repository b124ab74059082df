//! Child data records and their envelope transform.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::encryption::{EncryptedEnvelope, FieldCipher};
use crate::error::{IntegrityError, KidsafeError, VaultError};

/// Placeholder left in a record for each field moved into the envelope.
pub const ENCRYPTED_MARKER: &str = "[ENCRYPTED]";

/// A flat record of named values, optionally carrying one envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<EncryptedEnvelope>,
}

impl DataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn is_encrypted(&self) -> bool {
        self.envelope.is_some()
    }

    /// Names of fields currently holding the encrypted marker.
    pub fn marker_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, v)| is_marker(v))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

fn is_marker(value: &Value) -> bool {
    value.as_str() == Some(ENCRYPTED_MARKER)
}

/// Move every present field named in `sensitive` into one envelope.
/// A record without sensitive fields comes back unchanged. Records holding
/// the literal marker as a value are rejected.
pub fn encrypt_record(
    cipher: &FieldCipher,
    record: &DataRecord,
    sensitive: &[String],
) -> Result<DataRecord, KidsafeError> {
    if record.is_encrypted() {
        return Err(VaultError::AlreadyEncrypted.into());
    }
    // A plaintext marker could not be told apart from an encrypted field.
    if let Some(field) = record.marker_fields().into_iter().next() {
        return Err(VaultError::ReservedMarker { field }.into());
    }

    let subset: BTreeMap<&str, &Value> = sensitive
        .iter()
        .filter_map(|name| record.fields.get_key_value(name.as_str()))
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    if subset.is_empty() {
        return Ok(record.clone());
    }

    let payload = serde_json::to_vec(&subset)?;
    let envelope = cipher.seal(&payload, subset.len())?;

    let mut sealed = record.clone();
    for name in subset.keys() {
        sealed
            .fields
            .insert((*name).to_string(), Value::String(ENCRYPTED_MARKER.into()));
    }
    sealed.envelope = Some(envelope);
    Ok(sealed)
}

/// Open the envelope and restore its fields. Nothing is returned unless the
/// checksum, field count and markers all agree.
pub fn decrypt_record(cipher: &FieldCipher, record: &DataRecord) -> Result<DataRecord, KidsafeError> {
    let Some(envelope) = &record.envelope else {
        let orphans = record.marker_fields();
        if !orphans.is_empty() {
            return Err(IntegrityError::OrphanMarkers { fields: orphans }.into());
        }
        return Ok(record.clone());
    };

    let plaintext = cipher.open(envelope)?;
    let restored: BTreeMap<String, Value> =
        serde_json::from_slice(&plaintext).map_err(|e| VaultError::MalformedEnvelope {
            message: format!("payload is not a field map: {}", e),
        })?;

    if restored.len() != envelope.field_count {
        return Err(IntegrityError::FieldCountMismatch {
            declared: envelope.field_count,
            actual: restored.len(),
        }
        .into());
    }
    if let Some(missing) = restored
        .keys()
        .find(|name| !record.fields.get(name.as_str()).is_some_and(is_marker))
    {
        return Err(IntegrityError::MarkerMissing {
            field: missing.clone(),
        }
        .into());
    }

    let mut opened = record.clone();
    opened.envelope = None;
    opened.fields.extend(restored);
    Ok(opened)
}
