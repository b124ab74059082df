//! Verifiable deletion receipts.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::encryption::sha256_hex;

/// Proof that deletion of a child's data was requested at a point in time.
/// The physical overwrite is carried out by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionReceipt {
    pub receipt_id: Uuid,
    pub child_id: String,
    pub deleted_at: DateTime<Utc>,
    /// Hex SHA-256 of `child_id` and the RFC 3339 deletion time.
    pub receipt_hash: String,
}

fn receipt_hash(child_id: &str, deleted_at: &DateTime<Utc>) -> String {
    let stamp = deleted_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
    sha256_hex(format!("{}|{}", child_id, stamp).as_bytes())
}

impl DeletionReceipt {
    pub fn issue(child_id: &str, deleted_at: DateTime<Utc>) -> Self {
        Self {
            receipt_id: Uuid::new_v4(),
            child_id: child_id.to_string(),
            deleted_at,
            receipt_hash: receipt_hash(child_id, &deleted_at),
        }
    }

    /// Recompute the hash from the receipt's own fields.
    pub fn verify(&self) -> bool {
        receipt_hash(&self.child_id, &self.deleted_at) == self.receipt_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_receipt_verifies() {
        let receipt = DeletionReceipt::issue("child-42", Utc::now());
        assert!(receipt.verify());
        assert_eq!(receipt.receipt_hash.len(), 64);
    }

    #[test]
    fn test_altered_receipt_fails() {
        let mut receipt = DeletionReceipt::issue("child-42", Utc::now());
        receipt.child_id = "child-43".into();
        assert!(!receipt.verify());

        let mut receipt = DeletionReceipt::issue("child-42", Utc::now());
        receipt.deleted_at += Duration::seconds(1);
        assert!(!receipt.verify());
    }

    #[test]
    fn test_receipt_survives_serde() {
        let receipt = DeletionReceipt::issue("child-42", Utc::now());
        let json = serde_json::to_string(&receipt).unwrap();
        let back: DeletionReceipt = serde_json::from_str(&json).unwrap();
        assert!(back.verify());
        assert_eq!(back, receipt);
    }
}
