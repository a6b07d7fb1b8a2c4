// models/transaction.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Lifecycle of a payment attempt. A transaction is created `Pending` and is
/// moved exactly once into a terminal state by the callback processor or by
/// reconciliation; terminal rows are never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// One STK-push payment attempt against a booking. Kept forever as the
/// audit trail; a booking may accumulate several failed attempts.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: String,
    pub booking_id: String,
    pub phone_number: String,
    /// Whole Kenyan shillings. M-Pesa rejects fractional amounts.
    pub amount: i64,
    pub description: String,

    pub status: TransactionStatus,

    // Daraja correlation ids, set once the gateway accepts the charge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_request_id: Option<String>,

    /// M-Pesa receipt number, set only on successful completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpesa_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde_as(as = "Option<bson::DateTime>")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TransactionStatus::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&TransactionStatus::Completed).unwrap(), "\"completed\"");
        assert_eq!(serde_json::to_string(&TransactionStatus::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn as_str_matches_serialized_form() {
        let status: TransactionStatus =
            serde_json::from_str(&format!("\"{}\"", TransactionStatus::Failed.as_str())).unwrap();
        assert_eq!(status, TransactionStatus::Failed);
    }
}
