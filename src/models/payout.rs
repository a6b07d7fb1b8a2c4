// models/payout.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }
}

/// One B2C disbursement of host earnings. Accepted payouts stay `Pending`
/// holding the Daraja conversation ids until the result callback resolves
/// them, mirroring the charge-side lifecycle.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub host_id: String,
    pub phone_number: String,
    pub amount: i64,
    pub description: String,

    pub status: PayoutStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator_conversation_id: Option<String>,

    /// Provider transaction id from the B2C result callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpesa_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde_as(as = "Option<bson::DateTime>")]
    pub completed_at: Option<DateTime<Utc>>,
}
