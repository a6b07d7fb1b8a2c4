// handlers/payouts.rs
use axum::{
    extract::{Extension, State},
    response::Json,
};
use chrono::Utc;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::Collection;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::models::payout::{Payout, PayoutStatus};
use crate::models::user::{Claims, User};
use crate::services::mpesa::{round_amount, PayoutOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PayoutRequest {
    #[serde(rename = "hostId")]
    pub host_id: String,
    pub amount: f64,
    pub description: Option<String>,
}

/// Disburses host earnings over B2C. Callable by an admin or by the host
/// for their own account. An accepted payout stays `pending` until the
/// provider posts the B2C result callback, matching the charge lifecycle.
pub async fn send_payout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<PayoutRequest>,
) -> Result<Json<Value>> {
    if !claims.is_admin() && claims.sub != payload.host_id {
        return Err(AppError::Forbidden);
    }
    if payload.amount <= 0.0 {
        return Err(AppError::Validation("Amount must be greater than 0".to_string()));
    }

    let host_oid = ObjectId::parse_str(&payload.host_id).map_err(|_| AppError::NotFound)?;
    let users: Collection<User> = state.db.collection("users");
    let host = users.find_one(doc! {"_id": host_oid}).await?.ok_or(AppError::NotFound)?;
    let phone = host.disbursement_phone().ok_or(AppError::NotFound)?.to_string();

    let description =
        payload.description.clone().unwrap_or_else(|| "Earnings Payout".to_string());
    let payout_id = ObjectId::new();

    let payout = Payout {
        id: Some(payout_id),
        host_id: payload.host_id.clone(),
        phone_number: phone.clone(),
        amount: round_amount(payload.amount) as i64,
        description: description.clone(),
        status: PayoutStatus::Pending,
        conversation_id: None,
        originator_conversation_id: None,
        mpesa_ref: None,
        error_message: None,
        created_at: Utc::now(),
        completed_at: None,
    };

    let payouts: Collection<Payout> = state.db.collection("payouts");
    payouts.insert_one(&payout).await?;

    info!("Payout {} created for host {}", payout_id.to_hex(), payload.host_id);

    let outcome = match state
        .mpesa
        .send_payout(&phone, payload.amount, &format!("Kodisha Earnings - {}", description))
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            mark_payout_failed(&payouts, payout_id, &e.to_string()).await;
            return Err(e.into());
        }
    };

    match outcome {
        PayoutOutcome::Rejected { error } => {
            mark_payout_failed(&payouts, payout_id, &error).await;
            Err(AppError::Gateway(error))
        }
        PayoutOutcome::Accepted { conversation_id, originator_conversation_id } => {
            payouts
                .update_one(
                    doc! {"_id": payout_id},
                    doc! {"$set": {
                        "conversation_id": &conversation_id,
                        "originator_conversation_id": &originator_conversation_id,
                    }},
                )
                .await?;

            Ok(Json(json!({
                "success": true,
                "data": {"payoutId": payout_id.to_hex()},
                "message": "Payout accepted. Completion is confirmed by the provider callback.",
            })))
        }
    }
}

async fn mark_payout_failed(
    payouts: &Collection<Payout>,
    payout_id: ObjectId,
    error_message: &str,
) {
    let result = payouts
        .update_one(
            doc! {"_id": payout_id, "status": PayoutStatus::Pending.as_str()},
            doc! {"$set": {
                "status": PayoutStatus::Failed.as_str(),
                "error_message": error_message,
            }},
        )
        .await;

    if let Err(e) = result {
        error!("Failed to record payout rejection on {}: {}", payout_id.to_hex(), e);
    }
}
