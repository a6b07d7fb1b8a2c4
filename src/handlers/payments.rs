// handlers/payments.rs
use axum::{
    extract::{Extension, Query, State},
    response::Json,
};
use chrono::Utc;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::Collection;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::models::booking::Booking;
use crate::models::transaction::{Transaction, TransactionStatus};
use crate::models::user::Claims;
use crate::services::mpesa::{round_amount, ChargeOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub amount: f64,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(rename = "bookingId")]
    pub booking_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
}

/// Starts an STK-push charge for a booking. The ledger row is written
/// before the gateway is contacted, so every attempt leaves a durable
/// record whatever happens afterwards. The transaction stays `pending`
/// here; only the callback processor or reconciliation may complete it.
pub async fn initiate_payment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<Json<Value>> {
    if payload.amount <= 0.0 {
        return Err(AppError::Validation("Amount must be greater than 0".to_string()));
    }
    if payload.phone_number.trim().is_empty() {
        return Err(AppError::Validation("Missing phone number".to_string()));
    }
    let booking_oid = ObjectId::parse_str(&payload.booking_id)
        .map_err(|_| AppError::Validation("Invalid booking id".to_string()))?;

    let bookings: Collection<Booking> = state.db.collection("bookings");
    bookings.find_one(doc! {"_id": booking_oid}).await?.ok_or(AppError::NotFound)?;

    let transactions: Collection<Transaction> = state.db.collection("transactions");

    // One in-flight attempt per booking and payer; retries are allowed only
    // after the previous attempt resolved.
    let existing_pending = transactions
        .find_one(doc! {
            "booking_id": &payload.booking_id,
            "user_id": &claims.sub,
            "status": TransactionStatus::Pending.as_str(),
        })
        .await?;
    if existing_pending.is_some() {
        return Err(AppError::PendingPaymentExists);
    }

    let description =
        payload.description.clone().unwrap_or_else(|| "Booking payment".to_string());
    let transaction_id = ObjectId::new();

    let transaction = Transaction {
        id: Some(transaction_id),
        user_id: claims.sub.clone(),
        booking_id: payload.booking_id.clone(),
        phone_number: payload.phone_number.clone(),
        amount: round_amount(payload.amount) as i64,
        description: description.clone(),
        status: TransactionStatus::Pending,
        checkout_request_id: None,
        merchant_request_id: None,
        mpesa_ref: None,
        error_message: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    transactions.insert_one(&transaction).await?;

    info!("Transaction {} created for booking {}", transaction_id.to_hex(), payload.booking_id);

    let outcome = match state
        .mpesa
        .initiate_charge(&payload.phone_number, payload.amount, &payload.booking_id, &description)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // The ledger row records why the charge never reached the
            // provider, then the error is surfaced to the caller.
            mark_failed(&transactions, transaction_id, &e.to_string()).await;
            return Err(e.into());
        }
    };

    match outcome {
        ChargeOutcome::Rejected { error } => {
            mark_failed(&transactions, transaction_id, &error).await;
            Err(AppError::Gateway(error))
        }
        ChargeOutcome::Accepted { merchant_request_id, checkout_request_id, .. } => {
            transactions
                .update_one(
                    doc! {"_id": transaction_id},
                    doc! {"$set": {
                        "checkout_request_id": &checkout_request_id,
                        "merchant_request_id": &merchant_request_id,
                    }},
                )
                .await?;

            Ok(Json(json!({
                "success": true,
                "data": {
                    "transactionId": transaction_id.to_hex(),
                    "checkoutRequestId": checkout_request_id,
                },
                "message": "Payment initiated. Please complete on your phone.",
            })))
        }
    }
}

/// Poll endpoint for the browser. Ownership is part of the lookup filter,
/// so a foreign transaction id and a nonexistent one are indistinguishable.
pub async fn payment_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>> {
    let transaction_oid =
        ObjectId::parse_str(&query.transaction_id).map_err(|_| AppError::NotFound)?;

    let transactions: Collection<Transaction> = state.db.collection("transactions");
    let transaction = transactions
        .find_one(doc! {"_id": transaction_oid, "user_id": &claims.sub})
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "transactionId": query.transaction_id,
            "status": transaction.status.as_str(),
            "amount": transaction.amount,
            "mpesaRef": transaction.mpesa_ref,
            "errorMessage": transaction.error_message,
        },
        "message": format!("Payment status: {}", transaction.status.as_str()),
    })))
}

async fn mark_failed(
    transactions: &Collection<Transaction>,
    transaction_id: ObjectId,
    error_message: &str,
) {
    let result = transactions
        .update_one(
            doc! {"_id": transaction_id, "status": TransactionStatus::Pending.as_str()},
            doc! {"$set": {
                "status": TransactionStatus::Failed.as_str(),
                "error_message": error_message,
            }},
        )
        .await;

    if let Err(e) = result {
        error!("Failed to record gateway rejection on {}: {}", transaction_id.to_hex(), e);
    }
}
