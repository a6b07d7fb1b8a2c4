// handlers/callbacks.rs
//
// Webhook endpoints Daraja calls after a charge or payout attempt resolves.
// These handlers must acknowledge unconditionally: a non-2xx or error body
// makes the provider retry the callback indefinitely. Bodies are taken as
// raw strings and parsed inside the boundary so even a malformed payload
// still produces the acknowledgment.
use axum::{extract::State, response::Json};
use mongodb::bson::{self, doc, oid::ObjectId, Bson};
use mongodb::options::ReturnDocument;
use mongodb::Collection;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::models::callback::{B2cResultEnvelope, StkCallbackEnvelope};
use crate::models::payout::{Payout, PayoutStatus};
use crate::models::transaction::{Transaction, TransactionStatus};
use crate::state::AppState;

fn ack() -> Json<Value> {
    Json(json!({
        "ResultCode": 0,
        "ResultDesc": "Callback received successfully",
    }))
}

pub async fn stk_callback(State(state): State<AppState>, body: String) -> Json<Value> {
    if let Err(e) = process_stk_callback(&state, &body).await {
        // Logged out-of-band; the provider still gets its acknowledgment.
        error!("STK callback processing failed: {}", e);
    }
    ack()
}

async fn process_stk_callback(state: &AppState, body: &str) -> Result<()> {
    let envelope: StkCallbackEnvelope = serde_json::from_str(body)
        .map_err(|e| AppError::Validation(format!("Malformed callback payload: {}", e)))?;
    let callback = envelope.body.stk_callback;

    info!(
        "M-Pesa callback for {}: result_code={} ({})",
        callback.checkout_request_id, callback.result_code, callback.result_desc
    );

    if callback.is_success() {
        info!(
            "Payment confirmed: amount={:?} payer={:?}",
            callback.paid_amount(),
            callback.payer_phone()
        );

        let transaction = complete_pending_transaction(
            state,
            &callback.checkout_request_id,
            callback.receipt_number(),
        )
        .await?;

        match transaction {
            Some(transaction) => mark_booking_paid(state, &transaction).await,
            None => log_unmatched(state, &callback.checkout_request_id).await?,
        }
    } else {
        let transaction = fail_pending_transaction(
            state,
            &callback.checkout_request_id,
            &callback.result_desc,
        )
        .await?;

        if transaction.is_none() {
            log_unmatched(state, &callback.checkout_request_id).await?;
        }
    }

    Ok(())
}

/// Atomically moves a transaction from `pending` to `completed`. The status
/// guard lives in the filter, so of two racing callback deliveries only one
/// matches; the other sees `None` and drops.
pub(crate) async fn complete_pending_transaction(
    state: &AppState,
    checkout_request_id: &str,
    receipt: Option<String>,
) -> Result<Option<Transaction>> {
    let transactions: Collection<Transaction> = state.db.collection("transactions");

    let updated = transactions
        .find_one_and_update(
            doc! {
                "checkout_request_id": checkout_request_id,
                "status": TransactionStatus::Pending.as_str(),
            },
            doc! {"$set": {
                "status": TransactionStatus::Completed.as_str(),
                "mpesa_ref": receipt,
                "error_message": Bson::Null,
                "completed_at": bson::DateTime::now(),
            }},
        )
        .return_document(ReturnDocument::After)
        .await?;

    if let Some(transaction) = &updated {
        info!(
            "Transaction {} completed, receipt {:?}",
            transaction.id.map(|id| id.to_hex()).unwrap_or_default(),
            transaction.mpesa_ref
        );
    }

    Ok(updated)
}

/// Atomically moves a transaction from `pending` to `failed` with the
/// provider's reason. Same conditional-update guard as completion.
pub(crate) async fn fail_pending_transaction(
    state: &AppState,
    checkout_request_id: &str,
    reason: &str,
) -> Result<Option<Transaction>> {
    let transactions: Collection<Transaction> = state.db.collection("transactions");

    let updated = transactions
        .find_one_and_update(
            doc! {
                "checkout_request_id": checkout_request_id,
                "status": TransactionStatus::Pending.as_str(),
            },
            doc! {"$set": {
                "status": TransactionStatus::Failed.as_str(),
                "error_message": reason,
            }},
        )
        .return_document(ReturnDocument::After)
        .await?;

    if let Some(transaction) = &updated {
        info!(
            "Transaction {} failed: {}",
            transaction.id.map(|id| id.to_hex()).unwrap_or_default(),
            reason
        );
    }

    Ok(updated)
}

/// Marks the booking paid after a completed charge. Payment truth is never
/// rolled back for a bookkeeping failure here; any problem is recorded in
/// payment_discrepancies for the reconciliation sweep to pick up.
pub(crate) async fn mark_booking_paid(state: &AppState, transaction: &Transaction) {
    let booking_oid = match ObjectId::parse_str(&transaction.booking_id) {
        Ok(oid) => oid,
        Err(_) => {
            record_discrepancy(state, transaction, "invalid booking id on transaction").await;
            return;
        }
    };

    let bookings: Collection<crate::models::booking::Booking> = state.db.collection("bookings");
    let result = bookings
        .update_one(
            doc! {"_id": booking_oid},
            doc! {"$set": {
                "payment_status": "completed",
                "paid_at": bson::DateTime::now(),
            }},
        )
        .await;

    match result {
        Ok(update) if update.matched_count == 0 => {
            record_discrepancy(state, transaction, "booking not found").await;
        }
        Ok(_) => {
            info!("Booking {} marked paid", transaction.booking_id);
        }
        Err(e) => {
            record_discrepancy(state, transaction, &format!("booking update failed: {}", e)).await;
        }
    }
}

async fn record_discrepancy(state: &AppState, transaction: &Transaction, reason: &str) {
    error!(
        "Booking update discrepancy for transaction {}: {}",
        transaction.id.map(|id| id.to_hex()).unwrap_or_default(),
        reason
    );

    let discrepancies: Collection<bson::Document> = state.db.collection("payment_discrepancies");
    let insert = discrepancies
        .insert_one(doc! {
            "transaction_id": transaction.id,
            "booking_id": &transaction.booking_id,
            "reason": reason,
            "created_at": bson::DateTime::now(),
        })
        .await;

    if let Err(e) = insert {
        error!("Failed to queue payment discrepancy: {}", e);
    }
}

async fn log_unmatched(state: &AppState, checkout_request_id: &str) -> Result<()> {
    let transactions: Collection<Transaction> = state.db.collection("transactions");
    let existing =
        transactions.find_one(doc! {"checkout_request_id": checkout_request_id}).await?;

    match existing {
        // Already terminal: a duplicate delivery, dropped by the guard.
        Some(transaction) => info!(
            "Duplicate callback for {} ignored (status {})",
            checkout_request_id,
            transaction.status.as_str()
        ),
        None => warn!("Callback for unknown checkout request id {}", checkout_request_id),
    }

    Ok(())
}

// ---- B2C (payout) result callbacks ----

pub async fn b2c_result(State(state): State<AppState>, body: String) -> Json<Value> {
    if let Err(e) = process_b2c_result(&state, &body).await {
        error!("B2C result processing failed: {}", e);
    }
    ack()
}

async fn process_b2c_result(state: &AppState, body: &str) -> Result<()> {
    let envelope: B2cResultEnvelope = serde_json::from_str(body)
        .map_err(|e| AppError::Validation(format!("Malformed B2C result payload: {}", e)))?;
    let result = envelope.result;

    info!(
        "B2C result for {}: result_code={} ({})",
        result.originator_conversation_id, result.result_code, result.result_desc
    );

    let payouts: Collection<Payout> = state.db.collection("payouts");
    let filter = doc! {
        "originator_conversation_id": &result.originator_conversation_id,
        "status": PayoutStatus::Pending.as_str(),
    };

    let update = if result.is_success() {
        doc! {"$set": {
            "status": PayoutStatus::Completed.as_str(),
            "mpesa_ref": result.transaction_id.clone(),
            "error_message": Bson::Null,
            "completed_at": bson::DateTime::now(),
        }}
    } else {
        doc! {"$set": {
            "status": PayoutStatus::Failed.as_str(),
            "error_message": &result.result_desc,
        }}
    };

    let updated = payouts
        .find_one_and_update(filter, update)
        .return_document(ReturnDocument::After)
        .await?;

    match updated {
        Some(payout) => info!(
            "Payout {} resolved to {}",
            payout.id.map(|id| id.to_hex()).unwrap_or_default(),
            payout.status.as_str()
        ),
        None => warn!(
            "B2C result for unknown or already-resolved conversation {}",
            result.originator_conversation_id
        ),
    }

    Ok(())
}

pub async fn b2c_timeout(body: String) -> Json<Value> {
    warn!("B2C queue timeout callback: {}", body);
    ack()
}
