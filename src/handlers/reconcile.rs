// handlers/reconcile.rs
use axum::{
    extract::{Extension, State},
    response::Json,
};
use chrono::{Duration, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc};
use mongodb::Collection;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{AppError, Result};
use crate::handlers::callbacks::{
    complete_pending_transaction, fail_pending_transaction, mark_booking_paid,
};
use crate::models::transaction::{Transaction, TransactionStatus};
use crate::models::user::Claims;
use crate::services::mpesa::QueryOutcome;
use crate::state::AppState;

/// Sweep for transactions stuck in `pending` past the SLA window: the
/// charge callback was lost or delayed, so ask the provider directly and
/// apply the same transitions the callback processor would. Driven by an
/// external scheduler; admin-only.
pub async fn reconcile_pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>> {
    if !claims.is_admin() {
        return Err(AppError::Forbidden);
    }

    let cutoff = Utc::now() - Duration::seconds(state.config.reconcile_after_secs);
    let transactions: Collection<Transaction> = state.db.collection("transactions");

    let cursor = transactions
        .find(doc! {
            "status": TransactionStatus::Pending.as_str(),
            "created_at": {"$lt": bson::DateTime::from_chrono(cutoff)},
        })
        .await?;
    let stale: Vec<Transaction> = cursor.try_collect().await?;

    info!("Reconciling {} stale pending transaction(s)", stale.len());

    let mut completed = 0u64;
    let mut failed = 0u64;
    let mut still_pending = 0u64;
    let mut orphaned = 0u64;

    for transaction in &stale {
        let transaction_hex = transaction.id.map(|id| id.to_hex()).unwrap_or_default();

        let checkout_request_id = match &transaction.checkout_request_id {
            Some(id) => id,
            None => {
                // Crashed between gateway acceptance and persisting the
                // checkout id, or never reached the gateway. Cannot be
                // queried; left for manual resolution.
                warn!("Transaction {} is pending with no checkout request id", transaction_hex);
                orphaned += 1;
                continue;
            }
        };

        match state.mpesa.query_status(checkout_request_id).await {
            Err(e) => {
                warn!("Status query for {} failed: {}", checkout_request_id, e);
                still_pending += 1;
            }
            Ok(QueryOutcome::Pending) => {
                still_pending += 1;
            }
            Ok(QueryOutcome::Completed { .. }) => {
                // The query result carries no receipt number; the ledger
                // records completion without one.
                if let Some(updated) =
                    complete_pending_transaction(&state, checkout_request_id, None).await?
                {
                    mark_booking_paid(&state, &updated).await;
                    completed += 1;
                } else {
                    still_pending += 1;
                }
            }
            Ok(QueryOutcome::Failed { result_desc }) => {
                if fail_pending_transaction(&state, checkout_request_id, &result_desc)
                    .await?
                    .is_some()
                {
                    failed += 1;
                } else {
                    still_pending += 1;
                }
            }
        }
    }

    Ok(Json(json!({
        "success": true,
        "data": {
            "checked": stale.len(),
            "completed": completed,
            "failed": failed,
            "stillPending": still_pending,
            "orphaned": orphaned,
        },
    })))
}
