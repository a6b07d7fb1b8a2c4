use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::{callbacks, payments, payouts, reconcile};
use crate::middleware::auth::auth_middleware;
use crate::state::AppState;

pub fn payment_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/initiate", post(payments::initiate_payment))
        .route("/status", get(payments::payment_status))
        .route("/payout", post(payouts::send_payout))
        .route("/reconcile", post(reconcile::reconcile_pending))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        // Health
        .route("/health", get(payments_health))
        // Webhooks posted by the provider; no bearer auth
        .route("/callback", post(callbacks::stk_callback))
        .route("/b2c/result", post(callbacks::b2c_result))
        .route("/b2c/timeout", post(callbacks::b2c_timeout))
        .merge(protected)
}

async fn payments_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "payments",
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "status", "callback", "payout", "reconcile"],
    }))
}
