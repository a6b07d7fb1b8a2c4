use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

mod config;
mod database;
mod errors;
mod handlers;
mod middleware;
mod models;
mod routes;
mod services;
mod state;

use axum::extract::State;
use config::AppConfig;
use database::connection::get_db_client;
use services::mpesa::MpesaGateway;
use state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("✅ Config loaded (M-Pesa environment: {})", config.mpesa_environment);

    let db = match get_db_client(&config).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("❌ Database connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let mpesa = Arc::new(MpesaGateway::new(config.clone()));

    // Verify the Daraja credentials up front; a provider outage at boot is
    // logged but does not stop the API from serving.
    match mpesa.get_access_token().await {
        Ok(_) => tracing::info!("✅ M-Pesa credentials verified"),
        Err(e) => tracing::warn!("M-Pesa token fetch failed at startup: {}", e),
    }

    let app_state = AppState::new(db, mpesa, config.clone());
    let app = build_router(app_state);

    start_server(app, &config).await;
}

fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/payments", routes::payments::payment_routes(app_state.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn start_server(app: Router, config: &AppConfig) {
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid listen address {}:{}: {}", config.host, config.port, e);
            std::process::exit(1);
        }
    };

    tracing::info!("🚀 Server starting on {}", addr);

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    }
}

async fn root_handler() -> &'static str {
    "🏠 Kodisha Payments API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    use mongodb::bson::doc;

    let db_status = match state.db.run_command(doc! {"ping": 1}).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    Json(json!({
        "status": "healthy",
        "database": db_status,
        "mpesa_environment": state.config.mpesa_environment,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
