use std::sync::Arc;

use mongodb::Database;

use crate::config::AppConfig;
use crate::services::mpesa::MpesaGateway;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub mpesa: Arc<MpesaGateway>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(db: Database, mpesa: Arc<MpesaGateway>, config: AppConfig) -> Self {
        AppState { db, mpesa, config }
    }
}
