use mongodb::{Client, Database};

use crate::config::AppConfig;
use crate::errors::Result;

pub async fn get_db_client(config: &AppConfig) -> Result<Database> {
    let client = Client::with_uri_str(&config.database_url).await?;
    let db = client.database(&config.database_name);

    // Connectivity check so a bad DATABASE_URL fails at startup, not on the
    // first payment.
    db.run_command(mongodb::bson::doc! {"ping": 1}).await?;
    tracing::info!("Connected to database: {}", config.database_name);

    Ok(db)
}
