// src/config.rs
use std::env;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_callback_url: String,
    pub mpesa_b2c_result_url: String,
    pub mpesa_b2c_queue_timeout_url: String,
    pub mpesa_initiator_name: String,
    pub mpesa_security_credential: String,
    pub mpesa_environment: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub database_name: String,
    pub reconcile_after_secs: i64,
    pub port: u16,
    pub host: String,
}

/// Daraja endpoints for the configured environment.
#[derive(Debug, Clone)]
pub struct MpesaEndpoints {
    pub auth: String,
    pub stk_push: String,
    pub stk_query: String,
    pub b2c: String,
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| AppError::Configuration(format!("{} must be set", name)))
}

impl AppConfig {
    /// Loads and validates configuration. Every M-Pesa credential is
    /// mandatory; a missing one aborts startup rather than failing on the
    /// first gateway call.
    pub fn from_env() -> Result<Self> {
        let mpesa_environment =
            env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string());

        if mpesa_environment != "sandbox" && mpesa_environment != "production" {
            return Err(AppError::Configuration(format!(
                "MPESA_ENVIRONMENT must be 'sandbox' or 'production', got '{}'",
                mpesa_environment
            )));
        }

        Ok(AppConfig {
            mpesa_consumer_key: required("MPESA_CONSUMER_KEY")?,
            mpesa_consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            mpesa_short_code: required("MPESA_SHORT_CODE")?,
            mpesa_passkey: required("MPESA_PASSKEY")?,
            mpesa_callback_url: required("MPESA_CALLBACK_URL")?,
            mpesa_b2c_result_url: required("MPESA_B2C_RESULT_URL")?,
            mpesa_b2c_queue_timeout_url: required("MPESA_B2C_QUEUE_TIMEOUT_URL")?,
            mpesa_initiator_name: required("MPESA_INITIATOR_NAME")?,
            mpesa_security_credential: required("MPESA_SECURITY_CREDENTIAL")?,
            mpesa_environment,
            jwt_secret: required("JWT_SECRET")?,
            database_url: required("DATABASE_URL")?,
            database_name: env::var("MONGO_DB_NAME").unwrap_or_else(|_| "kodisha".to_string()),
            reconcile_after_secs: env::var("RECONCILE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(900),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| AppError::Configuration("PORT must be a number".to_string()))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        })
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    pub fn mpesa_endpoints(&self) -> MpesaEndpoints {
        let base_url = if self.is_production() {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        };

        MpesaEndpoints {
            auth: format!("{}/oauth/v1/generate?grant_type=client_credentials", base_url),
            stk_push: format!("{}/mpesa/stkpush/v1/processrequest", base_url),
            stk_query: format!("{}/mpesa/stkpushquery/v1/query", base_url),
            b2c: format!("{}/mpesa/b2c/v1/paymentrequest", base_url),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(environment: &str) -> AppConfig {
    AppConfig {
        mpesa_consumer_key: "key".to_string(),
        mpesa_consumer_secret: "secret".to_string(),
        mpesa_short_code: "174379".to_string(),
        mpesa_passkey: "passkey".to_string(),
        mpesa_callback_url: "https://example.com/api/payments/callback".to_string(),
        mpesa_b2c_result_url: "https://example.com/api/payments/b2c/result".to_string(),
        mpesa_b2c_queue_timeout_url: "https://example.com/api/payments/b2c/timeout".to_string(),
        mpesa_initiator_name: "Kodisha".to_string(),
        mpesa_security_credential: "credential".to_string(),
        mpesa_environment: environment.to_string(),
        jwt_secret: "jwt-secret".to_string(),
        database_url: "mongodb://localhost:27017".to_string(),
        database_name: "kodisha_test".to_string(),
        reconcile_after_secs: 900,
        port: 3000,
        host: "0.0.0.0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_endpoints() {
        let config = test_config("sandbox");
        let urls = config.mpesa_endpoints();
        assert_eq!(
            urls.auth,
            "https://sandbox.safaricom.co.ke/oauth/v1/generate?grant_type=client_credentials"
        );
        assert_eq!(urls.stk_push, "https://sandbox.safaricom.co.ke/mpesa/stkpush/v1/processrequest");
        assert_eq!(urls.stk_query, "https://sandbox.safaricom.co.ke/mpesa/stkpushquery/v1/query");
        assert_eq!(urls.b2c, "https://sandbox.safaricom.co.ke/mpesa/b2c/v1/paymentrequest");
    }

    #[test]
    fn production_endpoints() {
        let config = test_config("production");
        assert!(config.is_production());
        let urls = config.mpesa_endpoints();
        assert!(urls.auth.starts_with("https://api.safaricom.co.ke/"));
        assert!(urls.b2c.starts_with("https://api.safaricom.co.ke/"));
    }
}
