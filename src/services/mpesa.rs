// services/mpesa.rs
use std::time::Duration as StdDuration;

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AppConfig, MpesaEndpoints};

/// Errors raised before the provider ever considered the operation. A
/// rejection by the provider itself is not an error here, it comes back as
/// a `Rejected` outcome so callers can persist the reason.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Auth(String),
}

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    Accepted {
        merchant_request_id: String,
        checkout_request_id: String,
        customer_message: String,
    },
    Rejected {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// The payment itself completed, not merely the query call.
    Completed { result_desc: String },
    Failed { result_desc: String },
    /// Provider has no definitive result yet.
    Pending,
}

#[derive(Debug, Clone)]
pub enum PayoutOutcome {
    Accepted {
        conversation_id: String,
        originator_conversation_id: String,
    },
    Rejected {
        error: String,
    },
}

// ---- Daraja wire types ----

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    expires_in: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: String,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: String,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResultCode", default)]
    pub result_code: Option<String>,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

#[derive(Debug, Serialize)]
struct B2cRequest {
    #[serde(rename = "InitiatorName")]
    initiator_name: String,
    #[serde(rename = "SecurityCredential")]
    security_credential: String,
    #[serde(rename = "CommandID")]
    command_id: String,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "Remarks")]
    remarks: String,
    #[serde(rename = "QueueTimeOutURL")]
    queue_timeout_url: String,
    #[serde(rename = "ResultURL")]
    result_url: String,
    #[serde(rename = "Occasion")]
    occasion: String,
}

#[derive(Debug, Deserialize)]
struct B2cResponse {
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: String,
}

#[derive(Debug, Deserialize)]
struct DarajaErrorResponse {
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

// ---- helpers ----

/// M-Pesa rejects fractional amounts; everything is whole shillings.
pub(crate) fn round_amount(amount: f64) -> u64 {
    amount.round() as u64
}

/// Normalizes a payer phone number to international format: `0712345678`,
/// `+254712345678` and `712345678` all become `254712345678`.
pub(crate) fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.trim().chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 12 && digits.starts_with("254") {
        return digits;
    }
    if digits.len() == 10 && digits.starts_with('0') {
        return format!("254{}", &digits[1..]);
    }
    if digits.len() == 9 {
        return format!("254{}", digits);
    }
    digits
}

pub(crate) fn daraja_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

pub(crate) fn generate_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

pub(crate) fn classify_query_response(response: &StkQueryResponse) -> QueryOutcome {
    if response.response_code != "0" {
        return QueryOutcome::Pending;
    }
    let desc = response.result_desc.clone().unwrap_or_default();
    match response.result_code.as_deref() {
        Some("0") => QueryOutcome::Completed { result_desc: desc },
        Some(_) => QueryOutcome::Failed { result_desc: desc },
        None => QueryOutcome::Pending,
    }
}

fn validate_request(amount: f64, phone: &str) -> Result<(), GatewayError> {
    if amount <= 0.0 {
        return Err(GatewayError::InvalidRequest("Invalid amount".to_string()));
    }
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < 9 {
        return Err(GatewayError::InvalidRequest("Invalid phone number".to_string()));
    }
    Ok(())
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

enum SendError {
    Auth(GatewayError),
    Network(String),
}

const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// All outbound Daraja interaction. The only mutable state is the cached
/// OAuth token; the refresh is guarded by a mutex so concurrent requests
/// share one fetch instead of racing the token endpoint.
pub struct MpesaGateway {
    config: AppConfig,
    endpoints: MpesaEndpoints,
    client: Client,
    cached_token: Mutex<Option<CachedToken>>,
}

impl MpesaGateway {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        let endpoints = config.mpesa_endpoints();

        MpesaGateway { config, endpoints, client, cached_token: Mutex::new(None) }
    }

    pub async fn get_access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.cached_token.lock().await;

        if let Some(entry) = cached.as_ref() {
            if Utc::now() + Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < entry.expires_at {
                return Ok(entry.token.clone());
            }
        }

        let entry = self.fetch_token().await?;
        let token = entry.token.clone();
        *cached = Some(entry);
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.cached_token.lock().await = None;
    }

    async fn fetch_token(&self) -> Result<CachedToken, GatewayError> {
        info!("Requesting new M-Pesa access token");

        let auth = base64.encode(format!(
            "{}:{}",
            self.config.mpesa_consumer_key, self.config.mpesa_consumer_secret
        ));

        let response = self
            .client
            .get(&self.endpoints.auth)
            .header(header::AUTHORIZATION, format!("Basic {}", auth))
            .send()
            .await
            .map_err(|e| GatewayError::Auth(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("M-Pesa auth rejected: {} - {}", status, body);
            return Err(GatewayError::Auth(format!("M-Pesa auth failed: {}", status)));
        }

        let auth_response: AuthResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Auth(format!("Invalid token response: {}", e)))?;

        let expires_in: i64 = auth_response.expires_in.parse().unwrap_or(3600);

        Ok(CachedToken {
            token: auth_response.access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }

    /// Bearer-authed POST with a single forced token refresh on 401.
    async fn post_authed<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, SendError> {
        let token = self.get_access_token().await.map_err(SendError::Auth)?;

        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Network(format!("Request failed: {}", e)))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Bearer token rejected, refreshing and retrying once");
        self.invalidate_token().await;
        let token = self.get_access_token().await.map_err(SendError::Auth)?;

        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Network(format!("Request failed: {}", e)))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SendError::Auth(GatewayError::Auth(
                "M-Pesa rejected credentials after token refresh".to_string(),
            )));
        }

        Ok(response)
    }

    async fn rejection_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<DarajaErrorResponse>().await {
            Ok(DarajaErrorResponse { error_message: Some(msg) }) => msg,
            _ => format!("M-Pesa request failed: {}", status),
        }
    }

    /// Submits an STK push. Acceptance only means the charge request was
    /// queued on the handset; the actual outcome arrives later on the
    /// callback webhook.
    pub async fn initiate_charge(
        &self,
        phone_number: &str,
        amount: f64,
        account_reference: &str,
        description: &str,
    ) -> Result<ChargeOutcome, GatewayError> {
        validate_request(amount, phone_number)?;

        let formatted_phone = normalize_phone(phone_number);
        let timestamp = daraja_timestamp(Utc::now());
        let password =
            generate_password(&self.config.mpesa_short_code, &self.config.mpesa_passkey, &timestamp);

        info!("STK push for {} - KSh {}", formatted_phone, round_amount(amount));

        let request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: round_amount(amount),
            party_a: formatted_phone.clone(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: formatted_phone,
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: description.to_string(),
        };

        let response = match self.post_authed(&self.endpoints.stk_push, &request).await {
            Ok(response) => response,
            Err(SendError::Auth(e)) => return Err(e),
            Err(SendError::Network(msg)) => {
                error!("STK push failed: {}", msg);
                return Ok(ChargeOutcome::Rejected { error: msg });
            }
        };

        if !response.status().is_success() {
            let error = Self::rejection_message(response).await;
            error!("STK push rejected: {}", error);
            return Ok(ChargeOutcome::Rejected { error });
        }

        let stk_response: StkPushResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Malformed STK push response: {}", e);
                return Ok(ChargeOutcome::Rejected {
                    error: format!("Malformed M-Pesa response: {}", e),
                });
            }
        };

        if stk_response.response_code != "0" {
            return Ok(ChargeOutcome::Rejected { error: stk_response.response_description });
        }

        info!("STK push accepted: {}", stk_response.checkout_request_id);
        Ok(ChargeOutcome::Accepted {
            merchant_request_id: stk_response.merchant_request_id,
            checkout_request_id: stk_response.checkout_request_id,
            customer_message: stk_response.customer_message,
        })
    }

    /// Polls the provider for a definitive charge result. Used by the
    /// reconciliation sweep when the callback was delayed or lost.
    pub async fn query_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<QueryOutcome, GatewayError> {
        let timestamp = daraja_timestamp(Utc::now());
        let password =
            generate_password(&self.config.mpesa_short_code, &self.config.mpesa_passkey, &timestamp);

        let request = StkQueryRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response = match self.post_authed(&self.endpoints.stk_query, &request).await {
            Ok(response) => response,
            Err(SendError::Auth(e)) => return Err(e),
            Err(SendError::Network(msg)) => {
                warn!("STK query for {} failed: {}", checkout_request_id, msg);
                return Ok(QueryOutcome::Pending);
            }
        };

        if !response.status().is_success() {
            // Daraja answers the query with an error envelope while the
            // push is still in flight; treat anything non-2xx as not yet
            // resolved rather than as a payment failure.
            warn!("STK query for {} returned {}", checkout_request_id, response.status());
            return Ok(QueryOutcome::Pending);
        }

        match response.json::<StkQueryResponse>().await {
            Ok(parsed) => Ok(classify_query_response(&parsed)),
            Err(e) => {
                warn!("Malformed STK query response: {}", e);
                Ok(QueryOutcome::Pending)
            }
        }
    }

    /// B2C transfer of host earnings. Acceptance queues the transfer; the
    /// definitive result arrives on the B2C result webhook.
    pub async fn send_payout(
        &self,
        phone_number: &str,
        amount: f64,
        description: &str,
    ) -> Result<PayoutOutcome, GatewayError> {
        validate_request(amount, phone_number)?;

        let formatted_phone = normalize_phone(phone_number);

        info!("B2C payout to {} - KSh {}", formatted_phone, round_amount(amount));

        let request = B2cRequest {
            initiator_name: self.config.mpesa_initiator_name.clone(),
            security_credential: self.config.mpesa_security_credential.clone(),
            command_id: "BusinessPayment".to_string(),
            amount: round_amount(amount),
            party_a: self.config.mpesa_short_code.clone(),
            party_b: formatted_phone,
            remarks: description.to_string(),
            queue_timeout_url: self.config.mpesa_b2c_queue_timeout_url.clone(),
            result_url: self.config.mpesa_b2c_result_url.clone(),
            occasion: "Host Payout".to_string(),
        };

        let response = match self.post_authed(&self.endpoints.b2c, &request).await {
            Ok(response) => response,
            Err(SendError::Auth(e)) => return Err(e),
            Err(SendError::Network(msg)) => {
                error!("B2C request failed: {}", msg);
                return Ok(PayoutOutcome::Rejected { error: msg });
            }
        };

        if !response.status().is_success() {
            let error = Self::rejection_message(response).await;
            error!("B2C rejected: {}", error);
            return Ok(PayoutOutcome::Rejected { error });
        }

        let b2c_response: B2cResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Malformed B2C response: {}", e);
                return Ok(PayoutOutcome::Rejected {
                    error: format!("Malformed M-Pesa response: {}", e),
                });
            }
        };

        if b2c_response.response_code != "0" {
            return Ok(PayoutOutcome::Rejected { error: b2c_response.response_description });
        }

        info!("B2C accepted: {}", b2c_response.conversation_id);
        Ok(PayoutOutcome::Accepted {
            conversation_id: b2c_response.conversation_id,
            originator_conversation_id: b2c_response.originator_conversation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rounds_to_nearest_whole_shilling() {
        assert_eq!(round_amount(1500.7), 1501);
        assert_eq!(round_amount(1500.4), 1500);
        assert_eq!(round_amount(3500.0), 3500);
        assert_eq!(round_amount(0.5), 1);
    }

    #[test]
    fn normalizes_local_and_international_formats() {
        assert_eq!(normalize_phone("0712345678"), "254712345678");
        assert_eq!(normalize_phone("254712345678"), "254712345678");
        assert_eq!(normalize_phone("+254712345678"), "254712345678");
        assert_eq!(normalize_phone("712345678"), "254712345678");
        assert_eq!(normalize_phone(" 0712345678 "), "254712345678");
    }

    #[test]
    fn timestamp_is_daraja_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(daraja_timestamp(at), "20240101120000");

        let at = Utc.with_ymd_and_hms(2026, 8, 7, 9, 5, 3).unwrap();
        assert_eq!(daraja_timestamp(at), "20260807090503");
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        assert_eq!(
            generate_password("174379", "passkey", "20240101120000"),
            "MTc0Mzc5cGFzc2tleTIwMjQwMTAxMTIwMDAw"
        );
    }

    #[test]
    fn rejects_non_positive_amount() {
        assert!(matches!(
            validate_request(0.0, "0712345678"),
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_request(-10.0, "0712345678"),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_short_phone_number() {
        assert!(matches!(validate_request(100.0, "07123"), Err(GatewayError::InvalidRequest(_))));
        assert!(validate_request(100.0, "0712345678").is_ok());
    }

    #[test]
    fn stk_push_request_uses_daraja_field_names() {
        let request = StkPushRequest {
            business_short_code: "174379".to_string(),
            password: "pw".to_string(),
            timestamp: "20240101120000".to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: round_amount(1500.7),
            party_a: "254712345678".to_string(),
            party_b: "174379".to_string(),
            phone_number: "254712345678".to_string(),
            callback_url: "https://example.com/cb".to_string(),
            account_reference: "b1".to_string(),
            transaction_desc: "Booking payment".to_string(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["BusinessShortCode"], "174379");
        assert_eq!(value["Amount"], 1501);
        assert_eq!(value["PhoneNumber"], "254712345678");
        assert_eq!(value["CallBackURL"], "https://example.com/cb");
        assert_eq!(value["TransactionType"], "CustomerPayBillOnline");
    }

    #[test]
    fn query_completed_only_when_payment_itself_completed() {
        let response: StkQueryResponse = serde_json::from_str(
            r#"{"ResponseCode": "0", "ResultCode": "0", "ResultDesc": "Processed successfully"}"#,
        )
        .unwrap();
        assert!(matches!(
            classify_query_response(&response),
            QueryOutcome::Completed { .. }
        ));

        // Query call succeeded but the payment was cancelled by the user.
        let response: StkQueryResponse = serde_json::from_str(
            r#"{"ResponseCode": "0", "ResultCode": "1032", "ResultDesc": "Request cancelled by user"}"#,
        )
        .unwrap();
        match classify_query_response(&response) {
            QueryOutcome::Failed { result_desc } => {
                assert_eq!(result_desc, "Request cancelled by user")
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn inconclusive_query_maps_to_pending() {
        let response: StkQueryResponse =
            serde_json::from_str(r#"{"ResponseCode": "1", "ResultDesc": "In process"}"#).unwrap();
        assert!(matches!(classify_query_response(&response), QueryOutcome::Pending));

        let response: StkQueryResponse =
            serde_json::from_str(r#"{"ResponseCode": "0"}"#).unwrap();
        assert!(matches!(classify_query_response(&response), QueryOutcome::Pending));
    }
}
