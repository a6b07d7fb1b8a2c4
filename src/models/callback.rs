// models/callback.rs
//
// Wire shapes Daraja POSTs to our webhook endpoints. Field names follow the
// provider exactly via serde renames. CallbackMetadata.Item is an unordered
// list of {Name, Value} pairs whose values arrive as either strings or
// numbers, so every lookup is by name and coerces the JSON type.
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    #[serde(rename = "ResultCode")]
    pub result_code: i32,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

impl CallbackMetadata {
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.items.iter().find(|item| item.name == name).map(|item| &item.value)
    }

    /// String lookup that also accepts numeric values (PhoneNumber arrives
    /// as a JSON number).
    pub fn string_value(&self, name: &str) -> Option<String> {
        match self.value(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn numeric_value(&self, name: &str) -> Option<f64> {
        match self.value(name)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    pub fn receipt_number(&self) -> Option<String> {
        self.callback_metadata.as_ref()?.string_value("MpesaReceiptNumber")
    }

    pub fn paid_amount(&self) -> Option<f64> {
        self.callback_metadata.as_ref()?.numeric_value("Amount")
    }

    pub fn payer_phone(&self) -> Option<String> {
        self.callback_metadata.as_ref()?.string_value("PhoneNumber")
    }
}

// B2C result envelope. ResultParameters is absent on some failure shapes.
#[derive(Debug, Deserialize)]
pub struct B2cResultEnvelope {
    #[serde(rename = "Result")]
    pub result: B2cResult,
}

#[derive(Debug, Deserialize)]
pub struct B2cResult {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: String,

    #[serde(rename = "ConversationID")]
    pub conversation_id: String,

    #[serde(rename = "TransactionID", default)]
    pub transaction_id: Option<String>,

    #[serde(rename = "ResultParameters", default)]
    pub result_parameters: Option<B2cResultParameters>,
}

#[derive(Debug, Deserialize)]
pub struct B2cResultParameters {
    #[serde(rename = "ResultParameter", default)]
    pub result_parameter: Vec<B2cResultParameter>,
}

#[derive(Debug, Deserialize)]
pub struct B2cResultParameter {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

impl B2cResult {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.result_parameters
            .as_ref()?
            .result_parameter
            .iter()
            .find(|p| p.key == key)
            .map(|p| &p.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS_CALLBACK: &str = r#"{
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 3500.0},
                        {"Name": "MpesaReceiptNumber", "Value": "QAZ123"},
                        {"Name": "TransactionDate", "Value": 20191219102115},
                        {"Name": "PhoneNumber", "Value": 254712345678}
                    ]
                }
            }
        }
    }"#;

    const CANCELLED_CALLBACK: &str = r#"{
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-2",
                "CheckoutRequestID": "ws_CO_191220191020363926",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }
        }
    }"#;

    #[test]
    fn parses_success_callback() {
        let envelope: StkCallbackEnvelope = serde_json::from_str(SUCCESS_CALLBACK).unwrap();
        let cb = envelope.body.stk_callback;
        assert!(cb.is_success());
        assert_eq!(cb.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(cb.receipt_number().as_deref(), Some("QAZ123"));
        assert_eq!(cb.paid_amount(), Some(3500.0));
        assert_eq!(cb.payer_phone().as_deref(), Some("254712345678"));
    }

    #[test]
    fn parses_failure_callback_without_metadata() {
        let envelope: StkCallbackEnvelope = serde_json::from_str(CANCELLED_CALLBACK).unwrap();
        let cb = envelope.body.stk_callback;
        assert!(!cb.is_success());
        assert_eq!(cb.result_code, 1032);
        assert_eq!(cb.result_desc, "Request cancelled by user");
        assert_eq!(cb.receipt_number(), None);
        assert_eq!(cb.paid_amount(), None);
    }

    #[test]
    fn metadata_lookup_tolerates_reordering_and_gaps() {
        let metadata: CallbackMetadata = serde_json::from_str(
            r#"{"Item": [
                {"Name": "PhoneNumber", "Value": "254700000000"},
                {"Name": "Amount", "Value": "1200"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(metadata.string_value("PhoneNumber").as_deref(), Some("254700000000"));
        assert_eq!(metadata.numeric_value("Amount"), Some(1200.0));
        assert_eq!(metadata.string_value("MpesaReceiptNumber"), None);
    }

    #[test]
    fn metadata_item_without_value_defaults_to_null() {
        let metadata: CallbackMetadata =
            serde_json::from_str(r#"{"Item": [{"Name": "Amount"}]}"#).unwrap();
        assert_eq!(metadata.numeric_value("Amount"), None);
    }

    #[test]
    fn parses_b2c_result() {
        let raw = r#"{
            "Result": {
                "ResultType": 0,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "OriginatorConversationID": "10571-7910404-1",
                "ConversationID": "AG_20191219_00004e48cf7e3533f581",
                "TransactionID": "NLJ41HAY6Q",
                "ResultParameters": {
                    "ResultParameter": [
                        {"Key": "TransactionAmount", "Value": 10},
                        {"Key": "TransactionReceipt", "Value": "NLJ41HAY6Q"}
                    ]
                }
            }
        }"#;

        let envelope: B2cResultEnvelope = serde_json::from_str(raw).unwrap();
        let result = envelope.result;
        assert!(result.is_success());
        assert_eq!(result.transaction_id.as_deref(), Some("NLJ41HAY6Q"));
        assert_eq!(result.parameter("TransactionAmount").and_then(|v| v.as_i64()), Some(10));
    }

    #[test]
    fn parses_b2c_failure_without_parameters() {
        let raw = r#"{
            "Result": {
                "ResultCode": 2001,
                "ResultDesc": "The initiator information is invalid.",
                "OriginatorConversationID": "10571-7910404-2",
                "ConversationID": "AG_20191219_00004e48cf7e3533f582"
            }
        }"#;

        let envelope: B2cResultEnvelope = serde_json::from_str(raw).unwrap();
        assert!(!envelope.result.is_success());
        assert_eq!(envelope.result.transaction_id, None);
        assert_eq!(envelope.result.parameter("TransactionReceipt"), None);
    }
}
