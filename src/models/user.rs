// models/user.rs
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// User rows are owned by the auth/profile subsystem. The payout flow only
/// needs the disbursement phone number and the role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub phone_number: Option<String>,
    /// Preferred over phone_number for disbursements when present.
    #[serde(default)]
    pub mpesa_phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl User {
    pub fn disbursement_phone(&self) -> Option<&str> {
        self.mpesa_phone
            .as_deref()
            .filter(|p| !p.is_empty())
            .or_else(|| self.phone_number.as_deref().filter(|p| !p.is_empty()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpesa_phone_preferred_over_profile_phone() {
        let user = User {
            id: None,
            phone_number: Some("0712345678".to_string()),
            mpesa_phone: Some("0798765432".to_string()),
            role: None,
        };
        assert_eq!(user.disbursement_phone(), Some("0798765432"));
    }

    #[test]
    fn falls_back_to_profile_phone() {
        let user = User {
            id: None,
            phone_number: Some("0712345678".to_string()),
            mpesa_phone: None,
            role: None,
        };
        assert_eq!(user.disbursement_phone(), Some("0712345678"));

        let user = User {
            id: None,
            phone_number: Some("0712345678".to_string()),
            mpesa_phone: Some(String::new()),
            role: None,
        };
        assert_eq!(user.disbursement_phone(), Some("0712345678"));
    }

    #[test]
    fn no_phone_on_file() {
        let user = User { id: None, phone_number: None, mpesa_phone: None, role: None };
        assert_eq!(user.disbursement_phone(), None);
    }
}
