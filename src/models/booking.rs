// models/booking.rs
//
// Bookings are owned by the listings subsystem; this service only reads the
// row to confirm existence and writes payment_status/paid_at after a
// successful charge.
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub paid_at: Option<mongodb::bson::DateTime>,
}
