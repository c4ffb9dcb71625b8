use chrono::{DateTime, Utc};
use fv_core::visit_contracts::{CheckMethod, CheckSource, GeoPoint, VisitStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateVisitRequest {
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub planned_point: Option<GeoPoint>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateVisitRequest {
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub technician_id: Option<String>,
    pub technician_name: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub planned_point: Option<GeoPoint>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCreateRequest {
    pub items: Vec<CreateVisitRequest>,
}

/// Body of a check-in or check-out. Also the unit the idempotency
/// fingerprint is computed over, so field order stays fixed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub device_at: Option<DateTime<Utc>>,
    pub method: Option<CheckMethod>,
    pub source: Option<CheckSource>,
    pub device_id: Option<String>,
    pub notes: Option<String>,
    pub photo_url: Option<String>,
}

impl CheckRequest {
    pub fn point(&self) -> Option<GeoPoint> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        }
    }
}

/// Transport-level request metadata accompanying a check.
#[derive(Debug, Clone, Default)]
pub struct CheckMeta {
    pub ip: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Single business day; overrides `from`/`to`.
    pub date: Option<DateTime<Utc>>,
    pub technician_id: Option<String>,
    pub client_id: Option<String>,
    pub status: Option<VisitStatus>,
    pub mine: bool,
}
