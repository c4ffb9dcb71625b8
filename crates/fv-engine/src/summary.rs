use chrono::{DateTime, Utc};
use fv_core::visit_contracts::{ClientRecord, ClientStatus, Technician, Visit, VisitStatus};
use serde::Serialize;

/// Wire shape of a visit, client and technician embedded.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitSummary {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub status: VisitStatus,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub check_in_at: Option<DateTime<Utc>>,
    pub check_in_lat: Option<f64>,
    pub check_in_lng: Option<f64>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub check_out_lat: Option<f64>,
    pub check_out_lng: Option<f64>,
    pub client: ClientSummary,
    pub technician: TechnicianSummary,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: ClientStatus,
    pub notes: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TechnicianSummary {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub subject: Option<String>,
}

impl VisitSummary {
    pub fn build(visit: &Visit, client: &ClientRecord, technician: &Technician) -> Self {
        Self {
            id: visit.id.clone(),
            scheduled_at: visit.scheduled_at,
            window_start: visit.window_start,
            window_end: visit.window_end,
            status: visit.status,
            notes: visit.notes.clone(),
            started_at: visit.started_at,
            completed_at: visit.completed_at,
            canceled_at: visit.canceled_at,
            cancel_reason: visit.cancel_reason.clone(),
            check_in_at: visit.check_in_at,
            check_in_lat: visit.check_in_point.map(|p| p.lat),
            check_in_lng: visit.check_in_point.map(|p| p.lng),
            check_out_at: visit.check_out_at,
            check_out_lat: visit.check_out_point.map(|p| p.lat),
            check_out_lng: visit.check_out_point.map(|p| p.lng),
            client: ClientSummary {
                id: client.id.clone(),
                name: client.name.clone(),
                email: client.email.clone(),
                phone: client.phone.clone(),
                status: client.status,
                notes: client.notes.clone(),
                address: client.address.clone(),
                lat: client.point.map(|p| p.lat),
                lng: client.point.map(|p| p.lng),
            },
            technician: TechnicianSummary {
                id: technician.id.clone(),
                name: technician.display_name.clone(),
                email: technician.email.clone(),
                subject: Some(technician.subject.clone()),
            },
        }
    }
}
