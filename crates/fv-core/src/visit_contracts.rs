use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Display name given to technician records created lazily from an external
/// identity that carried no usable name.
pub const PLACEHOLDER_TECHNICIAN_NAME: &str = "Técnico";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisitStatus {
    Planned,
    InProgress,
    Done,
    Canceled,
    NoShow,
}

impl Default for VisitStatus {
    fn default() -> Self {
        Self::Planned
    }
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Planned => "PLANNED",
            VisitStatus::InProgress => "IN_PROGRESS",
            VisitStatus::Done => "DONE",
            VisitStatus::Canceled => "CANCELED",
            VisitStatus::NoShow => "NO_SHOW",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VisitStatus::Done | VisitStatus::Canceled | VisitStatus::NoShow
        )
    }

    /// The lifecycle transition table. Terminal states never transition out;
    /// `DONE` is reachable only from `IN_PROGRESS`, while cancellation and
    /// no-show are reachable from any non-terminal state.
    pub fn allows_transition_to(&self, target: VisitStatus) -> bool {
        match (self, target) {
            (VisitStatus::Planned, VisitStatus::InProgress) => true,
            (VisitStatus::InProgress, VisitStatus::Done) => true,
            (
                VisitStatus::Planned | VisitStatus::InProgress,
                VisitStatus::Canceled | VisitStatus::NoShow,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "PLANNED" => Ok(VisitStatus::Planned),
            "IN_PROGRESS" => Ok(VisitStatus::InProgress),
            "DONE" => Ok(VisitStatus::Done),
            "CANCELED" | "CANCELLED" => Ok(VisitStatus::Canceled),
            "NO_SHOW" => Ok(VisitStatus::NoShow),
            other => Err(format!("Unknown visit status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckKind {
    CheckIn,
    CheckOut,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::CheckIn => "CHECK_IN",
            CheckKind::CheckOut => "CHECK_OUT",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "CHECK_IN" => Ok(CheckKind::CheckIn),
            "CHECK_OUT" => Ok(CheckKind::CheckOut),
            other => Err(format!("Unknown check kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckMethod {
    Geo,
    Manual,
    Qr,
}

impl Default for CheckMethod {
    fn default() -> Self {
        Self::Geo
    }
}

impl CheckMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMethod::Geo => "GEO",
            CheckMethod::Manual => "MANUAL",
            CheckMethod::Qr => "QR",
        }
    }
}

impl FromStr for CheckMethod {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "GEO" => Ok(CheckMethod::Geo),
            "MANUAL" => Ok(CheckMethod::Manual),
            "QR" => Ok(CheckMethod::Qr),
            other => Err(format!("Unknown check method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckSource {
    Online,
    Offline,
}

impl Default for CheckSource {
    fn default() -> Self {
        Self::Online
    }
}

impl CheckSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckSource::Online => "ONLINE",
            CheckSource::Offline => "OFFLINE",
        }
    }
}

impl FromStr for CheckSource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "ONLINE" => Ok(CheckSource::Online),
            "OFFLINE" => Ok(CheckSource::Offline),
            other => Err(format!("Unknown check source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Active,
    Inactive,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "ACTIVE",
            ClientStatus::Inactive => "INACTIVE",
        }
    }
}

impl FromStr for ClientStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "ACTIVE" => Ok(ClientStatus::Active),
            "INACTIVE" => Ok(ClientStatus::Inactive),
            other => Err(format!("Unknown client status: {other}")),
        }
    }
}

/// Signed decimal degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Technician {
    pub id: String,
    /// Stable subject from the external identity provider.
    pub subject: String,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub status: ClientStatus,
    pub notes: Option<String>,
    pub point: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub id: String,
    pub client_id: String,
    pub technician_id: String,
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
    pub check_in_point: Option<GeoPoint>,
    pub check_out_at: Option<DateTime<Utc>>,
    pub check_out_point: Option<GeoPoint>,
    /// Geofence anchor planned for this visit. Falls back to the client's
    /// registered coordinates when absent.
    pub planned_point: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
}

impl Visit {
    /// Time window with missing bounds collapsed to the scheduled instant.
    pub fn effective_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.window_start.unwrap_or(self.scheduled_at),
            self.window_end.unwrap_or(self.scheduled_at),
        )
    }
}

/// Immutable record of one successful check-in or check-out attempt.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitCheck {
    pub id: String,
    pub visit_id: String,
    pub kind: CheckKind,
    pub technician_id: String,
    pub occurred_at: DateTime<Utc>,
    pub device_at: Option<DateTime<Utc>>,
    pub point: Option<GeoPoint>,
    pub distance_meters: Option<f64>,
    pub method: CheckMethod,
    pub source: CheckSource,
    pub verified: bool,
    pub verification_msg: String,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    pub notes: Option<String>,
    pub photo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idem_key_hash: Option<String>,
    #[serde(skip)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisitCompletedEvent {
    pub visit_id: String,
    pub completed_at: DateTime<Utc>,
    pub client: CompletedClient,
    pub technician: CompletedTechnician,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_html: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedClient {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedTechnician {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Per-request identity context handed down by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct IdentityContext {
    pub subject: Option<String>,
    pub roles: Vec<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of a caller-supplied idempotency key. Stored on the verification
/// event under a UNIQUE constraint.
pub fn idempotency_key_hash(key: &str) -> String {
    sha256_hex(key)
}

/// Canonical fingerprint of a request body, used to detect an idempotency
/// key reused with a different payload.
pub fn request_fingerprint<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_string(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use VisitStatus::*;

        assert!(Planned.allows_transition_to(InProgress));
        assert!(Planned.allows_transition_to(Canceled));
        assert!(Planned.allows_transition_to(NoShow));
        assert!(InProgress.allows_transition_to(Done));
        assert!(InProgress.allows_transition_to(Canceled));
        assert!(InProgress.allows_transition_to(NoShow));

        assert!(!Planned.allows_transition_to(Done));
        assert!(!InProgress.allows_transition_to(Planned));
        for terminal in [Done, Canceled, NoShow] {
            assert!(terminal.is_terminal());
            for target in [Planned, InProgress, Done, Canceled, NoShow] {
                assert!(!terminal.allows_transition_to(target));
            }
        }
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            VisitStatus::Planned,
            VisitStatus::InProgress,
            VisitStatus::Done,
            VisitStatus::Canceled,
            VisitStatus::NoShow,
        ] {
            assert_eq!(status.as_str().parse::<VisitStatus>(), Ok(status));
        }
        assert_eq!("cancelled".parse::<VisitStatus>(), Ok(VisitStatus::Canceled));
        assert!("SOMETHING".parse::<VisitStatus>().is_err());
    }

    #[test]
    fn effective_window_collapses_to_scheduled_instant() {
        let scheduled = chrono::Utc::now();
        let visit = Visit {
            id: "v-1".to_string(),
            client_id: "c-1".to_string(),
            technician_id: "t-1".to_string(),
            scheduled_at: scheduled,
            window_start: None,
            window_end: None,
            status: VisitStatus::Planned,
            notes: None,
            started_at: None,
            completed_at: None,
            canceled_at: None,
            cancel_reason: None,
            check_in_at: None,
            check_in_point: None,
            check_out_at: None,
            check_out_point: None,
            planned_point: None,
            created_at: scheduled,
        };
        assert_eq!(visit.effective_window(), (scheduled, scheduled));
    }

    #[test]
    fn fingerprint_is_stable_and_payload_sensitive() {
        #[derive(Serialize)]
        struct Body<'a> {
            lat: f64,
            notes: &'a str,
        }

        let a = request_fingerprint(&Body {
            lat: 14.64,
            notes: "ok",
        })
        .expect("fingerprint");
        let b = request_fingerprint(&Body {
            lat: 14.64,
            notes: "ok",
        })
        .expect("fingerprint");
        let c = request_fingerprint(&Body {
            lat: 14.64,
            notes: "changed",
        })
        .expect("fingerprint");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
