use fv_core::visit_contracts::{ClientRecord, ClientStatus, GeoPoint};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("client directory error: {0}")]
pub struct DirectoryError(pub String);

/// A client as reported by the external directory service.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteClient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl RemoteClient {
    pub fn into_record(self) -> ClientRecord {
        let status = self
            .status
            .as_deref()
            .and_then(|raw| raw.parse::<ClientStatus>().ok())
            .unwrap_or_default();
        ClientRecord {
            id: self.id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            address: self.address,
            status,
            notes: self.notes,
            point: match (self.lat, self.lng) {
                (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
                _ => None,
            },
        }
    }
}

/// External client directory, consumed through a narrow interface. Lookups
/// are best-effort; the engine treats errors as "no remote results".
pub trait ClientDirectory: Send {
    fn find_client(&self, id: &str) -> Result<Option<RemoteClient>, DirectoryError>;
    fn search_clients(&self, query: &str) -> Result<Vec<RemoteClient>, DirectoryError>;
}

/// Directory that knows nothing; local storage is the only source.
pub struct NullDirectory;

impl ClientDirectory for NullDirectory {
    fn find_client(&self, _id: &str) -> Result<Option<RemoteClient>, DirectoryError> {
        Ok(None)
    }

    fn search_clients(&self, _query: &str) -> Result<Vec<RemoteClient>, DirectoryError> {
        Ok(Vec::new())
    }
}
