use fv_core::visit_contracts::VisitStatus;
use fv_storage::StorageError;
use thiserror::Error;

/// Expected domain outcomes carry a distinct reason code so the transport
/// can render a precise message; only `Storage`/`Serialization` are system
/// failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("clientId or clientName is required")]
    MissingClientRef,
    #[error("technicianId or technicianName is required")]
    MissingTechnicianRef,
    #[error("Client not found")]
    ClientNotFound,
    #[error("Client is inactive and cannot receive visits")]
    ClientInactive,
    #[error("Technician not found")]
    TechnicianNotFound,
    #[error("windowStart must be before windowEnd")]
    InvalidWindow,
    #[error("Time window overlaps with another visit for this technician")]
    ScheduleConflict,
    #[error("Visit not found")]
    VisitNotFound,
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: VisitStatus, to: VisitStatus },
    #[error("Missing user identity")]
    MissingIdentity,
    #[error("Not assigned to this visit")]
    NotAssignedToVisit,
    #[error("Visit already has check-in")]
    DuplicateCheckIn,
    #[error("Cannot check-out without a prior check-in")]
    MissingCheckIn,
    #[error("Visit already has check-out")]
    DuplicateCheckOut,
    #[error("Outside check-in time window")]
    OutsideCheckInWindow,
    #[error("Outside check-out time window")]
    OutsideCheckOutWindow,
    #[error("Outside geofence")]
    OutsideGeofence,
    #[error("Idempotency key reused with different payload")]
    IdempotencyKeyReused,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::MissingClientRef => "MISSING_CLIENT_REF",
            EngineError::MissingTechnicianRef => "MISSING_TECHNICIAN_REF",
            EngineError::ClientNotFound => "CLIENT_NOT_FOUND",
            EngineError::ClientInactive => "CLIENT_INACTIVE",
            EngineError::TechnicianNotFound => "TECHNICIAN_NOT_FOUND",
            EngineError::InvalidWindow => "INVALID_WINDOW",
            EngineError::ScheduleConflict => "SCHEDULE_CONFLICT",
            EngineError::VisitNotFound => "VISIT_NOT_FOUND",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::MissingIdentity => "MISSING_IDENTITY",
            EngineError::NotAssignedToVisit => "NOT_ASSIGNED_TO_VISIT",
            EngineError::DuplicateCheckIn => "DUPLICATE_CHECK_IN",
            EngineError::MissingCheckIn => "MISSING_CHECK_IN",
            EngineError::DuplicateCheckOut => "DUPLICATE_CHECK_OUT",
            EngineError::OutsideCheckInWindow => "OUTSIDE_CHECK_IN_WINDOW",
            EngineError::OutsideCheckOutWindow => "OUTSIDE_CHECK_OUT_WINDOW",
            EngineError::OutsideGeofence => "OUTSIDE_GEOFENCE",
            EngineError::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::VisitNotFound
                | EngineError::ClientNotFound
                | EngineError::TechnicianNotFound
        )
    }
}
