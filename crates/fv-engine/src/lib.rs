pub mod conflict;
pub mod directory;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod notifier;
pub mod ownership;
pub mod requests;
pub mod summary;

pub use directory::{ClientDirectory, DirectoryError, NullDirectory, RemoteClient};
pub use engine::VisitEngine;
pub use error::EngineError;
pub use notifier::{CompletionNotifier, LogNotifier, NotifyError};
pub use requests::{
    BulkCreateRequest, CheckMeta, CheckRequest, CreateVisitRequest, ListQuery, UpdateVisitRequest,
};
pub use summary::{ClientSummary, TechnicianSummary, VisitSummary};
