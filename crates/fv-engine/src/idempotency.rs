use crate::error::EngineError;
use crate::requests::CheckRequest;
use fv_core::visit_contracts::{idempotency_key_hash, request_fingerprint, VisitCheck};
use fv_storage::VisitStore;

/// What the guard decided for one request.
#[derive(Debug)]
pub enum IdempotencyDecision {
    /// No prior effect for this key; proceed and persist the hashes with
    /// the event.
    Proceed {
        key_hash: Option<String>,
        fingerprint: Option<String>,
    },
    /// Same key, identical payload: return the recorded event untouched.
    Replay(VisitCheck),
}

/// At most one effect per caller-supplied key. Without a key the caller
/// accepts at-least-once semantics and no guarantee is offered. The final
/// enforcement point is the UNIQUE constraint on the stored key hash; this
/// pre-check resolves the common retry path without touching the pipeline.
pub fn ensure_once(
    store: &VisitStore,
    key: Option<&str>,
    request: &CheckRequest,
) -> Result<IdempotencyDecision, EngineError> {
    let Some(key) = key else {
        return Ok(IdempotencyDecision::Proceed {
            key_hash: None,
            fingerprint: None,
        });
    };

    let key_hash = idempotency_key_hash(key);
    let fingerprint = request_fingerprint(request)?;

    if let Some(existing) = store.check_by_idem_hash(&key_hash)? {
        if existing.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return Ok(IdempotencyDecision::Replay(existing));
        }
        return Err(EngineError::IdempotencyKeyReused);
    }

    Ok(IdempotencyDecision::Proceed {
        key_hash: Some(key_hash),
        fingerprint: Some(fingerprint),
    })
}
