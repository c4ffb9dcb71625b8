use fv_core::visit_contracts::VisitCompletedEvent;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("completion notification failed: {0}")]
pub struct NotifyError(pub String);

/// Downstream notification on transition to `DONE`. Fire-and-forget;
/// at-least-once delivery is acceptable and failures never roll back the
/// status transition.
pub trait CompletionNotifier: Send {
    fn notify_visit_completed(&self, event: &VisitCompletedEvent) -> Result<(), NotifyError>;
}

/// Default notifier: records the event in the log stream only.
pub struct LogNotifier;

impl CompletionNotifier for LogNotifier {
    fn notify_visit_completed(&self, event: &VisitCompletedEvent) -> Result<(), NotifyError> {
        info!(
            visit_id = %event.visit_id,
            client = %event.client.name,
            "visit completed"
        );
        Ok(())
    }
}
