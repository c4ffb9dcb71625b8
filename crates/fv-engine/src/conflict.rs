use crate::error::EngineError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fv_core::time_window::windows_overlap;
use fv_core::tz::day_bounds_utc;
use fv_storage::VisitStore;

/// Rejects a proposed window that intersects any existing non-canceled
/// window for the same technician on the same business day. Closed-interval
/// semantics: touching endpoints conflict. Visits without an explicit window
/// are exempt.
pub fn ensure_no_schedule_conflict(
    store: &VisitStore,
    technician_id: &str,
    scheduled_at: DateTime<Utc>,
    window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    exclude_visit: Option<&str>,
    tz: Tz,
) -> Result<(), EngineError> {
    let Some((start, end)) = window else {
        return Ok(());
    };

    let (day_start, day_end) = day_bounds_utc(scheduled_at, tz);
    let existing =
        store.visit_windows_for_technician_day(technician_id, day_start, day_end, exclude_visit)?;
    for (other_start, other_end) in existing {
        if windows_overlap(start, end, other_start, other_end) {
            return Err(EngineError::ScheduleConflict);
        }
    }
    Ok(())
}
