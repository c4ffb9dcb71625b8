use chrono::{DateTime, Duration, Utc};

/// Check-in is permitted in `[start - early_grace, end]`, inclusive.
pub fn in_check_in_window(
    now: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    early_grace_min: i64,
) -> bool {
    let min = start - Duration::minutes(early_grace_min);
    now >= min && now <= end
}

/// Check-out is permitted in `[start, end + late_grace]`, inclusive.
pub fn in_check_out_window(
    now: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    late_grace_min: i64,
) -> bool {
    let max = end + Duration::minutes(late_grace_min);
    now >= start && now <= max
}

/// Closed-interval overlap: touching endpoints count as overlapping.
pub fn windows_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start <= b_end && b_start <= a_end
}
