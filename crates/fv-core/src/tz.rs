use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_BUSINESS_TZ: Tz = chrono_tz::America::Guatemala;

/// Business timezone, overridable via `BUSINESS_TZ`. Unparseable values fall
/// back to the default.
pub fn business_tz() -> Tz {
    std::env::var("BUSINESS_TZ")
        .ok()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(DEFAULT_BUSINESS_TZ)
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Inside a DST gap; anchor on the UTC reading of the same wall time.
        LocalResult::None => tz.from_utc_datetime(&naive),
    }
}

/// UTC bounds of the business calendar day containing `instant`. The end
/// bound is inclusive, one millisecond before the next day starts.
pub fn day_bounds_utc(instant: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = instant.with_timezone(&tz).date_naive();
    let start = resolve_local(tz, local_date.and_time(NaiveTime::MIN));
    let next_date = local_date.succ_opt().unwrap_or(local_date);
    let next_start = resolve_local(tz, next_date.and_time(NaiveTime::MIN));
    (
        start.with_timezone(&Utc),
        next_start.with_timezone(&Utc) - Duration::milliseconds(1),
    )
}
