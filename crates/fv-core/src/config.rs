const DEFAULT_EARLY_GRACE_MIN: i64 = 30;
const DEFAULT_LATE_GRACE_MIN: i64 = 60;
const DEFAULT_RADIUS_METERS: f64 = 150.0;

/// Knobs for the field-verification pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationConfig {
    /// Minutes a check-in may precede the window start.
    pub early_grace_min: i64,
    /// Minutes a check-out may follow the window end.
    pub late_grace_min: i64,
    /// Geofence radius in meters around the visit anchor.
    pub radius_meters: f64,
    /// When false, distance is recorded opportunistically but not enforced.
    pub require_geofence: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            early_grace_min: DEFAULT_EARLY_GRACE_MIN,
            late_grace_min: DEFAULT_LATE_GRACE_MIN,
            radius_meters: DEFAULT_RADIUS_METERS,
            require_geofence: true,
        }
    }
}

impl VerificationConfig {
    /// Reads the recognized environment options, keeping defaults for
    /// anything missing or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            early_grace_min: env_parse("CHECKIN_EARLY_MIN", defaults.early_grace_min),
            late_grace_min: env_parse("CHECKOUT_LATE_MIN", defaults.late_grace_min),
            radius_meters: env_parse("RADIUS_METERS", defaults.radius_meters),
            require_geofence: std::env::var("REQUIRE_GEOFENCE")
                .map(|value| value.trim() == "true")
                .unwrap_or(defaults.require_geofence),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let config = VerificationConfig::default();
        assert_eq!(config.early_grace_min, 30);
        assert_eq!(config.late_grace_min, 60);
        assert_eq!(config.radius_meters, 150.0);
        assert!(config.require_geofence);
    }
}
