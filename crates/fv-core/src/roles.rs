use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const ROLE_ADMIN: &str = "ADMIN";
pub const ROLE_SUPERVISOR: &str = "SUPERVISOR";
pub const ROLE_TECHNICIAN: &str = "TECNICO";

/// Canonical role token: NFD-decompose, drop combining marks, uppercase.
/// Token issuers disagree on diacritics ("TÉCNICO" vs "TECNICO"), so every
/// role comparison goes through this one function.
pub fn normalize_role(role: &str) -> String {
    role.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_uppercase()
}

pub fn normalize_roles(roles: &[String]) -> Vec<String> {
    roles.iter().map(|role| normalize_role(role)).collect()
}

/// Administrative or supervisory callers are exempt from per-visit
/// ownership checks.
pub fn has_elevated_role(roles: &[String]) -> bool {
    normalize_roles(roles)
        .iter()
        .any(|role| role == ROLE_ADMIN || role == ROLE_SUPERVISOR)
}

/// A caller whose roles include the technician role and nothing elevated is
/// scoped to their own visits when listing.
pub fn technician_only(roles: &[String]) -> bool {
    let normalized = normalize_roles(roles);
    !normalized.is_empty()
        && normalized.iter().any(|role| role == ROLE_TECHNICIAN)
        && !normalized
            .iter()
            .any(|role| role == ROLE_ADMIN || role == ROLE_SUPERVISOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_diacritics_and_uppercases() {
        assert_eq!(normalize_role("Técnico"), "TECNICO");
        assert_eq!(normalize_role("técnico"), "TECNICO");
        assert_eq!(normalize_role("ADMIN"), "ADMIN");
        assert_eq!(normalize_role("supervisór"), "SUPERVISOR");
    }

    #[test]
    fn elevated_roles_detected_across_encodings() {
        assert!(has_elevated_role(&["admin".to_string()]));
        assert!(has_elevated_role(&[
            "técnico".to_string(),
            "Supervisor".to_string()
        ]));
        assert!(!has_elevated_role(&["Técnico".to_string()]));
        assert!(!has_elevated_role(&[]));
    }

    #[test]
    fn technician_only_requires_absence_of_elevated_roles() {
        assert!(technician_only(&["Técnico".to_string()]));
        assert!(!technician_only(&[
            "técnico".to_string(),
            "ADMIN".to_string()
        ]));
        assert!(!technician_only(&[]));
        assert!(!technician_only(&["viewer".to_string()]));
    }
}
