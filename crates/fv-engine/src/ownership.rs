use crate::error::EngineError;
use fv_core::roles::has_elevated_role;
use fv_core::visit_contracts::{new_id, IdentityContext, Technician, PLACEHOLDER_TECHNICIAN_NAME};
use fv_storage::VisitStore;

/// Lazy technician reconciliation: match the external subject, then display
/// name, then email, before creating a fresh record. Deterministic and
/// order-fixed so records created through different entry points merge the
/// same way every time.
pub fn ensure_technician_record(
    store: &VisitStore,
    subject: &str,
    display_name: Option<&str>,
    email: Option<&str>,
) -> Result<Technician, EngineError> {
    if let Some(existing) = store.technician_by_subject(subject)? {
        return Ok(existing);
    }

    if let Some(name) = display_name {
        if let Some(mut existing) = store.technician_by_name(name)? {
            existing.subject = subject.to_string();
            if existing.email.is_none() {
                existing.email = email.map(str::to_string);
            }
            store.update_technician(&existing)?;
            return Ok(existing);
        }
    }

    if let Some(address) = email {
        if let Some(mut existing) = store.technician_by_email(address)? {
            existing.subject = subject.to_string();
            if existing.display_name.is_empty() {
                existing.display_name = display_name.unwrap_or(address).to_string();
            }
            store.update_technician(&existing)?;
            return Ok(existing);
        }
    }

    let created = Technician {
        id: new_id(),
        subject: subject.to_string(),
        display_name: display_name
            .unwrap_or(PLACEHOLDER_TECHNICIAN_NAME)
            .to_string(),
        email: email.map(str::to_string),
    };
    store.insert_technician(&created)?;
    Ok(created)
}

/// Ownership policy for mutations on one visit. Elevated roles pass and act
/// on behalf of the assigned technician; everyone else must resolve to the
/// visit's own technician record.
pub fn resolve_acting_technician(
    store: &VisitStore,
    identity: &IdentityContext,
    visit_technician_id: &str,
) -> Result<Technician, EngineError> {
    if has_elevated_role(&identity.roles) {
        return store
            .technician_by_id(visit_technician_id)?
            .ok_or(EngineError::TechnicianNotFound);
    }

    let subject = identity
        .subject
        .as_deref()
        .ok_or(EngineError::MissingIdentity)?;
    let acting = ensure_technician_record(
        store,
        subject,
        identity.display_name.as_deref(),
        identity.email.as_deref(),
    )?;
    if acting.id != visit_technician_id {
        return Err(EngineError::NotAssignedToVisit);
    }
    Ok(acting)
}
