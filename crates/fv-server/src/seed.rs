use chrono::{Duration, Utc};
use fv_core::visit_contracts::{
    new_id, ClientRecord, ClientStatus, GeoPoint, Technician, Visit, VisitStatus,
};
use fv_storage::{StorageError, VisitStore};
use tracing::info;

const SEED_SUBJECT: &str = "auth0|tec-carlos";

/// Loads a small demo roster with visits scheduled for today. Runs once;
/// a database that already carries the roster is left untouched.
pub fn seed_demo(store: &VisitStore) -> Result<(), StorageError> {
    if store.technician_by_subject(SEED_SUBJECT)?.is_some() {
        info!("demo data already present, skipping seed");
        return Ok(());
    }

    let carlos = Technician {
        id: new_id(),
        subject: SEED_SUBJECT.to_string(),
        display_name: "Carlos Pérez".to_string(),
        email: Some("carlos.perez@fieldvisits.local".to_string()),
    };
    let maria = Technician {
        id: new_id(),
        subject: "auth0|tec-maria".to_string(),
        display_name: "María López".to_string(),
        email: Some("maria.lopez@fieldvisits.local".to_string()),
    };
    store.insert_technician(&carlos)?;
    store.insert_technician(&maria)?;

    let ferreteria = ClientRecord {
        id: "cli-ferreteria".to_string(),
        name: "Ferretería El Tornillo".to_string(),
        email: Some("compras@eltornillo.gt".to_string()),
        phone: Some("+502 2222 1111".to_string()),
        address: Some("6a Avenida 12-34, Zona 1".to_string()),
        status: ClientStatus::Active,
        notes: None,
        point: Some(GeoPoint {
            lat: 14.64245,
            lng: -90.51336,
        }),
    };
    let farmacia = ClientRecord {
        id: "cli-farmacia".to_string(),
        name: "Farmacia La Bendición".to_string(),
        email: Some("admin@labendicion.gt".to_string()),
        phone: Some("+502 2333 4455".to_string()),
        address: Some("Boulevard Los Próceres, Zona 10".to_string()),
        status: ClientStatus::Active,
        notes: Some("Pedir acceso en garita".to_string()),
        point: Some(GeoPoint {
            lat: 14.59355,
            lng: -90.50882,
        }),
    };
    let panaderia = ClientRecord {
        id: "cli-panaderia".to_string(),
        name: "Panadería San Martín".to_string(),
        email: None,
        phone: None,
        address: Some("Calzada Roosevelt, Zona 7".to_string()),
        status: ClientStatus::Active,
        notes: None,
        point: None,
    };
    store.upsert_client(&ferreteria)?;
    store.upsert_client(&farmacia)?;
    store.upsert_client(&panaderia)?;

    let now = Utc::now();
    let visits = [
        demo_visit(&ferreteria, &carlos, now, now + Duration::hours(1)),
        demo_visit(
            &farmacia,
            &carlos,
            now + Duration::hours(2),
            now + Duration::hours(3),
        ),
        demo_visit(
            &panaderia,
            &maria,
            now + Duration::hours(1),
            now + Duration::hours(2),
        ),
    ];
    for visit in &visits {
        store.insert_visit(visit)?;
    }

    info!(
        clients = 3,
        technicians = 2,
        visits = visits.len(),
        "demo data seeded"
    );
    Ok(())
}

fn demo_visit(
    client: &ClientRecord,
    technician: &Technician,
    window_start: chrono::DateTime<Utc>,
    window_end: chrono::DateTime<Utc>,
) -> Visit {
    Visit {
        id: new_id(),
        client_id: client.id.clone(),
        technician_id: technician.id.clone(),
        scheduled_at: window_start,
        window_start: Some(window_start),
        window_end: Some(window_end),
        status: VisitStatus::Planned,
        notes: Some("Visita de mantenimiento".to_string()),
        started_at: None,
        completed_at: None,
        canceled_at: None,
        cancel_reason: None,
        check_in_at: None,
        check_in_point: None,
        check_out_at: None,
        check_out_point: None,
        planned_point: client.point,
        created_at: Utc::now(),
    }
}
