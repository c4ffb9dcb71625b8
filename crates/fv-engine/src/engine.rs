use crate::conflict::ensure_no_schedule_conflict;
use crate::directory::ClientDirectory;
use crate::error::EngineError;
use crate::idempotency::{ensure_once, IdempotencyDecision};
use crate::notifier::CompletionNotifier;
use crate::ownership::{ensure_technician_record, resolve_acting_technician};
use crate::requests::{
    BulkCreateRequest, CheckMeta, CheckRequest, CreateVisitRequest, ListQuery, UpdateVisitRequest,
};
use crate::summary::VisitSummary;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fv_core::config::VerificationConfig;
use fv_core::geo::haversine_meters;
use fv_core::roles::technician_only;
use fv_core::time_window::{in_check_in_window, in_check_out_window};
use fv_core::tz::day_bounds_utc;
use fv_core::visit_contracts::{
    new_id, CheckKind, ClientRecord, ClientStatus, CompletedClient, CompletedTechnician, GeoPoint,
    IdentityContext, Technician, Visit, VisitCheck, VisitCompletedEvent, VisitStatus,
};
use fv_storage::{CheckInsert, VisitQuery, VisitStore};
use tracing::{info, warn};

const DEFAULT_CANCEL_REASON: &str = "N/A";

/// Visit lifecycle and field-verification engine. Owns the store; the
/// directory and notifier are pluggable edges.
pub struct VisitEngine {
    store: VisitStore,
    directory: Box<dyn ClientDirectory>,
    notifier: Box<dyn CompletionNotifier>,
    config: VerificationConfig,
    tz: Tz,
}

impl VisitEngine {
    pub fn new(
        store: VisitStore,
        directory: Box<dyn ClientDirectory>,
        notifier: Box<dyn CompletionNotifier>,
        config: VerificationConfig,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            config,
            tz,
        }
    }

    pub fn store(&self) -> &VisitStore {
        &self.store
    }

    // ---- planning ----

    pub fn create_visit(&self, request: &CreateVisitRequest) -> Result<VisitSummary, EngineError> {
        let client = self.resolve_client(request.client_id.as_deref(), request.client_name.as_deref())?;
        let technician = self.resolve_technician(
            request.technician_id.as_deref(),
            request.technician_name.as_deref(),
        )?;

        validate_window(request.window_start, request.window_end)?;
        let scheduled_at = request
            .scheduled_at
            .or(request.window_start)
            .unwrap_or_else(Utc::now);
        let window = explicit_window(request.window_start, request.window_end);
        ensure_no_schedule_conflict(
            &self.store,
            &technician.id,
            scheduled_at,
            window,
            None,
            self.tz,
        )?;

        let visit = Visit {
            id: new_id(),
            client_id: client.id.clone(),
            technician_id: technician.id.clone(),
            scheduled_at,
            window_start: request.window_start,
            window_end: request.window_end,
            status: VisitStatus::Planned,
            notes: request.notes.clone(),
            started_at: None,
            completed_at: None,
            canceled_at: None,
            cancel_reason: None,
            check_in_at: None,
            check_in_point: None,
            check_out_at: None,
            check_out_point: None,
            planned_point: request.planned_point,
            created_at: Utc::now(),
        };
        self.store.insert_visit(&visit)?;
        info!(visit_id = %visit.id, client = %client.name, "visit planned");
        Ok(VisitSummary::build(&visit, &client, &technician))
    }

    pub fn bulk_create(
        &self,
        request: &BulkCreateRequest,
    ) -> Result<Vec<VisitSummary>, EngineError> {
        let mut created = Vec::with_capacity(request.items.len());
        for item in &request.items {
            created.push(self.create_visit(item)?);
        }
        Ok(created)
    }

    pub fn update_visit(
        &self,
        id: &str,
        request: &UpdateVisitRequest,
    ) -> Result<VisitSummary, EngineError> {
        let mut visit = self
            .store
            .visit_by_id(id)?
            .ok_or(EngineError::VisitNotFound)?;

        if request.client_id.is_some() || request.client_name.is_some() {
            let client = self.resolve_client(
                request.client_id.as_deref(),
                request.client_name.as_deref(),
            )?;
            visit.client_id = client.id;
        }
        if request.technician_id.is_some() || request.technician_name.is_some() {
            let technician = self.resolve_technician(
                request.technician_id.as_deref(),
                request.technician_name.as_deref(),
            )?;
            visit.technician_id = technician.id;
        }

        if let Some(scheduled_at) = request.scheduled_at {
            visit.scheduled_at = scheduled_at;
        }
        if request.window_start.is_some() {
            visit.window_start = request.window_start;
        }
        if request.window_end.is_some() {
            visit.window_end = request.window_end;
        }
        if request.notes.is_some() {
            visit.notes = request.notes.clone();
        }
        if request.planned_point.is_some() {
            visit.planned_point = request.planned_point;
        }

        validate_window(visit.window_start, visit.window_end)?;
        ensure_no_schedule_conflict(
            &self.store,
            &visit.technician_id,
            visit.scheduled_at,
            explicit_window(visit.window_start, visit.window_end),
            Some(&visit.id),
            self.tz,
        )?;

        self.store.update_visit(&visit)?;
        self.summarize(&visit)
    }

    pub fn get_visit(&self, id: &str) -> Result<VisitSummary, EngineError> {
        let visit = self
            .store
            .visit_by_id(id)?
            .ok_or(EngineError::VisitNotFound)?;
        self.summarize(&visit)
    }

    pub fn list_visits(
        &self,
        query: &ListQuery,
        identity: &IdentityContext,
    ) -> Result<Vec<VisitSummary>, EngineError> {
        let (from, to) = match query.date {
            Some(date) => {
                let (start, end) = day_bounds_utc(date, self.tz);
                (Some(start), Some(end))
            }
            None => (query.from, query.to),
        };

        // Technician-scoped callers only ever see their own schedule.
        let technician_id = if query.mine || technician_only(&identity.roles) {
            let subject = identity
                .subject
                .as_deref()
                .ok_or(EngineError::MissingIdentity)?;
            let technician = ensure_technician_record(
                &self.store,
                subject,
                identity.display_name.as_deref(),
                identity.email.as_deref(),
            )?;
            Some(technician.id)
        } else {
            query.technician_id.clone()
        };

        let visits = self.store.list_visits(&VisitQuery {
            from,
            to,
            technician_id,
            client_id: query.client_id.clone(),
            status: query.status,
        })?;
        visits.iter().map(|visit| self.summarize(visit)).collect()
    }

    pub fn list_today(
        &self,
        identity: &IdentityContext,
    ) -> Result<Vec<VisitSummary>, EngineError> {
        self.list_visits(
            &ListQuery {
                date: Some(Utc::now()),
                ..ListQuery::default()
            },
            identity,
        )
    }

    // ---- lifecycle ----

    pub fn set_status(
        &self,
        id: &str,
        target: VisitStatus,
        reason: Option<&str>,
        identity: &IdentityContext,
    ) -> Result<VisitSummary, EngineError> {
        let mut visit = self
            .store
            .visit_by_id(id)?
            .ok_or(EngineError::VisitNotFound)?;

        // Completing an already completed visit is a no-op replay; every
        // other repeated terminal transition is an error.
        if visit.status == VisitStatus::Done && target == VisitStatus::Done {
            return self.summarize(&visit);
        }

        resolve_acting_technician(&self.store, identity, &visit.technician_id)?;

        if !visit.status.allows_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                from: visit.status,
                to: target,
            });
        }

        let now = Utc::now();
        match target {
            VisitStatus::InProgress => {
                visit.started_at.get_or_insert(now);
                visit.check_in_at.get_or_insert(now);
            }
            VisitStatus::Done => {
                visit.completed_at.get_or_insert(now);
                visit.check_out_at.get_or_insert(now);
            }
            VisitStatus::Canceled => {
                visit.canceled_at = Some(now);
                visit.cancel_reason = Some(
                    reason
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .unwrap_or(DEFAULT_CANCEL_REASON)
                        .to_string(),
                );
            }
            VisitStatus::NoShow => {
                visit.completed_at.get_or_insert(now);
            }
            VisitStatus::Planned => {}
        }
        visit.status = target;
        self.store.update_visit(&visit)?;

        if target == VisitStatus::Done {
            self.publish_completed(&visit)?;
        }
        self.summarize(&visit)
    }

    pub fn complete(
        &self,
        id: &str,
        identity: &IdentityContext,
    ) -> Result<VisitSummary, EngineError> {
        self.set_status(id, VisitStatus::Done, None, identity)
    }

    // ---- field verification ----

    pub fn check_in(
        &self,
        id: &str,
        request: &CheckRequest,
        meta: &CheckMeta,
        identity: &IdentityContext,
    ) -> Result<VisitCheck, EngineError> {
        self.record_check(id, CheckKind::CheckIn, request, meta, identity)
    }

    pub fn check_out(
        &self,
        id: &str,
        request: &CheckRequest,
        meta: &CheckMeta,
        identity: &IdentityContext,
    ) -> Result<VisitCheck, EngineError> {
        self.record_check(id, CheckKind::CheckOut, request, meta, identity)
    }

    pub fn list_checks(&self, id: &str) -> Result<Vec<VisitCheck>, EngineError> {
        self.store
            .visit_by_id(id)?
            .ok_or(EngineError::VisitNotFound)?;
        Ok(self.store.checks_for_visit(id)?)
    }

    fn record_check(
        &self,
        id: &str,
        kind: CheckKind,
        request: &CheckRequest,
        meta: &CheckMeta,
        identity: &IdentityContext,
    ) -> Result<VisitCheck, EngineError> {
        let mut visit = self
            .store
            .visit_by_id(id)?
            .ok_or(EngineError::VisitNotFound)?;
        let acting = resolve_acting_technician(&self.store, identity, &visit.technician_id)?;

        let decision = ensure_once(&self.store, meta.idempotency_key.as_deref(), request)?;
        let (key_hash, fingerprint) = match decision {
            IdempotencyDecision::Replay(existing) => return Ok(existing),
            IdempotencyDecision::Proceed {
                key_hash,
                fingerprint,
            } => (key_hash, fingerprint),
        };

        if visit.status.is_terminal() {
            let to = match kind {
                CheckKind::CheckIn => VisitStatus::InProgress,
                CheckKind::CheckOut => VisitStatus::Done,
            };
            return Err(EngineError::InvalidTransition {
                from: visit.status,
                to,
            });
        }

        // Duplicate and ordering guards are keyed on recorded events, not on
        // the visit's back-filled instants: a manual start stamps
        // `check_in_at` without producing a CHECK_IN event.
        match kind {
            CheckKind::CheckIn => {
                if self.store.check_for_visit(id, CheckKind::CheckIn)?.is_some() {
                    return Err(EngineError::DuplicateCheckIn);
                }
            }
            CheckKind::CheckOut => {
                if self.store.check_for_visit(id, CheckKind::CheckIn)?.is_none() {
                    return Err(EngineError::MissingCheckIn);
                }
                if self
                    .store
                    .check_for_visit(id, CheckKind::CheckOut)?
                    .is_some()
                {
                    return Err(EngineError::DuplicateCheckOut);
                }
            }
        }

        let now = Utc::now();
        let (start, end) = visit.effective_window();
        let in_window = match kind {
            CheckKind::CheckIn => in_check_in_window(now, start, end, self.config.early_grace_min),
            CheckKind::CheckOut => in_check_out_window(now, start, end, self.config.late_grace_min),
        };
        if !in_window {
            return Err(match kind {
                CheckKind::CheckIn => EngineError::OutsideCheckInWindow,
                CheckKind::CheckOut => EngineError::OutsideCheckOutWindow,
            });
        }

        let client = self
            .store
            .client_by_id(&visit.client_id)?
            .ok_or(EngineError::ClientNotFound)?;
        let anchor = visit.planned_point.or(client.point);
        let point = request.point();
        let (distance, verified, message) = self.verify_geofence(anchor, point)?;

        let check = VisitCheck {
            id: new_id(),
            visit_id: visit.id.clone(),
            kind,
            technician_id: acting.id.clone(),
            occurred_at: now,
            device_at: request.device_at,
            point,
            distance_meters: distance,
            method: request.method.unwrap_or_default(),
            source: request.source.unwrap_or_default(),
            verified,
            verification_msg: message,
            device_id: request.device_id.clone(),
            ip: meta.ip.clone(),
            notes: request.notes.clone(),
            photo_url: request.photo_url.clone(),
            idem_key_hash: key_hash,
            fingerprint,
        };

        // The UNIQUE constraints are the serialization point for concurrent
        // submissions; a losing insert yields the winner's event.
        match self.store.insert_check(&check)? {
            CheckInsert::Existing(existing) => return Ok(existing),
            CheckInsert::Inserted => {}
        }

        match kind {
            CheckKind::CheckIn => {
                visit.check_in_at = Some(now);
                visit.check_in_point = point;
                if visit.status == VisitStatus::Planned {
                    visit.status = VisitStatus::InProgress;
                    visit.started_at.get_or_insert(now);
                }
            }
            CheckKind::CheckOut => {
                visit.check_out_at = Some(now);
                visit.check_out_point = point;
            }
        }
        self.store.update_visit(&visit)?;
        info!(visit_id = %visit.id, kind = %kind, verified, "check recorded");
        Ok(check)
    }

    /// Distance against the geofence anchor. Enforcement requires both the
    /// anchor and submitted coordinates to be present and within the radius;
    /// otherwise distance is recorded opportunistically.
    fn verify_geofence(
        &self,
        anchor: Option<GeoPoint>,
        point: Option<GeoPoint>,
    ) -> Result<(Option<f64>, bool, String), EngineError> {
        let Some(anchor) = anchor else {
            if self.config.require_geofence {
                return Err(EngineError::OutsideGeofence);
            }
            return Ok((None, true, "No geofence anchor".to_string()));
        };
        let Some(point) = point else {
            if self.config.require_geofence {
                return Err(EngineError::OutsideGeofence);
            }
            return Ok((None, false, "No coordinates provided".to_string()));
        };

        let distance = haversine_meters(anchor, point);
        if distance <= self.config.radius_meters {
            return Ok((Some(distance), true, "OK".to_string()));
        }
        if self.config.require_geofence {
            return Err(EngineError::OutsideGeofence);
        }
        Ok((
            Some(distance),
            false,
            format!("Outside geofence: {distance:.0} m"),
        ))
    }

    // ---- directories ----

    pub fn list_technicians(&self) -> Result<Vec<Technician>, EngineError> {
        Ok(self.store.technicians()?)
    }

    /// Active clients, local cache refreshed from the remote directory when
    /// it answers. Directory failures degrade to cache-only results.
    pub fn list_clients(&self, search: Option<&str>) -> Result<Vec<ClientRecord>, EngineError> {
        match self.directory.search_clients(search.unwrap_or("")) {
            Ok(remote) => {
                for client in remote {
                    self.store.upsert_client(&client.into_record())?;
                }
            }
            Err(err) => warn!(error = %err, "client directory unavailable"),
        }
        Ok(self.store.search_active_clients(search)?)
    }

    // ---- internals ----

    fn resolve_client(
        &self,
        client_id: Option<&str>,
        client_name: Option<&str>,
    ) -> Result<ClientRecord, EngineError> {
        let client = if let Some(id) = client_id {
            match self.store.client_by_id(id)? {
                Some(found) => found,
                None => self.fetch_remote_client(id)?,
            }
        } else if let Some(name) = client_name {
            match self.store.client_by_name(name)? {
                Some(found) => found,
                None => self.search_remote_client(name)?,
            }
        } else {
            return Err(EngineError::MissingClientRef);
        };

        if client.status == ClientStatus::Inactive {
            return Err(EngineError::ClientInactive);
        }
        Ok(client)
    }

    fn fetch_remote_client(&self, id: &str) -> Result<ClientRecord, EngineError> {
        let remote = match self.directory.find_client(id) {
            Ok(found) => found,
            Err(err) => {
                warn!(client_id = %id, error = %err, "client directory lookup failed");
                None
            }
        };
        let record = remote.ok_or(EngineError::ClientNotFound)?.into_record();
        self.store.upsert_client(&record)?;
        Ok(record)
    }

    fn search_remote_client(&self, name: &str) -> Result<ClientRecord, EngineError> {
        let results = match self.directory.search_clients(name) {
            Ok(found) => found,
            Err(err) => {
                warn!(client_name = %name, error = %err, "client directory search failed");
                Vec::new()
            }
        };
        let record = results
            .into_iter()
            .find(|client| client.name.eq_ignore_ascii_case(name))
            .ok_or(EngineError::ClientNotFound)?
            .into_record();
        self.store.upsert_client(&record)?;
        Ok(record)
    }

    fn resolve_technician(
        &self,
        technician_id: Option<&str>,
        technician_name: Option<&str>,
    ) -> Result<Technician, EngineError> {
        if let Some(id) = technician_id {
            if let Some(found) = self.store.technician_by_id(id)? {
                return Ok(found);
            }
            // An unseen id is treated as an external identity subject and a
            // record is created lazily, same as the check-in path.
            return ensure_technician_record(&self.store, id, None, None);
        }
        let name = technician_name.ok_or(EngineError::MissingTechnicianRef)?;
        if let Some(found) = self.store.technician_by_name(name)? {
            return Ok(found);
        }
        let created = Technician {
            id: new_id(),
            subject: format!("local-{}", new_id()),
            display_name: name.to_string(),
            email: None,
        };
        self.store.insert_technician(&created)?;
        Ok(created)
    }

    fn summarize(&self, visit: &Visit) -> Result<VisitSummary, EngineError> {
        let client = self
            .store
            .client_by_id(&visit.client_id)?
            .ok_or(EngineError::ClientNotFound)?;
        let technician = self
            .store
            .technician_by_id(&visit.technician_id)?
            .ok_or(EngineError::TechnicianNotFound)?;
        Ok(VisitSummary::build(visit, &client, &technician))
    }

    fn publish_completed(&self, visit: &Visit) -> Result<(), EngineError> {
        let client = self
            .store
            .client_by_id(&visit.client_id)?
            .ok_or(EngineError::ClientNotFound)?;
        let technician = self
            .store
            .technician_by_id(&visit.technician_id)?
            .ok_or(EngineError::TechnicianNotFound)?;
        let completed_at = visit.completed_at.unwrap_or_else(Utc::now);
        let event = VisitCompletedEvent {
            visit_id: visit.id.clone(),
            completed_at,
            client: CompletedClient {
                name: client.name.clone(),
                email: client.email.clone(),
                address: client.address.clone(),
            },
            technician: CompletedTechnician {
                name: technician.display_name.clone(),
                email: technician.email.clone(),
            },
            notes: visit.notes.clone(),
            summary_html: Some(render_summary_html(visit, &client, &technician, completed_at)),
        };

        // Delivery is at-least-once downstream; a failed notification never
        // rolls back the completed visit.
        if let Err(err) = self.notifier.notify_visit_completed(&event) {
            warn!(visit_id = %visit.id, error = %err, "completion notification failed");
        }
        Ok(())
    }
}

fn validate_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<(), EngineError> {
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(EngineError::InvalidWindow);
        }
    }
    Ok(())
}

fn explicit_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match (start, end) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => None,
    }
}

fn render_summary_html(
    visit: &Visit,
    client: &ClientRecord,
    technician: &Technician,
    completed_at: DateTime<Utc>,
) -> String {
    let notes = visit.notes.as_deref().unwrap_or("-");
    format!(
        "<h2>Visita completada</h2>\
         <p><b>Cliente:</b> {}</p>\
         <p><b>Técnico:</b> {}</p>\
         <p><b>Finalizada:</b> {}</p>\
         <p><b>Notas:</b> {}</p>",
        client.name,
        technician.display_name,
        completed_at.to_rfc3339(),
        notes
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, NullDirectory, RemoteClient};
    use crate::notifier::NotifyError;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CLIENT_POINT: GeoPoint = GeoPoint {
        lat: 14.64072,
        lng: -90.51327,
    };

    struct CountingNotifier {
        delivered: Arc<AtomicUsize>,
    }

    impl CompletionNotifier for CountingNotifier {
        fn notify_visit_completed(&self, _event: &VisitCompletedEvent) -> Result<(), NotifyError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StaticDirectory {
        clients: Vec<RemoteClient>,
    }

    impl ClientDirectory for StaticDirectory {
        fn find_client(&self, id: &str) -> Result<Option<RemoteClient>, DirectoryError> {
            Ok(self.clients.iter().find(|c| c.id == id).cloned())
        }

        fn search_clients(&self, query: &str) -> Result<Vec<RemoteClient>, DirectoryError> {
            Ok(self
                .clients
                .iter()
                .filter(|c| c.name.to_lowercase().contains(&query.to_lowercase()))
                .cloned()
                .collect())
        }
    }

    fn seeded_store() -> (VisitStore, ClientRecord, Technician) {
        let store = VisitStore::open_in_memory().expect("open db");
        let client = ClientRecord {
            id: "c-1".to_string(),
            name: "Acme S.A.".to_string(),
            email: Some("ops@acme.local".to_string()),
            phone: None,
            address: Some("Zona 4".to_string()),
            status: ClientStatus::Active,
            notes: None,
            point: Some(CLIENT_POINT),
        };
        let technician = Technician {
            id: new_id(),
            subject: "sub-tec1".to_string(),
            display_name: "Tec 1".to_string(),
            email: Some("tec1@fieldvisits.local".to_string()),
        };
        store.upsert_client(&client).expect("upsert client");
        store
            .insert_technician(&technician)
            .expect("insert technician");
        (store, client, technician)
    }

    fn engine_with(store: VisitStore, config: VerificationConfig) -> (VisitEngine, Arc<AtomicUsize>) {
        let delivered = Arc::new(AtomicUsize::new(0));
        let engine = VisitEngine::new(
            store,
            Box::new(NullDirectory),
            Box::new(CountingNotifier {
                delivered: Arc::clone(&delivered),
            }),
            config,
            chrono_tz::America::Guatemala,
        );
        (engine, delivered)
    }

    fn engine() -> (VisitEngine, ClientRecord, Technician, Arc<AtomicUsize>) {
        let (store, client, technician) = seeded_store();
        let (engine, delivered) = engine_with(store, VerificationConfig::default());
        (engine, client, technician, delivered)
    }

    fn technician_identity(subject: &str) -> IdentityContext {
        IdentityContext {
            subject: Some(subject.to_string()),
            roles: vec!["TECNICO".to_string()],
            display_name: None,
            email: None,
        }
    }

    fn admin_identity() -> IdentityContext {
        IdentityContext {
            subject: Some("sub-admin".to_string()),
            roles: vec!["ADMIN".to_string()],
            display_name: Some("Admin".to_string()),
            email: None,
        }
    }

    /// Visit whose window contains the present instant.
    fn open_visit(engine: &VisitEngine, client: &ClientRecord, technician: &Technician) -> String {
        let now = Utc::now();
        let summary = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some(technician.id.clone()),
                scheduled_at: Some(now),
                window_start: Some(now - Duration::minutes(10)),
                window_end: Some(now + Duration::minutes(50)),
                notes: Some("Mantenimiento".to_string()),
                ..CreateVisitRequest::default()
            })
            .expect("create visit");
        summary.id
    }

    fn at_client() -> CheckRequest {
        CheckRequest {
            lat: Some(CLIENT_POINT.lat),
            lng: Some(CLIENT_POINT.lng),
            ..CheckRequest::default()
        }
    }

    #[test]
    fn full_round_trip_completes_once() {
        let (engine, client, technician, delivered) = engine();
        let visit_id = open_visit(&engine, &client, &technician);
        let identity = technician_identity(&technician.subject);

        let check_in = engine
            .check_in(&visit_id, &at_client(), &CheckMeta::default(), &identity)
            .expect("check in");
        assert!(check_in.verified);
        assert!(check_in.distance_meters.expect("distance") < 1.0);
        assert_eq!(
            engine.get_visit(&visit_id).expect("get").status,
            VisitStatus::InProgress
        );

        engine
            .check_out(&visit_id, &at_client(), &CheckMeta::default(), &identity)
            .expect("check out");
        let done = engine.complete(&visit_id, &identity).expect("complete");
        assert_eq!(done.status, VisitStatus::Done);
        assert!(done.completed_at.is_some());
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        // Completing again replays the final state without another event.
        let replay = engine.complete(&visit_id, &identity).expect("re-complete");
        assert_eq!(replay.status, VisitStatus::Done);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_and_out_of_order_checks_are_rejected() {
        let (engine, client, technician, _) = engine();
        let identity = technician_identity(&technician.subject);

        let first = open_visit(&engine, &client, &technician);
        assert!(matches!(
            engine.check_out(&first, &at_client(), &CheckMeta::default(), &identity),
            Err(EngineError::MissingCheckIn)
        ));

        engine
            .check_in(&first, &at_client(), &CheckMeta::default(), &identity)
            .expect("check in");
        assert!(matches!(
            engine.check_in(&first, &at_client(), &CheckMeta::default(), &identity),
            Err(EngineError::DuplicateCheckIn)
        ));

        engine
            .check_out(&first, &at_client(), &CheckMeta::default(), &identity)
            .expect("check out");
        assert!(matches!(
            engine.check_out(&first, &at_client(), &CheckMeta::default(), &identity),
            Err(EngineError::DuplicateCheckOut)
        ));
    }

    #[test]
    fn check_in_after_manual_start_records_the_event() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);

        // A supervisor starting the visit back-fills the check-in instant
        // without recording any event.
        let started = engine
            .set_status(&visit_id, VisitStatus::InProgress, None, &admin_identity())
            .expect("manual start");
        assert_eq!(started.status, VisitStatus::InProgress);
        assert!(started.check_in_at.is_some());
        assert!(engine.list_checks(&visit_id).expect("checks").is_empty());

        let identity = technician_identity(&technician.subject);
        engine
            .check_in(&visit_id, &at_client(), &CheckMeta::default(), &identity)
            .expect("check in after manual start");
        assert_eq!(engine.list_checks(&visit_id).expect("checks").len(), 1);
    }

    #[test]
    fn idempotent_check_in_replays_the_stored_event() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);
        let identity = technician_identity(&technician.subject);
        let meta = CheckMeta {
            ip: Some("10.0.0.7".to_string()),
            idempotency_key: Some("retry-123".to_string()),
        };

        let first = engine
            .check_in(&visit_id, &at_client(), &meta, &identity)
            .expect("check in");
        let replay = engine
            .check_in(&visit_id, &at_client(), &meta, &identity)
            .expect("replay");
        assert_eq!(replay.id, first.id);
        assert_eq!(engine.list_checks(&visit_id).expect("checks").len(), 1);

        // Same key with a different payload is a protocol error.
        let mut altered = at_client();
        altered.notes = Some("otra cosa".to_string());
        assert!(matches!(
            engine.check_in(&visit_id, &altered, &meta, &identity),
            Err(EngineError::IdempotencyKeyReused)
        ));
    }

    #[test]
    fn ownership_scopes_checks_to_the_assigned_technician() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);

        let stranger = IdentityContext {
            subject: Some("sub-tec2".to_string()),
            roles: vec!["Técnico".to_string()],
            display_name: Some("Tec 2".to_string()),
            email: Some("tec2@fieldvisits.local".to_string()),
        };
        assert!(matches!(
            engine.check_in(&visit_id, &at_client(), &CheckMeta::default(), &stranger),
            Err(EngineError::NotAssignedToVisit)
        ));

        assert!(matches!(
            engine.check_in(
                &visit_id,
                &at_client(),
                &CheckMeta::default(),
                &IdentityContext::default()
            ),
            Err(EngineError::MissingIdentity)
        ));

        // Elevated callers pass and the event stays attributed to the
        // assigned technician.
        let check = engine
            .check_in(&visit_id, &at_client(), &CheckMeta::default(), &admin_identity())
            .expect("admin check in");
        assert_eq!(check.technician_id, technician.id);
    }

    #[test]
    fn check_in_respects_the_time_window() {
        let (engine, client, technician, _) = engine();
        let identity = technician_identity(&technician.subject);
        let now = Utc::now();

        let stale = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some(technician.id.clone()),
                scheduled_at: Some(now - Duration::hours(3)),
                window_start: Some(now - Duration::hours(3)),
                window_end: Some(now - Duration::hours(2)),
                ..CreateVisitRequest::default()
            })
            .expect("create stale visit");
        assert!(matches!(
            engine.check_in(&stale.id, &at_client(), &CheckMeta::default(), &identity),
            Err(EngineError::OutsideCheckInWindow)
        ));

        // Twenty minutes ahead of the window is inside the early grace.
        let upcoming = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some(technician.id.clone()),
                scheduled_at: Some(now + Duration::minutes(20)),
                window_start: Some(now + Duration::minutes(20)),
                window_end: Some(now + Duration::minutes(80)),
                ..CreateVisitRequest::default()
            })
            .expect("create upcoming visit");
        engine
            .check_in(&upcoming.id, &at_client(), &CheckMeta::default(), &identity)
            .expect("early grace check in");
    }

    #[test]
    fn geofence_is_enforced_against_the_client_anchor() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);
        let identity = technician_identity(&technician.subject);

        let far = CheckRequest {
            lat: Some(CLIENT_POINT.lat + 0.01),
            lng: Some(CLIENT_POINT.lng),
            ..CheckRequest::default()
        };
        assert!(matches!(
            engine.check_in(&visit_id, &far, &CheckMeta::default(), &identity),
            Err(EngineError::OutsideGeofence)
        ));
        assert!(matches!(
            engine.check_in(
                &visit_id,
                &CheckRequest::default(),
                &CheckMeta::default(),
                &identity
            ),
            Err(EngineError::OutsideGeofence)
        ));
    }

    #[test]
    fn unenforced_geofence_records_distance_opportunistically() {
        let (store, client, technician) = seeded_store();
        let (engine, _) = engine_with(
            store,
            VerificationConfig {
                require_geofence: false,
                ..VerificationConfig::default()
            },
        );
        let visit_id = open_visit(&engine, &client, &technician);
        let identity = technician_identity(&technician.subject);

        let far = CheckRequest {
            lat: Some(CLIENT_POINT.lat + 0.01),
            lng: Some(CLIENT_POINT.lng),
            ..CheckRequest::default()
        };
        let check = engine
            .check_in(&visit_id, &far, &CheckMeta::default(), &identity)
            .expect("check in");
        assert!(!check.verified);
        assert!(check.distance_meters.expect("distance") > 1_000.0);
        assert!(check.verification_msg.starts_with("Outside geofence"));
    }

    fn unlocated_client() -> ClientRecord {
        ClientRecord {
            id: "c-2".to_string(),
            name: "Sin Ubicación".to_string(),
            email: None,
            phone: None,
            address: None,
            status: ClientStatus::Active,
            notes: None,
            point: None,
        }
    }

    #[test]
    fn enforced_geofence_requires_an_anchor() {
        let (store, _, technician) = seeded_store();
        let unlocated = unlocated_client();
        store.upsert_client(&unlocated).expect("upsert client");
        let (engine, _) = engine_with(store, VerificationConfig::default());
        let visit_id = open_visit(&engine, &unlocated, &technician);

        assert!(matches!(
            engine.check_in(
                &visit_id,
                &at_client(),
                &CheckMeta::default(),
                &technician_identity(&technician.subject),
            ),
            Err(EngineError::OutsideGeofence)
        ));
    }

    #[test]
    fn unenforced_visit_without_anchor_skips_the_geofence() {
        let (store, _, technician) = seeded_store();
        let unlocated = unlocated_client();
        store.upsert_client(&unlocated).expect("upsert client");
        let (engine, _) = engine_with(
            store,
            VerificationConfig {
                require_geofence: false,
                ..VerificationConfig::default()
            },
        );
        let visit_id = open_visit(&engine, &unlocated, &technician);

        let check = engine
            .check_in(
                &visit_id,
                &CheckRequest::default(),
                &CheckMeta::default(),
                &technician_identity(&technician.subject),
            )
            .expect("check in");
        assert!(check.verified);
        assert!(check.distance_meters.is_none());
    }

    #[test]
    fn geofence_boundary_is_inclusive_at_the_radius() {
        let nearby = GeoPoint {
            lat: CLIENT_POINT.lat + 150.0 / 111_195.0,
            lng: CLIENT_POINT.lng,
        };
        let distance = haversine_meters(CLIENT_POINT, nearby);
        let request = CheckRequest {
            lat: Some(nearby.lat),
            lng: Some(nearby.lng),
            ..CheckRequest::default()
        };

        let (store, client, technician) = seeded_store();
        let (engine, _) = engine_with(
            store,
            VerificationConfig {
                radius_meters: distance,
                ..VerificationConfig::default()
            },
        );
        let visit_id = open_visit(&engine, &client, &technician);
        let at_radius = engine
            .check_in(
                &visit_id,
                &request,
                &CheckMeta::default(),
                &technician_identity(&technician.subject),
            )
            .expect("boundary check in");
        assert!(at_radius.verified);

        // A radius one meter short of the distance rejects.
        let (store, client, technician) = seeded_store();
        let (engine, _) = engine_with(
            store,
            VerificationConfig {
                radius_meters: distance - 1.0,
                ..VerificationConfig::default()
            },
        );
        let visit_id = open_visit(&engine, &client, &technician);
        assert!(matches!(
            engine.check_in(
                &visit_id,
                &request,
                &CheckMeta::default(),
                &technician_identity(&technician.subject),
            ),
            Err(EngineError::OutsideGeofence)
        ));
    }

    #[test]
    fn lifecycle_transitions_follow_the_table() {
        let (engine, client, technician, delivered) = engine();
        let identity = admin_identity();

        let planned = open_visit(&engine, &client, &technician);
        assert!(matches!(
            engine.set_status(&planned, VisitStatus::Done, None, &identity),
            Err(EngineError::InvalidTransition {
                from: VisitStatus::Planned,
                to: VisitStatus::Done,
            })
        ));

        let canceled = engine
            .set_status(&planned, VisitStatus::Canceled, Some("  "), &identity)
            .expect("cancel");
        assert_eq!(canceled.status, VisitStatus::Canceled);
        assert_eq!(canceled.cancel_reason.as_deref(), Some("N/A"));
        assert!(canceled.canceled_at.is_some());

        // Repeated cancellation is not a replay.
        assert!(matches!(
            engine.set_status(&planned, VisitStatus::Canceled, None, &identity),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);

        let now = Utc::now();
        let other = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some(technician.id.clone()),
                scheduled_at: Some(now),
                window_start: Some(now + Duration::hours(2)),
                window_end: Some(now + Duration::hours(3)),
                ..CreateVisitRequest::default()
            })
            .expect("create visit");
        let skipped = engine
            .set_status(&other.id, VisitStatus::NoShow, None, &identity)
            .expect("no show");
        assert_eq!(skipped.status, VisitStatus::NoShow);
        assert!(skipped.completed_at.is_some());
    }

    #[test]
    fn explicit_cancel_reason_is_kept() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);
        let canceled = engine
            .set_status(
                &visit_id,
                VisitStatus::Canceled,
                Some("Cliente reagendó"),
                &admin_identity(),
            )
            .expect("cancel");
        assert_eq!(canceled.cancel_reason.as_deref(), Some("Cliente reagendó"));
    }

    #[test]
    fn overlapping_windows_conflict_including_touching_endpoints() {
        let (engine, client, technician, _) = engine();
        let now = Utc::now();
        let base = CreateVisitRequest {
            client_id: Some(client.id.clone()),
            technician_id: Some(technician.id.clone()),
            scheduled_at: Some(now),
            window_start: Some(now),
            window_end: Some(now + Duration::hours(1)),
            ..CreateVisitRequest::default()
        };
        let first = engine.create_visit(&base).expect("first visit");

        assert!(matches!(
            engine.create_visit(&CreateVisitRequest {
                window_start: Some(now + Duration::minutes(30)),
                window_end: Some(now + Duration::minutes(90)),
                ..base.clone()
            }),
            Err(EngineError::ScheduleConflict)
        ));
        // Closed intervals: sharing an endpoint still conflicts.
        assert!(matches!(
            engine.create_visit(&CreateVisitRequest {
                window_start: Some(now + Duration::hours(1)),
                window_end: Some(now + Duration::hours(2)),
                ..base.clone()
            }),
            Err(EngineError::ScheduleConflict)
        ));
        // Disjoint later window is fine, and so is a windowless visit.
        engine
            .create_visit(&CreateVisitRequest {
                window_start: Some(now + Duration::hours(1) + Duration::milliseconds(1)),
                window_end: Some(now + Duration::hours(2)),
                ..base.clone()
            })
            .expect("disjoint visit");
        engine
            .create_visit(&CreateVisitRequest {
                window_start: None,
                window_end: None,
                ..base.clone()
            })
            .expect("windowless visit");

        // Rescheduling a visit never conflicts with itself.
        engine
            .update_visit(
                &first.id,
                &UpdateVisitRequest {
                    notes: Some("ajuste".to_string()),
                    ..UpdateVisitRequest::default()
                },
            )
            .expect("update against own window");
    }

    #[test]
    fn update_rewrites_window_and_notes() {
        let (engine, client, technician, _) = engine();
        let visit_id = open_visit(&engine, &client, &technician);
        let now = Utc::now();

        let updated = engine
            .update_visit(
                &visit_id,
                &UpdateVisitRequest {
                    window_start: Some(now + Duration::hours(4)),
                    window_end: Some(now + Duration::hours(5)),
                    notes: Some("Reprogramada".to_string()),
                    ..UpdateVisitRequest::default()
                },
            )
            .expect("update");
        assert_eq!(updated.window_start, Some(now + Duration::hours(4)));
        assert_eq!(updated.notes.as_deref(), Some("Reprogramada"));

        assert!(matches!(
            engine.update_visit(
                &visit_id,
                &UpdateVisitRequest {
                    window_start: Some(now + Duration::hours(5)),
                    window_end: Some(now + Duration::hours(4)),
                    ..UpdateVisitRequest::default()
                },
            ),
            Err(EngineError::InvalidWindow)
        ));
        assert!(matches!(
            engine.update_visit("missing-id", &UpdateVisitRequest::default()),
            Err(EngineError::VisitNotFound)
        ));
    }

    #[test]
    fn creation_validates_references() {
        let (engine, client, _, _) = engine();
        assert!(matches!(
            engine.create_visit(&CreateVisitRequest::default()),
            Err(EngineError::MissingClientRef)
        ));
        assert!(matches!(
            engine.create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                ..CreateVisitRequest::default()
            }),
            Err(EngineError::MissingTechnicianRef)
        ));
        assert!(matches!(
            engine.create_visit(&CreateVisitRequest {
                client_id: Some("nope".to_string()),
                technician_name: Some("Tec 1".to_string()),
                ..CreateVisitRequest::default()
            }),
            Err(EngineError::ClientNotFound)
        ));
    }

    #[test]
    fn unseen_technician_id_binds_lazily_as_a_subject() {
        let (engine, client, _, _) = engine();
        let summary = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some("auth0|tec-nuevo".to_string()),
                ..CreateVisitRequest::default()
            })
            .expect("create visit");
        assert_eq!(
            summary.technician.name,
            fv_core::visit_contracts::PLACEHOLDER_TECHNICIAN_NAME
        );
        assert_eq!(
            summary.technician.subject.as_deref(),
            Some("auth0|tec-nuevo")
        );

        // The same subject authenticating later resolves to that record.
        let listed = engine
            .list_visits(
                &ListQuery::default(),
                &technician_identity("auth0|tec-nuevo"),
            )
            .expect("scoped list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, summary.id);
    }

    #[test]
    fn inactive_clients_cannot_receive_visits() {
        let (store, _, technician) = seeded_store();
        let inactive = ClientRecord {
            id: "c-x".to_string(),
            name: "Cerrado".to_string(),
            email: None,
            phone: None,
            address: None,
            status: ClientStatus::Inactive,
            notes: None,
            point: None,
        };
        store.upsert_client(&inactive).expect("upsert client");
        let (engine, _) = engine_with(store, VerificationConfig::default());

        assert!(matches!(
            engine.create_visit(&CreateVisitRequest {
                client_id: Some(inactive.id.clone()),
                technician_id: Some(technician.id.clone()),
                ..CreateVisitRequest::default()
            }),
            Err(EngineError::ClientInactive)
        ));
    }

    #[test]
    fn creation_by_name_creates_a_technician_record() {
        let (engine, client, _, _) = engine();
        let summary = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_name: Some("Nuevo Tec".to_string()),
                ..CreateVisitRequest::default()
            })
            .expect("create visit");
        assert_eq!(summary.technician.name, "Nuevo Tec");
        assert!(engine
            .list_technicians()
            .expect("technicians")
            .iter()
            .any(|t| t.display_name == "Nuevo Tec"));
    }

    #[test]
    fn unknown_clients_are_pulled_from_the_directory() {
        let (store, _, technician) = seeded_store();
        let delivered = Arc::new(AtomicUsize::new(0));
        let engine = VisitEngine::new(
            store,
            Box::new(StaticDirectory {
                clients: vec![RemoteClient {
                    id: "remote-1".to_string(),
                    name: "Corporación Remota".to_string(),
                    email: Some("contacto@remota.local".to_string()),
                    phone: None,
                    address: None,
                    status: Some("ACTIVE".to_string()),
                    notes: None,
                    lat: Some(14.6),
                    lng: Some(-90.5),
                }],
            }),
            Box::new(CountingNotifier { delivered }),
            VerificationConfig::default(),
            chrono_tz::America::Guatemala,
        );

        let summary = engine
            .create_visit(&CreateVisitRequest {
                client_id: Some("remote-1".to_string()),
                technician_id: Some(technician.id.clone()),
                ..CreateVisitRequest::default()
            })
            .expect("create visit");
        assert_eq!(summary.client.name, "Corporación Remota");

        // The fetched record is cached locally.
        let cached = engine.list_clients(Some("Remota")).expect("list clients");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "remote-1");
    }

    #[test]
    fn listing_scopes_technician_callers_to_their_own_visits() {
        let (store, client, technician) = seeded_store();
        let other = Technician {
            id: new_id(),
            subject: "sub-tec2".to_string(),
            display_name: "Tec 2".to_string(),
            email: None,
        };
        store.insert_technician(&other).expect("insert technician");
        let (engine, _) = engine_with(store, VerificationConfig::default());

        open_visit(&engine, &client, &technician);
        let now = Utc::now();
        engine
            .create_visit(&CreateVisitRequest {
                client_id: Some(client.id.clone()),
                technician_id: Some(other.id.clone()),
                scheduled_at: Some(now),
                ..CreateVisitRequest::default()
            })
            .expect("create other visit");

        let all = engine
            .list_visits(&ListQuery::default(), &admin_identity())
            .expect("admin list");
        assert_eq!(all.len(), 2);

        let own = engine
            .list_visits(&ListQuery::default(), &technician_identity("sub-tec1"))
            .expect("technician list");
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].technician.id, technician.id);

        let mine = engine
            .list_visits(
                &ListQuery {
                    mine: true,
                    ..ListQuery::default()
                },
                &admin_identity(),
            )
            .expect("mine list");
        assert!(mine.is_empty());

        let today = engine
            .list_today(&technician_identity("sub-tec2"))
            .expect("today list");
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].technician.id, other.id);
    }

    #[test]
    fn failed_notification_never_rolls_back_completion() {
        struct FailingNotifier;

        impl CompletionNotifier for FailingNotifier {
            fn notify_visit_completed(
                &self,
                _event: &VisitCompletedEvent,
            ) -> Result<(), NotifyError> {
                Err(NotifyError("downstream unavailable".to_string()))
            }
        }

        let (store, client, technician) = seeded_store();
        let engine = VisitEngine::new(
            store,
            Box::new(NullDirectory),
            Box::new(FailingNotifier),
            VerificationConfig::default(),
            chrono_tz::America::Guatemala,
        );
        let visit_id = open_visit(&engine, &client, &technician);
        let identity = technician_identity(&technician.subject);

        engine
            .check_in(&visit_id, &at_client(), &CheckMeta::default(), &identity)
            .expect("check in");
        engine
            .check_out(&visit_id, &at_client(), &CheckMeta::default(), &identity)
            .expect("check out");

        let done = engine.complete(&visit_id, &identity).expect("complete");
        assert_eq!(done.status, VisitStatus::Done);
        assert_eq!(
            engine.get_visit(&visit_id).expect("reload").status,
            VisitStatus::Done
        );
    }

    #[test]
    fn bulk_create_plans_every_item() {
        let (engine, client, technician, _) = engine();
        let now = Utc::now();
        let created = engine
            .bulk_create(&BulkCreateRequest {
                items: vec![
                    CreateVisitRequest {
                        client_id: Some(client.id.clone()),
                        technician_id: Some(technician.id.clone()),
                        scheduled_at: Some(now),
                        window_start: Some(now),
                        window_end: Some(now + Duration::hours(1)),
                        ..CreateVisitRequest::default()
                    },
                    CreateVisitRequest {
                        client_id: Some(client.id.clone()),
                        technician_id: Some(technician.id.clone()),
                        scheduled_at: Some(now + Duration::hours(2)),
                        window_start: Some(now + Duration::hours(2)),
                        window_end: Some(now + Duration::hours(3)),
                        ..CreateVisitRequest::default()
                    },
                ],
            })
            .expect("bulk create");
        assert_eq!(created.len(), 2);
        assert_eq!(
            engine
                .list_visits(&ListQuery::default(), &admin_identity())
                .expect("list")
                .len(),
            2
        );
    }
}
