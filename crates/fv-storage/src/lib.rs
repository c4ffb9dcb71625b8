use chrono::{DateTime, Utc};
use fv_core::visit_contracts::{
    CheckKind, CheckMethod, CheckSource, ClientRecord, ClientStatus, GeoPoint, Technician, Visit,
    VisitCheck, VisitStatus,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const VISITS_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Outcome of a uniqueness-guarded insert: either the row went in, or a
/// conflicting row already existed and is returned instead of the raw
/// constraint error.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckInsert {
    Inserted,
    Existing(VisitCheck),
}

/// Filters for visit listings. Empty filter returns everything.
#[derive(Debug, Clone, Default)]
pub struct VisitQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub technician_id: Option<String>,
    pub client_id: Option<String>,
    pub status: Option<VisitStatus>,
}

const VISIT_COLUMNS: &str = "id, client_id, technician_id, scheduled_at, window_start, window_end, \
     status, notes, started_at, completed_at, canceled_at, cancel_reason, \
     check_in_at, check_in_lat, check_in_lng, check_out_at, check_out_lat, check_out_lng, \
     planned_lat, planned_lng, created_at";

const CHECK_COLUMNS: &str = "id, visit_id, kind, technician_id, occurred_at, device_at, lat, lng, \
     distance_meters, method, source, verified, verification_msg, device_id, ip, notes, \
     photo_url, idem_key_hash, fingerprint";

pub struct VisitStore {
    conn: Connection,
}

impl VisitStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > VISITS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: VISITS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_visits_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    // ---- clients ----

    pub fn upsert_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO clients (id, name, email, phone, address, status, notes, lat, lng, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                email=excluded.email,
                phone=excluded.phone,
                address=excluded.address,
                status=excluded.status,
                notes=excluded.notes,
                lat=excluded.lat,
                lng=excluded.lng,
                updated_at=excluded.updated_at
            ",
            params![
                client.id,
                client.name,
                client.email,
                client.phone,
                client.address,
                client.status.as_str(),
                client.notes,
                client.point.map(|p| p.lat),
                client.point.map(|p| p.lng),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn client_by_id(&self, id: &str) -> Result<Option<ClientRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, email, phone, address, status, notes, lat, lng
                 FROM clients WHERE id = ?1",
                [id],
                map_client_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn client_by_name(&self, name: &str) -> Result<Option<ClientRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, email, phone, address, status, notes, lat, lng
                 FROM clients WHERE name = ?1 COLLATE NOCASE LIMIT 1",
                [name],
                map_client_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn search_active_clients(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<ClientRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT id, name, email, phone, address, status, notes, lat, lng
             FROM clients
             WHERE status = 'ACTIVE'
               AND (?1 IS NULL OR name LIKE '%' || ?1 || '%' OR email LIKE '%' || ?1 || '%')
             ORDER BY name ASC",
        )?;
        let rows = statement.query_map(params![search], map_client_row)?;
        let mut clients = Vec::new();
        for row in rows {
            clients.push(row?);
        }
        Ok(clients)
    }

    // ---- technicians ----

    pub fn insert_technician(&self, technician: &Technician) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO technicians (id, subject, display_name, email, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                technician.id,
                technician.subject,
                technician.display_name,
                technician.email,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_technician(&self, technician: &Technician) -> Result<(), StorageError> {
        self.conn.execute(
            "UPDATE technicians SET subject = ?2, display_name = ?3, email = ?4 WHERE id = ?1",
            params![
                technician.id,
                technician.subject,
                technician.display_name,
                technician.email,
            ],
        )?;
        Ok(())
    }

    pub fn technician_by_id(&self, id: &str) -> Result<Option<Technician>, StorageError> {
        self.technician_where("id = ?1", id)
    }

    pub fn technician_by_subject(&self, subject: &str) -> Result<Option<Technician>, StorageError> {
        self.technician_where("subject = ?1", subject)
    }

    pub fn technician_by_name(&self, name: &str) -> Result<Option<Technician>, StorageError> {
        self.technician_where("display_name = ?1 COLLATE NOCASE", name)
    }

    pub fn technician_by_email(&self, email: &str) -> Result<Option<Technician>, StorageError> {
        self.technician_where("email = ?1 COLLATE NOCASE", email)
    }

    fn technician_where(&self, clause: &str, value: &str) -> Result<Option<Technician>, StorageError> {
        let sql = format!(
            "SELECT id, subject, display_name, email FROM technicians WHERE {clause} LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, [value], map_technician_row)
            .optional()?;
        Ok(row)
    }

    pub fn technicians(&self) -> Result<Vec<Technician>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT id, subject, display_name, email FROM technicians ORDER BY display_name ASC",
        )?;
        let rows = statement.query_map([], map_technician_row)?;
        let mut technicians = Vec::new();
        for row in rows {
            technicians.push(row?);
        }
        Ok(technicians)
    }

    // ---- visits ----

    pub fn insert_visit(&self, visit: &Visit) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO visits (
                id, client_id, technician_id, scheduled_at, window_start, window_end,
                status, notes, started_at, completed_at, canceled_at, cancel_reason,
                check_in_at, check_in_lat, check_in_lng, check_out_at, check_out_lat,
                check_out_lng, planned_lat, planned_lng, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            ",
            params_from_iter(visit_values(visit)),
        )?;
        Ok(())
    }

    /// Rewrites every mutable column of an existing visit.
    pub fn update_visit(&self, visit: &Visit) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE visits SET
                client_id = ?2, technician_id = ?3, scheduled_at = ?4, window_start = ?5,
                window_end = ?6, status = ?7, notes = ?8, started_at = ?9, completed_at = ?10,
                canceled_at = ?11, cancel_reason = ?12, check_in_at = ?13, check_in_lat = ?14,
                check_in_lng = ?15, check_out_at = ?16, check_out_lat = ?17, check_out_lng = ?18,
                planned_lat = ?19, planned_lng = ?20, created_at = ?21
            WHERE id = ?1
            ",
            params_from_iter(visit_values(visit)),
        )?;
        Ok(())
    }

    pub fn visit_by_id(&self, id: &str) -> Result<Option<Visit>, StorageError> {
        let sql = format!("SELECT {VISIT_COLUMNS} FROM visits WHERE id = ?1");
        let row = self.conn.query_row(&sql, [id], map_visit_row).optional()?;
        Ok(row)
    }

    pub fn list_visits(&self, query: &VisitQuery) -> Result<Vec<Visit>, StorageError> {
        let mut sql = format!("SELECT {VISIT_COLUMNS} FROM visits WHERE 1=1");
        let mut values: Vec<String> = Vec::new();

        if let Some(from) = query.from {
            values.push(from.to_rfc3339());
            sql.push_str(&format!(" AND scheduled_at >= ?{}", values.len()));
        }
        if let Some(to) = query.to {
            values.push(to.to_rfc3339());
            sql.push_str(&format!(" AND scheduled_at <= ?{}", values.len()));
        }
        if let Some(technician_id) = &query.technician_id {
            values.push(technician_id.clone());
            sql.push_str(&format!(" AND technician_id = ?{}", values.len()));
        }
        if let Some(client_id) = &query.client_id {
            values.push(client_id.clone());
            sql.push_str(&format!(" AND client_id = ?{}", values.len()));
        }
        if let Some(status) = query.status {
            values.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY window_start ASC, created_at ASC");

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values.iter()), map_visit_row)?;
        let mut visits = Vec::new();
        for row in rows {
            visits.push(row?);
        }
        Ok(visits)
    }

    /// Windows of non-canceled visits for one technician inside one business
    /// day, both bounds set. Feeds the schedule conflict detector.
    pub fn visit_windows_for_technician_day(
        &self,
        technician_id: &str,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
        exclude_visit: Option<&str>,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT window_start, window_end FROM visits
             WHERE technician_id = ?1
               AND scheduled_at >= ?2 AND scheduled_at <= ?3
               AND status <> 'CANCELED'
               AND window_start IS NOT NULL AND window_end IS NOT NULL
               AND (?4 IS NULL OR id <> ?4)",
        )?;
        let rows = statement.query_map(
            params![
                technician_id,
                day_start.to_rfc3339(),
                day_end.to_rfc3339(),
                exclude_visit,
            ],
            |row| {
                Ok((
                    timestamp_col(row, 0)?,
                    timestamp_col(row, 1)?,
                ))
            },
        )?;
        let mut windows = Vec::new();
        for row in rows {
            windows.push(row?);
        }
        Ok(windows)
    }

    // ---- verification events ----

    /// Insert-or-get-existing. A UNIQUE violation (same visit+kind, or same
    /// idempotency key hash) re-reads and returns the pre-existing event
    /// instead of surfacing the raw constraint error.
    pub fn insert_check(&self, check: &VisitCheck) -> Result<CheckInsert, StorageError> {
        let result = self.conn.execute(
            "
            INSERT INTO visit_checks (
                id, visit_id, kind, technician_id, occurred_at, device_at, lat, lng,
                distance_meters, method, source, verified, verification_msg, device_id,
                ip, notes, photo_url, idem_key_hash, fingerprint
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ",
            params![
                check.id,
                check.visit_id,
                check.kind.as_str(),
                check.technician_id,
                check.occurred_at.to_rfc3339(),
                check.device_at.map(|at| at.to_rfc3339()),
                check.point.map(|p| p.lat),
                check.point.map(|p| p.lng),
                check.distance_meters,
                check.method.as_str(),
                check.source.as_str(),
                check.verified as i64,
                check.verification_msg,
                check.device_id,
                check.ip,
                check.notes,
                check.photo_url,
                check.idem_key_hash,
                check.fingerprint,
            ],
        );

        match result {
            Ok(_) => Ok(CheckInsert::Inserted),
            Err(rusqlite::Error::SqliteFailure(err, message))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                if let Some(hash) = &check.idem_key_hash {
                    if let Some(existing) = self.check_by_idem_hash(hash)? {
                        return Ok(CheckInsert::Existing(existing));
                    }
                }
                if let Some(existing) = self.check_for_visit(&check.visit_id, check.kind)? {
                    return Ok(CheckInsert::Existing(existing));
                }
                Err(rusqlite::Error::SqliteFailure(err, message).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn check_for_visit(
        &self,
        visit_id: &str,
        kind: CheckKind,
    ) -> Result<Option<VisitCheck>, StorageError> {
        let sql = format!(
            "SELECT {CHECK_COLUMNS} FROM visit_checks WHERE visit_id = ?1 AND kind = ?2 LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![visit_id, kind.as_str()], map_check_row)
            .optional()?;
        Ok(row)
    }

    pub fn checks_for_visit(&self, visit_id: &str) -> Result<Vec<VisitCheck>, StorageError> {
        let sql = format!(
            "SELECT {CHECK_COLUMNS} FROM visit_checks WHERE visit_id = ?1 ORDER BY occurred_at ASC"
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([visit_id], map_check_row)?;
        let mut checks = Vec::new();
        for row in rows {
            checks.push(row?);
        }
        Ok(checks)
    }

    pub fn check_by_idem_hash(&self, hash: &str) -> Result<Option<VisitCheck>, StorageError> {
        let sql = format!("SELECT {CHECK_COLUMNS} FROM visit_checks WHERE idem_key_hash = ?1");
        let row = self
            .conn
            .query_row(&sql, [hash], map_check_row)
            .optional()?;
        Ok(row)
    }
}

fn visit_values(visit: &Visit) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value;
    vec![
        Value::from(visit.id.clone()),
        Value::from(visit.client_id.clone()),
        Value::from(visit.technician_id.clone()),
        Value::from(visit.scheduled_at.to_rfc3339()),
        Value::from(visit.window_start.map(|at| at.to_rfc3339())),
        Value::from(visit.window_end.map(|at| at.to_rfc3339())),
        Value::from(visit.status.as_str().to_string()),
        Value::from(visit.notes.clone()),
        Value::from(visit.started_at.map(|at| at.to_rfc3339())),
        Value::from(visit.completed_at.map(|at| at.to_rfc3339())),
        Value::from(visit.canceled_at.map(|at| at.to_rfc3339())),
        Value::from(visit.cancel_reason.clone()),
        Value::from(visit.check_in_at.map(|at| at.to_rfc3339())),
        Value::from(visit.check_in_point.map(|p| p.lat)),
        Value::from(visit.check_in_point.map(|p| p.lng)),
        Value::from(visit.check_out_at.map(|at| at.to_rfc3339())),
        Value::from(visit.check_out_point.map(|p| p.lat)),
        Value::from(visit.check_out_point.map(|p| p.lng)),
        Value::from(visit.planned_point.map(|p| p.lat)),
        Value::from(visit.planned_point.map(|p| p.lng)),
        Value::from(visit.created_at.to_rfc3339()),
    ]
}

fn map_client_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientRecord> {
    let status = parse_col::<ClientStatus>(row, 5)?;
    Ok(ClientRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        address: row.get(4)?,
        status,
        notes: row.get(6)?,
        point: point_from(row.get(7)?, row.get(8)?),
    })
}

fn map_technician_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Technician> {
    Ok(Technician {
        id: row.get(0)?,
        subject: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
    })
}

fn map_visit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Visit> {
    Ok(Visit {
        id: row.get(0)?,
        client_id: row.get(1)?,
        technician_id: row.get(2)?,
        scheduled_at: timestamp_col(row, 3)?,
        window_start: opt_timestamp_col(row, 4)?,
        window_end: opt_timestamp_col(row, 5)?,
        status: parse_col::<VisitStatus>(row, 6)?,
        notes: row.get(7)?,
        started_at: opt_timestamp_col(row, 8)?,
        completed_at: opt_timestamp_col(row, 9)?,
        canceled_at: opt_timestamp_col(row, 10)?,
        cancel_reason: row.get(11)?,
        check_in_at: opt_timestamp_col(row, 12)?,
        check_in_point: point_from(row.get(13)?, row.get(14)?),
        check_out_at: opt_timestamp_col(row, 15)?,
        check_out_point: point_from(row.get(16)?, row.get(17)?),
        planned_point: point_from(row.get(18)?, row.get(19)?),
        created_at: timestamp_col(row, 20)?,
    })
}

fn map_check_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisitCheck> {
    Ok(VisitCheck {
        id: row.get(0)?,
        visit_id: row.get(1)?,
        kind: parse_col::<CheckKind>(row, 2)?,
        technician_id: row.get(3)?,
        occurred_at: timestamp_col(row, 4)?,
        device_at: opt_timestamp_col(row, 5)?,
        point: point_from(row.get(6)?, row.get(7)?),
        distance_meters: row.get(8)?,
        method: parse_col::<CheckMethod>(row, 9)?,
        source: parse_col::<CheckSource>(row, 10)?,
        verified: row.get::<_, i64>(11)? != 0,
        verification_msg: row.get(12)?,
        device_id: row.get(13)?,
        ip: row.get(14)?,
        notes: row.get(15)?,
        photo_url: row.get(16)?,
        idem_key_hash: row.get(17)?,
        fingerprint: row.get(18)?,
    })
}

fn point_from(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    }
}

fn parse_col<T>(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>().map_err(|message| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
        )
    })
}

fn timestamp_col(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn opt_timestamp_col(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
    })
    .transpose()
}
