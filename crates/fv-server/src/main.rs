use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::Parser;
use fv_core::config::VerificationConfig;
use fv_core::tz::business_tz;
use fv_core::visit_contracts::{IdentityContext, VisitStatus};
use fv_engine::{
    BulkCreateRequest, CheckMeta, CheckRequest, ClientDirectory, ClientSummary, CompletionNotifier,
    CreateVisitRequest, EngineError, ListQuery, LogNotifier, NullDirectory, TechnicianSummary,
    UpdateVisitRequest, VisitEngine,
};
use fv_storage::VisitStore;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod remote;
mod seed;

#[derive(Parser, Debug)]
#[command(name = "fv-server")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,
    /// SQLite database path.
    #[arg(long, default_value = "fieldvisits.db")]
    db: String,
    /// Base URL of the external client directory; empty disables it.
    #[arg(long, default_value = "", env = "CLIENTS_API_URL")]
    clients_api: String,
    /// Webhook for visit-completed events; empty logs them instead.
    #[arg(long, default_value = "", env = "NOTIFY_WEBHOOK_URL")]
    notify_webhook: String,
    /// Load demo clients, technicians and visits on startup.
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

type SharedEngine = Arc<Mutex<VisitEngine>>;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let store = match VisitStore::open(&args.db) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, db = %args.db, "failed to open database");
            return;
        }
    };
    if args.seed_demo {
        if let Err(err) = seed::seed_demo(&store) {
            error!(error = %err, "demo seed failed");
            return;
        }
    }

    let directory: Box<dyn ClientDirectory> = if args.clients_api.trim().is_empty() {
        Box::new(NullDirectory)
    } else {
        Box::new(remote::HttpDirectory::new(&args.clients_api))
    };
    let notifier: Box<dyn CompletionNotifier> = if args.notify_webhook.trim().is_empty() {
        Box::new(LogNotifier)
    } else {
        Box::new(remote::WebhookNotifier::new(&args.notify_webhook))
    };

    let engine = VisitEngine::new(
        store,
        directory,
        notifier,
        VerificationConfig::from_env(),
        business_tz(),
    );
    let state: SharedEngine = Arc::new(Mutex::new(engine));

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/visits", post(create_visit).get(list_visits))
        .route("/visits/bulk", post(bulk_create))
        .route("/visits/today", get(list_today))
        .route("/visits/:id", get(get_visit).patch(update_visit))
        .route("/visits/:id/status", post(set_status))
        .route("/visits/:id/complete", post(complete))
        .route("/visits/:id/check-in", post(check_in))
        .route("/visits/:id/check-out", post(check_out))
        .route("/visits/:id/checks", get(list_checks))
        .route("/technicians", get(list_technicians))
        .route("/clients", get(list_clients))
        .with_state(state);

    let addr: SocketAddr = match args.addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, addr = %args.addr, "invalid listen address");
            return;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %args.addr, "bind failed");
            return;
        }
    };

    info!(addr = %args.addr, db = %args.db, "visit server listening");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(error = %err, "server error");
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn lock(engine: &SharedEngine) -> MutexGuard<'_, VisitEngine> {
    engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---- error mapping ----

enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Engine(err) => (status_for(&err), err.code(), err.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
        };
        let body = serde_json::json!({ "code": code, "message": message });
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        EngineError::MissingIdentity => StatusCode::UNAUTHORIZED,
        EngineError::NotAssignedToVisit => StatusCode::FORBIDDEN,
        EngineError::ScheduleConflict
        | EngineError::IdempotencyKeyReused
        | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::Storage(_) | EngineError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

// ---- request context ----

fn identity_from(headers: &HeaderMap) -> IdentityContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    IdentityContext {
        subject: header("x-identity-subject"),
        roles: header("x-identity-roles")
            .map(|raw| {
                raw.split(',')
                    .map(|role| role.trim().to_string())
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        display_name: header("x-identity-name"),
        email: header("x-identity-email"),
    }
}

fn check_meta(headers: &HeaderMap, remote: SocketAddr) -> CheckMeta {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());
    CheckMeta {
        ip: Some(forwarded.unwrap_or_else(|| remote.ip().to_string())),
        idempotency_key: headers
            .get("idempotency-key")
            .and_then(|value| value.to_str().ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty()),
    }
}

// ---- query parsing ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    from: Option<String>,
    to: Option<String>,
    date: Option<String>,
    technician_id: Option<String>,
    client_id: Option<String>,
    status: Option<String>,
    mine: Option<String>,
}

fn parse_list_query(params: ListParams) -> Result<ListQuery, ApiError> {
    Ok(ListQuery {
        from: params.from.as_deref().map(parse_instant).transpose()?,
        to: params.to.as_deref().map(parse_instant).transpose()?,
        date: params.date.as_deref().map(parse_instant).transpose()?,
        technician_id: params.technician_id,
        client_id: params.client_id,
        status: params
            .status
            .as_deref()
            .map(str::parse::<VisitStatus>)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        mine: params
            .mine
            .as_deref()
            .map(|raw| matches!(raw.trim(), "1" | "true"))
            .unwrap_or(false),
    })
}

/// RFC 3339 instant, or a bare date interpreted in the business timezone.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let invalid = || ApiError::BadRequest(format!("invalid timestamp: {raw}"));
    let date = raw.parse::<NaiveDate>().map_err(|_| invalid())?;
    let noon = date.and_hms_opt(12, 0, 0).ok_or_else(invalid)?;
    business_tz()
        .from_local_datetime(&noon)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[derive(Debug, Deserialize)]
struct ClientsParams {
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

// ---- handlers ----

async fn create_visit(
    State(engine): State<SharedEngine>,
    Json(body): Json<CreateVisitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = lock(&engine).create_visit(&body)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn bulk_create(
    State(engine): State<SharedEngine>,
    Json(body): Json<BulkCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = lock(&engine).bulk_create(&body)?;
    Ok((StatusCode::CREATED, Json(summaries)))
}

async fn list_visits(
    State(engine): State<SharedEngine>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let query = parse_list_query(params)?;
    let identity = identity_from(&headers);
    Ok(Json(lock(&engine).list_visits(&query, &identity)?))
}

async fn list_today(
    State(engine): State<SharedEngine>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity_from(&headers);
    Ok(Json(lock(&engine).list_today(&identity)?))
}

async fn get_visit(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(lock(&engine).get_visit(&id)?))
}

async fn update_visit(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(body): Json<UpdateVisitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(lock(&engine).update_visit(&id, &body)?))
}

async fn set_status(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<impl IntoResponse, ApiError> {
    let target = body
        .status
        .parse::<VisitStatus>()
        .map_err(ApiError::BadRequest)?;
    let identity = identity_from(&headers);
    Ok(Json(lock(&engine).set_status(
        &id,
        target,
        body.reason.as_deref(),
        &identity,
    )?))
}

async fn complete(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity_from(&headers);
    Ok(Json(lock(&engine).complete(&id, &identity)?))
}

async fn check_in(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<CheckRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let meta = check_meta(&headers, remote);
    let identity = identity_from(&headers);
    let check = lock(&engine).check_in(&id, &request, &meta, &identity)?;
    Ok((StatusCode::CREATED, Json(check)))
}

async fn check_out(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<CheckRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let meta = check_meta(&headers, remote);
    let identity = identity_from(&headers);
    let check = lock(&engine).check_out(&id, &request, &meta, &identity)?;
    Ok((StatusCode::CREATED, Json(check)))
}

async fn list_checks(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(lock(&engine).list_checks(&id)?))
}

async fn list_technicians(
    State(engine): State<SharedEngine>,
) -> Result<impl IntoResponse, ApiError> {
    let technicians = lock(&engine).list_technicians()?;
    let summaries: Vec<TechnicianSummary> = technicians
        .into_iter()
        .map(|technician| TechnicianSummary {
            id: technician.id,
            name: technician.display_name,
            email: technician.email,
            subject: Some(technician.subject),
        })
        .collect();
    Ok(Json(summaries))
}

async fn list_clients(
    State(engine): State<SharedEngine>,
    Query(params): Query<ClientsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let search = params
        .search
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let clients = lock(&engine).list_clients(search)?;
    let summaries: Vec<ClientSummary> = clients
        .into_iter()
        .map(|client| ClientSummary {
            id: client.id,
            name: client.name,
            email: client.email,
            phone: client.phone,
            status: client.status,
            notes: client.notes,
            address: client.address,
            lat: client.point.map(|p| p.lat),
            lng: client.point.map(|p| p.lng),
        })
        .collect();
    Ok(Json(summaries))
}
