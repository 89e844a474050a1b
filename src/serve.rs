//! Purpose: Provide the HTTP/JSON server for fielddb.
//! Exports: `ServeConfig`, `AccessMode`, `serve`.
//! Role: Axum-based loopback server exposing field load/dump and the query engine.
//! Invariants: Field names in paths pass the boundary name check before touching disk.
//! Invariants: Predicates are compiled expressions from the query string; nothing else runs.
//! Invariants: Store and query calls run on the blocking pool, never on the async workers.
//! Invariants: Loopback-only unless explicitly allowed.

use std::collections::HashSet;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fielddb::api::{
    Error, ErrorKind, Field, FieldStore, JoinMode, QueryEngine, Value, check_boundary_name,
    compile_expr, parse_field_list,
};

use crate::{field_entries_json, field_info_json, groups_json, sorted_keys};

const VERSION_HEADER: &str = "fielddb-version";
const DEFAULT_EXPR: &str = "true";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub token: Option<String>,
    pub access_mode: AccessMode,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
}

#[derive(Clone)]
struct AppState {
    store: FieldStore,
    token: Option<String>,
    access_mode: AccessMode,
}

#[derive(Clone, Copy, Debug)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    fn allows_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    fn allows_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let state = Arc::new(AppState {
        store: FieldStore::open(&config.data_dir)?,
        token: config.token,
        access_mode: config.access_mode,
    });

    let app = router(state, max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        access = ?config.access_mode,
        "fielddb serving"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/fields", get(list_fields))
        .route(
            "/v0/fields/:field",
            get(get_field).put(put_field).delete(delete_field),
        )
        .route("/v0/find/:fields/:mode", get(find_keys))
        .route("/v0/group/:fields/:mode", get(group_keys))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    let is_loopback_bind = is_loopback(config.bind.ip());
    if !is_loopback_bind && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 8388608."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.token.as_deref().is_some_and(str::is_empty) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token must not be empty")
            .with_hint("Omit --token to disable auth, or pass a non-empty value."));
    }

    if !is_loopback_bind && config.access_mode.allows_write() && config.token.is_none() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback write requires --token")
            .with_hint("Add --token, or use --access read-only for an open read replica."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    if value.strip_prefix("Bearer ") != Some(token.as_str()) {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

fn ensure_read_access(state: &AppState) -> Result<(), Error> {
    if state.access_mode.allows_read() {
        Ok(())
    } else {
        Err(access_error("read operations"))
    }
}

fn ensure_write_access(state: &AppState) -> Result<(), Error> {
    if state.access_mode.allows_write() {
        Ok(())
    } else {
        Err(access_error("write operations"))
    }
}

fn access_error(action: &str) -> Error {
    Error::new(ErrorKind::Permission)
        .with_message(format!("forbidden: access mode disallows {action}"))
        .with_hint("Adjust --access to permit this operation.")
}

fn check_path_name(name: &str) -> Result<(), Error> {
    check_boundary_name(name).map_err(|err| Error::from(err).with_field(name))
}

/// Run store/query work on the blocking pool.
async fn run_blocking<T, F>(work: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("request worker failed")
            .with_source(err)
    })?
}

#[derive(Debug, Deserialize)]
struct PutFieldRequest {
    entries: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FindQuery {
    #[serde(rename = "where")]
    expr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupQuery {
    by: String,
    #[serde(rename = "where")]
    expr: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_fields(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_read_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        let fields: Vec<serde_json::Value> = store.list_fields()?.iter().map(field_info_json).collect();
        Ok(json!({ "fields": fields }))
    })
    .await;
    respond(result)
}

async fn get_field(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_read_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        check_path_name(&name)?;
        let field: Field<String, Value> = store.load_field(&name)?;
        Ok(json!({ "field": name, "entries": field_entries_json(&field) }))
    })
    .await;
    respond(result)
}

async fn put_field(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<PutFieldRequest>,
) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_write_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        check_path_name(&name)?;
        let field: Field<String, Value> = payload
            .entries
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect();
        store.dump_field(&name, &field)?;
        let mut info = field_info_json(&store.field_info(&name)?);
        info["entries"] = json!(field.len());
        Ok(json!({ "field": info }))
    })
    .await;
    respond(result)
}

async fn delete_field(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_write_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        check_path_name(&name)?;
        store.delete_field(&name)?;
        Ok(json!({ "ok": true }))
    })
    .await;
    respond(result)
}

async fn find_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((fields, mode)): AxumPath<(String, String)>,
    Query(query): Query<FindQuery>,
) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_read_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        let names = parse_field_list(&fields)?;
        let mode: JoinMode = mode.parse()?;
        let expr = compile_expr(query.expr.as_deref().unwrap_or(DEFAULT_EXPR))?;
        let keys: HashSet<String> = QueryEngine::new(&store)
            .try_find_keys::<String, Value, _, _>(&names[..], mode, |values| {
                expr.matches_row(values)
            })?;
        Ok(json!({ "keys": sorted_keys(keys) }))
    })
    .await;
    respond(result)
}

async fn group_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((fields, mode)): AxumPath<(String, String)>,
    Query(query): Query<GroupQuery>,
) -> Response {
    if let Err(err) = authorize(&headers, &state).and_then(|()| ensure_read_access(&state)) {
        return error_response(err);
    }
    let store = state.store.clone();
    let result = run_blocking(move || {
        let names = parse_field_list(&fields)?;
        check_path_name(&query.by)?;
        let mode: JoinMode = mode.parse()?;
        let expr = compile_expr(query.expr.as_deref().unwrap_or(DEFAULT_EXPR))?;
        let groups = QueryEngine::new(&store).try_find_keys_group_by::<String, Value, _, _>(
            &names[..],
            &query.by,
            mode,
            |lists| expr.matches_group(lists),
        )?;
        Ok(json!({ "groups": groups_json(groups) }))
    })
    .await;
    respond(result)
}

fn respond(result: Result<serde_json::Value, Error>) -> Response {
    match result {
        Ok(payload) => json_response(payload),
        Err(err) => error_response(err),
    }
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static("0"));
    response
}

fn error_status(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::Usage | ErrorKind::Predicate => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Permission => {
            if is_access_forbidden(err) {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::UNAUTHORIZED
            }
        }
        ErrorKind::Corrupt | ErrorKind::Io | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::warn!(error = %err, "request failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            field: err.field().map(str::to_string),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static("0"));
    response
}

fn is_access_forbidden(err: &Error) -> bool {
    err.message()
        .is_some_and(|message| message.starts_with("forbidden:"))
}
