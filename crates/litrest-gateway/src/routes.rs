//! HTTP front: routing and the per-verb pipelines
//!
//! Every table request runs the same spine: authenticate, parse, plan
//! against the schema cache, inject policies, emit SQL, execute through the
//! pool, negotiate the response. Databases may be named in the path
//! (`/{db}/{table}`); a single segment targets the default database.

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use litrest_common::{DefaultAction, GatewayError, RpcMethod};

use crate::auth::Principal;
use crate::engine::emit::{emit_count, emit_delete, emit_insert, emit_select, emit_update};
use crate::engine::exec::{run_execute, run_scalar_i64, run_select};
use crate::engine::filter::parse_query;
use crate::engine::plan::{validate_body_columns, Planner};
use crate::policy::Action;
use crate::response::{content_range, render_plan, render_rows, ApiError, MediaType};
use crate::state::AppState;

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_debug/databases", get(debug_databases))
        .route("/_debug/schema", get(debug_schema))
        .route("/_debug/policies", get(debug_policies))
        .route("/_debug/auth", get(debug_auth))
        .route("/rpc/{name}", get(rpc_call).post(rpc_call))
        .route(
            "/{table}",
            get(table_default)
                .post(table_default)
                .patch(table_default)
                .put(table_default)
                .delete(table_default),
        )
        .route(
            "/{db}/{table}",
            get(table_scoped)
                .post(table_scoped)
                .patch(table_scoped)
                .put(table_scoped)
                .delete(table_scoped),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "litrest"}))
}

async fn not_found() -> ApiError {
    ApiError(GatewayError::NotFound("no such route".to_string()))
}

// Table pipelines

async fn table_default(
    State(state): State<AppState>,
    Path(table): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let db = state.default_db().to_string();
    dispatch_table(state, db, table, method, headers, raw.unwrap_or_default(), body).await
}

async fn table_scoped(
    State(state): State<AppState>,
    Path((db, table)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    dispatch_table(state, db, table, method, headers, raw.unwrap_or_default(), body).await
}

async fn dispatch_table(
    state: AppState,
    db: String,
    table: String,
    method: Method,
    headers: HeaderMap,
    raw: String,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.auth.verify(&headers, &raw).await?;
    ensure_routable(&state, &db, &table).await?;

    match method {
        Method::GET => handle_select(state, db, table, principal, &headers, &raw).await,
        Method::POST => handle_insert(state, db, table, principal, &body).await,
        Method::PATCH | Method::PUT => {
            handle_update(state, db, table, principal, &raw, &body).await
        }
        Method::DELETE => handle_delete(state, db, table, principal, &raw).await,
        _ => Err(GatewayError::NotFound("no such route".to_string()).into()),
    }
}

/// Unknown databases and internal tables are unroutable
async fn ensure_routable(state: &AppState, db: &str, table: &str) -> Result<(), ApiError> {
    if !state.pools.contains(db).await {
        return Err(GatewayError::DatabaseNotFound(db.to_string()).into());
    }
    if litrest_common::ident::is_internal_table(table) {
        return Err(GatewayError::TableNotFound(table.to_string()).into());
    }
    Ok(())
}

async fn handle_select(
    state: AppState,
    db: String,
    table: String,
    principal: Principal,
    headers: &HeaderMap,
    raw: &str,
) -> Result<Response, ApiError> {
    let parsed = parse_query(raw)?;
    let planner = Planner::new(&state.schemas, &db);
    let (mut plan, schema) = planner.build_select(&table, &parsed).await?;
    state
        .policies
        .apply_to_plan(&db, &mut plan, Action::Select, &principal, &schema)?;

    let (sql, params) = emit_select(&plan);
    debug!(%db, %table, %sql, "select compiled");

    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let media = MediaType::negotiate(accept);
    if media == MediaType::Plan {
        return Ok(render_plan(&sql, &params));
    }

    // Content-Range needs the unwindowed total
    let total = if plan.window.limit.is_some() {
        let (count_sql, count_params) = emit_count(&plan);
        Some(
            state
                .pools
                .read(&db, move |conn| run_scalar_i64(conn, &count_sql, &count_params))
                .await?,
        )
    } else {
        None
    };

    let offset = plan.window.offset;
    let output = state
        .pools
        .read(&db, move |conn| run_select(conn, &plan, &sql, &params))
        .await?;
    let range = total.map(|t| content_range(offset, output.rows.len(), t));
    Ok(render_rows(media, &output, range))
}

async fn handle_insert(
    state: AppState,
    db: String,
    table: String,
    principal: Principal,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let parsed: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = match parsed {
        serde_json::Value::Object(obj) => vec![obj],
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::Object(obj) => Ok(obj),
                _ => Err(GatewayError::Validation(
                    "body array must contain objects".to_string(),
                )),
            })
            .collect::<Result<_, _>>()?,
        _ => {
            return Err(GatewayError::Validation(
                "body must be an object or an array of objects".to_string(),
            )
            .into())
        }
    };
    if rows.is_empty() {
        return Err(GatewayError::Validation("empty insert body".to_string()).into());
    }

    let schema = state.schemas.get(&db, &table).await?;
    let mut row_columns = Vec::with_capacity(rows.len());
    for row in &rows {
        row_columns.push(validate_body_columns(&schema, row)?);
    }

    let row_refs: Vec<&serde_json::Map<String, serde_json::Value>> = rows.iter().collect();
    state
        .policies
        .check_insert(&db, &table, &principal, &row_refs)?;

    // Location is only meaningful for a single row with an auto-assigned key
    let auto_pk = schema
        .auto_primary_key()
        .map(|c| c.name.clone())
        .filter(|pk| rows.len() == 1 && !rows[0].contains_key(pk));

    let table_for_sql = table.clone();
    let (affected, new_id) = state
        .pools
        .write(&db, move |conn| {
            let tx = conn.transaction().map_err(crate::pool::map_sqlite_err)?;
            let mut affected = 0usize;
            for (row, columns) in rows.iter().zip(&row_columns) {
                let (sql, params) = emit_insert(&table_for_sql, columns, row);
                affected += run_execute(&tx, &sql, &params)?;
            }
            let new_id = tx.last_insert_rowid();
            tx.commit().map_err(crate::pool::map_sqlite_err)?;
            Ok((affected, new_id))
        })
        .await?;

    let mut response = (
        StatusCode::CREATED,
        Json(serde_json::json!({"rows_affected": affected})),
    )
        .into_response();
    if let Some(pk) = auto_pk {
        let location = format!("/{table}?{pk}=eq.{new_id}");
        if let Ok(value) = location.parse() {
            response.headers_mut().insert(header::LOCATION, value);
        }
    }
    Ok(response)
}

async fn handle_update(
    state: AppState,
    db: String,
    table: String,
    principal: Principal,
    raw: &str,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let row: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))?;
    let row = match row {
        serde_json::Value::Object(obj) => obj,
        _ => {
            return Err(
                GatewayError::Validation("body must be a single object".to_string()).into(),
            )
        }
    };

    let parsed = parse_query(raw)?;
    let planner = Planner::new(&state.schemas, &db);
    let (mut plan, schema) = planner.build_mutation(&table, &parsed, "UPDATE").await?;
    let columns = validate_body_columns(&schema, &row)?;
    state
        .policies
        .apply_to_plan(&db, &mut plan, Action::Update, &principal, &schema)?;

    let (sql, params) = emit_update(&plan, &columns, &row);
    debug!(%db, %table, %sql, "update compiled");
    let affected = state
        .pools
        .write(&db, move |conn| run_execute(conn, &sql, &params))
        .await?;
    Ok(Json(serde_json::json!({"rows_affected": affected})).into_response())
}

async fn handle_delete(
    state: AppState,
    db: String,
    table: String,
    principal: Principal,
    raw: &str,
) -> Result<Response, ApiError> {
    let parsed = parse_query(raw)?;
    let planner = Planner::new(&state.schemas, &db);
    let (mut plan, schema) = planner.build_mutation(&table, &parsed, "DELETE").await?;
    state
        .policies
        .apply_to_plan(&db, &mut plan, Action::Delete, &principal, &schema)?;

    let (sql, params) = emit_delete(&plan);
    debug!(%db, %table, %sql, "delete compiled");
    let affected = state
        .pools
        .write(&db, move |conn| run_execute(conn, &sql, &params))
        .await?;
    Ok(Json(serde_json::json!({"rows_affected": affected})).into_response())
}

// RPC

async fn rpc_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let raw = raw.unwrap_or_default();
    let principal = state.auth.verify(&headers, &raw).await?;

    let (rpc_method, params) = match method {
        Method::GET => {
            let mut params = serde_json::Map::new();
            for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
                if key != "token" {
                    params.insert(
                        key.into_owned(),
                        serde_json::Value::String(value.into_owned()),
                    );
                }
            }
            (RpcMethod::Get, params)
        }
        Method::POST => {
            let params = if body.is_empty() {
                serde_json::Map::new()
            } else {
                match serde_json::from_slice(&body).map_err(|e| {
                    GatewayError::Validation(format!("invalid JSON body: {e}"))
                })? {
                    serde_json::Value::Object(obj) => obj,
                    _ => {
                        return Err(GatewayError::Validation(
                            "RPC body must be a JSON object".to_string(),
                        )
                        .into())
                    }
                }
            };
            (RpcMethod::Post, params)
        }
        _ => return Err(GatewayError::NotFound("no such route".to_string()).into()),
    };

    let result = state
        .rpc
        .dispatch(&state, &name, rpc_method, &params, &principal)
        .await?;
    Ok(Json(result).into_response())
}

// Debug surface

/// With a deny default the debug surface is admin-only
async fn ensure_debug_access(
    state: &AppState,
    headers: &HeaderMap,
    raw: &str,
) -> Result<Principal, ApiError> {
    let principal = state.auth.verify(headers, raw).await?;
    if state.policies.default_action() == DefaultAction::Deny && !principal.is_admin() {
        return Err(
            GatewayError::PermissionDenied("debug endpoints are admin-only".to_string()).into(),
        );
    }
    Ok(principal)
}

async fn debug_databases(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    ensure_debug_access(&state, &headers, raw.as_deref().unwrap_or_default()).await?;
    let databases = state.pools.list().await;
    Ok(Json(serde_json::json!({ "databases": databases })).into_response())
}

async fn debug_schema(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    ensure_debug_access(&state, &headers, raw.as_deref().unwrap_or_default()).await?;
    let mut stats = serde_json::Map::new();
    for db in state.pools.list().await {
        stats.insert(
            db.name.clone(),
            serde_json::to_value(state.schemas.stats(&db.name).await)
                .unwrap_or(serde_json::Value::Null),
        );
    }
    Ok(Json(serde_json::json!({ "schema_cache": stats })).into_response())
}

async fn debug_policies(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    ensure_debug_access(&state, &headers, raw.as_deref().unwrap_or_default()).await?;
    let mut per_db = serde_json::Map::new();
    for db in state.pools.list().await {
        per_db.insert(
            db.name.clone(),
            serde_json::Value::Array(state.policies.snapshot(&db.name).describe()),
        );
    }
    Ok(Json(serde_json::json!({
        "default_action": match state.policies.default_action() {
            DefaultAction::Allow => "allow",
            DefaultAction::Deny => "deny",
        },
        "policies": per_db,
    }))
    .into_response())
}

async fn debug_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let principal =
        ensure_debug_access(&state, &headers, raw.as_deref().unwrap_or_default()).await?;
    Ok(Json(principal.describe()).into_response())
}
