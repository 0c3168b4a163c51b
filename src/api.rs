use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tables::{
    audit_entries::{AuditAction, AuditEntry},
    blocked_clients::BlockedClient,
    parameters::Parameter,
};

use crate::{
    audit::{Compaction, MonitorSummary},
    error::{Error, Result},
    state::AppState,
};

const ACTIVITY_PER_PAGE: u64 = 15;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/parameters", get(list_parameters))
        .route("/parameters/:name", put(update_parameter))
        .route("/clients/:ip", get(client_status))
        .route("/clients/:ip/unblock", post(unblock_client))
        .route("/monitor", get(monitor))
        .route("/activity", get(activity))
        .route("/audit/compact", post(compact))
}

pub async fn health() -> &'static str {
    "Healthy!"
}

pub async fn list_parameters(State(state): State<AppState>) -> Result<Json<Vec<Parameter>>> {
    Ok(Json(state.parameters.list().await?))
}

#[derive(Debug, Deserialize)]
pub struct ParameterUpdate {
    pub value: String,
}

pub async fn update_parameter(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<ParameterUpdate>,
) -> Result<Json<Parameter>> {
    let parameter = state.parameters.update_from_admin(&name, &update.value).await?;
    Ok(Json(parameter))
}

#[derive(Debug, Serialize)]
pub struct ClientStatus {
    pub ip: String,
    pub blocked: bool,
    pub record: Option<BlockedClient>,
}

pub async fn client_status(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<ClientStatus>> {
    let record = state.blocklist.status(&ip).await?;
    Ok(Json(ClientStatus {
        blocked: record.as_ref().is_some_and(|c| c.block_type.is_blocked()),
        ip,
        record,
    }))
}

pub async fn unblock_client(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<BlockedClient>> {
    Ok(Json(state.blocklist.unblock(&ip).await?))
}

pub async fn monitor(State(state): State<AppState>) -> Result<Json<MonitorSummary>> {
    Ok(Json(state.audit.summary().await?))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub page: Option<u64>,
    pub action: Option<u8>,
}

pub async fn activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<AuditEntry>>> {
    let action = query
        .action
        .map(AuditAction::try_from)
        .transpose()
        .map_err(Error::Validation)?;
    let entries = state
        .audit
        .activity(action, query.page.unwrap_or(1), ACTIVITY_PER_PAGE)
        .await?;
    Ok(Json(entries))
}

pub async fn compact(State(state): State<AppState>) -> Result<Json<Compaction>> {
    Ok(Json(state.audit.compact().await?))
}
