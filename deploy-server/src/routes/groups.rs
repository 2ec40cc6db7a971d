use crate::error::AppError;
use crate::models::site_group::{CreateGroupRequest, SiteGroup, UpdateGroupRequest};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_groups).post(create_group))
        .route("/{name}", get(get_group).put(update_group).delete(delete_group))
        .route("/{name}/start", post(start_group))
        .route("/{name}/stop", post(stop_group))
}

async fn list_groups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SiteGroup>>, AppError> {
    let groups = state.groups.clone();
    let all = tokio::task::spawn_blocking(move || groups.find_all())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(all))
}

async fn get_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SiteGroup>, AppError> {
    Ok(Json(state.group(&name).await?))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<SiteGroup>), AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }

    let groups = state.groups.clone();
    let created = tokio::task::spawn_blocking(move || groups.create(&body))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    match created {
        Some(group) => {
            tracing::info!(group = %group.name, sites = group.site_names.len(), "Site group created");
            Ok((StatusCode::CREATED, Json(group)))
        }
        None => Err(AppError::Conflict("A group with this name already exists".into())),
    }
}

async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<UpdateGroupRequest>,
) -> Result<Json<SiteGroup>, AppError> {
    let groups = state.groups.clone();
    let updated = tokio::task::spawn_blocking(move || groups.update(&name, &body))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    updated
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Group not found".into()))
}

async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let groups = state.groups.clone();
    let deleted = tokio::task::spawn_blocking(move || groups.delete(&name))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Group not found".into()))
    }
}

/// Start or stop every site of a group. Unknown sites are skipped and a
/// failing site does not stop the others.
async fn set_group_running(state: &AppState, name: &str, start: bool) -> Result<Json<Value>, AppError> {
    let group = state.group(name).await?;
    let sites = state.sites.clone();
    let site_names = group.site_names.clone();

    let errors = tokio::task::spawn_blocking(move || {
        let mut errors = Vec::new();
        for site in &site_names {
            if sites.get(site)?.is_none() {
                tracing::warn!(site = %site, "Group member not found, skipping");
                continue;
            }
            let result = if start { sites.start_site(site) } else { sites.stop_site(site) };
            if let Err(e) = result {
                tracing::warn!(site = %site, error = %e, "Failed to change site state");
                errors.push(format!("{site}: {e}"));
            }
        }
        Ok::<_, deploy_sync::SyncError>(errors)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    Ok(Json(json!({ "group": group.name, "errors": errors })))
}

async fn start_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    set_group_running(&state, &name, true).await
}

async fn stop_group(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    set_group_running(&state, &name, false).await
}
