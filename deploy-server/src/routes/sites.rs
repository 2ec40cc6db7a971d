use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use deploy_sync::diff::{diff, ClientFileEntry, DiffReport};
use deploy_sync::sites::{Binding, SiteInfo, SiteManager};
use deploy_sync::SyncError;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_sites))
        .route("/group/{group}/check-files", post(check_group_files))
        .route("/{name}", get(get_site))
        .route("/{name}/start", post(start_site))
        .route("/{name}/stop", post(stop_site))
        .route("/{name}/restart", post(restart_site))
        .route("/{name}/physical-path", put(set_physical_path))
        .route("/{name}/application-pool", put(set_application_pool))
        .route("/{name}/bindings", post(add_binding))
        .route("/{name}/bindings/{binding}", delete(remove_binding))
        .route("/{name}/check-files", post(check_files))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhysicalPathRequest {
    physical_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationPoolRequest {
    application_pool: String,
}

/// Run a Site Manager call on the blocking pool.
async fn with_sites<T, F>(state: &AppState, f: F) -> Result<T, AppError>
where
    F: FnOnce(&dyn SiteManager) -> deploy_sync::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let sites = state.sites.clone();
    let result = tokio::task::spawn_blocking(move || f(sites.as_ref()))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(result)
}

async fn list_sites(State(state): State<Arc<AppState>>) -> Result<Json<Vec<SiteInfo>>, AppError> {
    let sites = with_sites(&state, |s| s.list()).await?;
    Ok(Json(sites))
}

async fn get_site(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SiteInfo>, AppError> {
    let name2 = name.clone();
    match with_sites(&state, move |s| s.get(&name2)).await? {
        Some(site) => Ok(Json(site)),
        None => Err(SyncError::SiteNotFound(name).into()),
    }
}

async fn start_site(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    with_sites(&state, move |s| s.start_site(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_site(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    with_sites(&state, move |s| s.stop_site(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_site(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    with_sites(&state, move |s| {
        s.stop_site(&name)?;
        s.start_site(&name)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_physical_path(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<PhysicalPathRequest>,
) -> Result<Json<SiteInfo>, AppError> {
    if body.physical_path.as_os_str().is_empty() {
        return Err(AppError::BadRequest("physicalPath is required".into()));
    }
    let site = with_sites(&state, move |s| {
        s.set_physical_path(&name, body.physical_path)?;
        s.commit()?;
        s.get(&name)?.ok_or(SyncError::SiteNotFound(name))
    })
    .await?;
    tracing::info!(site = %site.name, path = %site.physical_path.display(), "Physical path updated");
    Ok(Json(site))
}

async fn set_application_pool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ApplicationPoolRequest>,
) -> Result<Json<SiteInfo>, AppError> {
    if body.application_pool.is_empty() {
        return Err(AppError::BadRequest("applicationPool is required".into()));
    }
    let site = with_sites(&state, move |s| {
        s.set_application_pool(&name, &body.application_pool)?;
        s.commit()?;
        s.get(&name)?.ok_or(SyncError::SiteNotFound(name))
    })
    .await?;
    Ok(Json(site))
}

async fn add_binding(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(binding): Json<Binding>,
) -> Result<(StatusCode, Json<SiteInfo>), AppError> {
    if binding.protocol.is_empty() || binding.binding_information.is_empty() {
        return Err(AppError::BadRequest("protocol and bindingInformation are required".into()));
    }
    let site = with_sites(&state, move |s| {
        s.add_binding(&name, binding)?;
        s.commit()?;
        s.get(&name)?.ok_or(SyncError::SiteNotFound(name))
    })
    .await?;
    Ok((StatusCode::CREATED, Json(site)))
}

async fn remove_binding(
    State(state): State<Arc<AppState>>,
    Path((name, binding)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let removed = with_sites(&state, move |s| {
        let removed = s.remove_binding(&name, &binding)?;
        if removed {
            s.commit()?;
        }
        Ok(removed)
    })
    .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Binding not found".into()))
    }
}

async fn run_diff(
    state: &AppState,
    site: &str,
    manifest: Vec<ClientFileEntry>,
) -> Result<Json<DiffReport>, AppError> {
    let root = state.physical_path(site).await?;
    let patterns = state.ignore_patterns().await?;
    let report = tokio::task::spawn_blocking(move || diff(&root, &manifest, &patterns))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    tracing::info!(
        site,
        total = report.files.len(),
        to_update = report.files_to_update.len(),
        "Checked files"
    );
    Ok(Json(report))
}

async fn check_files(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(manifest): Json<Vec<ClientFileEntry>>,
) -> Result<Json<DiffReport>, AppError> {
    run_diff(&state, &name, manifest).await
}

async fn check_group_files(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(manifest): Json<Vec<ClientFileEntry>>,
) -> Result<Json<DiffReport>, AppError> {
    let group = state.group(&group).await?;
    let host = AppState::group_host_site(&group)?;
    run_diff(&state, host, manifest).await
}
