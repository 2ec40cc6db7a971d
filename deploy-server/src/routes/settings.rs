use crate::error::AppError;
use crate::models::settings::ManagerSettings;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_settings).post(save_settings))
        .route("/ignored-files", post(set_ignored_files))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Result<Json<ManagerSettings>, AppError> {
    let store = state.settings.clone();
    let settings = tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(settings))
}

async fn save_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManagerSettings>,
) -> Result<Json<ManagerSettings>, AppError> {
    let store = state.settings.clone();
    let saved = body.clone();
    tokio::task::spawn_blocking(move || store.save(&saved))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    tracing::info!(ignored_files = body.ignored_files.len(), "Settings saved");
    Ok(Json(body))
}

async fn set_ignored_files(
    State(state): State<Arc<AppState>>,
    Json(patterns): Json<Vec<String>>,
) -> Result<Json<ManagerSettings>, AppError> {
    let store = state.settings.clone();
    let settings = tokio::task::spawn_blocking(move || store.set_ignored_files(patterns))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    tracing::info!(ignored_files = settings.ignored_files.len(), "Ignored files updated");
    Ok(Json(settings))
}
