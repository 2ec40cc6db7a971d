use crate::error::AppError;
use crate::state::AppState;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use deploy_sync::deploy::{DeployOutcome, GroupDeployReport};
use deploy_sync::fs::metadata::parse_client_timestamp;
use deploy_sync::staging::{IncomingChunk, UploadTarget};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const LAST_MODIFIED_PREFIX: &str = "lastModified_";

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/begin/{target}", post(begin_upload))
        .route("/group/begin/{group}", post(begin_group_upload))
        .route("/{upload_id}/chunk/{target}", post(upload_chunk))
        .route("/{upload_id}/chunk/group/{group}", post(upload_group_chunk))
        .route("/{upload_id}/file/{target}", post(upload_files))
        .route("/{upload_id}/file/group/{group}", post(upload_group_files))
        .route("/{upload_id}/finalize/{target}", post(finalize_upload))
        .route("/{upload_id}/finalize/group/{group}/site/{site}", post(finalize_group_site))
        .route("/{upload_id}/finalize/group/{group}", post(finalize_group))
        .layer(DefaultBodyLimit::max(state.config.uploads.max_chunk_bytes))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeResponse {
    message: String,
    #[serde(flatten)]
    outcome: DeployOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupFinalizeResponse {
    message: String,
    errors: Vec<String>,
    #[serde(flatten)]
    report: GroupDeployReport,
}

fn bad_multipart(e: MultipartError) -> AppError {
    AppError::BadRequest(format!("Invalid multipart body: {e}"))
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid {name}: {value}")))
}

fn parse_time(name: &str, value: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse_client_timestamp(value)
        .map(Some)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid {name}: {value}")))
}

/// Read one chunk: a file part (its file name is the relative path) plus
/// `chunkIndex`, `totalSize`, `lastModified`, optional `relativePath` and
/// `encoding=zstd`.
async fn read_chunk(mut multipart: Multipart) -> Result<IncomingChunk, AppError> {
    let mut data: Option<Bytes> = None;
    let mut file_name = None;
    let mut relative_path = None;
    let mut index = None;
    let mut total_size = None;
    let mut last_modified = None;
    let mut compressed = false;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(part_name) = field.file_name().map(str::to_string) {
            if data.is_none() {
                file_name = Some(part_name.trim_matches('"').to_string());
                data = Some(field.bytes().await.map_err(bad_multipart)?);
            }
            continue;
        }

        let value = field.text().await.map_err(bad_multipart)?;
        match name.as_str() {
            "chunkIndex" => index = Some(parse_field::<u32>(&name, &value)?),
            "totalSize" => total_size = Some(parse_field::<u64>(&name, &value)?),
            "lastModified" => last_modified = parse_time(&name, &value)?,
            "relativePath" => relative_path = Some(value),
            "encoding" => compressed = value.trim().eq_ignore_ascii_case("zstd"),
            _ => {}
        }
    }

    let data = data.ok_or_else(|| AppError::BadRequest("No file in request".into()))?;
    let index = index.ok_or_else(|| AppError::BadRequest("chunkIndex is required".into()))?;
    let relative_path = relative_path
        .or(file_name)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::BadRequest("File name is required".into()))?;

    let data = if compressed {
        tokio::task::spawn_blocking(move || zstd::decode_all(&data[..]))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map_err(|e| AppError::BadRequest(format!("Invalid zstd chunk: {e}")))?
    } else {
        data.to_vec()
    };

    Ok(IncomingChunk {
        relative_path,
        index,
        data,
        total_size,
        last_modified,
    })
}

/// Read whole-file parts plus their `lastModified_<relativePath>` fields.
async fn read_files(
    mut multipart: Multipart,
) -> Result<(Vec<(String, Bytes)>, HashMap<String, DateTime<Utc>>), AppError> {
    let mut files = Vec::new();
    let mut times = HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(|f| f.trim_matches('"').to_string()) {
            let data = field.bytes().await.map_err(bad_multipart)?;
            files.push((file_name, data));
            continue;
        }

        if let Some(path) = name.strip_prefix(LAST_MODIFIED_PREFIX) {
            let value = field.text().await.map_err(bad_multipart)?;
            if let Some(when) = parse_time(&name, &value)? {
                times.insert(path.replace('\\', "/"), when);
            }
        }
    }

    if files.is_empty() {
        return Err(AppError::BadRequest("No files in request".into()));
    }
    Ok((files, times))
}

async fn begin_upload(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
) -> Result<Json<Value>, AppError> {
    let root = state.physical_path(&target).await?;
    let upload_id = state
        .sessions
        .begin_session(UploadTarget::Site(target), &root)
        .await?;
    Ok(Json(json!({ "uploadId": upload_id })))
}

async fn begin_group_upload(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Result<Json<Value>, AppError> {
    let group = state.group(&group).await?;
    let root = state.physical_path(AppState::group_host_site(&group)?).await?;
    let upload_id = state
        .sessions
        .begin_session(UploadTarget::Group(group.name), &root)
        .await?;
    Ok(Json(json!({ "uploadId": upload_id })))
}

async fn store_chunk(
    state: &AppState,
    upload_id: &str,
    target: UploadTarget,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    state.sessions.session_for(upload_id, &target).await?;
    let chunk = read_chunk(multipart).await?;
    let index = chunk.index;
    state.sessions.receive_chunk(upload_id, chunk).await?;
    Ok(Json(json!({ "message": "Chunk received", "chunkIndex": index })))
}

async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((upload_id, target)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    store_chunk(&state, &upload_id, UploadTarget::Site(target), multipart).await
}

async fn upload_group_chunk(
    State(state): State<Arc<AppState>>,
    Path((upload_id, group)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    store_chunk(&state, &upload_id, UploadTarget::Group(group), multipart).await
}

async fn store_files(
    state: &AppState,
    upload_id: &str,
    target: UploadTarget,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    state.sessions.session_for(upload_id, &target).await?;
    let (files, times) = read_files(multipart).await?;
    for (path, data) in &files {
        let when = times.get(&path.replace('\\', "/")).copied();
        state.sessions.receive_file(upload_id, path, data, when).await?;
    }
    Ok(Json(json!({ "message": "Files received", "count": files.len() })))
}

async fn upload_files(
    State(state): State<Arc<AppState>>,
    Path((upload_id, target)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    store_files(&state, &upload_id, UploadTarget::Site(target), multipart).await
}

async fn upload_group_files(
    State(state): State<Arc<AppState>>,
    Path((upload_id, group)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    store_files(&state, &upload_id, UploadTarget::Group(group), multipart).await
}

async fn finalize_upload(
    State(state): State<Arc<AppState>>,
    Path((upload_id, target)): Path<(String, String)>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let patterns = state.ignore_patterns().await?;
    let outcome = state
        .deployer
        .finalize_site(&upload_id, &target, &patterns)
        .await?;
    Ok(Json(FinalizeResponse {
        message: format!("Deployed {} file(s) to '{}'", outcome.merged.len(), target),
        outcome,
    }))
}

async fn finalize_group_site(
    State(state): State<Arc<AppState>>,
    Path((upload_id, group, site)): Path<(String, String, String)>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let group = state.group(&group).await?;
    if !group.site_names.contains(&site) {
        return Err(AppError::BadRequest(format!(
            "Site '{site}' is not part of group '{}'",
            group.name
        )));
    }
    let patterns = state.ignore_patterns().await?;
    let outcome = state
        .deployer
        .finalize_group_site(&upload_id, &group.name, &site, &patterns)
        .await?;
    Ok(Json(FinalizeResponse {
        message: format!("Deployed {} file(s) to '{}'", outcome.merged.len(), site),
        outcome,
    }))
}

async fn finalize_group(
    State(state): State<Arc<AppState>>,
    Path((upload_id, group)): Path<(String, String)>,
) -> Result<Json<GroupFinalizeResponse>, AppError> {
    let group = state.group(&group).await?;
    let patterns = state.ignore_patterns().await?;
    let report = state
        .deployer
        .finalize_group(&upload_id, &group.name, &group.site_names, &patterns)
        .await?;

    let errors = report.errors();
    let deployed = report.results.iter().filter(|r| r.success).count();
    let message = if errors.is_empty() {
        format!("Deployed group '{}' to {} site(s)", group.name, deployed)
    } else {
        format!(
            "Deployed group '{}' to {} site(s), {} failed",
            group.name,
            deployed,
            errors.len()
        )
    };
    Ok(Json(GroupFinalizeResponse {
        message,
        errors,
        report,
    }))
}
