//! Request handlers. Each one unpacks the request, calls into the sandbox
//! core and wraps the result in the `{success, ...}` envelope.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use super::error::{ApiError, ApiResult};
use crate::sandbox::{FileMap, Sandboxes};

type AppState = State<Arc<Sandboxes>>;

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileBody {
    path: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFilesBody {
    files: Option<FileMap>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestBody {
    package: Option<Value>,
}

fn required<T>(value: Option<T>, what: &str) -> ApiResult<T> {
    value.ok_or_else(|| ApiError::BadRequest(format!("{} is required", what)))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "success": true, "status": "ok" }))
}

pub async fn list(State(sandboxes): AppState) -> ApiResult<Json<Value>> {
    let containers = sandboxes.list().await?;
    Ok(Json(json!({ "success": true, "containers": containers })))
}

pub async fn create(State(sandboxes): AppState) -> ApiResult<Json<Value>> {
    let created = sandboxes.create().await?;
    info!(id = %created.id, port = created.port, "http:sandbox created");
    Ok(Json(json!({
        "success": true,
        "containerId": created.container_id,
        "container": created,
    })))
}

pub async fn start(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let summary = sandboxes.start(&id).await?;
    Ok(Json(json!({
        "success": true,
        "containerId": summary.id,
        "port": summary.port,
        "url": summary.url,
        "status": summary.status,
        "message": "Container is running",
    })))
}

pub async fn stop(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    sandboxes.stop(&id).await?;
    Ok(Json(json!({ "success": true, "message": "Container stopped" })))
}

pub async fn remove(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    sandboxes.stop(&id).await?;
    Ok(Json(json!({ "success": true, "message": "Container deleted" })))
}

pub async fn list_files(
    State(sandboxes): AppState,
    Path(id): Path<String>,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let files = sandboxes.list_files(&id, query.path.as_deref()).await?;
    Ok(Json(json!({
        "success": true,
        "path": query.path,
        "files": files,
    })))
}

pub async fn file_tree(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let tree = sandboxes.file_tree(&id).await?;
    Ok(Json(json!({ "success": true, "fileTree": tree })))
}

pub async fn file_content_tree(
    State(sandboxes): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let tree = sandboxes.file_content_tree(&id).await?;
    Ok(Json(json!({ "success": true, "fileContentTree": tree })))
}

pub async fn read_file(
    State(sandboxes): AppState,
    Path(id): Path<String>,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let path = required(query.path, "path")?;
    let content = sandboxes.read_file(&id, &path).await?;
    Ok(Json(json!({ "success": true, "path": path, "content": content })))
}

pub async fn write_file(
    State(sandboxes): AppState,
    Path(id): Path<String>,
    body: Result<Json<WriteFileBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let path = required(body.path, "path")?;
    let content = required(body.content, "content")?;

    let mut files = FileMap::new();
    files.insert(path.clone(), content);
    sandboxes.write_files(&id, &files).await?.into_result()?;
    Ok(Json(json!({
        "success": true,
        "path": path,
        "message": "File updated",
    })))
}

/// Bulk write. A partial failure answers 207 with the per-path results so the
/// caller can see exactly which files were applied.
pub async fn write_files(
    State(sandboxes): AppState,
    Path(id): Path<String>,
    body: Result<Json<WriteFilesBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let files = required(body.files, "files")?;
    let report = sandboxes.write_files(&id, &files).await?;

    if report.is_complete() {
        return Ok(Json(json!({
            "success": true,
            "results": report.results,
            "message": format!("{} files updated", report.results.len()),
        }))
        .into_response());
    }

    let failed = report.failures().count();
    let body = json!({
        "success": false,
        "error": format!("{} of {} files failed to sync", failed, report.results.len()),
        "results": report.results,
    });
    Ok((StatusCode::MULTI_STATUS, Json(body)).into_response())
}

pub async fn logs(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let logs = sandboxes.logs(&id).await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

pub async fn read_manifest(
    State(sandboxes): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let package = sandboxes.read_manifest(&id).await?;
    Ok(Json(json!({ "success": true, "package": package })))
}

pub async fn write_manifest(
    State(sandboxes): AppState,
    Path(id): Path<String>,
    body: Result<Json<ManifestBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let package = required(body.package, "package")?;
    if !package.is_object() {
        return Err(ApiError::BadRequest("package must be a JSON object".to_string()));
    }
    sandboxes.write_manifest(&id, &package).await?;
    Ok(Json(json!({ "success": true, "message": "package.json updated" })))
}

pub async fn export(State(sandboxes): AppState, Path(id): Path<String>) -> ApiResult<Response> {
    let archive = sandboxes.export(&id).await?;
    let disposition = format!(
        "attachment; filename=\"sandbox-{}.tar.gz\"",
        crate::sandbox::slugify_id(&id)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}
