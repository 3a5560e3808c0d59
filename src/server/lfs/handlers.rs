use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::dto::{Action, BatchRequest, BatchResponse, ObjectResponse, ObjectSpec};
use super::super::response::{ApiError, ApiResult};
use super::super::router::AppState;
use crate::auth::{
    check_repo_read_permission, check_repo_write_permission, get_current_user, get_optional_user,
};
use crate::lfs::{is_valid_oid, lfs_key, plan_multipart};
use crate::quota::check_quota;
use crate::types::Repository;

const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";
/// Large transfers take time; presigned uploads live for a day, multipart
/// uploads for a week.
const UPLOAD_URL_EXPIRY: Duration = Duration::from_secs(86_400);
const MULTIPART_URL_EXPIRY: Duration = Duration::from_secs(86_400 * 7);
const DOWNLOAD_URL_EXPIRY: Duration = Duration::from_secs(86_400);

fn lfs_json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    let json = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, LFS_MEDIA_TYPE)
        .body(Body::from(json))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn verify_url(state: &AppState, full_id: &str) -> String {
    format!(
        "{}/api/{full_id}.git/info/lfs/verify",
        state.config.app.base_url
    )
}

fn complete_url(state: &AppState, full_id: &str, upload_id: &str) -> String {
    format!(
        "{}/api/{full_id}.git/info/lfs/complete/{upload_id}",
        state.config.app.base_url
    )
}

async fn upload_object_response(
    state: &AppState,
    repo: &Repository,
    spec: &ObjectSpec,
    is_browser: bool,
) -> ObjectResponse {
    if !is_valid_oid(&spec.oid) {
        return ObjectResponse::with_error(spec.oid.clone(), spec.size, 422, "Invalid OID format");
    }

    let key = lfs_key(&spec.oid);

    // Global dedup: the blob store or any File row with this content means
    // the client can skip the upload entirely.
    let in_store = state.blobs.exists(&key).await.unwrap_or(false);
    let in_db = state
        .store
        .get_file_by_sha256(&spec.oid)
        .ok()
        .flatten()
        .is_some_and(|f| f.size == spec.size);
    if in_store || in_db {
        info!(
            "LFS object {} already exists (s3={in_store}, db={in_db}), skipping upload",
            &spec.oid[..8]
        );
        return ObjectResponse::exists(spec.oid.clone(), spec.size);
    }

    if spec.size > state.config.s3.multipart_threshold_bytes {
        return multipart_upload_response(state, repo, spec).await;
    }

    // Single presigned PUT, checksum-pinned so the store verifies content.
    let checksum_b64 = match hex::decode(&spec.oid) {
        Ok(raw) => BASE64.encode(raw),
        Err(_) => {
            return ObjectResponse::with_error(
                spec.oid.clone(),
                spec.size,
                422,
                "Invalid OID format",
            );
        }
    };
    let content_type = is_browser.then_some("application/octet-stream");

    match state
        .blobs
        .presign_put(&key, UPLOAD_URL_EXPIRY, content_type, Some(&checksum_b64))
        .await
    {
        Ok(upload) => {
            let mut actions = HashMap::new();
            actions.insert(
                "upload".to_string(),
                Action {
                    href: upload.url,
                    header: Some(upload.headers),
                    expires_at: Some(upload.expires_at.clone()),
                },
            );
            actions.insert(
                "verify".to_string(),
                Action {
                    href: verify_url(state, &repo.full_id),
                    header: None,
                    expires_at: Some(upload.expires_at),
                },
            );
            ObjectResponse::with_actions(spec.oid.clone(), spec.size, actions)
        }
        Err(e) => ObjectResponse::with_error(
            spec.oid.clone(),
            spec.size,
            500,
            format!("Failed to generate upload URL: {e}"),
        ),
    }
}

async fn multipart_upload_response(
    state: &AppState,
    repo: &Repository,
    spec: &ObjectSpec,
) -> ObjectResponse {
    let key = lfs_key(&spec.oid);
    let plan = plan_multipart(spec.size, state.config.s3.multipart_chunk_size_bytes);

    let upload_id = match state.blobs.create_multipart(&key).await {
        Ok(id) => id,
        Err(e) => {
            return ObjectResponse::with_error(
                spec.oid.clone(),
                spec.size,
                500,
                format!("Failed to start multipart upload: {e}"),
            );
        }
    };

    // Clients detect multipart by the chunk_size header entry; part URLs use
    // numeric string keys.
    let mut header = HashMap::new();
    header.insert("chunk_size".to_string(), plan.chunk_size.to_string());
    header.insert("upload_id".to_string(), upload_id.clone());

    let parts = join_all((1..=plan.part_count).map(|n| {
        let key = key.clone();
        let upload_id = upload_id.clone();
        async move {
            let url = state
                .blobs
                .presign_part(&key, &upload_id, n as i32, MULTIPART_URL_EXPIRY)
                .await;
            (n, url)
        }
    }))
    .await;

    for (n, url) in parts {
        match url {
            Ok(url) => {
                header.insert(n.to_string(), url);
            }
            Err(e) => {
                warn!("Failed to presign part {n} of {}: {e}", &spec.oid[..8]);
                return ObjectResponse::with_error(
                    spec.oid.clone(),
                    spec.size,
                    500,
                    format!("Failed to generate multipart URLs: {e}"),
                );
            }
        }
    }

    info!(
        "Multipart upload for {}: {} part(s), chunk_size={}",
        &spec.oid[..8],
        plan.part_count,
        plan.chunk_size
    );

    let expires_at = (chrono::Utc::now()
        + chrono::Duration::from_std(MULTIPART_URL_EXPIRY).unwrap_or_default())
    .format("%Y-%m-%dT%H:%M:%S%.fZ")
    .to_string();

    let mut actions = HashMap::new();
    actions.insert(
        "upload".to_string(),
        Action {
            href: complete_url(state, &repo.full_id, &upload_id),
            header: Some(header),
            expires_at: Some(expires_at.clone()),
        },
    );
    actions.insert(
        "verify".to_string(),
        Action {
            href: verify_url(state, &repo.full_id),
            header: None,
            expires_at: Some(expires_at),
        },
    );

    ObjectResponse::with_actions(spec.oid.clone(), spec.size, actions)
}

async fn download_object_response(state: &AppState, spec: &ObjectSpec) -> ObjectResponse {
    if !is_valid_oid(&spec.oid) {
        return ObjectResponse::with_error(spec.oid.clone(), spec.size, 422, "Invalid OID format");
    }

    let known = state
        .store
        .get_file_by_sha256(&spec.oid)
        .ok()
        .flatten()
        .is_some();
    if !known {
        return ObjectResponse::with_error(spec.oid.clone(), spec.size, 404, "Object not found");
    }

    match state
        .blobs
        .presign_get(&lfs_key(&spec.oid), DOWNLOAD_URL_EXPIRY, None)
        .await
    {
        Ok(url) => {
            let expires_at = (chrono::Utc::now()
                + chrono::Duration::from_std(DOWNLOAD_URL_EXPIRY).unwrap_or_default())
            .format("%Y-%m-%dT%H:%M:%S%.fZ")
            .to_string();
            let mut actions = HashMap::new();
            actions.insert(
                "download".to_string(),
                Action {
                    href: url,
                    header: None,
                    expires_at: Some(expires_at),
                },
            );
            ObjectResponse::with_actions(spec.oid.clone(), spec.size, actions)
        }
        Err(e) => ObjectResponse::with_error(
            spec.oid.clone(),
            spec.size,
            500,
            format!("Failed to generate download URL: {e}"),
        ),
    }
}

async fn batch_inner(
    state: &AppState,
    repo_type_plural: &str,
    namespace: &str,
    name: &str,
    headers: &HeaderMap,
    request: BatchRequest,
) -> ApiResult<Response> {
    let (_, repo) = state.resolve_repo(repo_type_plural, namespace, name)?;

    match request.operation.as_str() {
        "upload" => {
            let user = get_current_user(state.store.as_ref(), headers)?;
            check_repo_write_permission(state.store.as_ref(), &repo, &user)?;

            // One quota check covers the whole batch.
            let total: i64 = request.objects.iter().map(|o| o.size).sum();
            if let Err(e) = check_quota(state.store.as_ref(), &repo.namespace, total, repo.private)
            {
                let message = e.to_string();
                let objects = request
                    .objects
                    .iter()
                    .map(|o| ObjectResponse::with_error(o.oid.clone(), o.size, 413, message.as_str()))
                    .collect();
                return Ok(lfs_json_response(
                    StatusCode::OK,
                    &BatchResponse {
                        transfer: "basic",
                        objects,
                        hash_algo: "sha256",
                    },
                ));
            }

            let objects = join_all(
                request
                    .objects
                    .iter()
                    .map(|o| upload_object_response(state, &repo, o, request.is_browser)),
            )
            .await;
            Ok(lfs_json_response(
                StatusCode::OK,
                &BatchResponse {
                    transfer: "basic",
                    objects,
                    hash_algo: "sha256",
                },
            ))
        }
        "download" => {
            let user = get_optional_user(state.store.as_ref(), headers)?;
            check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

            let objects = join_all(
                request
                    .objects
                    .iter()
                    .map(|o| download_object_response(state, o)),
            )
            .await;
            Ok(lfs_json_response(
                StatusCode::OK,
                &BatchResponse {
                    transfer: "basic",
                    objects,
                    hash_algo: "sha256",
                },
            ))
        }
        other => Err(ApiError::bad_request(format!("Invalid operation: {other}"))),
    }
}

/// Typed route: POST /{type}s/{ns}/{name}.git/info/lfs/objects/batch
pub async fn batch(
    State(state): State<Arc<AppState>>,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Response> {
    batch_inner(&state, &repo_type, &namespace, &name, &headers, request).await
}

/// Fallback route: POST /{ns}/{name}.git/info/lfs/objects/batch (model repos).
pub async fn batch_for(
    state: Arc<AppState>,
    repo_type_plural: &str,
    namespace: &str,
    name: &str,
    req: Request,
) -> Response {
    let headers = req.headers().clone();
    let request = match read_json::<BatchRequest>(req).await {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    match batch_inner(&state, repo_type_plural, namespace, name, &headers, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to read body: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))
}

/// Both `{PartNumber, ETag}` and `{partNumber, etag}` casings are accepted.
fn normalize_parts(parts: &[Value]) -> Result<Vec<(i32, String)>, ApiError> {
    let mut normalized = Vec::with_capacity(parts.len());
    for part in parts {
        let number = part
            .get("PartNumber")
            .or_else(|| part.get("partNumber"))
            .and_then(Value::as_i64);
        let etag = part
            .get("ETag")
            .or_else(|| part.get("etag"))
            .and_then(Value::as_str);
        match (number, etag) {
            (Some(number), Some(etag)) if number >= 1 => {
                normalized.push((number as i32, etag.to_string()));
            }
            _ => {
                return Err(ApiError::bad_request(format!(
                    "Invalid part format: {part}; expected PartNumber/partNumber and ETag/etag"
                )));
            }
        }
    }
    Ok(normalized)
}

async fn complete_inner(
    state: &AppState,
    upload_id: Option<String>,
    body: Value,
) -> ApiResult<Json<Value>> {
    let oid = body
        .get("oid")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Missing required field: oid"))?;
    let declared_size = body.get("size").and_then(Value::as_i64);
    let upload_id = upload_id
        .or_else(|| {
            body.get("upload_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::bad_request("Missing required field: upload_id"))?;
    let parts = body
        .get("parts")
        .and_then(Value::as_array)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing required field: parts"))?;

    if !is_valid_oid(oid) {
        return Err(ApiError::bad_request("Invalid OID format"));
    }
    let parts = normalize_parts(parts)?;

    info!(
        "Completing multipart upload for {}: {} part(s)",
        &oid[..8],
        parts.len()
    );
    let key = lfs_key(oid);
    let meta = state
        .blobs
        .complete_multipart(&key, &upload_id, &parts)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to complete multipart upload: {e}")))?;

    if let Some(expected) = declared_size {
        if meta.size != expected {
            return Err(ApiError::bad_request(format!(
                "Size mismatch after upload: expected {expected}, got {}",
                meta.size
            )));
        }
    }

    Ok(Json(json!({
        "message": "Multipart upload completed successfully",
        "size": meta.size,
        "etag": meta.etag,
    })))
}

pub async fn complete_multipart(
    state: Arc<AppState>,
    _namespace: &str,
    _name: &str,
    upload_id: Option<String>,
    req: Request,
) -> Response {
    let body = match read_json::<Value>(req).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    match complete_inner(&state, upload_id, body).await {
        Ok(json) => json.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn verify_inner(state: &AppState, body: Value) -> ApiResult<Json<Value>> {
    let oid = body
        .get("oid")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Missing OID"))?;
    if !is_valid_oid(oid) {
        return Err(ApiError::bad_request("Invalid OID format"));
    }
    let size = body.get("size").and_then(Value::as_i64);
    let upload_id = body.get("upload_id").and_then(Value::as_str);
    let parts = body.get("parts").and_then(Value::as_array);

    let key = lfs_key(oid);

    // A multipart upload may be finalized here instead of the complete
    // endpoint.
    if let (Some(upload_id), Some(parts)) = (upload_id, parts) {
        let parts = normalize_parts(parts)?;
        info!(
            "Completing multipart upload during verify for {}: {} part(s)",
            &oid[..8],
            parts.len()
        );
        state
            .blobs
            .complete_multipart(&key, upload_id, &parts)
            .await
            .map_err(|e| {
                ApiError::upstream(format!("Failed to complete multipart upload: {e}"))
            })?;
    }

    let exists = state
        .blobs
        .exists(&key)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to verify object: {e}")))?;
    if !exists {
        return Err(ApiError::not_found("Object not found in storage"));
    }

    if let Some(expected) = size {
        match state.blobs.head(&key).await {
            Ok(meta) if meta.size != expected => {
                return Err(ApiError::bad_request(format!(
                    "Size mismatch: expected {expected}, got {}",
                    meta.size
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to verify size for {}: {e}", &oid[..8]),
        }
    }

    Ok(Json(json!({ "message": "Object verified successfully" })))
}

pub async fn verify(
    state: Arc<AppState>,
    _namespace: &str,
    _name: &str,
    req: Request,
) -> Response {
    let body = match read_json::<Value>(req).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    match verify_inner(&state, body).await {
        Ok(json) => json.into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_both_part_casings() {
        let parts = vec![
            json!({"PartNumber": 1, "ETag": "abc"}),
            json!({"partNumber": 2, "etag": "def"}),
        ];
        let normalized = normalize_parts(&parts).unwrap();
        assert_eq!(normalized, vec![(1, "abc".to_string()), (2, "def".to_string())]);
    }

    #[test]
    fn rejects_malformed_parts() {
        assert!(normalize_parts(&[json!({"PartNumber": 1})]).is_err());
        assert!(normalize_parts(&[json!({"PartNumber": 0, "ETag": "x"})]).is_err());
        assert!(normalize_parts(&[json!({"etag": "x"})]).is_err());
    }
}
