use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::response::{ApiError, ApiResult, error_code};
use super::router::AppState;
use crate::auth::{check_repo_read_permission, get_optional_user};
use crate::lfs::lfs_key;
use crate::rules::should_use_lfs;

const DOWNLOAD_URL_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct PreuploadFile {
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreuploadPayload {
    pub files: Vec<PreuploadFile>,
}

/// Partition upload candidates into regular vs LFS and flag content the
/// server already has.
pub async fn preupload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    Json(payload): Json<PreuploadPayload>,
) -> ApiResult<Json<Value>> {
    let (parsed_type, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let mut out = Vec::with_capacity(payload.files.len());
    for f in &payload.files {
        let use_lfs = should_use_lfs(&repo, &state.config.app, &f.path, f.size);

        let mut should_ignore = false;
        if let Some(sha256) = &f.sha256 {
            if let Some(existing) = state.store.get_file(repo.id, &f.path)? {
                should_ignore =
                    !existing.is_deleted && existing.sha256 == *sha256 && existing.size == f.size;
            }
        }

        if !use_lfs {
            let storage_key = format!(
                "_staging/{}/{revision}/{}/{}",
                repo.full_id,
                Uuid::new_v4().simple(),
                f.path
            );
            state.store.create_staging_upload(
                repo.id,
                parsed_type,
                &revision,
                &f.path,
                f.sha256.as_deref().unwrap_or(""),
                f.size,
                &storage_key,
                false,
            )?;
        }

        out.push(json!({
            "path": f.path,
            "uploadMode": if use_lfs { "lfs" } else { "regular" },
            "shouldIgnore": should_ignore,
        }));
    }

    Ok(Json(json!({ "files": out })))
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    pub recursive: Option<bool>,
    #[serde(default)]
    pub expand: Option<bool>,
}

pub async fn tree_root(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    query: Query<TreeQuery>,
) -> ApiResult<Json<Value>> {
    tree(state, headers, repo_type, namespace, name, revision, String::new(), query.0).await
}

pub async fn tree_path(
    state: State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, revision, path)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    query: Query<TreeQuery>,
) -> ApiResult<Json<Value>> {
    tree(state, headers, repo_type, namespace, name, revision, path, query.0).await
}

#[allow(clippy::too_many_arguments)]
async fn tree(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    repo_type: String,
    namespace: String,
    name: String,
    revision: String,
    path: String,
    query: TreeQuery,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let lakefs_repo = state.lakefs_name(&repo);
    let recursive = query.recursive.unwrap_or(false);
    let expand = query.expand.unwrap_or(false);

    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{}/", path.trim_end_matches('/'))
    };
    let delimiter = if recursive { "" } else { "/" };

    // Branch HEAD enriches entries with a last-commit stamp when expanded.
    let last_commit = if expand {
        match state.lakefs.get_branch(&lakefs_repo, &revision).await {
            Ok(branch) => {
                let date = state
                    .lakefs
                    .get_commit(&lakefs_repo, &branch.commit_id)
                    .await
                    .ok()
                    .and_then(|c| chrono::DateTime::from_timestamp(c.creation_date, 0))
                    .map(|d| d.to_rfc3339());
                Some(json!({ "id": branch.commit_id, "date": date }))
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let mut entries = Vec::new();
    let mut after = String::new();
    loop {
        let listing = state
            .lakefs
            .list_objects(&lakefs_repo, &revision, &prefix, delimiter, &after, 1000)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ApiError::not_found(format!("Revision {revision} not found"))
                        .with_code(error_code::REVISION_NOT_FOUND)
                } else {
                    ApiError::from(crate::error::Error::from(e))
                }
            })?;

        for obj in &listing.results {
            if obj.is_object() {
                let record = state.store.get_file(repo.id, &obj.path)?;
                let is_lfs = record.as_ref().map(|f| f.lfs).unwrap_or(false);
                let mut entry = json!({
                    "path": obj.path,
                    "type": "blob",
                    "size": obj.size_bytes,
                    "oid": obj.checksum_hex(),
                });
                if is_lfs {
                    if let (Some(record), Value::Object(map)) = (record, &mut entry) {
                        map.insert(
                            "lfs".to_string(),
                            json!({ "oid": record.sha256, "size": record.size }),
                        );
                    }
                }
                if let (Some(last_commit), Value::Object(map)) = (&last_commit, &mut entry) {
                    map.insert("lastCommit".to_string(), last_commit.clone());
                }
                entries.push(entry);
            } else {
                entries.push(json!({
                    "path": obj.path.trim_end_matches('/'),
                    "type": "tree",
                }));
            }
        }

        match listing.pagination {
            Some(p) if p.has_more => after = p.next_offset,
            _ => break,
        }
    }

    Ok(Json(Value::Array(entries)))
}

/// Redirect to a presigned blob URL. LFS files resolve through the global
/// content-addressed key; regular files through their storage-namespace
/// address.
pub async fn resolve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, revision, path)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> ApiResult<Response> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let lakefs_repo = state.lakefs_name(&repo);

    let stat = state
        .lakefs
        .stat_object(&lakefs_repo, &revision, &path)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("Entry {path} not found at {revision}"))
                    .with_code(error_code::ENTRY_NOT_FOUND)
            } else {
                ApiError::from(crate::error::Error::from(e))
            }
        })?;

    let commit_id = state
        .lakefs
        .get_branch(&lakefs_repo, &revision)
        .await
        .map(|b| b.commit_id)
        .unwrap_or_else(|_| revision.clone());

    let filename = path.rsplit('/').next().unwrap_or(&path);
    let record = state.store.get_file(repo.id, &path)?;
    let (key, etag) = match &record {
        Some(f) if f.lfs => (lfs_key(&f.sha256), f.sha256.clone()),
        _ => {
            let key = blob_key_from_address(&stat.physical_address, state.blobs.bucket())
                .ok_or_else(|| {
                    ApiError::internal(format!(
                        "Unresolvable physical address for {path}"
                    ))
                })?;
            (key, stat.checksum_hex().to_string())
        }
    };

    let url = state
        .blobs
        .presign_get(&key, DOWNLOAD_URL_EXPIRY, Some(filename))
        .await?;

    let mut response = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, url)
        .header("X-Repo-Commit", commit_id)
        .header(header::ETAG, format!("\"{etag}\""))
        .header(header::CONTENT_LENGTH, stat.size_bytes.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{filename}\""),
        );
    if let Some(f) = &record {
        if f.lfs {
            response = response.header("X-Linked-Size", f.size.to_string());
        }
    }

    response
        .body(axum::body::Body::empty())
        .map_err(|e| ApiError::internal(format!("response build failed: {e}")))
}

/// Strip `s3://{bucket}/` from a physical address.
fn blob_key_from_address(address: &str, bucket: &str) -> Option<String> {
    address
        .strip_prefix("s3://")?
        .strip_prefix(bucket)?
        .strip_prefix('/')
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_physical_addresses() {
        assert_eq!(
            blob_key_from_address("s3://hub/hf-model-a-b-1/data/x", "hub"),
            Some("hf-model-a-b-1/data/x".to_string())
        );
        assert_eq!(blob_key_from_address("s3://other/x", "hub"), None);
        assert_eq!(blob_key_from_address("file:///x", "hub"), None);
    }
}
