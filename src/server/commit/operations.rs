//! The NDJSON commit pipeline: parse, apply operations against the
//! versioned store, commit, then settle bookkeeping (commit record, LFS
//! history, retention GC, storage accounting).

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::join_all;
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::super::response::{ApiError, ApiResult};
use super::super::router::AppState;
use crate::auth::{check_repo_write_permission, get_current_user};
use crate::gc::{refresh_storage_accounting, run_gc_for_file, track_lfs_object};
use crate::lakefs::{StagingLocation, StagingMetadata};
use crate::lfs::{lfs_key, physical_address};
use crate::rules::{effective_lfs_threshold, should_use_lfs};
use crate::store::{FileUpsert, NewCommit};
use crate::types::Repository;

const COMMIT_VISIBILITY_ATTEMPTS: u32 = 120;
const COMMIT_VISIBILITY_INTERVAL_MS: u64 = 500;

/// Git blob id: `SHA1("blob {size}\0" + content)`. Stored for non-LFS files
/// so clients can dedup against it.
#[must_use]
pub fn git_blob_sha1(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

struct LfsTracking {
    path: String,
    sha256: String,
    size: i64,
    /// Set only when this commit truly replaced an older oid at the path;
    /// marks the path for a retention pass.
    old_sha256: Option<String>,
}

struct CommitHeader {
    summary: String,
    description: String,
}

struct Operation {
    key: String,
    value: Value,
}

fn parse_ndjson(body: &str) -> Result<(CommitHeader, Vec<Operation>), ApiError> {
    let mut header = None;
    let mut operations = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let obj: Value = serde_json::from_str(line)
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON line: {e}")))?;

        let key = obj.get("key").and_then(Value::as_str).unwrap_or_default();
        let value = obj.get("value").cloned().unwrap_or(Value::Null);

        match key {
            "header" => {
                header = Some(CommitHeader {
                    summary: value
                        .get("summary")
                        .and_then(Value::as_str)
                        .unwrap_or("Commit via API")
                        .to_string(),
                    description: value
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            "file" | "lfsFile" | "deletedFile" | "deletedFolder" | "copyFile" => {
                operations.push(Operation {
                    key: key.to_string(),
                    value,
                });
            }
            // Unknown keys are ignored for forward compatibility.
            _ => {}
        }
    }

    let header = header.ok_or_else(|| ApiError::bad_request("Missing commit header"))?;
    Ok((header, operations))
}

fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str, ApiError> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request(format!("Missing field '{name}'")))
}

/// Inline base64 file. Rejected when the repo's LFS rules say this content
/// must go through LFS; silent duplication of large content is worse than a
/// client round trip.
async fn process_regular_file(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    value: &Value,
) -> ApiResult<bool> {
    let path = str_field(value, "path")?;
    let encoding = value
        .get("encoding")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if !encoding.starts_with("base64") {
        return Err(ApiError::bad_request(format!(
            "Invalid file operation for {path}: unsupported encoding '{encoding}'"
        )));
    }

    let content = str_field(value, "content")?;
    let data = BASE64
        .decode(content)
        .map_err(|e| ApiError::bad_request(format!("Failed to decode base64 for {path}: {e}")))?;

    let size = data.len() as i64;
    if should_use_lfs(repo, &state.config.app, path, size) {
        let threshold = effective_lfs_threshold(repo, &state.config.app);
        return Err(ApiError::bad_request(format!(
            "File {path} should use LFS (size: {size} bytes, threshold: {threshold} bytes). \
             Use the 'lfsFile' operation instead of 'file'."
        )));
    }

    let sha1 = git_blob_sha1(&data);

    if let Some(existing) = state.store.get_file(repo.id, path)? {
        if existing.sha256 == sha1 && existing.size == size && !existing.is_deleted {
            debug!("Skipping unchanged file: {path}");
            return Ok(false);
        }
    }

    info!("Uploading regular file: {path} ({size} bytes)");
    state
        .lakefs
        .upload_object(lakefs_repo, revision, path, data)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to upload {path}: {e}")))?;

    state.store.upsert_file(&FileUpsert {
        repository: repo.id,
        path_in_repo: path,
        size,
        sha256: &sha1,
        lfs: false,
        owner: repo.owner,
    })?;

    Ok(true)
}

/// LFS reference: content was already uploaded to the blob store; link its
/// physical address on the branch.
async fn process_lfs_file(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    value: &Value,
) -> ApiResult<(bool, Option<LfsTracking>)> {
    let path = str_field(value, "path")?;
    let oid = str_field(value, "oid")?;
    let mut size = value.get("size").and_then(Value::as_i64).unwrap_or(0);
    let algo = value.get("algo").and_then(Value::as_str).unwrap_or("sha256");

    if oid.is_empty() {
        return Err(ApiError::bad_request(format!("Missing OID for LFS file {path}")));
    }
    if !crate::lfs::is_valid_oid(oid) {
        return Err(ApiError::bad_request(format!("Invalid OID for LFS file {path}")));
    }

    let existing = state.store.get_file(repo.id, path)?;

    let old_sha256 = existing
        .as_ref()
        .filter(|f| f.lfs && f.sha256 != oid)
        .map(|f| f.sha256.clone());
    if let Some(old) = &old_sha256 {
        info!("File {path} will be replaced: {} -> {}", &old[..8], &oid[..8]);
    }

    let address = physical_address(state.blobs.bucket(), oid);
    let staging = StagingMetadata {
        staging: StagingLocation {
            physical_address: address.clone(),
        },
        checksum: format!("{algo}:{oid}"),
        size_bytes: size,
    };

    if let Some(existing) = &existing {
        if existing.sha256 == oid && existing.size == size {
            if existing.is_deleted {
                // Resurrect: re-link the blob, keep the old history row.
                info!("Restoring deleted LFS file {path} ({})", &oid[..8]);
                state
                    .lakefs
                    .link_physical_address(lakefs_repo, revision, path, &staging)
                    .await
                    .map_err(|e| {
                        ApiError::upstream(format!("Failed to restore LFS file {path}: {e}"))
                    })?;

                state.store.upsert_file(&FileUpsert {
                    repository: repo.id,
                    path_in_repo: path,
                    size,
                    sha256: oid,
                    lfs: true,
                    owner: repo.owner,
                })?;

                return Ok((
                    true,
                    Some(LfsTracking {
                        path: path.to_string(),
                        sha256: oid.to_string(),
                        size,
                        old_sha256: None,
                    }),
                ));
            }

            // Unchanged and active; still record usage in this commit.
            debug!("LFS file unchanged: {path} ({})", &oid[..8]);
            return Ok((
                false,
                Some(LfsTracking {
                    path: path.to_string(),
                    sha256: oid.to_string(),
                    size,
                    old_sha256: None,
                }),
            ));
        }
    }

    // New content at this path: the blob must already be in the store.
    let key = lfs_key(oid);
    let exists = state
        .blobs
        .exists(&key)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to verify LFS object: {e}")))?;
    if !exists {
        return Err(ApiError::bad_request(format!(
            "LFS object {oid} not found in storage. Upload may have failed. Key: {key}"
        )));
    }

    match state.blobs.head(&key).await {
        Ok(meta) => {
            if meta.size != size {
                warn!(
                    "Size mismatch for {path}: declared {size}, stored {}",
                    meta.size
                );
                size = meta.size;
            }
        }
        Err(e) => warn!("Could not verify blob metadata for {path}: {e}"),
    }

    let staging = StagingMetadata {
        staging: StagingLocation {
            physical_address: address,
        },
        checksum: format!("{algo}:{oid}"),
        size_bytes: size,
    };
    state
        .lakefs
        .link_physical_address(lakefs_repo, revision, path, &staging)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to link LFS file {path}: {e}")))?;

    state.store.upsert_file(&FileUpsert {
        repository: repo.id,
        path_in_repo: path,
        size,
        sha256: oid,
        lfs: true,
        owner: repo.owner,
    })?;

    Ok((
        true,
        Some(LfsTracking {
            path: path.to_string(),
            sha256: oid.to_string(),
            size,
            old_sha256,
        }),
    ))
}

/// Soft delete: the row stays so LFS history keeps a valid file pointer.
async fn process_deleted_file(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    value: &Value,
) -> ApiResult<bool> {
    let path = str_field(value, "path")?;
    info!("Deleting file: {path}");

    if let Err(e) = state.lakefs.delete_object(lakefs_repo, revision, path).await {
        warn!("Failed to delete {path} from versioned store: {e}");
    }

    let updated = state.store.mark_file_deleted(repo.id, path)?;
    if updated == 0 {
        debug!("File {path} was not tracked");
    }
    Ok(true)
}

async fn process_deleted_folder(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    value: &Value,
) -> ApiResult<bool> {
    let path = str_field(value, "path")?;
    let folder = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    };
    info!("Deleting folder: {folder}");

    let mut paths = Vec::new();
    let mut after = String::new();
    loop {
        let listing = state
            .lakefs
            .list_objects(lakefs_repo, revision, &folder, "", &after, 1000)
            .await
            .map_err(|e| ApiError::upstream(format!("Failed to list {folder}: {e}")))?;
        paths.extend(
            listing
                .results
                .iter()
                .filter(|o| o.is_object())
                .map(|o| o.path.clone()),
        );
        match listing.pagination {
            Some(p) if p.has_more => after = p.next_offset,
            _ => break,
        }
    }

    let deletions = paths.iter().map(|p| async move {
        match state.lakefs.delete_object(lakefs_repo, revision, p).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to delete {p}: {e}");
                false
            }
        }
    });
    let deleted = join_all(deletions).await.into_iter().filter(|ok| *ok).count();
    info!("Deleted {deleted}/{} file(s) under {folder}", paths.len());

    let tombstoned = state.store.mark_folder_deleted(repo.id, &folder)?;
    debug!("Marked {tombstoned} file row(s) deleted under {folder}");
    Ok(true)
}

/// Copy by linking the source's physical address; no bytes move for either
/// LFS or regular content.
async fn process_copy_file(
    state: &AppState,
    repo: &Repository,
    lakefs_repo: &str,
    revision: &str,
    value: &Value,
) -> ApiResult<bool> {
    let dest_path = str_field(value, "path")?;
    let src_path = str_field(value, "srcPath")?;
    let src_revision = value
        .get("srcRevision")
        .and_then(Value::as_str)
        .unwrap_or(revision);

    info!("Copying {src_path} -> {dest_path} (from {src_revision})");

    let src = state
        .lakefs
        .stat_object(lakefs_repo, src_revision, src_path)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to stat {src_path}: {e}")))?;

    let staging = StagingMetadata {
        staging: StagingLocation {
            physical_address: src.physical_address.clone(),
        },
        checksum: src.checksum.clone(),
        size_bytes: src.size_bytes,
    };
    state
        .lakefs
        .link_physical_address(lakefs_repo, revision, dest_path, &staging)
        .await
        .map_err(|e| {
            ApiError::upstream(format!("Failed to copy {src_path} to {dest_path}: {e}"))
        })?;

    let (size, sha256, lfs) = match state.store.get_file(repo.id, src_path)? {
        Some(src_file) => (src_file.size, src_file.sha256, src_file.lfs),
        None => (
            src.size_bytes,
            src.checksum_hex().to_string(),
            should_use_lfs(repo, &state.config.app, dest_path, src.size_bytes),
        ),
    };
    state.store.upsert_file(&FileUpsert {
        repository: repo.id,
        path_in_repo: dest_path,
        size,
        sha256: &sha256,
        lfs,
        owner: repo.owner,
    })?;

    Ok(true)
}

async fn wait_for_commit_visibility(state: &AppState, lakefs_repo: &str, commit_id: &str) {
    for attempt in 0..COMMIT_VISIBILITY_ATTEMPTS {
        match state.lakefs.get_commit(lakefs_repo, commit_id).await {
            Ok(_) => {
                debug!(
                    "Commit {} visible after {} attempt(s)",
                    &commit_id[..8],
                    attempt + 1
                );
                return;
            }
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(
                    COMMIT_VISIBILITY_INTERVAL_MS,
                ))
                .await;
            }
        }
    }
    warn!(
        "Commit {} not visible after {} attempts, continuing",
        &commit_id[..8],
        COMMIT_VISIBILITY_ATTEMPTS
    );
}

fn commit_url(state: &AppState, repo: &Repository, commit_id: &str) -> String {
    format!(
        "{}/{}/commit/{commit_id}",
        state.config.app.base_url, repo.full_id
    )
}

pub async fn create_commit(
    State(state): State<Arc<AppState>>,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let (parsed_type, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_write_permission(state.store.as_ref(), &repo, &user)?;

    let lakefs_repo = state.lakefs_name(&repo);
    let (header, operations) = parse_ndjson(&body)?;

    let mut files_changed = false;
    let mut pending_lfs_tracking: Vec<LfsTracking> = Vec::new();

    for op in &operations {
        debug!("Processing {}: {:?}", op.key, op.value.get("path"));
        match op.key.as_str() {
            "file" => {
                files_changed |=
                    process_regular_file(&state, &repo, &lakefs_repo, &revision, &op.value).await?;
            }
            "lfsFile" => {
                let (changed, tracking) =
                    process_lfs_file(&state, &repo, &lakefs_repo, &revision, &op.value).await?;
                files_changed |= changed;
                if let Some(tracking) = tracking {
                    pending_lfs_tracking.push(tracking);
                }
            }
            "deletedFile" => {
                files_changed |=
                    process_deleted_file(&state, &repo, &lakefs_repo, &revision, &op.value).await?;
            }
            "deletedFolder" => {
                files_changed |=
                    process_deleted_folder(&state, &repo, &lakefs_repo, &revision, &op.value)
                        .await?;
            }
            "copyFile" => {
                files_changed |=
                    process_copy_file(&state, &repo, &lakefs_repo, &revision, &op.value).await?;
            }
            _ => unreachable!("filtered during parse"),
        }
    }

    if !files_changed {
        let commit_id = state
            .lakefs
            .get_branch(&lakefs_repo, &revision)
            .await
            .map(|b| b.commit_id)
            .unwrap_or_else(|_| "no-changes".to_string());
        return Ok(Json(json!({
            "commitUrl": commit_url(&state, &repo, &commit_id),
            "commitOid": commit_id,
            "pullRequestUrl": null,
        })));
    }

    let metadata = if header.description.is_empty() {
        None
    } else {
        let mut m = std::collections::HashMap::new();
        m.insert("description".to_string(), header.description.clone());
        Some(m)
    };
    let commit = state
        .lakefs
        .commit(&lakefs_repo, &revision, &header.summary, metadata.as_ref())
        .await
        .map_err(|e| ApiError::upstream(format!("Commit failed: {e}")))?;

    // The store may take a while to surface large commits.
    wait_for_commit_visibility(&state, &lakefs_repo, &commit.id).await;

    let record = state.store.create_commit_record(&NewCommit {
        commit_id: &commit.id,
        repository: repo.id,
        repo_type: parsed_type,
        branch: &revision,
        author: user.id,
        username: &user.username,
        message: &header.summary,
        description: &header.description,
    });
    if let Err(e) = record {
        warn!("Failed to record commit in database: {e}");
    }

    finalize_lfs_tracking(&state, &repo, &commit.id, &pending_lfs_tracking).await;
    refresh_storage_accounting(state.store.as_ref(), &repo);

    info!(
        "Commit {} on {}/{revision} by {}",
        &commit.id[..8],
        repo.full_id,
        user.username
    );
    Ok(Json(json!({
        "commitUrl": commit_url(&state, &repo, &commit.id),
        "commitOid": commit.id,
        "pullRequestUrl": null,
    })))
}

async fn finalize_lfs_tracking(
    state: &AppState,
    repo: &Repository,
    commit_id: &str,
    pending: &[LfsTracking],
) {
    let gc = state.gc();
    for tracking in pending {
        if let Err(e) = track_lfs_object(
            state.store.as_ref(),
            repo,
            &tracking.path,
            &tracking.sha256,
            tracking.size,
            commit_id,
        ) {
            warn!("Failed to track LFS history for {}: {e}", tracking.path);
        }

        if tracking.old_sha256.is_some() {
            match run_gc_for_file(&gc, repo, &tracking.path).await {
                Ok(deleted) if deleted > 0 => {
                    info!("GC cleaned {deleted} old version(s) of {}", tracking.path);
                }
                Ok(_) => {}
                Err(e) => warn!("GC failed for {}: {e}", tracking.path),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_blob_sha1_matches_git() {
        // Well-known git hashes.
        assert_eq!(git_blob_sha1(b""), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
        assert_eq!(
            git_blob_sha1(b"hello\n"),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
    }

    #[test]
    fn ndjson_requires_header() {
        let body = r#"{"key":"file","value":{"path":"a"}}"#;
        assert!(parse_ndjson(body).is_err());
    }

    #[test]
    fn ndjson_parses_header_and_ops() {
        let body = concat!(
            r#"{"key":"header","value":{"summary":"init","description":"d"}}"#,
            "\n\n",
            r#"{"key":"file","value":{"path":"a.txt","content":"aGVsbG8=","encoding":"base64"}}"#,
            "\n",
            r#"{"key":"deletedFile","value":{"path":"b.txt"}}"#,
            "\n",
            r#"{"key":"somethingNew","value":{}}"#,
        );
        let (header, ops) = parse_ndjson(body).unwrap();
        assert_eq!(header.summary, "init");
        assert_eq!(header.description, "d");
        // Unknown keys are dropped.
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].key, "file");
        assert_eq!(ops[1].key, "deletedFile");
    }

    #[test]
    fn ndjson_rejects_garbage() {
        assert!(parse_ndjson("not json").is_err());
    }
}
