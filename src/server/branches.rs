//! Branch and tag management: create/delete, revert, merge, and the
//! history-preserving reset.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::response::{ApiError, ApiResult};
use super::router::AppState;
use crate::auth::{
    check_repo_delete_permission, check_repo_write_permission, get_current_user,
};
use crate::gc::{
    check_commit_range_recoverability, refresh_storage_accounting, sync_file_table_with_commit,
    track_commit_lfs_objects,
};
use crate::lakefs::{LakefsError, MergeOptions, RevertOptions};
use crate::store::NewCommit;
use crate::types::{RepoType, Repository, User};

#[derive(Debug, Deserialize)]
pub struct CreateBranchPayload {
    pub branch: String,
    #[serde(default)]
    pub revision: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTagPayload {
    pub tag: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevertPayload {
    pub r#ref: String,
    #[serde(default = "default_parent_number")]
    pub parent_number: u32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    #[allow(dead_code)]
    pub force: bool,
    #[serde(default)]
    pub allow_empty: bool,
}

fn default_parent_number() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct MergePayload {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default)]
    pub squash_merge: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResetPayload {
    pub r#ref: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub force: bool,
}

fn record_commit(
    state: &AppState,
    repo: &Repository,
    repo_type: RepoType,
    branch: &str,
    user: &User,
    commit_id: &str,
    message: &str,
    description: &str,
) {
    let result = state.store.create_commit_record(&NewCommit {
        commit_id,
        repository: repo.id,
        repo_type,
        branch,
        author: user.id,
        username: &user.username,
        message,
        description,
    });
    if let Err(e) = result {
        warn!("Failed to record commit in database: {e}");
    }
}

pub async fn create_branch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    Json(payload): Json<CreateBranchPayload>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_delete_permission(state.store.as_ref(), &repo, Some(&user), false)?;

    let lakefs_repo = state.lakefs_name(&repo);
    let source_ref = payload.revision.as_deref().unwrap_or("main");

    let source = state
        .lakefs
        .get_branch(&lakefs_repo, source_ref)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to resolve {source_ref}: {e}")))?;

    match state
        .lakefs
        .create_branch(&lakefs_repo, &payload.branch, &source.commit_id)
        .await
    {
        Ok(()) => {}
        Err(LakefsError::Conflict(_)) => {
            return Err(ApiError::conflict(format!(
                "Branch '{}' already exists",
                payload.branch
            )));
        }
        Err(e) => return Err(ApiError::upstream(format!("Failed to create branch: {e}"))),
    }

    Ok(Json(json!({
        "success": true,
        "message": format!("Branch '{}' created", payload.branch),
    })))
}

pub async fn delete_branch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, branch)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_delete_permission(state.store.as_ref(), &repo, Some(&user), false)?;

    if branch == "main" {
        return Err(ApiError::bad_request("Cannot delete main branch"));
    }

    let lakefs_repo = state.lakefs_name(&repo);
    state
        .lakefs
        .delete_branch(&lakefs_repo, &branch)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to delete branch: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Branch '{branch}' deleted"),
    })))
}

pub async fn create_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
    Json(payload): Json<CreateTagPayload>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_delete_permission(state.store.as_ref(), &repo, Some(&user), false)?;

    let lakefs_repo = state.lakefs_name(&repo);
    let source_ref = payload.revision.as_deref().unwrap_or("main");
    let source = state
        .lakefs
        .get_branch(&lakefs_repo, source_ref)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to resolve {source_ref}: {e}")))?;

    state
        .lakefs
        .create_tag(&lakefs_repo, &payload.tag, &source.commit_id)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to create tag: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Tag '{}' created", payload.tag),
    })))
}

pub async fn delete_tag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, tag)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_delete_permission(state.store.as_ref(), &repo, Some(&user), false)?;

    let lakefs_repo = state.lakefs_name(&repo);
    state
        .lakefs
        .delete_tag(&lakefs_repo, &tag)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to delete tag: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Tag '{tag}' deleted"),
    })))
}

/// Revert a commit on a branch. No recoverability precheck: a clean revert
/// only moves paths between versions that retention still holds, and
/// conflicts surface as 409 from the store.
pub async fn revert_branch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, branch)): Path<(String, String, String, String)>,
    Json(payload): Json<RevertPayload>,
) -> ApiResult<Json<Value>> {
    let (parsed_type, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_write_permission(state.store.as_ref(), &repo, &user)?;

    let lakefs_repo = state.lakefs_name(&repo);

    let commit = state
        .lakefs
        .get_commit(&lakefs_repo, &payload.r#ref)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("Commit not found: {}", payload.r#ref))
            } else {
                ApiError::upstream(format!("Failed to resolve {}: {e}", payload.r#ref))
            }
        })?;
    info!("Reverting commit {} on {branch}", &commit.id[..8]);

    let options = RevertOptions {
        parent_number: payload.parent_number,
        allow_empty: payload.allow_empty,
    };
    match state
        .lakefs
        .revert_branch(&lakefs_repo, &branch, &payload.r#ref, &options)
        .await
    {
        Ok(()) => {}
        Err(LakefsError::Conflict(msg)) => {
            return Err(ApiError::conflict(format!(
                "Revert conflict: {msg}. The revert created conflicts with the current branch state."
            )));
        }
        Err(e) => return Err(ApiError::upstream(format!("Revert failed: {e}"))),
    }

    let new_commit_id = state
        .lakefs
        .get_branch(&lakefs_repo, &branch)
        .await
        .map(|b| b.commit_id)
        .map_err(|e| ApiError::upstream(format!("Failed to read new HEAD: {e}")))?;

    // Bookkeeping failures never undo a successful revert.
    match track_commit_lfs_objects(&state.gc(), &lakefs_repo, &new_commit_id, &repo).await {
        Ok(tracked) if tracked > 0 => info!("Tracked {tracked} LFS object(s) from revert"),
        Ok(_) => {}
        Err(e) => warn!("Failed to track LFS objects after revert: {e}"),
    }

    let message = payload
        .message
        .clone()
        .unwrap_or_else(|| format!("Revert commit {}", &commit.id[..8]));
    record_commit(
        &state,
        &repo,
        parsed_type,
        &branch,
        &user,
        &new_commit_id,
        &message,
        &format!("Reverted {}", commit.id),
    );
    refresh_storage_accounting(state.store.as_ref(), &repo);

    Ok(Json(json!({
        "success": true,
        "message": format!("Successfully reverted commit {} on branch '{branch}'", &commit.id[..8]),
        "new_commit_id": new_commit_id,
    })))
}

pub async fn merge_branches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, source_ref, destination_branch)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    Json(payload): Json<MergePayload>,
) -> ApiResult<Json<Value>> {
    let (parsed_type, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_write_permission(state.store.as_ref(), &repo, &user)?;

    let lakefs_repo = state.lakefs_name(&repo);

    let options = MergeOptions {
        message: payload.message.clone(),
        metadata: payload.metadata.clone(),
        strategy: payload.strategy.clone(),
        force: payload.force,
        allow_empty: payload.allow_empty,
        squash_merge: payload.squash_merge,
    };
    let merge = match state
        .lakefs
        .merge_into_branch(&lakefs_repo, &source_ref, &destination_branch, &options)
        .await
    {
        Ok(result) => result,
        Err(LakefsError::Conflict(msg)) => {
            return Err(ApiError::conflict(format!(
                "Merge conflict: {msg}. Use strategy='source-wins' or 'dest-wins' to resolve automatically."
            )));
        }
        Err(e) => return Err(ApiError::upstream(format!("Merge failed: {e}"))),
    };
    info!("Merged {source_ref} into {destination_branch} at {}", &merge.reference[..8]);

    match track_commit_lfs_objects(&state.gc(), &lakefs_repo, &merge.reference, &repo).await {
        Ok(tracked) if tracked > 0 => info!("Tracked {tracked} LFS object(s) from merge"),
        Ok(_) => {}
        Err(e) => warn!("Failed to track LFS objects after merge: {e}"),
    }

    let message = payload
        .message
        .clone()
        .unwrap_or_else(|| format!("Merge {source_ref} into {destination_branch}"));
    record_commit(
        &state,
        &repo,
        parsed_type,
        &destination_branch,
        &user,
        &merge.reference,
        &message,
        &format!("Merged {source_ref}"),
    );
    refresh_storage_accounting(state.store.as_ref(), &repo);

    Ok(Json(json!({
        "success": true,
        "message": format!("Successfully merged {source_ref} into {destination_branch}"),
        "result": { "reference": merge.reference },
    })))
}

/// Reset a branch to an older commit by committing the inverse diff. History
/// is preserved; the recoverability precheck rejects resets that would
/// reference garbage-collected LFS content.
pub async fn reset_branch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, branch)): Path<(String, String, String, String)>,
    Json(payload): Json<ResetPayload>,
) -> ApiResult<Json<Value>> {
    let (parsed_type, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_current_user(state.store.as_ref(), &headers)?;
    check_repo_write_permission(state.store.as_ref(), &repo, &user)?;

    if branch == "main" && !payload.force {
        return Err(ApiError::bad_request(
            "Cannot reset main branch without force=true. This is a safety measure to prevent accidental data loss.",
        ));
    }

    let lakefs_repo = state.lakefs_name(&repo);

    let target = state
        .lakefs
        .get_commit(&lakefs_repo, &payload.r#ref)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("Commit not found: {}", payload.r#ref))
            } else {
                ApiError::upstream(format!("Failed to resolve {}: {e}", payload.r#ref))
            }
        })?;
    let target_id = target.id;

    if !payload.force {
        let (all_ok, missing, affected) = check_commit_range_recoverability(
            &state.gc(),
            &lakefs_repo,
            &repo,
            &target_id,
            &branch,
        )
        .await?;

        if !all_ok {
            let mut unique_missing: Vec<String> = missing.clone();
            unique_missing.sort();
            unique_missing.dedup();

            let preview = unique_missing
                .iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let mut message = format!(
                "Cannot reset to commit {}: {} LFS file(s) across {} commit(s) have been \
                 garbage collected and are no longer available. Missing files: {preview}",
                &target_id[..8],
                unique_missing.len(),
                affected.len()
            );
            if unique_missing.len() > 5 {
                message.push_str(&format!(" and {} more...", unique_missing.len() - 5));
            }
            message.push_str(
                " Use force=true to reset anyway (may result in broken LFS references).",
            );

            warn!("{message}");
            return Err(ApiError::bad_request(message).with_payload(json!({
                "missing_files": unique_missing,
                "affected_commits": affected,
                "recoverable": false,
            })));
        }
    }

    let current = state
        .lakefs
        .get_branch(&lakefs_repo, &branch)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to read branch HEAD: {e}")))?;
    info!("Reset {branch}: current {} -> target {}", &current.commit_id[..8], &target_id[..8]);

    // Diff target..current is exactly what must be undone.
    let diff = state
        .lakefs
        .diff_refs(&lakefs_repo, &target_id, &current.commit_id)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to diff refs: {e}")))?;

    let mut files_changed = 0usize;
    for entry in diff.results.iter().filter(|e| e.is_object()) {
        match entry.diff_type.as_str() {
            "added" => {
                // Added after the target: remove it.
                state
                    .lakefs
                    .delete_object(&lakefs_repo, &branch, &entry.path)
                    .await
                    .map_err(|e| {
                        ApiError::upstream(format!("Failed to delete {}: {e}", entry.path))
                    })?;
                files_changed += 1;
            }
            "removed" | "changed" => {
                // Restore the target's version. LFS-linked content is
                // relinked by physical address so the bytes never pass
                // through this process; regular files are copied.
                let stat = state
                    .lakefs
                    .stat_object(&lakefs_repo, &target_id, &entry.path)
                    .await
                    .map_err(|e| {
                        ApiError::upstream(format!("Failed to stat {}: {e}", entry.path))
                    })?;

                if stat.checksum.starts_with("sha256:") {
                    let staging = crate::lakefs::StagingMetadata {
                        staging: crate::lakefs::StagingLocation {
                            physical_address: stat.physical_address.clone(),
                        },
                        checksum: stat.checksum.clone(),
                        size_bytes: stat.size_bytes,
                    };
                    state
                        .lakefs
                        .link_physical_address(&lakefs_repo, &branch, &entry.path, &staging)
                        .await
                        .map_err(|e| {
                            ApiError::upstream(format!("Failed to relink {}: {e}", entry.path))
                        })?;
                } else {
                    let content = state
                        .lakefs
                        .get_object(&lakefs_repo, &target_id, &entry.path)
                        .await
                        .map_err(|e| {
                            ApiError::upstream(format!("Failed to read {}: {e}", entry.path))
                        })?;
                    state
                        .lakefs
                        .upload_object(&lakefs_repo, &branch, &entry.path, content.to_vec())
                        .await
                        .map_err(|e| {
                            ApiError::upstream(format!("Failed to restore {}: {e}", entry.path))
                        })?;
                }
                files_changed += 1;
            }
            _ => {}
        }
    }

    if files_changed == 0 && !payload.force {
        return Err(ApiError::bad_request("Branch is already at the target state"));
    }

    let message = payload
        .message
        .clone()
        .unwrap_or_else(|| format!("Reset to commit {}", &target_id[..8]));
    let mut metadata = HashMap::new();
    metadata.insert("reset_to".to_string(), target_id.clone());

    let commit = state
        .lakefs
        .commit(&lakefs_repo, &branch, &message, Some(&metadata))
        .await
        .map_err(|e| ApiError::upstream(format!("Reset failed: {e}")))?;
    info!("Reset created commit {}", &commit.id[..8]);

    // Idempotent; a failure here is repaired by the next sync.
    match sync_file_table_with_commit(&state.gc(), &lakefs_repo, &branch, &repo).await {
        Ok(synced) => info!("Synced {synced} file(s) after reset"),
        Err(e) => warn!("Failed to sync file table after reset: {e}"),
    }

    record_commit(
        &state,
        &repo,
        parsed_type,
        &branch,
        &user,
        &commit.id,
        &message,
        &format!("Reset to {target_id}"),
    );
    refresh_storage_accounting(state.store.as_ref(), &repo);

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "Successfully reset branch '{branch}' to commit {} (new commit created)",
            &target_id[..8]
        ),
        "commit_id": commit.id,
    })))
}
