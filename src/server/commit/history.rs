use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use similar::TextDiff;
use tracing::{debug, warn};

use super::super::response::{ApiError, ApiResult};
use super::super::router::AppState;
use crate::auth::{check_repo_read_permission, get_optional_user};
use crate::rules::should_use_lfs;

/// Text diffs are only produced when both sides fit under this cap.
const MAX_DIFF_SIDE_BYTES: i64 = 1_000_000;

fn commit_date(creation_date: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(creation_date, 0).map(|d| d.to_rfc3339())
}

#[derive(Debug, Deserialize)]
pub struct ListCommitsQuery {
    pub limit: Option<u32>,
    pub after: Option<String>,
}

pub async fn list_commits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, branch)): Path<(String, String, String, String)>,
    Query(query): Query<ListCommitsQuery>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let lakefs_repo = state.lakefs_name(&repo);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    let log = state
        .lakefs
        .log_commits(&lakefs_repo, &branch, limit, query.after.as_deref())
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to list commits: {e}")))?;

    // Our own records enrich store commits with real authorship.
    let commit_ids: Vec<String> = log.results.iter().map(|c| c.id.clone()).collect();
    let records: HashMap<String, crate::types::Commit> = state
        .store
        .list_commit_records(repo.id, &commit_ids)?
        .into_iter()
        .map(|c| (c.commit_id.clone(), c))
        .collect();

    let commits: Vec<Value> = log
        .results
        .iter()
        .map(|commit| {
            let author = records
                .get(&commit.id)
                .map(|r| r.username.clone())
                .unwrap_or_else(|| {
                    if commit.committer.is_empty() {
                        "unknown".to_string()
                    } else {
                        commit.committer.clone()
                    }
                });
            json!({
                "id": commit.id,
                "oid": commit.id,
                "title": commit.message,
                "message": commit.message,
                "date": commit_date(commit.creation_date),
                "author": author,
                "email": commit.metadata.get("email").cloned().unwrap_or_default(),
                "parents": commit.parents,
            })
        })
        .collect();

    let (has_more, next_cursor) = match &log.pagination {
        Some(p) if p.has_more => (true, Some(p.next_offset.clone())),
        _ => (false, None),
    };

    Ok(Json(json!({
        "commits": commits,
        "hasMore": has_more,
        "nextCursor": next_cursor,
    })))
}

pub async fn commit_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, commit_id)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let lakefs_repo = state.lakefs_name(&repo);
    let commit = state
        .lakefs
        .get_commit(&lakefs_repo, &commit_id)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("Commit not found: {commit_id}"))
            } else {
                ApiError::upstream(format!("Failed to get commit: {e}"))
            }
        })?;

    let record = state.store.get_commit_record(repo.id, &commit.id)?;

    let mut body = json!({
        "id": commit.id,
        "oid": commit.id,
        "title": commit.message,
        "message": commit.message,
        "date": commit_date(commit.creation_date),
        "parents": commit.parents,
        "metadata": commit.metadata,
    });
    if let Value::Object(map) = &mut body {
        match record {
            Some(record) => {
                map.insert("author".to_string(), json!(record.username));
                map.insert("description".to_string(), json!(record.description));
                map.insert(
                    "committed_at".to_string(),
                    json!(record.created_at.to_rfc3339()),
                );
            }
            None => {
                let author = if commit.committer.is_empty() {
                    "unknown".to_string()
                } else {
                    commit.committer.clone()
                };
                map.insert("author".to_string(), json!(author));
            }
        }
    }

    Ok(Json(body))
}

pub async fn commit_diff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, commit_id)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let lakefs_repo = state.lakefs_name(&repo);
    let commit = state
        .lakefs
        .get_commit(&lakefs_repo, &commit_id)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                ApiError::not_found(format!("Commit not found: {commit_id}"))
            } else {
                ApiError::upstream(format!("Failed to get commit: {e}"))
            }
        })?;

    let Some(parent_id) = commit.parents.first().cloned() else {
        debug!("Commit {} has no parent", &commit_id[..8.min(commit_id.len())]);
        return Ok(Json(json!({ "files": [], "parent_commit": null })));
    };

    let diff = state
        .lakefs
        .diff_refs(&lakefs_repo, &parent_id, &commit.id)
        .await
        .map_err(|e| ApiError::upstream(format!("Failed to diff commit: {e}")))?;

    let paths: Vec<String> = diff.results.iter().map(|d| d.path.clone()).collect();
    let records: HashMap<String, crate::types::File> = state
        .store
        .list_files_by_paths(repo.id, &paths)?
        .into_iter()
        .map(|f| (f.path_in_repo.clone(), f))
        .collect();

    let mut files = Vec::new();
    for entry in diff.results.iter().filter(|e| e.is_object()) {
        let is_lfs = records
            .get(&entry.path)
            .map(|f| f.lfs)
            .unwrap_or_else(|| {
                entry
                    .size_bytes
                    .is_some_and(|size| should_use_lfs(&repo, &state.config.app, &entry.path, size))
            });

        let mut info = json!({
            "path": entry.path,
            "type": entry.diff_type,
            "size_bytes": entry.size_bytes,
            "is_lfs": is_lfs,
        });
        let map = info.as_object_mut().expect("object literal");

        let mut current_size = None;
        let mut previous_size = None;

        if matches!(entry.diff_type.as_str(), "added" | "changed") {
            if let Ok(stat) = state
                .lakefs
                .stat_object(&lakefs_repo, &commit.id, &entry.path)
                .await
            {
                current_size = Some(stat.size_bytes);
                map.insert("size_bytes".to_string(), json!(stat.size_bytes));
                map.insert("sha256".to_string(), json!(stat.checksum_hex()));
            }
        }
        if matches!(entry.diff_type.as_str(), "removed" | "changed") {
            if let Ok(stat) = state
                .lakefs
                .stat_object(&lakefs_repo, &parent_id, &entry.path)
                .await
            {
                previous_size = Some(stat.size_bytes);
                map.insert("previous_size".to_string(), json!(stat.size_bytes));
                map.insert("previous_sha256".to_string(), json!(stat.checksum_hex()));
            }
        }

        if !is_lfs {
            let too_large = current_size.is_some_and(|s| s >= MAX_DIFF_SIDE_BYTES)
                || previous_size.is_some_and(|s| s >= MAX_DIFF_SIDE_BYTES);
            if too_large {
                map.insert("diff".to_string(), Value::Null);
            } else {
                match text_diff(&state, &lakefs_repo, entry, &parent_id, &commit.id).await {
                    Ok(diff_text) => {
                        map.insert("diff".to_string(), json!(diff_text));
                    }
                    Err(e) => {
                        warn!("Failed to generate diff for {}: {e}", entry.path);
                        map.insert("diff".to_string(), Value::Null);
                    }
                }
            }
        }

        files.push(info);
    }

    let record = state.store.get_commit_record(repo.id, &commit.id)?;
    let author = record
        .map(|r| r.username)
        .unwrap_or_else(|| commit.committer.clone());

    Ok(Json(json!({
        "commit_id": commit.id,
        "parent_commit": parent_id,
        "message": commit.message,
        "author": author,
        "date": commit_date(commit.creation_date),
        "files": files,
    })))
}

async fn text_diff(
    state: &AppState,
    lakefs_repo: &str,
    entry: &crate::lakefs::DiffEntry,
    parent_id: &str,
    commit_id: &str,
) -> crate::error::Result<String> {
    let current = if matches!(entry.diff_type.as_str(), "added" | "changed") {
        String::from_utf8_lossy(
            &state
                .lakefs
                .get_object(lakefs_repo, commit_id, &entry.path)
                .await?,
        )
        .into_owned()
    } else {
        String::new()
    };

    let previous = if matches!(entry.diff_type.as_str(), "removed" | "changed") {
        String::from_utf8_lossy(
            &state
                .lakefs
                .get_object(lakefs_repo, parent_id, &entry.path)
                .await?,
        )
        .into_owned()
    } else {
        String::new()
    };

    let diff = TextDiff::from_lines(&previous, &current);
    Ok(diff
        .unified_diff()
        .header(&format!("a/{}", entry.path), &format!("b/{}", entry.path))
        .to_string())
}
