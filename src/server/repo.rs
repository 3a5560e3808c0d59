use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::response::{ApiError, ApiResult};
use super::router::AppState;
use crate::auth::{
    check_namespace_permission, check_repo_delete_permission, check_repo_read_permission,
    get_current_user, get_current_user_or_admin, get_optional_user,
};
use crate::quota::{check_quota, increment_storage};
use crate::rules::{lakefs_repo_name_for, normalize_name};
use crate::types::{RepoType, Repository};

const DEFAULT_BRANCH: &str = "main";
const NAME_WAIT_ATTEMPTS: u32 = 120;
const NAME_WAIT_INTERVAL_MS: u64 = 500;

pub async fn whoami_v2(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let Some(user) = get_optional_user(state.store.as_ref(), &headers)? else {
        return Err(ApiError::unauthorized("Invalid or missing token"));
    };

    let orgs: Vec<Value> = state
        .store
        .list_user_organizations(user.id)?
        .into_iter()
        .map(|org| json!({ "name": org.username, "type": "org" }))
        .collect();

    Ok(Json(json!({
        "name": user.username,
        "type": "user",
        "displayName": user.username,
        "email": user.email,
        "emailVerified": user.email_verified,
        "orgs": orgs,
        "auth": { "type": "access_token" },
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateRepoPayload {
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: RepoType,
    pub name: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub sdk: Option<String>,
}

fn default_repo_type() -> RepoType {
    RepoType::Model
}

fn validate_repo_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= 96
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ApiError::invalid_repo_id(name))
    }
}

pub async fn create_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateRepoPayload>,
) -> ApiResult<Json<Value>> {
    let user = get_current_user(state.store.as_ref(), &headers)?;
    let namespace = payload.organization.clone().unwrap_or(user.username.clone());
    check_namespace_permission(state.store.as_ref(), &namespace, &user, false)?;
    validate_repo_name(&payload.name)?;

    let full_id = format!("{namespace}/{}", payload.name);
    info!("Creating repository: {full_id}");

    if state
        .store
        .get_repository(payload.repo_type, &namespace, &payload.name)?
        .is_some()
    {
        return Err(ApiError::repo_exists(&full_id));
    }

    // Normalized collisions within the namespace are conflicts too.
    let normalized = normalize_name(&payload.name);
    for existing in state.store.list_namespace_repositories(&namespace)? {
        if existing.repo_type == payload.repo_type && normalize_name(&existing.name) == normalized
        {
            return Err(ApiError::repo_exists(&existing.full_id));
        }
    }

    // The row comes first: the storage name embeds the repository id.
    let repo = state.store.create_repository(
        payload.repo_type,
        &namespace,
        &payload.name,
        payload.private,
        user.id,
    )?;

    let lakefs_repo = state.lakefs_name(&repo);
    let storage_namespace = format!("s3://{}/{}", state.blobs.bucket(), lakefs_repo);
    if let Err(e) = state
        .lakefs
        .create_repository(&lakefs_repo, &storage_namespace, DEFAULT_BRANCH)
        .await
    {
        warn!("Versioned-store creation failed for {full_id}, rolling back row: {e}");
        let _ = state.store.delete_repository(repo.id);
        return Err(ApiError::upstream(format!(
            "Repository creation failed: {e}"
        )));
    }

    Ok(Json(json!({
        "url": format!("{}/{}s/{}", state.config.app.base_url, payload.repo_type, full_id),
        "repo_id": full_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRepoPayload {
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: RepoType,
    pub name: String,
    #[serde(default)]
    pub organization: Option<String>,
}

pub async fn delete_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<DeleteRepoPayload>,
) -> ApiResult<Json<Value>> {
    let (user, is_admin) = get_current_user_or_admin(
        state.store.as_ref(),
        &headers,
        state.config.app.admin_token.as_deref(),
    )?;

    let namespace = match (&payload.organization, &user) {
        (Some(org), _) => org.clone(),
        (None, Some(user)) => user.username.clone(),
        (None, None) => {
            return Err(ApiError::bad_request(
                "Admin must specify the organization parameter",
            ));
        }
    };

    let full_id = format!("{namespace}/{}", payload.name);
    let Some(repo) = state
        .store
        .get_repository(payload.repo_type, &namespace, &payload.name)?
    else {
        return Err(ApiError::repo_not_found(&full_id, payload.repo_type.as_str()));
    };

    check_repo_delete_permission(state.store.as_ref(), &repo, user.as_ref(), is_admin)?;

    let lakefs_repo = state.lakefs_name(&repo);

    // Storage cleanup first, while the history rows still exist.
    if let Err(e) = crate::gc::cleanup_repository_storage(&state.gc(), &repo, &lakefs_repo).await {
        warn!("Storage cleanup failed for {full_id} (non-fatal): {e}");
    }

    match state.lakefs.delete_repository(&lakefs_repo).await {
        Ok(()) => info!("Deleted versioned-store repository {lakefs_repo}"),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            return Err(ApiError::upstream(format!(
                "Repository deletion failed: {e}"
            )));
        }
    }

    state.store.delete_repository(repo.id)?;
    crate::quota::update_namespace_storage(state.store.as_ref(), &namespace)
        .unwrap_or_else(|e| warn!("Failed to refresh namespace usage: {e}"));

    Ok(Json(json!({
        "message": format!("Repository '{full_id}' of type '{}' deleted.", payload.repo_type),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MoveRepoPayload {
    #[serde(rename = "fromRepo")]
    pub from_repo: String,
    #[serde(rename = "toRepo")]
    pub to_repo: String,
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: RepoType,
}

fn split_full_id(full_id: &str) -> Result<(&str, &str), ApiError> {
    full_id
        .split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| ApiError::invalid_repo_id(full_id))
}

/// Copy the repository tree into a new storage name: LFS content is re-linked
/// by physical address, regular blobs are copied, then the old name is torn
/// down.
async fn migrate_lakefs_repository(
    state: &AppState,
    repo: &Repository,
    to_full_id: &str,
) -> ApiResult<()> {
    let prefix = &state.config.lakefs.repo_namespace;
    let from_name = state.lakefs_name(repo);
    let to_name = lakefs_repo_name_for(prefix, repo.repo_type, to_full_id, repo.id);
    if from_name == to_name {
        return Ok(());
    }

    // The target name may still be held by the store right after a delete
    // (squash moves back and forth). Wait for it to free up.
    let mut attempts = 0;
    while state.lakefs.repository_exists(&to_name).await? {
        attempts += 1;
        if attempts >= NAME_WAIT_ATTEMPTS {
            return Err(ApiError::upstream(format!(
                "Storage name '{to_name}' is still in use"
            )));
        }
        tokio::time::sleep(std::time::Duration::from_millis(NAME_WAIT_INTERVAL_MS)).await;
    }

    let mut objects = Vec::new();
    let mut after = String::new();
    loop {
        let listing = state
            .lakefs
            .list_objects(&from_name, DEFAULT_BRANCH, "", "", &after, 1000)
            .await?;
        objects.extend(listing.results.into_iter().filter(|o| o.is_object()));
        match listing.pagination {
            Some(p) if p.has_more => after = p.next_offset,
            _ => break,
        }
    }
    info!("Migrating {} object(s) from {from_name} to {to_name}", objects.len());

    let storage_namespace = format!("s3://{}/{}", state.blobs.bucket(), to_name);
    state
        .lakefs
        .create_repository(&to_name, &storage_namespace, DEFAULT_BRANCH)
        .await?;

    let mut migrated = 0usize;
    for obj in &objects {
        let is_lfs = match state.store.get_file(repo.id, &obj.path)? {
            Some(record) => record.lfs,
            None => crate::rules::should_use_lfs(repo, &state.config.app, &obj.path, obj.size_bytes),
        };

        let result = if is_lfs {
            // Shared content-addressed blob: link, never copy.
            state
                .lakefs
                .link_physical_address(
                    &to_name,
                    DEFAULT_BRANCH,
                    &obj.path,
                    &crate::lakefs::StagingMetadata {
                        staging: crate::lakefs::StagingLocation {
                            physical_address: obj.physical_address.clone(),
                        },
                        checksum: obj.checksum.clone(),
                        size_bytes: obj.size_bytes,
                    },
                )
                .await
        } else {
            match state.lakefs.get_object(&from_name, DEFAULT_BRANCH, &obj.path).await {
                Ok(content) => {
                    state
                        .lakefs
                        .upload_object(&to_name, DEFAULT_BRANCH, &obj.path, content.to_vec())
                        .await
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => migrated += 1,
            Err(e) => warn!("Failed to migrate {}: {e}", obj.path),
        }
    }

    if migrated > 0 {
        state
            .lakefs
            .commit(
                &to_name,
                DEFAULT_BRANCH,
                &format!("Repository moved from {} to {to_full_id}", repo.full_id),
                None,
            )
            .await?;
    }

    match state.lakefs.delete_repository(&from_name).await {
        Ok(()) | Err(crate::lakefs::LakefsError::NotFound) => {}
        Err(e) => warn!("Failed to delete old storage name {from_name}: {e}"),
    }
    let deleted = state.blobs.delete_prefix(&format!("{from_name}/")).await?;
    info!("Migration done: {migrated} object(s) moved, {deleted} old blob(s) removed");

    Ok(())
}

async fn do_move(
    state: &AppState,
    repo_type: RepoType,
    from_id: &str,
    to_id: &str,
    enforce_quota: bool,
) -> ApiResult<()> {
    let (from_ns, from_name) = split_full_id(from_id)?;
    let (to_ns, to_name) = split_full_id(to_id)?;

    let Some(repo) = state.store.get_repository(repo_type, from_ns, from_name)? else {
        return Err(ApiError::repo_not_found(from_id, repo_type.as_str()));
    };
    if state.store.get_repository(repo_type, to_ns, to_name)?.is_some() {
        return Err(ApiError::repo_exists(to_id));
    }

    let moving_namespace = from_ns != to_ns;
    let repo_size = state.store.sum_active_file_bytes(repo.id)?;

    if moving_namespace && enforce_quota {
        check_quota(state.store.as_ref(), to_ns, repo_size, repo.private)?;
    }

    migrate_lakefs_repository(state, &repo, to_id).await?;

    // Quota overrides reset when the namespace changes; usage moves with the
    // repository.
    let quota_bytes = if moving_namespace { None } else { repo.quota_bytes };
    state
        .store
        .update_repository_identity(repo.id, to_ns, to_name, quota_bytes)?;

    if moving_namespace && repo_size > 0 {
        increment_storage(state.store.as_ref(), from_ns, -repo_size, repo.private)?;
        increment_storage(state.store.as_ref(), to_ns, repo_size, repo.private)?;
    }

    Ok(())
}

pub async fn move_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<MoveRepoPayload>,
) -> ApiResult<Json<Value>> {
    let (user, is_admin) = get_current_user_or_admin(
        state.store.as_ref(),
        &headers,
        state.config.app.admin_token.as_deref(),
    )?;

    let (from_ns, from_name) = split_full_id(&payload.from_repo)?;
    let (to_ns, _) = split_full_id(&payload.to_repo)?;

    let Some(repo) = state
        .store
        .get_repository(payload.repo_type, from_ns, from_name)?
    else {
        return Err(ApiError::repo_not_found(&payload.from_repo, payload.repo_type.as_str()));
    };
    check_repo_delete_permission(state.store.as_ref(), &repo, user.as_ref(), is_admin)?;
    if !is_admin {
        let user = user.as_ref().ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        check_namespace_permission(state.store.as_ref(), to_ns, user, false)?;
    }

    do_move(
        &state,
        payload.repo_type,
        &payload.from_repo,
        &payload.to_repo,
        !is_admin,
    )
    .await?;

    Ok(Json(json!({
        "success": true,
        "url": format!("{}/{}s/{}", state.config.app.base_url, payload.repo_type, payload.to_repo),
        "message": format!("Repository moved from {} to {}", payload.from_repo, payload.to_repo),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SquashRepoPayload {
    pub repo: String,
    #[serde(rename = "type", default = "default_repo_type")]
    pub repo_type: RepoType,
}

/// Collapse history by moving the repo to a temporary name and back. Only
/// the current tree survives the round trip.
pub async fn squash_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SquashRepoPayload>,
) -> ApiResult<Json<Value>> {
    let (user, is_admin) = get_current_user_or_admin(
        state.store.as_ref(),
        &headers,
        state.config.app.admin_token.as_deref(),
    )?;

    let (namespace, name) = split_full_id(&payload.repo)?;
    let Some(repo) = state.store.get_repository(payload.repo_type, namespace, name)? else {
        return Err(ApiError::repo_not_found(&payload.repo, payload.repo_type.as_str()));
    };
    check_repo_delete_permission(state.store.as_ref(), &repo, user.as_ref(), is_admin)?;

    let temp_suffix = uuid::Uuid::new_v4().simple().to_string();
    let temp_id = format!("{namespace}/{name}-squash-{}", &temp_suffix[..8]);
    info!("Squashing {} via temporary name {temp_id}", payload.repo);

    do_move(&state, payload.repo_type, &payload.repo, &temp_id, false).await?;
    do_move(&state, payload.repo_type, &temp_id, &payload.repo, false).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Repository '{}' squashed; history cleared.", payload.repo),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListReposQuery {
    pub author: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_repos(
    State(state): State<Arc<AppState>>,
    Path(repo_type): Path<String>,
    Query(query): Query<ListReposQuery>,
) -> ApiResult<Json<Value>> {
    let repo_type = RepoType::from_plural(&repo_type)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown repo type: {repo_type}")))?;
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);

    let repos = state
        .store
        .list_repositories(Some(repo_type), query.author.as_deref(), limit)?;

    let summaries: Vec<Value> = repos
        .iter()
        .filter(|r| !r.private)
        .map(|r| {
            json!({
                "id": r.full_id,
                "author": r.namespace,
                "private": r.private,
                "gated": false,
                "downloads": 0,
                "likes": 0,
                "tags": [],
                "createdAt": r.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(Value::Array(summaries)))
}

async fn repo_info_body(
    state: &AppState,
    repo: &Repository,
    revision: Option<&str>,
) -> ApiResult<Value> {
    let lakefs_repo = state.lakefs_name(repo);
    let revision = revision.unwrap_or(DEFAULT_BRANCH);

    let (sha, commit_date) = match state.lakefs.get_branch(&lakefs_repo, revision).await {
        Ok(branch) => {
            let date = state
                .lakefs
                .get_commit(&lakefs_repo, &branch.commit_id)
                .await
                .ok()
                .and_then(|c| chrono::DateTime::from_timestamp(c.creation_date, 0))
                .map(|d| d.to_rfc3339());
            (Some(branch.commit_id), date)
        }
        Err(e) if e.is_not_found() => (None, None),
        Err(e) => return Err(ApiError::from(crate::error::Error::from(e))),
    };

    let files = state.store.list_active_files(repo.id)?;
    let siblings: Vec<Value> = files
        .iter()
        .map(|f| json!({ "rfilename": f.path_in_repo, "size": f.size, "lfs": f.lfs }))
        .collect();

    Ok(json!({
        "id": repo.full_id,
        "author": repo.namespace,
        "sha": sha,
        "lastModified": commit_date,
        "createdAt": repo.created_at.to_rfc3339(),
        "private": repo.private,
        "gated": false,
        "disabled": false,
        "downloads": 0,
        "likes": 0,
        "tags": [],
        "siblings": siblings,
        "usedStorage": repo.used_bytes,
    }))
}

pub async fn repo_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let body = repo_info_body(&state, &repo, None).await?;
    Ok(Json(body))
}

pub async fn revision_info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((repo_type, namespace, name, revision)): Path<(String, String, String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, repo) = state.resolve_repo(&repo_type, &namespace, &name)?;
    let user = get_optional_user(state.store.as_ref(), &headers)?;
    check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref())?;

    let mut body = repo_info_body(&state, &repo, Some(&revision)).await?;
    if let Value::Object(map) = &mut body {
        map.insert("revision".to_string(), json!(revision));
        map.insert(
            "commit".to_string(),
            json!({ "oid": map.get("sha").cloned().unwrap_or(Value::Null),
                    "date": map.get("lastModified").cloned().unwrap_or(Value::Null) }),
        );
        map.insert("xetEnabled".to_string(), json!(false));
    }
    Ok(Json(body))
}
