use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::response::ApiError;
use super::{branches, commit, file, git, lfs, repo};
use crate::config::Config;
use crate::gc::GcContext;
use crate::lakefs::LakefsClient;
use crate::rules::lakefs_repo_name;
use crate::storage::BlobStore;
use crate::store::Store;
use crate::types::{RepoType, Repository};

/// Inline commit payloads carry base64 file content; allow large bodies.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<BlobStore>,
    pub lakefs: Arc<LakefsClient>,
    pub config: Arc<Config>,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<BlobStore>,
        lakefs: Arc<LakefsClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            blobs,
            lakefs,
            config,
        }
    }

    #[must_use]
    pub fn gc(&self) -> GcContext<'_> {
        GcContext {
            store: self.store.as_ref(),
            blobs: &self.blobs,
            lakefs: &self.lakefs,
            app: &self.config.app,
        }
    }

    /// Versioned-store repository name for a repo row.
    #[must_use]
    pub fn lakefs_name(&self, repo: &Repository) -> String {
        lakefs_repo_name(&self.config.lakefs.repo_namespace, repo)
    }

    /// Resolve plural path segments ("models", ns, name[.git]) to a repo row.
    pub fn resolve_repo(
        &self,
        repo_type_plural: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(RepoType, Repository), ApiError> {
        let repo_type = RepoType::from_plural(repo_type_plural)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown repo type: {repo_type_plural}")))?;
        let name = name.strip_suffix(".git").unwrap_or(name);
        let repo = self
            .store
            .get_repository(repo_type, namespace, name)
            .map_err(ApiError::from)?
            .ok_or_else(|| {
                ApiError::repo_not_found(&format!("{namespace}/{name}"), repo_type.as_str())
            })?;
        Ok((repo_type, repo))
    }
}

async fn health() -> &'static str {
    "OK"
}

/// Paths carrying a `.git` suffix in their second segment cannot share the
/// typed route tree; dispatch them by hand.
async fn git_dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<String> = path.split('/').map(str::to_string).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
    let method = req.method().clone();

    match segments.as_slice() {
        [ns, repo, "info", "refs"] if method == Method::GET && repo.ends_with(".git") => {
            git::info_refs(state, ns, repo, req).await
        }
        [ns, repo, "git-upload-pack"] if method == Method::POST && repo.ends_with(".git") => {
            git::upload_pack(state, ns, repo, req).await
        }
        [ns, repo, "info", "lfs", "objects", "batch"]
            if method == Method::POST && repo.ends_with(".git") =>
        {
            lfs::batch_for(state, "models", ns, repo, req).await
        }
        ["api", ns, repo, "info", "lfs", "complete"]
            if method == Method::POST && repo.ends_with(".git") =>
        {
            lfs::complete_multipart(state, ns, repo, None, req).await
        }
        ["api", ns, repo, "info", "lfs", "complete", upload_id]
            if method == Method::POST && repo.ends_with(".git") =>
        {
            let upload_id = (*upload_id).to_string();
            lfs::complete_multipart(state, ns, repo, Some(upload_id), req).await
        }
        ["api", ns, repo, "info", "lfs", "verify"]
            if method == Method::POST && repo.ends_with(".git") =>
        {
            lfs::verify(state, ns, repo, req).await
        }
        _ => ApiError::not_found("Not found").into_response(),
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/whoami-v2", get(repo::whoami_v2))
        .route("/api/repos/create", post(repo::create_repo))
        .route("/api/repos/delete", delete(repo::delete_repo))
        .route("/api/repos/move", post(repo::move_repo))
        .route("/api/repos/squash", post(repo::squash_repo))
        .route("/api/{repo_type}", get(repo::list_repos))
        .route("/api/{repo_type}/{namespace}/{name}", get(repo::repo_info))
        .route(
            "/api/{repo_type}/{namespace}/{name}/revision/{revision}",
            get(repo::revision_info),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/tree/{revision}",
            get(file::tree_root),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/tree/{revision}/{*path}",
            get(file::tree_path),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/preupload/{revision}",
            post(file::preupload),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/commit/{revision}",
            post(commit::operations::create_commit).get(commit::history::commit_detail),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/commit/{revision}/diff",
            get(commit::history::commit_diff),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/commits/{revision}",
            get(commit::history::list_commits),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/branch",
            post(branches::create_branch),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/branch/{branch}",
            delete(branches::delete_branch),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/branch/{branch}/revert",
            post(branches::revert_branch),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/branch/{branch}/reset",
            post(branches::reset_branch),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/tag",
            post(branches::create_tag),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/tag/{tag}",
            delete(branches::delete_tag),
        )
        .route(
            "/api/{repo_type}/{namespace}/{name}/merge/{source_ref}/into/{destination_branch}",
            post(branches::merge_branches),
        )
        .route(
            "/{repo_type}/{namespace}/{name}/resolve/{revision}/{*path}",
            get(file::resolve),
        )
        .route(
            "/{repo_type}/{namespace}/{name}/info/lfs/objects/batch",
            post(lfs::batch),
        )
        .fallback(git_dispatch)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
