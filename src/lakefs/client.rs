use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::*;
use crate::config::LakefsConfig;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum LakefsError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl LakefsError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type LakefsResult<T> = std::result::Result<T, LakefsError>;

/// Client for the versioned-object store's REST API. Transient failures
/// (transport, 5xx) are retried with jittered exponential backoff.
pub struct LakefsClient {
    http: reqwest::Client,
    api_base: String,
    access_key: String,
    secret_key: String,
}

fn backoff(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    Duration::from_millis(base + jitter)
}

impl LakefsClient {
    #[must_use]
    pub fn new(cfg: &LakefsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: format!("{}/api/v1", cfg.endpoint.trim_end_matches('/')),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .basic_auth(&self.access_key, Some(&self.secret_key))
    }

    async fn send(&self, builder: RequestBuilder) -> LakefsResult<Response> {
        let mut attempt = 0;
        loop {
            let req = builder
                .try_clone()
                .ok_or_else(|| LakefsError::Transport("unclonable request".to_string()))?;

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() && attempt + 1 < MAX_ATTEMPTS {
                        warn!("lakefs {}: retrying after {}", resp.url(), status);
                        tokio::time::sleep(backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    if status.is_success() {
                        return Ok(resp);
                    }
                    return Err(Self::error_for(status, resp).await);
                }
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        debug!("lakefs transport error, retrying: {e}");
                        tokio::time::sleep(backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(LakefsError::Transport(e.to_string()));
                }
            }
        }
    }

    async fn error_for(status: StatusCode, resp: Response) -> LakefsError {
        let message = resp
            .text()
            .await
            .ok()
            .and_then(|body| {
                serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                    .or(Some(body))
            })
            .unwrap_or_default();

        match status {
            StatusCode::NOT_FOUND => LakefsError::NotFound,
            StatusCode::CONFLICT => LakefsError::Conflict(message),
            _ => LakefsError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> LakefsResult<T> {
        let resp = self.send(builder).await?;
        resp.json::<T>()
            .await
            .map_err(|e| LakefsError::Transport(format!("decode failed: {e}")))
    }

    // Repositories

    pub async fn create_repository(
        &self,
        name: &str,
        storage_namespace: &str,
        default_branch: &str,
    ) -> LakefsResult<()> {
        self.send(self.request(Method::POST, "/repositories").json(&json!({
            "name": name,
            "storage_namespace": storage_namespace,
            "default_branch": default_branch,
        })))
        .await?;
        Ok(())
    }

    pub async fn delete_repository(&self, repository: &str) -> LakefsResult<()> {
        self.send(self.request(Method::DELETE, &format!("/repositories/{repository}")))
            .await?;
        Ok(())
    }

    pub async fn repository_exists(&self, repository: &str) -> LakefsResult<bool> {
        match self
            .send(self.request(Method::GET, &format!("/repositories/{repository}")))
            .await
        {
            Ok(_) => Ok(true),
            Err(LakefsError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // Branches and tags

    pub async fn get_branch(&self, repository: &str, branch: &str) -> LakefsResult<BranchInfo> {
        self.send_json(self.request(
            Method::GET,
            &format!("/repositories/{repository}/branches/{branch}"),
        ))
        .await
    }

    pub async fn create_branch(
        &self,
        repository: &str,
        name: &str,
        source: &str,
    ) -> LakefsResult<()> {
        self.send(
            self.request(Method::POST, &format!("/repositories/{repository}/branches"))
                .json(&json!({ "name": name, "source": source })),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repository: &str, branch: &str) -> LakefsResult<()> {
        self.send(self.request(
            Method::DELETE,
            &format!("/repositories/{repository}/branches/{branch}"),
        ))
        .await?;
        Ok(())
    }

    pub async fn create_tag(&self, repository: &str, id: &str, reference: &str) -> LakefsResult<()> {
        self.send(
            self.request(Method::POST, &format!("/repositories/{repository}/tags"))
                .json(&json!({ "id": id, "ref": reference })),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_tag(&self, repository: &str, tag: &str) -> LakefsResult<()> {
        self.send(self.request(
            Method::DELETE,
            &format!("/repositories/{repository}/tags/{tag}"),
        ))
        .await?;
        Ok(())
    }

    // Objects

    pub async fn list_objects(
        &self,
        repository: &str,
        reference: &str,
        prefix: &str,
        delimiter: &str,
        after: &str,
        amount: u32,
    ) -> LakefsResult<ObjectListing> {
        self.send_json(
            self.request(
                Method::GET,
                &format!("/repositories/{repository}/refs/{reference}/objects/ls"),
            )
            .query(&[
                ("prefix", prefix),
                ("delimiter", delimiter),
                ("after", after),
                ("amount", &amount.to_string()),
            ]),
        )
        .await
    }

    pub async fn stat_object(
        &self,
        repository: &str,
        reference: &str,
        path: &str,
    ) -> LakefsResult<ObjectStat> {
        self.send_json(
            self.request(
                Method::GET,
                &format!("/repositories/{repository}/refs/{reference}/objects/stat"),
            )
            .query(&[("path", path)]),
        )
        .await
    }

    pub async fn get_object(
        &self,
        repository: &str,
        reference: &str,
        path: &str,
    ) -> LakefsResult<Bytes> {
        let resp = self
            .send(
                self.request(
                    Method::GET,
                    &format!("/repositories/{repository}/refs/{reference}/objects"),
                )
                .query(&[("path", path)]),
            )
            .await?;
        resp.bytes()
            .await
            .map_err(|e| LakefsError::Transport(format!("read body failed: {e}")))
    }

    pub async fn upload_object(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: Vec<u8>,
    ) -> LakefsResult<()> {
        self.send(
            self.request(
                Method::POST,
                &format!("/repositories/{repository}/branches/{branch}/objects"),
            )
            .query(&[("path", path)])
            .header("Content-Type", "application/octet-stream")
            .body(content),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_object(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
    ) -> LakefsResult<()> {
        self.send(
            self.request(
                Method::DELETE,
                &format!("/repositories/{repository}/branches/{branch}/objects"),
            )
            .query(&[("path", path)]),
        )
        .await?;
        Ok(())
    }

    /// Register an existing blob (by physical address) as the content of
    /// `path` on `branch` without copying bytes.
    pub async fn link_physical_address(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        staging: &StagingMetadata,
    ) -> LakefsResult<()> {
        self.send(
            self.request(
                Method::PUT,
                &format!("/repositories/{repository}/branches/{branch}/staging/backing"),
            )
            .query(&[("path", path)])
            .json(staging),
        )
        .await?;
        Ok(())
    }

    // Commits

    pub async fn commit(
        &self,
        repository: &str,
        branch: &str,
        message: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> LakefsResult<CommitRecord> {
        self.send_json(
            self.request(
                Method::POST,
                &format!("/repositories/{repository}/branches/{branch}/commits"),
            )
            .json(&json!({ "message": message, "metadata": metadata })),
        )
        .await
    }

    pub async fn get_commit(
        &self,
        repository: &str,
        commit_id: &str,
    ) -> LakefsResult<CommitRecord> {
        self.send_json(self.request(
            Method::GET,
            &format!("/repositories/{repository}/commits/{commit_id}"),
        ))
        .await
    }

    pub async fn log_commits(
        &self,
        repository: &str,
        reference: &str,
        amount: u32,
        after: Option<&str>,
    ) -> LakefsResult<CommitLog> {
        let mut req = self
            .request(
                Method::GET,
                &format!("/repositories/{repository}/refs/{reference}/commits"),
            )
            .query(&[("amount", amount.to_string())]);
        if let Some(after) = after {
            req = req.query(&[("after", after)]);
        }
        self.send_json(req).await
    }

    pub async fn diff_refs(
        &self,
        repository: &str,
        left_ref: &str,
        right_ref: &str,
    ) -> LakefsResult<DiffList> {
        self.send_json(
            self.request(
                Method::GET,
                &format!("/repositories/{repository}/refs/{left_ref}/diff/{right_ref}"),
            )
            .query(&[("amount", "1000")]),
        )
        .await
    }

    // Branch algebra

    pub async fn revert_branch(
        &self,
        repository: &str,
        branch: &str,
        reference: &str,
        options: &RevertOptions,
    ) -> LakefsResult<()> {
        self.send(
            self.request(
                Method::POST,
                &format!("/repositories/{repository}/branches/{branch}/revert"),
            )
            .json(&json!({
                "ref": reference,
                "parent_number": options.parent_number,
                "allow_empty": options.allow_empty,
            })),
        )
        .await?;
        Ok(())
    }

    pub async fn merge_into_branch(
        &self,
        repository: &str,
        source_ref: &str,
        destination_branch: &str,
        options: &MergeOptions,
    ) -> LakefsResult<MergeResult> {
        self.send_json(
            self.request(
                Method::POST,
                &format!(
                    "/repositories/{repository}/refs/{source_ref}/merge/{destination_branch}"
                ),
            )
            .json(&json!({
                "message": options.message,
                "metadata": options.metadata,
                "strategy": options.strategy,
                "force": options.force,
                "allow_empty": options.allow_empty,
                "squash_merge": options.squash_merge,
            })),
        )
        .await
    }
}
