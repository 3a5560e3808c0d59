//! Read-only git smart-HTTP endpoints backed by the in-memory bridge.
//!
//! Only `git-upload-pack` is served; pushes go through the HTTP commit API,
//! never through `git-receive-pack`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::response::ApiError;
use super::router::AppState;
use crate::auth::{check_repo_read_permission, get_optional_user};
use crate::gitbridge::{GitBridge, flush_pkt, pkt_line};
use crate::types::User;

const DEFAULT_BRANCH: &str = "main";
const UPLOAD_PACK_SERVICE: &str = "git-upload-pack";

/// Git clients authenticate with Basic auth; the password slot carries the
/// API token. Bearer headers work too.
fn git_user(state: &AppState, headers: &HeaderMap) -> Option<User> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = BASE64.decode(encoded.trim()) {
                if let Ok(pair) = String::from_utf8(decoded) {
                    if let Some((_, token)) = pair.split_once(':') {
                        let mut bearer = HeaderMap::new();
                        if let Ok(v) = format!("Bearer {token}").parse() {
                            bearer.insert(header::AUTHORIZATION, v);
                            return get_optional_user(state.store.as_ref(), &bearer)
                                .ok()
                                .flatten();
                        }
                    }
                }
            }
        }
    }
    get_optional_user(state.store.as_ref(), headers).ok().flatten()
}

fn git_response(body: Vec<u8>, content_type: &str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

pub async fn info_refs(
    state: Arc<AppState>,
    namespace: &str,
    name: &str,
    req: Request,
) -> Response {
    let service = req
        .uri()
        .query()
        .and_then(|q| query_param(q, "service"))
        .unwrap_or_default()
        .to_string();
    if service != UPLOAD_PACK_SERVICE {
        return (
            StatusCode::FORBIDDEN,
            "Only git-upload-pack is supported; this service is read-only over git",
        )
            .into_response();
    }

    let (_, repo) = match state.resolve_repo("models", namespace, name) {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };
    let user = git_user(&state, req.headers());
    if let Err(e) = check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref()) {
        return unauthorized_git(ApiError::from(e));
    }

    let lakefs_repo = state.lakefs_name(&repo);
    let bridge = GitBridge {
        store: state.store.as_ref(),
        lakefs: &state.lakefs,
        app: &state.config.app,
        repo: &repo,
        lakefs_repo,
    };

    let refs = match bridge.get_refs(DEFAULT_BRANCH).await {
        Ok(refs) => refs,
        Err(e) => {
            warn!("Failed to build refs for {}: {e}", repo.full_id);
            return ApiError::from(e).into_response();
        }
    };

    let mut body = Vec::new();
    body.extend_from_slice(&pkt_line(format!("# service={UPLOAD_PACK_SERVICE}\n").as_bytes()));
    body.extend_from_slice(flush_pkt());

    if refs.is_empty() {
        // Empty repository: capabilities ride on the zero-id line.
        body.extend_from_slice(&pkt_line(
            format!("{} capabilities^{{}}\0agent=kohakuhub\n", "0".repeat(40)).as_bytes(),
        ));
    } else {
        let head = &refs[0];
        body.extend_from_slice(&pkt_line(
            format!(
                "{} HEAD\0symref=HEAD:refs/heads/{DEFAULT_BRANCH} agent=kohakuhub\n",
                head.1
            )
            .as_bytes(),
        ));
        for (refname, sha) in refs.iter().skip(1) {
            body.extend_from_slice(&pkt_line(format!("{sha} {refname}\n").as_bytes()));
        }
    }
    body.extend_from_slice(flush_pkt());

    git_response(body, "application/x-git-upload-pack-advertisement")
}

pub async fn upload_pack(
    state: Arc<AppState>,
    namespace: &str,
    name: &str,
    req: Request,
) -> Response {
    let (_, repo) = match state.resolve_repo("models", namespace, name) {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };
    let user = git_user(&state, req.headers());
    if let Err(e) = check_repo_read_permission(state.store.as_ref(), &repo, user.as_ref()) {
        return unauthorized_git(ApiError::from(e));
    }

    // The negotiation body is drained (and gunzipped when needed) but not
    // used: the bridge serves exactly one synthesized commit, so every fetch
    // is a full clone.
    let gzipped = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        == Some("gzip");
    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("Failed to read body: {e}"))
                .into_response();
        }
    };
    if gzipped {
        let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(
            tokio::io::BufReader::new(std::io::Cursor::new(body)),
        );
        let mut decompressed = Vec::new();
        if decoder.read_to_end(&mut decompressed).await.is_err() {
            return (StatusCode::BAD_REQUEST, "Invalid gzip body").into_response();
        }
    }

    let lakefs_repo = state.lakefs_name(&repo);
    let bridge = GitBridge {
        store: state.store.as_ref(),
        lakefs: &state.lakefs,
        app: &state.config.app,
        repo: &repo,
        lakefs_repo,
    };

    let pack = match bridge.build_pack_file(DEFAULT_BRANCH).await {
        Ok(pack) => pack,
        Err(e) => {
            warn!("Failed to build pack for {}: {e}", repo.full_id);
            return ApiError::from(e).into_response();
        }
    };

    let mut body = Vec::new();
    body.extend_from_slice(&pkt_line(b"NAK\n"));
    body.extend_from_slice(&pack);

    git_response(body, "application/x-git-upload-pack-result")
}

fn unauthorized_git(err: ApiError) -> Response {
    let mut response = err.into_response();
    if response.status() == StatusCode::UNAUTHORIZED {
        if let Ok(value) = "Basic realm=\"kohakuhub\"".parse() {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_query_params() {
        assert_eq!(
            query_param("service=git-upload-pack", "service"),
            Some("git-upload-pack")
        );
        assert_eq!(query_param("a=1&service=x", "service"), Some("x"));
        assert_eq!(query_param("a=1", "service"), None);
    }
}
