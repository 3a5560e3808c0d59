//! Repository naming and LFS classification rules.
//!
//! Effective LFS settings resolve per repository: repo override first, then
//! the global config default.

use glob::Pattern;

use crate::config::AppConfig;
use crate::types::{RepoType, Repository};

/// Lowercase with `-` and `_` stripped. Used for namespace and repo name
/// collision checks.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect()
}

/// Versioned-store repository name: `{prefix}-{type}-{ns}-{name}-{id}`,
/// lowercased, slashes flattened. The numeric id suffix keeps names unique
/// across delete/recreate and move/squash cycles.
#[must_use]
pub fn lakefs_repo_name(prefix: &str, repo: &Repository) -> String {
    lakefs_repo_name_for(prefix, repo.repo_type, &repo.full_id, repo.id)
}

#[must_use]
pub fn lakefs_repo_name_for(
    prefix: &str,
    repo_type: RepoType,
    full_id: &str,
    repo_id: i64,
) -> String {
    let safe_id = full_id.replace('/', "-");
    format!("{prefix}-{repo_type}-{safe_id}-{repo_id}").to_lowercase()
}

#[must_use]
pub fn effective_lfs_threshold(repo: &Repository, app: &AppConfig) -> i64 {
    repo.lfs_threshold_bytes.unwrap_or(app.lfs_threshold_bytes)
}

#[must_use]
pub fn effective_keep_versions(repo: &Repository, app: &AppConfig) -> u32 {
    repo.lfs_keep_versions.unwrap_or(app.lfs_keep_versions)
}

/// Suffix globs forcing LFS. The repo override is a comma-separated list.
#[must_use]
pub fn effective_suffix_patterns(repo: &Repository, app: &AppConfig) -> Vec<String> {
    match &repo.lfs_suffix_patterns {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        None => app.lfs_suffix_patterns.clone(),
    }
}

fn matches_suffix(path: &str, pattern: &str) -> bool {
    let Ok(pattern) = Pattern::new(pattern) else {
        return false;
    };
    if pattern.matches(path) {
        return true;
    }
    // "*.ext" patterns also apply to the basename of nested paths.
    path.rsplit('/').next().is_some_and(|base| pattern.matches(base))
}

/// Whether a file at `path` with `size` bytes must be stored through LFS.
/// Size strictly above the threshold triggers LFS; suffix rules apply at any
/// size.
#[must_use]
pub fn should_use_lfs(repo: &Repository, app: &AppConfig, path: &str, size: i64) -> bool {
    if size > effective_lfs_threshold(repo, app) {
        return true;
    }
    effective_suffix_patterns(repo, app)
        .iter()
        .any(|p| matches_suffix(path, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn app() -> AppConfig {
        toml::from_str(r#"base_url = "http://localhost""#).unwrap()
    }

    fn repo() -> Repository {
        Repository {
            id: 42,
            repo_type: RepoType::Model,
            namespace: "Alice".to_string(),
            name: "My-Model".to_string(),
            full_id: "Alice/My-Model".to_string(),
            private: false,
            owner: 1,
            quota_bytes: None,
            used_bytes: 0,
            lfs_threshold_bytes: None,
            lfs_suffix_patterns: None,
            lfs_keep_versions: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("My-Model_v2"), "mymodelv2");
        assert_eq!(normalize_name("plain"), "plain");
    }

    #[test]
    fn lakefs_name_is_lowercase_with_id_suffix() {
        assert_eq!(lakefs_repo_name("hf", &repo()), "hf-model-alice-my-model-42");
    }

    #[test]
    fn threshold_is_strict() {
        let app = app();
        let repo = repo();
        let t = effective_lfs_threshold(&repo, &app);
        assert!(!should_use_lfs(&repo, &app, "weights.bin", t));
        assert!(should_use_lfs(&repo, &app, "weights.bin", t + 1));
    }

    #[test]
    fn repo_override_wins() {
        let app = app();
        let mut repo = repo();
        repo.lfs_threshold_bytes = Some(100);
        repo.lfs_keep_versions = Some(2);
        assert!(should_use_lfs(&repo, &app, "a.txt", 101));
        assert!(!should_use_lfs(&repo, &app, "a.txt", 100));
        assert_eq!(effective_keep_versions(&repo, &app), 2);
    }

    #[test]
    fn suffix_rules_apply_at_any_size() {
        let mut app = app();
        app.lfs_suffix_patterns = vec!["*.safetensors".to_string()];
        let repo = repo();
        assert!(should_use_lfs(&repo, &app, "weights.safetensors", 1));
        assert!(should_use_lfs(&repo, &app, "nested/dir/weights.safetensors", 1));
        assert!(!should_use_lfs(&repo, &app, "README.md", 1));
    }

    #[test]
    fn repo_suffix_override_replaces_global() {
        let mut app = app();
        app.lfs_suffix_patterns = vec!["*.safetensors".to_string()];
        let mut repo = repo();
        repo.lfs_suffix_patterns = Some("*.gguf, *.ckpt".to_string());
        assert!(should_use_lfs(&repo, &app, "model.gguf", 1));
        assert!(should_use_lfs(&repo, &app, "model.ckpt", 1));
        assert!(!should_use_lfs(&repo, &app, "weights.safetensors", 1));
    }
}
