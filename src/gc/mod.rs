//! LFS garbage collection and retention.
//!
//! `lfs_object_history` records every observed use of an oid in a commit and
//! is the source of truth here. Retention counts unique oids per path, so
//! reverts and merges that re-reference an oid never count as new versions.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::Result;
use crate::lakefs::LakefsClient;
use crate::lfs::lfs_key;
use crate::quota;
use crate::rules::{effective_keep_versions, should_use_lfs};
use crate::storage::BlobStore;
use crate::store::{FileUpsert, NewLfsHistory, Store};
use crate::types::Repository;

/// Shared handles the GC routines operate over.
pub struct GcContext<'a> {
    pub store: &'a dyn Store,
    pub blobs: &'a BlobStore,
    pub lakefs: &'a LakefsClient,
    pub app: &'a AppConfig,
}

pub struct CleanupStats {
    pub repo_objects_deleted: usize,
    pub lfs_objects_deleted: usize,
    pub lfs_history_deleted: usize,
}

/// Record one usage of an LFS oid in a commit. Always inserts; dedup happens
/// at GC time by unique oid.
pub fn track_lfs_object(
    store: &dyn Store,
    repo: &Repository,
    path_in_repo: &str,
    sha256: &str,
    size: i64,
    commit_id: &str,
) -> Result<()> {
    let file = store.get_file(repo.id, path_in_repo)?;
    store.insert_lfs_history(&NewLfsHistory {
        repository: repo.id,
        file: file.map(|f| f.id),
        path_in_repo,
        sha256,
        size,
        commit_id,
    })?;
    debug!(
        "Tracked LFS history for {}:{} ({})",
        repo.full_id,
        path_in_repo,
        &sha256[..8.min(sha256.len())]
    );
    Ok(())
}

/// Oids at `path` that fall outside the newest `keep_count` unique versions.
pub fn get_old_lfs_versions(
    store: &dyn Store,
    repo: &Repository,
    path_in_repo: &str,
    keep_count: u32,
) -> Result<Vec<String>> {
    let history = store.list_lfs_history_for_path(repo.id, path_in_repo)?;
    if history.is_empty() {
        return Ok(Vec::new());
    }

    let mut unique_oids = Vec::new();
    let mut seen = HashSet::new();
    for entry in &history {
        if seen.insert(entry.sha256.clone()) {
            unique_oids.push(entry.sha256.clone());
        }
    }

    if unique_oids.len() <= keep_count as usize {
        return Ok(Vec::new());
    }

    let stale = unique_oids.split_off(keep_count as usize);
    info!(
        "GC for {}: {} unique version(s), keeping {}, {} eligible",
        path_in_repo,
        stale.len() + unique_oids.len(),
        unique_oids.len(),
        stale.len()
    );
    Ok(stale)
}

/// Delete an LFS blob if nothing references it any more.
///
/// With `repo` set the reference check for history is scoped to that repo;
/// without it the oid must be unreferenced everywhere (active files AND
/// history) before the blob is removed.
pub async fn cleanup_lfs_object(
    ctx: &GcContext<'_>,
    sha256: &str,
    repo: Option<&Repository>,
) -> Result<bool> {
    let active = ctx.store.count_active_lfs_files(sha256, None)?;
    if active > 0 {
        debug!(
            "LFS object {} still used by {active} active file(s), keeping",
            &sha256[..8]
        );
        return Ok(false);
    }

    if repo.is_none() {
        let history = ctx.store.count_lfs_history(sha256, None)?;
        if history > 0 {
            debug!(
                "LFS object {} still in history ({history} reference(s)), keeping",
                &sha256[..8]
            );
            return Ok(false);
        }
    }

    if let Err(e) = ctx.blobs.delete_object(&lfs_key(sha256)).await {
        warn!("Failed to delete LFS object {}: {e}", &sha256[..8]);
        return Ok(false);
    }

    let purged = ctx
        .store
        .delete_lfs_history_by_sha256(sha256, repo.map(|r| r.id))?;
    info!(
        "Deleted LFS object {} and {purged} history record(s)",
        &sha256[..8]
    );
    Ok(true)
}

/// Retention pass for a single path after a replacing commit.
pub async fn run_gc_for_file(
    ctx: &GcContext<'_>,
    repo: &Repository,
    path_in_repo: &str,
) -> Result<usize> {
    if !ctx.app.lfs_auto_gc {
        debug!("Auto GC disabled, skipping");
        return Ok(0);
    }

    let keep = effective_keep_versions(repo, ctx.app);
    let stale = get_old_lfs_versions(ctx.store, repo, path_in_repo, keep)?;

    let mut deleted = 0;
    for sha256 in stale {
        if cleanup_lfs_object(ctx, &sha256, Some(repo)).await? {
            deleted += 1;
        }
    }
    if deleted > 0 {
        info!("GC for {path_in_repo}: deleted {deleted} old version(s)");
    }
    Ok(deleted)
}

/// Probe the blob store for every LFS object this commit recorded. Returns
/// `(all_present, missing_paths)`.
pub async fn check_lfs_recoverability(
    ctx: &GcContext<'_>,
    repo: &Repository,
    commit_id: &str,
) -> Result<(bool, Vec<String>)> {
    let entries = ctx.store.list_lfs_history_for_commit(repo.id, commit_id)?;
    if entries.is_empty() {
        return Ok((true, Vec::new()));
    }

    let probes = entries.iter().map(|entry| async {
        match ctx.blobs.exists(&lfs_key(&entry.sha256)).await {
            Ok(true) => None,
            Ok(false) => {
                warn!(
                    "LFS object missing for {}: {}",
                    entry.path_in_repo,
                    &entry.sha256[..8]
                );
                Some(entry.path_in_repo.clone())
            }
            Err(e) => {
                warn!("LFS existence probe failed for {}: {e}", entry.path_in_repo);
                Some(entry.path_in_repo.clone())
            }
        }
    });

    let missing: Vec<String> = join_all(probes).await.into_iter().flatten().collect();
    Ok((missing.is_empty(), missing))
}

/// Recoverability across every commit from the branch HEAD back to (and
/// including) `target_commit`. Returns `(all_ok, missing_paths,
/// affected_commits)`.
pub async fn check_commit_range_recoverability(
    ctx: &GcContext<'_>,
    lakefs_repo: &str,
    repo: &Repository,
    target_commit: &str,
    current_branch: &str,
) -> Result<(bool, Vec<String>, Vec<String>)> {
    let log = ctx
        .lakefs
        .log_commits(lakefs_repo, current_branch, 1000, None)
        .await?;

    let Some(target_index) = log.results.iter().position(|c| c.id == target_commit) else {
        warn!(
            "Target commit {} not found in branch history",
            &target_commit[..8.min(target_commit.len())]
        );
        return Ok((false, Vec::new(), Vec::new()));
    };

    let to_check = &log.results[..=target_index];
    info!(
        "Checking LFS recoverability for {} commit(s) back to {}",
        to_check.len(),
        &target_commit[..8.min(target_commit.len())]
    );

    let checks = to_check
        .iter()
        .map(|commit| async { (commit.id.clone(), check_lfs_recoverability(ctx, repo, &commit.id).await) });

    let mut all_missing = Vec::new();
    let mut affected = Vec::new();
    for (commit_id, result) in join_all(checks).await {
        let (ok, missing) = result?;
        if !ok {
            all_missing.extend(missing);
            affected.push(commit_id);
        }
    }

    // History rows may already have been purged by GC; the target tree is
    // the ground truth for what a reset must materialize. Probe every
    // LFS-linked object it still references.
    let mut after = String::new();
    loop {
        let listing = ctx
            .lakefs
            .list_objects(lakefs_repo, target_commit, "", "", &after, 1000)
            .await?;

        let probes = listing
            .results
            .iter()
            .filter(|o| o.is_object() && o.checksum.starts_with("sha256:"))
            .map(|obj| async {
                match ctx.blobs.exists(&lfs_key(obj.checksum_hex())).await {
                    Ok(true) => None,
                    _ => Some(obj.path.clone()),
                }
            });
        for path in join_all(probes).await.into_iter().flatten() {
            warn!("LFS object missing for {path} in reset target");
            all_missing.push(path);
            if !affected.contains(&target_commit.to_string()) {
                affected.push(target_commit.to_string());
            }
        }

        match listing.pagination {
            Some(p) if p.has_more => after = p.next_offset,
            _ => break,
        }
    }

    Ok((all_missing.is_empty(), all_missing, affected))
}

/// Make the File table match the tree at `ref`. Used after resets; safe to
/// re-run.
pub async fn sync_file_table_with_commit(
    ctx: &GcContext<'_>,
    lakefs_repo: &str,
    r#ref: &str,
    repo: &Repository,
) -> Result<usize> {
    // Resolve a branch ref to its commit id so staged changes never leak in.
    let commit_id = match ctx.lakefs.get_branch(lakefs_repo, r#ref).await {
        Ok(branch) => branch.commit_id,
        Err(e) if e.is_not_found() => r#ref.to_string(),
        Err(e) => return Err(e.into()),
    };

    let mut synced = 0;
    let mut kept_paths = Vec::new();
    let mut after = String::new();

    loop {
        let listing = ctx
            .lakefs
            .list_objects(lakefs_repo, &commit_id, "", "", &after, 1000)
            .await?;

        for obj in &listing.results {
            if !obj.is_object() {
                continue;
            }
            let is_lfs = should_use_lfs(repo, ctx.app, &obj.path, obj.size_bytes);
            let sha256 = obj.checksum_hex().to_string();

            ctx.store.upsert_file(&FileUpsert {
                repository: repo.id,
                path_in_repo: &obj.path,
                size: obj.size_bytes,
                sha256: &sha256,
                lfs: is_lfs,
                owner: repo.owner,
            })?;

            if is_lfs {
                track_lfs_object(
                    ctx.store,
                    repo,
                    &obj.path,
                    &sha256,
                    obj.size_bytes,
                    &commit_id,
                )?;
            }

            kept_paths.push(obj.path.clone());
            synced += 1;

            if kept_paths.len() >= 10_000 {
                warn!("File table sync for {} hit the 10000 path cap", repo.full_id);
                break;
            }
        }

        match listing.pagination {
            Some(p) if p.has_more && kept_paths.len() < 10_000 => after = p.next_offset,
            _ => break,
        }
    }

    let removed = ctx.store.delete_files_not_in(repo.id, &kept_paths)?;
    if removed > 0 {
        info!("Removed {removed} stale file(s) from File table");
    }
    info!(
        "Synced {synced} file(s) for {} at {}",
        repo.full_id,
        &commit_id[..8.min(commit_id.len())]
    );
    Ok(synced)
}

/// After a revert or merge, record LFS usage of the new commit by diffing it
/// against its first parent, and mirror the diff into the File table.
pub async fn track_commit_lfs_objects(
    ctx: &GcContext<'_>,
    lakefs_repo: &str,
    commit_id: &str,
    repo: &Repository,
) -> Result<usize> {
    let commit = ctx.lakefs.get_commit(lakefs_repo, commit_id).await?;
    let Some(parent) = commit.parents.first() else {
        warn!(
            "Commit {} has no parents, cannot track diff",
            &commit_id[..8.min(commit_id.len())]
        );
        return Ok(0);
    };

    let diff = ctx.lakefs.diff_refs(lakefs_repo, parent, commit_id).await?;

    let mut tracked = 0;
    let mut removed_paths = Vec::new();

    for entry in diff.results.iter().filter(|e| e.is_object()) {
        if entry.diff_type == "removed" {
            removed_paths.push(entry.path.clone());
            continue;
        }

        let stat = match ctx.lakefs.stat_object(lakefs_repo, commit_id, &entry.path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("Failed to stat {}: {e}", entry.path);
                continue;
            }
        };

        let is_lfs = should_use_lfs(repo, ctx.app, &entry.path, stat.size_bytes);
        let sha256 = stat.checksum_hex().to_string();

        ctx.store.upsert_file(&FileUpsert {
            repository: repo.id,
            path_in_repo: &entry.path,
            size: stat.size_bytes,
            sha256: &sha256,
            lfs: is_lfs,
            owner: repo.owner,
        })?;

        if is_lfs {
            track_lfs_object(ctx.store, repo, &entry.path, &sha256, stat.size_bytes, commit_id)?;
            tracked += 1;
        }
    }

    if !removed_paths.is_empty() {
        let removed = ctx.store.delete_files_in(repo.id, &removed_paths)?;
        info!("Removed {removed} deleted file(s) from File table");
    }

    Ok(tracked)
}

/// Storage teardown for a deleted or moved repository: drop the repo's
/// storage-namespace prefix, then globally reconsider every oid it ever
/// referenced, then purge its history rows.
pub async fn cleanup_repository_storage(
    ctx: &GcContext<'_>,
    repo: &Repository,
    lakefs_repo: &str,
) -> Result<CleanupStats> {
    let repo_objects_deleted = ctx.blobs.delete_prefix(&format!("{lakefs_repo}/")).await?;

    let oids = ctx.store.distinct_lfs_sha256(repo.id)?;
    let mut lfs_objects_deleted = 0;
    for sha256 in &oids {
        // Rows for this repo are about to be purged; they must not keep the
        // blob alive on their own.
        let other_history =
            ctx.store.count_lfs_history(sha256, None)? - ctx.store.count_lfs_history(sha256, Some(repo.id))?;
        let active = ctx.store.count_active_lfs_files(sha256, None)?;
        if other_history == 0 && active == 0 {
            if ctx.blobs.delete_object(&lfs_key(sha256)).await.is_ok() {
                lfs_objects_deleted += 1;
            }
        }
    }

    let lfs_history_deleted = {
        let mut total = 0;
        for sha256 in &oids {
            total += ctx.store.delete_lfs_history_by_sha256(sha256, Some(repo.id))?;
        }
        total
    };

    ctx.store.delete_staging_uploads(repo.id)?;

    info!(
        "Storage cleanup for {}: {} repo object(s), {} LFS object(s), {} history row(s)",
        repo.full_id, repo_objects_deleted, lfs_objects_deleted, lfs_history_deleted
    );

    Ok(CleanupStats {
        repo_objects_deleted,
        lfs_objects_deleted,
        lfs_history_deleted,
    })
}

/// Post-commit bookkeeping shared by commit/revert/merge/reset paths: refresh
/// repository and namespace usage. Failures here are logged, never surfaced.
pub fn refresh_storage_accounting(store: &dyn Store, repo: &Repository) {
    if let Err(e) = quota::update_repository_storage(store, repo) {
        warn!("Failed to update repository storage for {}: {e}", repo.full_id);
        return;
    }
    if let Err(e) = quota::update_namespace_storage(store, &repo.namespace) {
        warn!("Failed to update namespace storage for {}: {e}", repo.namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewLfsHistory, NewUser, SqliteStore};
    use crate::types::RepoType;

    fn fixture() -> (SqliteStore, Repository) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let alice = store
            .create_user(&NewUser {
                username: "alice",
                email: None,
                password_hash: None,
                is_org: false,
                private_quota_bytes: None,
                public_quota_bytes: None,
            })
            .unwrap();
        let repo = store
            .create_repository(RepoType::Model, "alice", "m1", false, alice.id)
            .unwrap();
        (store, repo)
    }

    fn push_history(store: &SqliteStore, repo: &Repository, oid: &str, commit: &str) {
        store
            .insert_lfs_history(&NewLfsHistory {
                repository: repo.id,
                file: None,
                path_in_repo: "weights.bin",
                sha256: oid,
                size: 1,
                commit_id: commit,
            })
            .unwrap();
    }

    #[test]
    fn retention_counts_unique_oids() {
        let (store, repo) = fixture();
        // o1 appears twice (e.g. committed, reverted back): one version.
        push_history(&store, &repo, "o1", "c1");
        push_history(&store, &repo, "o2", "c2");
        push_history(&store, &repo, "o1", "c3");

        assert!(get_old_lfs_versions(&store, &repo, "weights.bin", 2)
            .unwrap()
            .is_empty());

        push_history(&store, &repo, "o3", "c4");
        // Newest-first unique order is o3, o1, o2; with keep=2 only o2 falls off.
        let stale = get_old_lfs_versions(&store, &repo, "weights.bin", 2).unwrap();
        assert_eq!(stale, vec!["o2".to_string()]);
    }

    #[test]
    fn retention_keeps_everything_under_threshold() {
        let (store, repo) = fixture();
        push_history(&store, &repo, "o1", "c1");
        assert!(get_old_lfs_versions(&store, &repo, "weights.bin", 1)
            .unwrap()
            .is_empty());
        assert!(get_old_lfs_versions(&store, &repo, "missing.bin", 1)
            .unwrap()
            .is_empty());
    }
}
