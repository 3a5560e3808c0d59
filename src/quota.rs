//! Namespace and repository storage accounting.
//!
//! Quotas live on the users table (users and organizations share it), split
//! by repository visibility. Usage is recomputed from active files after
//! every successful commit and adjusted incrementally on repository moves.

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::Repository;

/// Fail when `used + additional` would exceed the namespace quota for the
/// given visibility class. A null quota means unlimited.
pub fn check_quota(
    store: &dyn Store,
    namespace: &str,
    additional_bytes: i64,
    private: bool,
) -> Result<()> {
    let Some(ns) = store.get_user_by_username(namespace)? else {
        return Err(Error::NotFound);
    };

    let (quota, used) = if private {
        (ns.private_quota_bytes, ns.private_used_bytes)
    } else {
        (ns.public_quota_bytes, ns.public_used_bytes)
    };

    if let Some(quota) = quota {
        if used + additional_bytes > quota {
            let kind = if private { "private" } else { "public" };
            return Err(Error::QuotaExceeded(format!(
                "{kind} storage quota exceeded for '{namespace}': \
                 used {used} + requested {additional_bytes} > quota {quota} bytes"
            )));
        }
    }

    Ok(())
}

/// Incremental adjustment used by repository moves: decrement the source
/// namespace, increment the target.
pub fn increment_storage(
    store: &dyn Store,
    namespace: &str,
    delta: i64,
    private: bool,
) -> Result<()> {
    let Some(ns) = store.get_user_by_username(namespace)? else {
        return Err(Error::NotFound);
    };
    store.add_user_usage(ns.id, delta, private)
}

/// Recompute `Repository.used_bytes` from active files. Returns the new total.
pub fn update_repository_storage(store: &dyn Store, repo: &Repository) -> Result<i64> {
    let total = store.sum_active_file_bytes(repo.id)?;
    store.update_repository_used_bytes(repo.id, total)?;
    debug!("Repository {} storage: {} bytes", repo.full_id, total);
    Ok(total)
}

/// Recompute a namespace's used bytes per visibility class from its
/// repositories.
pub fn update_namespace_storage(store: &dyn Store, namespace: &str) -> Result<()> {
    let Some(ns) = store.get_user_by_username(namespace)? else {
        return Err(Error::NotFound);
    };
    let private = store.sum_namespace_used_bytes(namespace, true)?;
    let public = store.sum_namespace_used_bytes(namespace, false)?;
    store.set_user_usage(ns.id, private, public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileUpsert, NewUser, SqliteStore};
    use crate::types::RepoType;

    fn store_with_user(quota: Option<i64>) -> (SqliteStore, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let user = store
            .create_user(&NewUser {
                username: "alice",
                email: None,
                password_hash: None,
                is_org: false,
                private_quota_bytes: None,
                public_quota_bytes: quota,
            })
            .unwrap();
        (store, user.id)
    }

    #[test]
    fn null_quota_is_unlimited() {
        let (store, _) = store_with_user(None);
        assert!(check_quota(&store, "alice", i64::MAX / 2, false).is_ok());
    }

    #[test]
    fn quota_boundary() {
        let (store, id) = store_with_user(Some(100));
        store.add_user_usage(id, 60, false).unwrap();
        assert!(check_quota(&store, "alice", 40, false).is_ok());
        assert!(matches!(
            check_quota(&store, "alice", 41, false),
            Err(Error::QuotaExceeded(_))
        ));
        // Private class has its own (here: unlimited) budget.
        assert!(check_quota(&store, "alice", 1_000_000, true).is_ok());
    }

    #[test]
    fn repository_storage_tracks_active_files_only() {
        let (store, id) = store_with_user(None);
        let repo = store
            .create_repository(RepoType::Model, "alice", "m1", false, id)
            .unwrap();
        for (path, size) in [("a.bin", 70), ("b.bin", 30)] {
            store
                .upsert_file(&FileUpsert {
                    repository: repo.id,
                    path_in_repo: path,
                    size,
                    sha256: "x",
                    lfs: false,
                    owner: id,
                })
                .unwrap();
        }
        assert_eq!(update_repository_storage(&store, &repo).unwrap(), 100);

        store.mark_file_deleted(repo.id, "a.bin").unwrap();
        assert_eq!(update_repository_storage(&store, &repo).unwrap(), 30);

        update_namespace_storage(&store, "alice").unwrap();
        let alice = store.get_user_by_id(id).unwrap().unwrap();
        assert_eq!(alice.public_used_bytes, 30);
        assert_eq!(alice.private_used_bytes, 0);
    }
}
