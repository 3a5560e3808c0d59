//! Permission predicates, called at every mutation boundary.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Repository, User};

/// Whether `user` may act within `namespace` (their own, or an organization
/// they belong to). `require_admin` raises the bar to org admin roles.
pub fn check_namespace_permission(
    store: &dyn Store,
    namespace: &str,
    user: &User,
    require_admin: bool,
) -> Result<()> {
    if namespace == user.username {
        return Ok(());
    }

    let Some(org) = store.get_organization(namespace)? else {
        return Err(Error::Forbidden(format!(
            "Namespace '{namespace}' does not exist or you don't have access"
        )));
    };

    let Some(membership) = store.get_membership(user.id, org.id)? else {
        return Err(Error::Forbidden(format!(
            "You are not a member of organization '{namespace}'"
        )));
    };

    if require_admin && !membership.role.can_delete() {
        return Err(Error::Forbidden(format!(
            "You need admin privileges in organization '{namespace}'"
        )));
    }

    Ok(())
}

/// Public repos are open; private repos require the owner namespace or org
/// membership.
pub fn check_repo_read_permission(
    store: &dyn Store,
    repo: &Repository,
    user: Option<&User>,
) -> Result<()> {
    if !repo.private {
        return Ok(());
    }

    let Some(user) = user else {
        return Err(Error::Unauthorized);
    };

    if repo.namespace == user.username {
        return Ok(());
    }

    if let Some(org) = store.get_organization(&repo.namespace)? {
        if store.get_membership(user.id, org.id)?.is_some() {
            return Ok(());
        }
    }

    Err(Error::Forbidden(format!(
        "You don't have access to private repository '{}'",
        repo.full_id
    )))
}

/// Owner namespace, or org member with a writing role.
pub fn check_repo_write_permission(
    store: &dyn Store,
    repo: &Repository,
    user: &User,
) -> Result<()> {
    if repo.namespace == user.username {
        return Ok(());
    }

    if let Some(org) = store.get_organization(&repo.namespace)? {
        if let Some(membership) = store.get_membership(user.id, org.id)? {
            if membership.role.can_write() {
                return Ok(());
            }
        }
    }

    Err(Error::Forbidden(format!(
        "You don't have permission to modify repository '{}'",
        repo.full_id
    )))
}

/// Owner namespace, or org admin/super-admin. `is_admin` (admin token)
/// bypasses.
pub fn check_repo_delete_permission(
    store: &dyn Store,
    repo: &Repository,
    user: Option<&User>,
    is_admin: bool,
) -> Result<()> {
    if is_admin {
        return Ok(());
    }

    let Some(user) = user else {
        return Err(Error::Unauthorized);
    };

    if repo.namespace == user.username {
        return Ok(());
    }

    if let Some(org) = store.get_organization(&repo.namespace)? {
        if let Some(membership) = store.get_membership(user.id, org.id)? {
            if membership.role.can_delete() {
                return Ok(());
            }
        }
    }

    Err(Error::Forbidden(format!(
        "You don't have permission to delete repository '{}'",
        repo.full_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewUser, SqliteStore, Store};
    use crate::types::{OrgRole, RepoType};

    fn fixture() -> (SqliteStore, User, User, Repository) {
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
        let org = store
            .create_user(&NewUser {
                username: "acme",
                email: None,
                password_hash: None,
                is_org: true,
                private_quota_bytes: None,
                public_quota_bytes: None,
            })
            .unwrap();
        let repo = store
            .create_repository(RepoType::Model, "acme", "m1", true, org.id)
            .unwrap();
        (store, alice, org, repo)
    }

    #[test]
    fn private_repo_requires_membership() {
        let (store, alice, org, repo) = fixture();
        assert!(check_repo_read_permission(&store, &repo, None).is_err());
        assert!(check_repo_read_permission(&store, &repo, Some(&alice)).is_err());

        store
            .create_membership(alice.id, org.id, OrgRole::Visitor)
            .unwrap();
        assert!(check_repo_read_permission(&store, &repo, Some(&alice)).is_ok());
        // Visitors read but never write.
        assert!(check_repo_write_permission(&store, &repo, &alice).is_err());
    }

    #[test]
    fn write_needs_member_delete_needs_admin() {
        let (store, alice, org, repo) = fixture();
        store
            .create_membership(alice.id, org.id, OrgRole::Member)
            .unwrap();
        assert!(check_repo_write_permission(&store, &repo, &alice).is_ok());
        assert!(check_repo_delete_permission(&store, &repo, Some(&alice), false).is_err());

        store
            .create_membership(alice.id, org.id, OrgRole::Admin)
            .unwrap();
        assert!(check_repo_delete_permission(&store, &repo, Some(&alice), false).is_ok());
    }

    #[test]
    fn admin_token_bypasses() {
        let (store, _, _, repo) = fixture();
        assert!(check_repo_delete_permission(&store, &repo, None, true).is_ok());
    }

    #[test]
    fn own_namespace_is_always_allowed() {
        let (store, alice, _, _) = fixture();
        assert!(check_namespace_permission(&store, "alice", &alice, true).is_ok());
        assert!(check_namespace_permission(&store, "missing", &alice, false).is_err());
    }
}
