mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Fields for creating a user or organization row.
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: Option<&'a str>,
    pub password_hash: Option<&'a str>,
    pub is_org: bool,
    pub private_quota_bytes: Option<i64>,
    pub public_quota_bytes: Option<i64>,
}

/// Fields written on every file upsert. `is_deleted` is always cleared.
pub struct FileUpsert<'a> {
    pub repository: i64,
    pub path_in_repo: &'a str,
    pub size: i64,
    pub sha256: &'a str,
    pub lfs: bool,
    pub owner: i64,
}

pub struct NewCommit<'a> {
    pub commit_id: &'a str,
    pub repository: i64,
    pub repo_type: RepoType,
    pub branch: &'a str,
    pub author: i64,
    pub username: &'a str,
    pub message: &'a str,
    pub description: &'a str,
}

pub struct NewLfsHistory<'a> {
    pub repository: i64,
    pub file: Option<i64>,
    pub path_in_repo: &'a str,
    pub sha256: &'a str,
    pub size: i64,
    pub commit_id: &'a str,
}

/// Store defines the metadata database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // User / organization operations
    fn create_user(&self, new: &NewUser) -> Result<User>;
    fn get_user_by_id(&self, id: i64) -> Result<Option<User>>;
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn get_organization(&self, name: &str) -> Result<Option<User>>;
    fn normalized_name_exists(&self, normalized: &str) -> Result<bool>;
    fn set_user_usage(&self, user_id: i64, private_used: i64, public_used: i64) -> Result<()>;
    fn add_user_usage(&self, user_id: i64, delta: i64, private: bool) -> Result<()>;

    // Membership operations
    fn get_membership(&self, user_id: i64, org_id: i64) -> Result<Option<UserOrganization>>;
    fn create_membership(&self, user_id: i64, org_id: i64, role: OrgRole) -> Result<()>;
    fn list_user_organizations(&self, user_id: i64) -> Result<Vec<User>>;

    // Repository operations
    fn create_repository(
        &self,
        repo_type: RepoType,
        namespace: &str,
        name: &str,
        private: bool,
        owner: i64,
    ) -> Result<Repository>;
    fn get_repository(
        &self,
        repo_type: RepoType,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Repository>>;
    fn list_repositories(
        &self,
        repo_type: Option<RepoType>,
        author: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Repository>>;
    fn list_namespace_repositories(&self, namespace: &str) -> Result<Vec<Repository>>;
    /// Rename a repository in place. The numeric id never changes.
    fn update_repository_identity(
        &self,
        id: i64,
        namespace: &str,
        name: &str,
        quota_bytes: Option<i64>,
    ) -> Result<()>;
    fn update_repository_used_bytes(&self, id: i64, used_bytes: i64) -> Result<()>;
    fn sum_namespace_used_bytes(&self, namespace: &str, private: bool) -> Result<i64>;
    fn delete_repository(&self, id: i64) -> Result<bool>;

    // File operations
    fn get_file(&self, repository: i64, path: &str) -> Result<Option<File>>;
    fn get_file_by_sha256(&self, sha256: &str) -> Result<Option<File>>;
    fn count_active_lfs_files(&self, sha256: &str, repository: Option<i64>) -> Result<i64>;
    fn upsert_file(&self, upsert: &FileUpsert) -> Result<File>;
    fn mark_file_deleted(&self, repository: i64, path: &str) -> Result<usize>;
    fn mark_folder_deleted(&self, repository: i64, prefix: &str) -> Result<usize>;
    fn delete_files_in(&self, repository: i64, paths: &[String]) -> Result<usize>;
    fn delete_files_not_in(&self, repository: i64, paths: &[String]) -> Result<usize>;
    fn list_active_files(&self, repository: i64) -> Result<Vec<File>>;
    fn list_files_by_paths(&self, repository: i64, paths: &[String]) -> Result<Vec<File>>;
    fn sum_active_file_bytes(&self, repository: i64) -> Result<i64>;

    // Commit operations
    fn create_commit_record(&self, new: &NewCommit) -> Result<Commit>;
    fn get_commit_record(&self, repository: i64, commit_id: &str) -> Result<Option<Commit>>;
    fn list_commit_records(
        &self,
        repository: i64,
        commit_ids: &[String],
    ) -> Result<Vec<Commit>>;

    // LFS history operations
    fn insert_lfs_history(&self, new: &NewLfsHistory) -> Result<LfsObjectHistory>;
    fn list_lfs_history_for_path(
        &self,
        repository: i64,
        path: &str,
    ) -> Result<Vec<LfsObjectHistory>>;
    fn list_lfs_history_for_commit(
        &self,
        repository: i64,
        commit_id: &str,
    ) -> Result<Vec<LfsObjectHistory>>;
    fn distinct_lfs_sha256(&self, repository: i64) -> Result<Vec<String>>;
    fn count_lfs_history(&self, sha256: &str, repository: Option<i64>) -> Result<i64>;
    fn delete_lfs_history_by_sha256(
        &self,
        sha256: &str,
        repository: Option<i64>,
    ) -> Result<usize>;

    // Staging upload operations
    fn create_staging_upload(
        &self,
        repository: i64,
        repo_type: RepoType,
        revision: &str,
        path_in_repo: &str,
        sha256: &str,
        size: i64,
        storage_key: &str,
        lfs: bool,
    ) -> Result<StagingUpload>;
    fn delete_staging_uploads(&self, repository: i64) -> Result<usize>;

    // Token operations
    fn create_token(&self, user_id: i64, token_hash: &str, name: &str) -> Result<Token>;
    fn get_token_by_hash(&self, token_hash: &str) -> Result<Option<Token>>;
    fn touch_token(&self, id: i64) -> Result<()>;
}
