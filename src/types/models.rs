use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RepoType;

/// Organization membership role, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrgRole {
    Visitor,
    Member,
    Admin,
    SuperAdmin,
}

impl OrgRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Member => "member",
            Self::Admin => "admin",
            Self::SuperAdmin => "super-admin",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "visitor" => Some(Self::Visitor),
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "super-admin" => Some(Self::SuperAdmin),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        self >= Self::Member
    }

    #[must_use]
    pub fn can_delete(self) -> bool {
        self >= Self::Admin
    }
}

/// A principal. One table holds both users and organizations; `is_org` rows
/// carry no email or password.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Lowercased username with `-`/`_` stripped. Unique across users and
    /// organizations for O(1) collision checks.
    #[serde(skip_serializing)]
    pub normalized_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub is_active: bool,
    pub is_org: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_quota_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_quota_bytes: Option<i64>,
    pub private_used_bytes: i64,
    pub public_used_bytes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOrganization {
    pub user: i64,
    pub organization: i64,
    pub role: OrgRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub repo_type: RepoType,
    pub namespace: String,
    pub name: String,
    /// "namespace/name"
    pub full_id: String,
    pub private: bool,
    pub owner: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<i64>,
    pub used_bytes: i64,
    /// Per-repo LFS rule overrides; `None` falls back to the global config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lfs_threshold_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lfs_suffix_patterns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lfs_keep_versions: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A tracked file at a path. Never hard-deleted while LFS history points at
/// it; `is_deleted` marks tombstones.
///
/// `sha256` holds the git blob SHA-1 for regular files and the content
/// SHA-256 for LFS files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub repository: i64,
    pub path_in_repo: String,
    pub size: i64,
    pub sha256: String,
    pub lfs: bool,
    pub is_deleted: bool,
    pub owner: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: i64,
    /// Versioned-store commit id.
    pub commit_id: String,
    pub repository: i64,
    pub repo_type: RepoType,
    pub branch: String,
    pub author: i64,
    pub username: String,
    pub message: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// One row per observed usage of an LFS oid in a commit. Source of truth for
/// garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LfsObjectHistory {
    pub id: i64,
    pub repository: i64,
    pub file: Option<i64>,
    pub path_in_repo: String,
    pub sha256: String,
    pub size: i64,
    pub commit_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingUpload {
    pub id: i64,
    pub repository: i64,
    pub repo_type: RepoType,
    pub revision: String,
    pub path_in_repo: String,
    pub sha256: String,
    pub size: i64,
    pub upload_id: Option<String>,
    pub storage_key: String,
    pub lfs: bool,
    pub created_at: DateTime<Utc>,
}

/// API token record. The core only reads these; issuing them belongs to the
/// auth collaborator (here: the admin CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user: i64,
    #[serde(skip)]
    pub token_hash: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}
