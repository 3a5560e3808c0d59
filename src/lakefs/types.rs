use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_offset: String,
}

/// Object metadata as reported by the versioned store.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStat {
    pub path: String,
    /// "object" or "common_prefix"
    pub path_type: String,
    #[serde(default)]
    pub physical_address: String,
    /// "sha256:<hex>" for linked content, store-native otherwise.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub mtime: i64,
}

impl ObjectStat {
    /// Checksum with any "algo:" prefix stripped.
    #[must_use]
    pub fn checksum_hex(&self) -> &str {
        match self.checksum.split_once(':') {
            Some((_, hex)) => hex,
            None => &self.checksum,
        }
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        self.path_type == "object"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectListing {
    #[serde(default)]
    pub results: Vec<ObjectStat>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchInfo {
    pub id: String,
    pub commit_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub committer: String,
    #[serde(default)]
    pub message: String,
    /// Unix epoch seconds.
    #[serde(default)]
    pub creation_date: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitLog {
    #[serde(default)]
    pub results: Vec<CommitRecord>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffEntry {
    /// "added", "removed", "changed"
    #[serde(rename = "type")]
    pub diff_type: String,
    pub path: String,
    #[serde(default)]
    pub path_type: String,
    #[serde(default)]
    pub size_bytes: Option<i64>,
}

impl DiffEntry {
    #[must_use]
    pub fn is_object(&self) -> bool {
        self.path_type == "object"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiffList {
    #[serde(default)]
    pub results: Vec<DiffEntry>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeResult {
    pub reference: String,
}

/// Staging payload for linking an existing physical address to a path.
#[derive(Debug, Clone, Serialize)]
pub struct StagingMetadata {
    pub staging: StagingLocation,
    pub checksum: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingLocation {
    pub physical_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct RevertOptions {
    pub parent_number: u32,
    pub allow_empty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub message: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    /// "source-wins" | "dest-wins"
    pub strategy: Option<String>,
    pub force: bool,
    pub allow_empty: bool,
    pub squash_merge: bool,
}
