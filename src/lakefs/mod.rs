mod client;
mod types;

pub use client::{LakefsClient, LakefsError};
pub use types::{
    BranchInfo, CommitLog, CommitRecord, DiffEntry, DiffList, MergeOptions, MergeResult,
    ObjectListing, ObjectStat, Pagination, RevertOptions, StagingLocation, StagingMetadata,
};
