mod s3;

pub use s3::{BlobStore, ObjectMeta, PresignedUpload};
