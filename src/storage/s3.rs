use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::S3Config;
use crate::error::{Error, Result};

/// Metadata returned by a HEAD probe.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: i64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A presigned PUT plus the headers the client is required to send.
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub expires_at: String,
}

/// Blob store adapter. All bytes flow client <-> store through presigned
/// URLs; the application only probes and presigns.
pub struct BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    endpoint: String,
    public_endpoint: String,
}

fn expires_at(expires_in: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or_default())
        .format("%Y-%m-%dT%H:%M:%S%.fZ")
        .to_string()
}

fn presigning_config(expires_in: Duration) -> Result<PresigningConfig> {
    PresigningConfig::expires_in(expires_in)
        .map_err(|e| Error::BlobStore(format!("invalid presign expiry: {e}")))
}

impl BlobStore {
    pub async fn new(cfg: &S3Config) -> Self {
        let loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.region.clone()));
        let shared = loader.load().await;

        let credentials = aws_sdk_s3::config::Credentials::new(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            None,
            None,
            "static",
        );
        let conf = aws_sdk_s3::config::Builder::from(&shared)
            .endpoint_url(cfg.endpoint.clone())
            .force_path_style(cfg.force_path_style)
            .credentials_provider(credentials)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
            endpoint: cfg.endpoint.clone(),
            public_endpoint: cfg.public_endpoint().to_string(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Presigned URLs are signed against the internal endpoint; hand clients
    /// the public one.
    fn publicize(&self, url: &str) -> String {
        url.replacen(&self.endpoint, &self.public_endpoint, 1)
    }

    /// Create the bucket if it does not exist yet. Called once at startup.
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }
        info!("Bucket '{}' not found, creating it", self.bucket);
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::BlobStore(format!("failed to create bucket: {e}")))?;
        Ok(())
    }

    /// Presigned PUT. When `checksum_sha256` (base64) is given, the store
    /// verifies content integrity and the client must send the matching
    /// `x-amz-checksum-sha256` header.
    pub async fn presign_put(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: Option<&str>,
        checksum_sha256: Option<&str>,
    ) -> Result<PresignedUpload> {
        let mut req = self.client.put_object().bucket(&self.bucket).key(key);
        if let Some(ct) = content_type {
            req = req.content_type(ct);
        }
        if let Some(checksum) = checksum_sha256 {
            req = req.checksum_sha256(checksum);
        }

        let presigned = req
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| Error::BlobStore(format!("presign put failed: {e}")))?;

        let mut headers = HashMap::new();
        if let Some(ct) = content_type {
            headers.insert("Content-Type".to_string(), ct.to_string());
        }
        if let Some(checksum) = checksum_sha256 {
            headers.insert("x-amz-checksum-sha256".to_string(), checksum.to_string());
        }

        Ok(PresignedUpload {
            url: self.publicize(presigned.uri()),
            headers,
            expires_at: expires_at(expires_in),
        })
    }

    pub async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
        download_filename: Option<&str>,
    ) -> Result<String> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(filename) = download_filename {
            req = req.response_content_disposition(format!(
                "attachment; filename=\"{filename}\";"
            ));
        }
        let presigned = req
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| Error::BlobStore(format!("presign get failed: {e}")))?;
        Ok(self.publicize(presigned.uri()))
    }

    pub async fn create_multipart(&self, key: &str) -> Result<String> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::BlobStore(format!("create multipart failed: {e}")))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::BlobStore("no upload id returned".to_string()))
    }

    pub async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires_in: Duration,
    ) -> Result<String> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| Error::BlobStore(format!("presign part failed: {e}")))?;
        Ok(self.publicize(presigned.uri()))
    }

    /// Complete a multipart upload, then HEAD the result to report the
    /// assembled size and etag.
    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<ObjectMeta> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::BlobStore(format!("complete multipart failed: {e}")))?;

        self.head(key).await
    }

    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Error::BlobStore(format!("abort multipart failed: {e}")))?;
        Ok(())
    }

    pub async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_not_found()) {
                    Error::NotFound
                } else {
                    Error::BlobStore(format!("head failed: {e}"))
                }
            })?;

        Ok(ObjectMeta {
            size: out.content_length().unwrap_or(0),
            etag: out
                .e_tag()
                .map(|t| t.trim_matches('"').to_string())
                .unwrap_or_default(),
            last_modified: out
                .last_modified()
                .and_then(|lm| DateTime::from_timestamp(lm.secs(), 0)),
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete everything under `prefix`. Paginated listing, batch deletes of
    /// up to 1000 keys; partial failures are logged and skipped.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(1000);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let listing = req
                .send()
                .await
                .map_err(|e| Error::BlobStore(format!("list failed: {e}")))?;

            let keys: Vec<String> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key().map(str::to_string))
                .collect();

            if !keys.is_empty() {
                let identifiers: Vec<ObjectIdentifier> = keys
                    .iter()
                    .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                    .collect();
                let batch_len = identifiers.len();

                match self
                    .client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(
                        Delete::builder()
                            .set_objects(Some(identifiers))
                            .build()
                            .map_err(|e| Error::BlobStore(format!("delete batch: {e}")))?,
                    )
                    .send()
                    .await
                {
                    Ok(out) => {
                        let failed = out.errors().len();
                        if failed > 0 {
                            warn!(
                                "Batch delete under '{prefix}': {failed} object(s) failed"
                            );
                        }
                        deleted += batch_len - failed;
                    }
                    Err(e) => {
                        warn!("Batch delete under '{prefix}' failed: {e}");
                    }
                }
            }

            if listing.is_truncated().unwrap_or(false) {
                continuation = listing.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        debug!("Deleted {deleted} object(s) under prefix '{prefix}'");
        Ok(deleted)
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::BlobStore(format!("delete failed: {e}")))?;
        Ok(())
    }
}
