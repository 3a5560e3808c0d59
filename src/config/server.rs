use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    28080
}

fn default_base_url() -> String {
    "http://localhost:28080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./hub.db")
}

fn default_lfs_threshold() -> i64 {
    10 * 1024 * 1024
}

fn default_multipart_threshold() -> i64 {
    5 * 1024 * 1024 * 1024
}

fn default_multipart_chunk_size() -> i64 {
    100 * 1024 * 1024
}

fn default_lfs_keep_versions() -> u32 {
    5
}

fn default_lfs_auto_gc() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_repo_namespace() -> String {
    "hf".to_string()
}

/// Server-wide settings: bind address, public URL, metadata database, LFS policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL this service is reachable at. Used for LFS action hrefs
    /// and commit URLs.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Files strictly larger than this must go through LFS.
    #[serde(default = "default_lfs_threshold")]
    pub lfs_threshold_bytes: i64,
    /// Suffix globs (e.g. "*.safetensors") that force LFS regardless of size.
    #[serde(default)]
    pub lfs_suffix_patterns: Vec<String>,
    #[serde(default = "default_lfs_keep_versions")]
    pub lfs_keep_versions: u32,
    #[serde(default = "default_lfs_auto_gc")]
    pub lfs_auto_gc: bool,
    /// Raw admin token. Presented tokens are compared as SHA3-512 digests.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    /// Endpoint substituted into presigned URLs handed to clients.
    /// Defaults to `endpoint` when unset.
    #[serde(default)]
    pub public_endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: i64,
    #[serde(default = "default_multipart_chunk_size")]
    pub multipart_chunk_size_bytes: i64,
}

impl S3Config {
    #[must_use]
    pub fn public_endpoint(&self) -> &str {
        self.public_endpoint.as_deref().unwrap_or(&self.endpoint)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LakefsConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Prefix for versioned-store repository names.
    #[serde(default = "default_repo_namespace")]
    pub repo_namespace: String,
}

/// Default storage quotas applied to newly created namespaces. `None` means
/// unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub default_user_private_quota_bytes: Option<i64>,
    #[serde(default)]
    pub default_user_public_quota_bytes: Option<i64>,
    #[serde(default)]
    pub default_org_private_quota_bytes: Option<i64>,
    #[serde(default)]
    pub default_org_public_quota_bytes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub s3: S3Config,
    pub lakefs: LakefsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// CLI overrides that can be applied on top of a config file.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Default config file search paths.
    const SEARCH_PATHS: &'static [&'static str] =
        &["./kohakuhub.toml", "/etc/kohakuhub/kohakuhub.toml"];

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.app.host, self.app.port).parse()
    }

    /// Load config from a specific file path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search `KOHAKUHUB_CONFIG`, then the default locations.
    pub fn load_from_search_paths() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("KOHAKUHUB_CONFIG") {
            return Self::load(Path::new(&path));
        }
        for path_str in Self::SEARCH_PATHS {
            let path = Path::new(path_str);
            if path.exists() {
                return Self::load(path);
            }
        }
        anyhow::bail!(
            "No config file found. Create ./kohakuhub.toml or set KOHAKUHUB_CONFIG."
        )
    }

    /// Load config with CLI overrides.
    ///
    /// Priority: CLI args > config file
    pub fn load_with_overrides(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load(path)?
        } else {
            Self::load_from_search_paths()?
        };

        if let Some(host) = overrides.host {
            config.app.host = host;
        }
        if let Some(port) = overrides.port {
            config.app.port = port;
        }
        if let Some(base_url) = overrides.base_url {
            config.app.base_url = base_url;
        }
        if let Some(database_path) = overrides.database_path {
            config.app.database_path = database_path;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [app]
        base_url = "https://hub.example.org"

        [s3]
        endpoint = "http://minio:9000"
        access_key = "minioadmin"
        secret_key = "minioadmin"
        bucket = "hub"

        [lakefs]
        endpoint = "http://lakefs:8000"
        access_key = "AKIA"
        secret_key = "secret"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.app.lfs_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.app.lfs_keep_versions, 5);
        assert!(config.app.lfs_auto_gc);
        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.s3.public_endpoint(), "http://minio:9000");
        assert_eq!(config.lakefs.repo_namespace, "hf");
        assert!(config.quota.default_user_private_quota_bytes.is_none());
    }

    #[test]
    fn public_endpoint_override() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.s3.public_endpoint = Some("https://s3.example.org".to_string());
        assert_eq!(config.s3.public_endpoint(), "https://s3.example.org");
    }
}
