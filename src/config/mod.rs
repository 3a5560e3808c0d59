mod server;

pub use server::{
    AppConfig, Config, ConfigOverrides, LakefsConfig, QuotaConfig, S3Config,
};
