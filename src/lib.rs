//! # KohakuHub
//!
//! A self-hostable, HuggingFace-compatible hub for models, datasets, and
//! spaces. Content lives in an S3-compatible blob store, versions in a
//! versioned object store; this crate is the commit pipeline, LFS protocol
//! engine, branch algebra, GC, and git read bridge that tie them together.
//!
//! Usable both as a standalone binary and as a library:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kohakuhub::config::Config;
//! use kohakuhub::lakefs::LakefsClient;
//! use kohakuhub::server::{AppState, create_router};
//! use kohakuhub::storage::BlobStore;
//! use kohakuhub::store::{SqliteStore, Store};
//!
//! # async fn run(config: Config) -> anyhow::Result<()> {
//! let store = SqliteStore::new(&config.app.database_path)?;
//! store.initialize()?;
//! let blobs = BlobStore::new(&config.s3).await;
//! let lakefs = LakefsClient::new(&config.lakefs);
//!
//! let state = Arc::new(AppState::new(
//!     Arc::new(store),
//!     Arc::new(blobs),
//!     Arc::new(lakefs),
//!     Arc::new(config),
//! ));
//! let router = create_router(state);
//! // Serve with axum...
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod gc;
pub mod gitbridge;
pub mod lakefs;
pub mod lfs;
pub mod quota;
pub mod rules;
pub mod server;
pub mod storage;
pub mod store;
pub mod types;
