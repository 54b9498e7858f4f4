//! State database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/buildline/db";
/// The DB tree holding persisted per-pipeline state.
const TREE_PIPELINE_STATE: &str = "pipeline_state";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the buildline state database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for buildline state database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function.
    pub async fn spawn_blocking<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.context("error joining blocking database task")
    }

    /// Get a handle to the DB tree holding per-pipeline state.
    pub async fn get_state_tree(&self) -> Result<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(TREE_PIPELINE_STATE));
        Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| anyhow!("could not open DB tree {} {}", TREE_PIPELINE_STATE, err)))
    }
}
