//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::store::{MemorySyncStore, SqliteSyncStore, SyncStore};
use crate::sync::{PullCursor, PushProcessor, StatusReporter};

/// `DATABASE_URL` value selecting the non-persistent store
pub const MEMORY_STORE_URL: &str = "memory";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn SyncStore>,
    push: PushProcessor,
    pull: PullCursor,
    status: StatusReporter,
}

impl AppState {
    /// Create the application state around an existing store
    pub fn new(config: &Config, store: Arc<dyn SyncStore>) -> Self {
        let push = PushProcessor::new(store.clone(), &config.sync);
        let pull = PullCursor::new(store.clone(), &config.sync);
        let status = StatusReporter::new(store.clone());

        Self {
            inner: Arc::new(AppStateInner {
                store,
                push,
                pull,
                status,
            }),
        }
    }

    /// Open the store named by the configuration and build the state on it
    pub async fn connect(config: &Config) -> Result<Self> {
        let store: Arc<dyn SyncStore> = if config.database.url == MEMORY_STORE_URL {
            tracing::warn!("Using in-memory sync store; data is lost on shutdown");
            Arc::new(MemorySyncStore::new())
        } else {
            let pool = db::create_pool(&config.database.url).await?;
            tracing::info!("Database initialized at {}", config.database.url);
            Arc::new(SqliteSyncStore::new(pool))
        };

        Ok(Self::new(config, store))
    }

    /// Get the sync store
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.inner.store
    }

    pub fn push(&self) -> &PushProcessor {
        &self.inner.push
    }

    pub fn pull(&self) -> &PullCursor {
        &self.inner.pull
    }

    pub fn status(&self) -> &StatusReporter {
        &self.inner.status
    }
}
