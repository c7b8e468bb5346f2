//! Shared handlers keyed by database name.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    config::{parse_db_name, StoreConfig},
    error::StoreResult,
    handler::Handler,
};

/// Caches one [`Handler`] per database so repeated requests share its pool.
#[derive(Clone, Debug)]
pub struct StoreRegistry {
    config: Arc<StoreConfig>,
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl StoreRegistry {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the cached handler for `db_name`, opening it on first use.
    pub async fn handler(&self, db_name: &str) -> StoreResult<Handler> {
        let key = parse_db_name(db_name);
        let cached = self.handlers.read().get(&key).cloned();
        if let Some(handler) = cached {
            return Ok(handler);
        }

        // Opened outside the lock; a concurrent opener for the same name loses
        // the race and its pool is dropped.
        let opened = Handler::open(&self.config, db_name).await?;
        let handler = self.handlers.write().entry(key).or_insert(opened).clone();
        debug!(db = %handler.name(), "handler registered");
        Ok(handler)
    }

    pub fn cached(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes and forgets every cached handler.
    pub async fn close_all(&self) {
        let drained: Vec<Handler> = self.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in drained {
            handler.close().await;
        }
    }
}
