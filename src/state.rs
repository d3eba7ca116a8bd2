//! Shared application state handed to every HTTP handler.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::{TaskRegistry, TimelineStore};
use crate::validation::{FileComparator, Validator};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<TaskRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub validator: Arc<dyn Validator>,
}

impl AppState {
    /// Build the registry (mirrored to `logs_dir` when set), dispatcher and
    /// validator from `config`.
    pub fn new(config: ServerConfig) -> Self {
        let store = config.logs_dir.clone().map(TimelineStore::new);
        let registry = Arc::new(TaskRegistry::new(store));
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: ServerConfig, registry: Arc<TaskRegistry>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            config.dispatcher_config(),
        ));
        Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            validator: Arc::new(FileComparator::default()),
        }
    }
}
