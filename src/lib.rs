pub mod accounting;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod providers;

use crate::accounting::UsageAccountant;
use crate::auth::CredentialValidator;
use crate::config::Config;
use crate::db::Database;
use crate::gateway::{Gateway, RetryPolicy};
use crate::providers::{ModelRegistry, UpstreamTransport};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub config_path: PathBuf,
    pub db: Database,
    pub validator: Arc<CredentialValidator>,
    pub registry: Arc<ModelRegistry>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    /// Wire the request path together. The accountant's receiver is owned by
    /// whoever drains usage records.
    pub fn new(
        config: Config,
        config_path: PathBuf,
        db: Database,
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn UpstreamTransport>,
        accountant: UsageAccountant,
    ) -> Self {
        let validator = Arc::new(CredentialValidator::new(
            Arc::new(db.clone()),
            Duration::from_secs(config.auth.identity_cache_ttl_secs),
        ));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&registry),
            transport,
            accountant,
            RetryPolicy::from_config(&config.upstream),
        ));
        Self {
            config: Arc::new(config),
            config_path,
            db,
            validator,
            registry,
            gateway,
        }
    }
}
