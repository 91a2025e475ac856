//! Engine and class configuration.
//!
//! The engine keeps one process-wide [`Config`] (storage directory,
//! integrity-failure behaviour, log level, adapter factory) and a global
//! class registry consulted by every proxy. See [`ClassConfig`] for the
//! per-class options.

mod class_config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use class_config::{
    clear_class_registry, configure_class, ClassConfig, DynamicFn, InitFn, LookupFn, MethodPredicate,
    MethodRef, ResolvedConfig, SpecializedDispatch,
};

use crate::error::Result;
use crate::persistence::{FileAdapter, PersistenceAdapter};

/// Global engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the file-based persistence adapter.
    pub storage_directory: PathBuf,
    /// Maximum level emitted by [`init_logging`]: `trace`, `debug`, `info`,
    /// `warn`, or `error`.
    pub log_level: String,
    /// When true, reads served from the read or write set verify integrity
    /// immediately instead of deferring to commit time.
    pub instant_read_integrity_fail: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("./objtx-data"),
            log_level: "info".to_string(),
            instant_read_integrity_fail: false,
        }
    }
}

impl Config {
    pub fn storage_directory(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.storage_directory = path.as_ref().to_path_buf();
        self
    }

    pub fn log_level(&mut self, level: &str) -> &mut Self {
        self.log_level = level.to_string();
        self
    }

    pub fn instant_read_integrity_fail(&mut self, enabled: bool) -> &mut Self {
        self.instant_read_integrity_fail = enabled;
        self
    }
}

/// Builds a persistence adapter from the current configuration.
pub type AdapterFactory = Arc<dyn Fn(&Config) -> Result<Arc<dyn PersistenceAdapter>> + Send + Sync>;

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

static ADAPTER_FACTORY: Lazy<RwLock<AdapterFactory>> = Lazy::new(|| {
    RwLock::new(Arc::new(|config: &Config| {
        let adapter = FileAdapter::new(config.storage_directory.clone())?;
        Ok(Arc::new(adapter) as Arc<dyn PersistenceAdapter>)
    }))
});

static ADAPTER: Lazy<RwLock<Option<Arc<dyn PersistenceAdapter>>>> =
    Lazy::new(|| RwLock::new(None));

/// Updates the global configuration. Invalidates the cached adapter so the
/// next transaction uses the new settings.
pub fn configure(f: impl FnOnce(&mut Config)) {
    {
        let mut config = CONFIG.write();
        f(&mut config);
    }
    *ADAPTER.write() = None;
}

/// A snapshot of the current global configuration.
pub fn current() -> Config {
    CONFIG.read().clone()
}

/// Replaces the adapter factory (`persistence_adapter` option). The default
/// factory builds a [`FileAdapter`] rooted at `storage_directory`.
pub fn set_adapter_factory(factory: AdapterFactory) {
    *ADAPTER_FACTORY.write() = factory;
    *ADAPTER.write() = None;
}

/// The process-wide persistence adapter, built lazily from the factory and
/// shared so in-process lock re-entrance works across transactions.
pub fn adapter() -> Result<Arc<dyn PersistenceAdapter>> {
    if let Some(adapter) = ADAPTER.read().as_ref() {
        return Ok(adapter.clone());
    }

    let mut slot = ADAPTER.write();
    if let Some(adapter) = slot.as_ref() {
        return Ok(adapter.clone());
    }

    let factory = ADAPTER_FACTORY.read().clone();
    let config = CONFIG.read().clone();
    let adapter = factory(&config)?;
    *slot = Some(adapter.clone());
    Ok(adapter)
}

/// Installs a `tracing` subscriber honouring the configured `log_level`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let level = match current().log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init();
}
