//! Session factory and its process-wide instance.
//!
//! # Responsibility
//! - Build the configured store, register entity mappings, and probe
//!   connectivity once.
//! - Hand out a new `Session` (with its own connection) per request.
//!
//! # Invariants
//! - The global factory is constructed at most once per process, even under
//!   concurrent first access.
//! - Re-initialization from a different config file is rejected.
//! - Construction failures are logged and returned, never hidden behind an
//!   empty handle.

use super::{Session, SessionError, SessionResult};
use crate::config::{Backend, ConfigError, FactoryConfig};
use crate::model::{EntityMapping, MAPPED_ENTITIES};
use crate::store::{Isolation, MemoryStore, SqliteStore, Store, StoreError};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

static GLOBAL_FACTORY: OnceCell<GlobalFactory> = OnceCell::new();

struct GlobalFactory {
    source: PathBuf,
    factory: SessionFactory,
}

/// Opens sessions against one configured store.
pub struct SessionFactory {
    store: Arc<dyn Store>,
    isolation: Isolation,
    mappings: Vec<&'static EntityMapping>,
}

impl SessionFactory {
    /// Builds a factory for every mapped entity from `config`.
    ///
    /// # Errors
    /// - `Configuration` when the config or a mapping is invalid.
    /// - `Connection` when the store cannot be reached.
    pub fn build(config: &FactoryConfig) -> SessionResult<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = match config.store.backend {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Sqlite => {
                let path = config.store.path.clone().ok_or_else(|| {
                    ConfigError::Invalid("store.path is required for the sqlite backend".into())
                })?;
                Arc::new(SqliteStore::new(path, config.store.busy_timeout()))
            }
        };
        Self::with_store(store, config.store.isolation, MAPPED_ENTITIES)
    }

    /// Builds a factory over an existing store.
    pub fn with_store(
        store: Arc<dyn Store>,
        isolation: Isolation,
        mappings: &[&'static EntityMapping],
    ) -> SessionResult<Self> {
        let started_at = Instant::now();
        let backend = store.backend();

        let result = Self::bootstrap(store.as_ref(), mappings);
        if let Err(err) = &result {
            error!(
                "event=factory_init module=session status=error backend={} duration_ms={} error={}",
                backend,
                started_at.elapsed().as_millis(),
                err
            );
        }
        result?;

        info!(
            "event=factory_init module=session status=ok backend={} mappings={} duration_ms={}",
            backend,
            mappings.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            store,
            isolation,
            mappings: mappings.to_vec(),
        })
    }

    fn bootstrap(store: &dyn Store, mappings: &[&'static EntityMapping]) -> SessionResult<()> {
        for &mapping in mappings {
            mapping.validate().map_err(ConfigError::from)?;
            store.register(mapping).map_err(|err| match err {
                StoreError::Connection(message) => SessionError::Connection(message),
                other => SessionError::Configuration(ConfigError::Invalid(format!(
                    "mapping for `{}` rejected by store: {other}",
                    mapping.table
                ))),
            })?;
        }
        // Connectivity probe; the connection is released immediately.
        drop(store.connect()?);
        Ok(())
    }

    /// Opens a new session bound to a fresh store connection.
    pub fn open_session(&self) -> SessionResult<Session> {
        let connection = self.store.connect().map_err(|err| {
            error!(
                "event=session_open module=session status=error backend={} error={}",
                self.store.backend(),
                err
            );
            SessionError::from(err)
        })?;
        Ok(Session::new(connection, self.isolation))
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn mappings(&self) -> &[&'static EntityMapping] {
        &self.mappings
    }
}

/// Returns the process-wide factory, building it from `config_path` on first
/// use.
///
/// # Errors
/// - `Configuration` when the file cannot be loaded, or when the factory was
///   already built from a different file.
/// - `Connection` when the store is unreachable.
pub fn global(config_path: impl AsRef<Path>) -> SessionResult<&'static SessionFactory> {
    let requested = config_path.as_ref().to_path_buf();
    let state = GLOBAL_FACTORY.get_or_try_init(|| -> SessionResult<GlobalFactory> {
        let config = FactoryConfig::load(&requested).map_err(|err| {
            error!(
                "event=factory_init module=session status=error source={} error={}",
                requested.display(),
                err
            );
            err
        })?;
        Ok(GlobalFactory {
            source: requested.clone(),
            factory: SessionFactory::build(&config)?,
        })
    })?;

    if state.source != requested {
        return Err(SessionError::Configuration(ConfigError::AlreadyInitialized {
            active: state.source.clone(),
            requested,
        }));
    }
    Ok(&state.factory)
}

/// Returns the process-wide factory if it has been built.
pub fn global_factory() -> Option<&'static SessionFactory> {
    GLOBAL_FACTORY.get().map(|state| &state.factory)
}
