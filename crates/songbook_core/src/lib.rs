//! Core persistence layer for the songbook.
//!
//! Sessions track loaded and staged records, detect field changes by
//! snapshot comparison, and flush them to a pluggable store at commit.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod service;
pub mod session;
pub mod store;

pub use config::{Backend, ConfigError, FactoryConfig, LoggingConfig, StoreConfig};
pub use logging::{default_log_level, init_logging, logging_status, LogSettings, LoggingError};
pub use model::song::Song;
pub use model::{Entity, EntityMapping, FieldValue, Fields, MappingError, Record, ValidationError};
pub use service::song_service::SongService;
pub use session::{
    global, global_factory, Attached, Session, SessionError, SessionFactory, SessionResult,
    StateError, Transaction, TransactionStatus,
};
pub use store::{Isolation, MemoryStore, SqliteStore, Store, StoreConnection, StoreError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
