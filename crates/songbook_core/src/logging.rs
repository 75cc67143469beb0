//! Process logging bootstrap.
//!
//! # Responsibility
//! - Start the `log` backend exactly once per process: rolling files when a
//!   directory is configured, stderr otherwise.
//! - Capture panics as sanitized, single-line log events.
//!
//! # Invariants
//! - Repeating initialization with identical settings is a no-op.
//! - Initialization with different settings after the first is rejected.
//! - Initialization never panics.

use crate::config::LoggingConfig;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::path::PathBuf;

const LOG_FILE_BASENAME: &str = "songbook";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

struct LoggingState {
    settings: NormalizedSettings,
    _logger: LoggerHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NormalizedSettings {
    level: &'static str,
    dir: Option<PathBuf>,
    echo_stderr: bool,
}

/// Requested logging setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// One of `trace|debug|info|warn|error`, case-insensitive.
    pub level: String,
    /// Absolute directory for rolling log files; `None` logs to stderr.
    pub dir: Option<PathBuf>,
    /// Also copy file log lines to stderr.
    pub echo_stderr: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            dir: None,
            echo_stderr: false,
        }
    }
}

impl From<&LoggingConfig> for LogSettings {
    fn from(value: &LoggingConfig) -> Self {
        Self {
            level: value.level.clone(),
            dir: value.dir.clone(),
            echo_stderr: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("unsupported log level `{0}`; expected trace|debug|info|warn|error")]
    UnsupportedLevel(String),
    #[error("log dir must be an absolute path, got `{}`", .0.display())]
    RelativeDir(PathBuf),
    #[error("failed to create log directory `{}`: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start logger: {0}")]
    Backend(#[from] flexi_logger::FlexiLoggerError),
    #[error("logging already initialized with {active}; refusing to switch to {requested}")]
    Conflict { active: String, requested: String },
}

/// Initializes process logging.
///
/// # Errors
/// - `UnsupportedLevel` / `RelativeDir` for malformed settings.
/// - `CreateDir` / `Backend` when the backend cannot start.
/// - `Conflict` when logging is already running with other settings.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    let requested = normalize(settings)?;

    let state = LOGGING_STATE.get_or_try_init(|| -> Result<LoggingState, LoggingError> {
        let logger = start_backend(&requested)?;
        install_panic_hook_once();

        info!(
            "event=app_start module=core status=ok platform={} build_mode={} version={}",
            std::env::consts::OS,
            build_mode(),
            env!("CARGO_PKG_VERSION")
        );
        info!(
            "event=logging_init module=core status=ok level={} log_dir={}",
            requested.level,
            describe_dir(&requested.dir)
        );

        Ok(LoggingState {
            settings: requested.clone(),
            _logger: logger,
        })
    })?;

    if state.settings != requested {
        return Err(LoggingError::Conflict {
            active: describe(&state.settings),
            requested: describe(&requested),
        });
    }
    Ok(())
}

/// Returns `(level, log_dir)` of the active logger, or `None` before init.
pub fn logging_status() -> Option<(&'static str, Option<PathBuf>)> {
    LOGGING_STATE
        .get()
        .map(|state| (state.settings.level, state.settings.dir.clone()))
}

/// `debug` in debug builds, `info` in release builds.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn start_backend(settings: &NormalizedSettings) -> Result<LoggerHandle, LoggingError> {
    let logger = Logger::try_with_str(settings.level)?;

    let Some(dir) = settings.dir.as_deref() else {
        return Ok(logger.log_to_stderr().start()?);
    };

    std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let duplicate = if settings.echo_stderr {
        Duplicate::All
    } else {
        Duplicate::None
    };

    let handle = logger
        .log_to_file(
            FileSpec::default()
                .directory(dir)
                .basename(LOG_FILE_BASENAME),
        )
        .duplicate_to_stderr(duplicate)
        .rotate(
            Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(MAX_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        // Format: [YYYY-MM-DD HH:MM:SS.ffffff TZ] LEVEL [module] file:line: message
        .format_for_files(flexi_logger::detailed_format)
        .start()?;
    Ok(handle)
}

fn normalize(settings: &LogSettings) -> Result<NormalizedSettings, LoggingError> {
    let level = normalize_level(&settings.level)?;
    let dir = match settings.dir.as_deref() {
        Some(dir) if !dir.is_absolute() => return Err(LoggingError::RelativeDir(dir.to_path_buf())),
        Some(dir) => Some(dir.to_path_buf()),
        None => None,
    };
    Ok(NormalizedSettings {
        level,
        dir,
        echo_stderr: settings.echo_stderr,
    })
}

fn normalize_level(level: &str) -> Result<&'static str, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(LoggingError::UnsupportedLevel(other.to_string())),
    }
}

fn describe(settings: &NormalizedSettings) -> String {
    format!(
        "level `{}` at {}",
        settings.level,
        describe_dir(&settings.dir)
    )
}

fn describe_dir(dir: &Option<PathBuf>) -> String {
    dir.as_ref()
        .map_or_else(|| "stderr".to_string(), |dir| format!("`{}`", dir.display()))
}

fn build_mode() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

fn install_panic_hook_once() {
    if PANIC_HOOK_INSTALLED.set(()).is_err() {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Payload may hold record contents; keep it single-line and bounded.
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_summary(panic_info);
        error!(
            "event=panic_captured module=core status=error location={} payload={}",
            location, payload
        );
        previous_hook(panic_info);
    }));
}

fn panic_payload_summary(info: &std::panic::PanicHookInfo<'_>) -> String {
    let payload = if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };

    sanitize_message(&payload, MAX_PANIC_PAYLOAD_CHARS)
}

fn sanitize_message(value: &str, max_chars: usize) -> String {
    let normalized = value.replace(['\n', '\r'], " ");
    let mut truncated = normalized.chars().take(max_chars).collect::<String>();
    if normalized.chars().count() > max_chars {
        truncated.push_str("...");
    }
    truncated
}
