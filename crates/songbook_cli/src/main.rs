//! Songbook CLI entry point.
//!
//! # Responsibility
//! - Parse create/read/update/delete commands and run them through
//!   `SongService` on the process-wide session factory.
//! - Start logging from the loaded config before any session is opened.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use songbook_core::{FactoryConfig, LogSettings, Song, SongService};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "songbook")]
#[command(version)]
#[command(about = "Create, read, update and delete songs in a songbook store")]
#[command(long_about = r#"
Every command runs as one unit of work against the store named in the
config file: open a session, begin, operate, commit, close.

Example usage:
  songbook create --name "Peaches" --artist "Justin"
  songbook update 3 --name "Fine Line"
  songbook --json read 3
"#)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, default_value = songbook_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log at debug level to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a new song
    Create {
        /// Song title
        #[arg(short, long)]
        name: String,

        /// Performing artist
        #[arg(short, long)]
        artist: String,
    },

    /// Print one song
    Read {
        /// Song id
        id: i64,
    },

    /// Change a song's title and optionally its artist
    Update {
        /// Song id
        id: i64,

        /// New title
        #[arg(short, long)]
        name: String,

        /// New artist
        #[arg(short, long)]
        artist: Option<String>,
    },

    /// Delete a song
    Delete {
        /// Song id
        id: i64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FactoryConfig::load(&cli.config)
        .with_context(|| format!("failed to load config `{}`", cli.config.display()))?;
    songbook_core::init_logging(&log_settings(&config, cli.verbose))
        .context("failed to start logging")?;
    debug!(
        "event=cli_start module=cli status=ok config={} backend={:?}",
        cli.config.display(),
        config.store.backend
    );

    let factory = songbook_core::global(&cli.config).context("failed to build session factory")?;
    let service = SongService::new(factory);

    match cli.command {
        Commands::Create { name, artist } => {
            let song = service.create_song(name, artist)?;
            print_song(&song, cli.json)?;
        }
        Commands::Read { id } => {
            let song = service.read_song(id)?;
            print_song(&song, cli.json)?;
        }
        Commands::Update { id, name, artist } => {
            let song = service.update_song(id, name, artist)?;
            print_song(&song, cli.json)?;
        }
        Commands::Delete { id } => {
            service.delete_song(id)?;
            if cli.json {
                println!("{}", serde_json::json!({ "deleted": id }));
            } else {
                println!("deleted song {id}");
            }
        }
    }

    Ok(())
}

fn log_settings(config: &FactoryConfig, verbose: bool) -> LogSettings {
    let mut settings = config
        .logging
        .as_ref()
        .map(LogSettings::from)
        .unwrap_or_else(|| LogSettings {
            level: "warn".to_string(),
            ..LogSettings::default()
        });
    if verbose {
        settings.level = "debug".to_string();
        settings.echo_stderr = settings.dir.is_some();
    }
    settings
}

fn print_song(song: &Song, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(song)?);
    } else {
        println!("{song}");
    }
    Ok(())
}
