//! # pictor
//!
//! CLI tool for inspecting and driving a Pictor data store.
//!
//! The cloud is the in-process mock, persisted next to the store so that
//! several data directories can share it through `--cloud`.
//!
//! ## Commands
//!
//! - `init`: Create the data directory, configuration and store
//! - `status`: Show account, sync markers and pending work
//! - `login` / `logout`: Account lifecycle
//! - `add-project`, `add-flight-plan`, `add-flight`: Local writes
//! - `delete`: Soft-delete a record and what it owns
//! - `list`: List records of one kind
//! - `sync`: Run one sync cycle
//! - `purge`: Remove synced tombstones past their grace period
//!
//! ## Example
//!
//! ```bash
//! pictor --data-dir ./a init
//! pictor --data-dir ./a login --name "Pilot"
//! pictor --data-dir ./a add-project "Facade survey"
//! pictor --data-dir ./a sync
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sync_types::EntityKind;

mod commands;
mod config;

use commands::{account, add, delete, init, list, status, sync};
use config::Workspace;

/// CLI tool for inspecting and driving a Pictor data store.
#[derive(Parser, Debug)]
#[command(name = "pictor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory holding the configuration, store and mock cloud
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mock cloud file, shareable between data directories
    /// (default: <data-dir>/cloud.json)
    #[arg(long, global = true)]
    cloud: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the configuration and the store
    Init {
        /// Device identifier (random when omitted)
        #[arg(long)]
        device_id: Option<String>,
    },

    /// Show account, sync markers and pending work
    Status,

    /// Log in, moving anonymous data to the account
    Login {
        /// Account display name
        #[arg(long, short)]
        name: String,

        /// Account email
        #[arg(long)]
        email: Option<String>,

        /// Account uuid, to log in to an existing account
        #[arg(long)]
        uuid: Option<String>,
    },

    /// Log out, returning account data to the anonymous user
    Logout,

    /// Enable or disable private mode
    Private {
        /// `on` or `off`
        #[arg(value_parser = ["on", "off"])]
        mode: String,
    },

    /// Create a project
    AddProject {
        /// Project title
        title: String,
    },

    /// Create a flight plan in a project
    AddFlightPlan {
        /// Owning project uuid
        #[arg(long)]
        project: String,

        /// Flight plan name
        name: String,
    },

    /// Record a flight
    AddFlight {
        /// Flight title
        title: String,

        /// Serial of the drone that flew
        #[arg(long, default_value = "PI040416AA0000")]
        serial: String,
    },

    /// Soft-delete a record and everything it owns
    Delete {
        /// Record uuid
        uuid: String,
    },

    /// List records of one kind
    List {
        /// Entity kind (user, session, drone, project, project_external,
        /// flight_plan, flight, execution_link, thumbnail)
        kind: String,

        /// Include tombstones
        #[arg(long)]
        deleted: bool,
    },

    /// Run one sync cycle against the mock cloud
    Sync {
        /// Force the full reconciliation pass
        #[arg(long)]
        full: bool,

        /// Simulate an unreachable cloud
        #[arg(long)]
        offline: bool,
    },

    /// Remove synced tombstones past their grace period
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;
    config::set_dir_permissions_0700(&data_dir).await?;

    let workspace = Workspace::new(data_dir, cli.config, cli.cloud);

    match cli.command {
        Commands::Init { device_id } => init::run(&workspace, device_id).await?,
        Commands::Status => status::run(&workspace).await?,
        Commands::Login { name, email, uuid } => {
            account::login(&workspace, &name, email, uuid.as_deref()).await?
        }
        Commands::Logout => account::logout(&workspace).await?,
        Commands::Private { mode } => account::private_mode(&workspace, mode == "on").await?,
        Commands::AddProject { title } => add::project(&workspace, &title).await?,
        Commands::AddFlightPlan { project, name } => {
            add::flight_plan(&workspace, &project, &name).await?
        }
        Commands::AddFlight { title, serial } => add::flight(&workspace, &title, &serial).await?,
        Commands::Delete { uuid } => delete::run(&workspace, &uuid).await?,
        Commands::List { kind, deleted } => {
            let kind: EntityKind = kind.parse()?;
            list::run(&workspace, kind, deleted).await?
        }
        Commands::Sync { full, offline } => sync::run(&workspace, full, offline).await?,
        Commands::Purge => sync::purge(&workspace).await?,
    }

    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

/// Get the default data directory for pictor.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "parrot", "pictor")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
