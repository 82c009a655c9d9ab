//! CLI command handling.
//!
//! Provides subcommands for:
//! - Showing the start order of a run plan (`order`)
//! - Computing the next free container name (`name`)
//! - Starting a run plan and tearing it down again (`up`)
//! - Pulling and pushing images (`pull`, `push`)
//! - Printing or following container logs (`logs`)

mod container;
mod image;
mod plan;

pub use container::{run_logs_command, run_name_command};
pub use image::{RegistryArgs, run_pull_command, run_push_command};
pub use plan::{run_order_command, run_up_command};

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ColorChoice, Parser, Subcommand};

use crate::config::Config;
use crate::engine::EngineClient;

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(about = "Start, wait for and tear down Docker containers over the Engine API")]
#[command(
    long_about = "dockhand drives a Docker engine over HTTP(S). Use 'dockhand <subcommand> --help' for details.\nExamples:\n  dockhand up plan.toml  # Start the containers of a plan\n  dockhand pull redis:7  # Pull an image"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the start order of a run plan
    #[command(
        about = "Show start order",
        long_about = "Orders the containers of a plan so that dependencies start first.\nExample: dockhand order plan.toml"
    )]
    Order {
        /// Run plan (TOML)
        plan: PathBuf,

        /// Names of containers that already exist
        #[arg(long = "existing")]
        existing: Vec<String>,
    },

    /// Print the next free container name
    #[command(
        about = "Compute a container name",
        long_about = "Applies a naming pattern (%n image, %a alias, %t timestamp, %i index, %e engine).\nExample: dockhand name --image redis:7 --pattern %n-%i"
    )]
    Name {
        #[arg(long)]
        image: String,

        /// Naming pattern, defaults to DOCKHAND_NAME_PATTERN or %n-%i
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        alias: Option<String>,

        /// Do not ask the engine for existing names
        #[arg(long)]
        offline: bool,
    },

    /// Start all containers of a run plan
    #[command(
        about = "Start a run plan",
        long_about = "Creates and starts the containers of a plan in dependency order and waits until they are ready.\nExamples:\n  dockhand up plan.toml  # Stop everything on Ctrl-C\n  dockhand up plan.toml --keep  # Leave containers running"
    )]
    Up {
        /// Run plan (TOML)
        plan: PathBuf,

        /// Leave the containers running and exit once they are ready
        #[arg(long)]
        keep: bool,
    },

    /// Pull an image
    Pull {
        image: String,

        #[command(flatten)]
        registry: RegistryArgs,
    },

    /// Push an image
    Push {
        image: String,

        #[command(flatten)]
        registry: RegistryArgs,
    },

    /// Print the logs of a container
    Logs {
        /// Container name or id
        container: String,

        /// Keep printing new output until Ctrl-C
        #[arg(short, long)]
        follow: bool,
    },
}

/// Run a CLI command.
pub async fn run_command(cmd: Command, config: Config) -> anyhow::Result<()> {
    match cmd {
        Command::Order { plan, existing } => run_order_command(&plan, existing),
        Command::Name {
            image,
            pattern,
            alias,
            offline,
        } => run_name_command(&config, &image, pattern, alias, offline).await,
        Command::Up { plan, keep } => run_up_command(&config, &plan, keep).await,
        Command::Pull { image, registry } => run_pull_command(&config, &image, &registry).await,
        Command::Push { image, registry } => run_push_command(&config, &image, &registry).await,
        Command::Logs { container, follow } => {
            run_logs_command(&config, &container, follow).await
        }
    }
}

/// Connect to the configured engine.
pub(crate) async fn connect(config: &Config) -> anyhow::Result<Arc<EngineClient>> {
    let endpoint = config.engine.endpoint()?;
    let client = EngineClient::connect(endpoint, config.engine.client_options()).await?;
    tracing::debug!(
        "Connected to {} (API {})",
        client.endpoint().base_url(),
        client.api_version()
    );
    Ok(Arc::new(client))
}
