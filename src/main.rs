use anyhow::{Context, Result};
use beacon::config::BeaconConfig;
use beacon::experiments::BucketingHash;
use beacon::logging::{self, LogConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "beacon")]
#[command(
    version,
    about = "Client-side analytics: identity, event batching and experiment bucketing"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Track one event and flush it to the backend
    Track {
        /// Event name
        event: String,

        /// Event property as key=value (value parsed as JSON when possible)
        #[arg(short, long = "prop", value_name = "KEY=VALUE")]
        properties: Vec<String>,

        /// Authenticated user id to send instead of the anonymous id
        #[arg(long)]
        user: Option<String>,
    },
    /// Print the variant a subject is bucketed into
    Assign {
        subject: String,
        experiment: String,
        variants: Vec<String>,

        /// Hash function: rolling, fnv1a (defaults to beacon.toml)
        #[arg(long)]
        hash: Option<BucketingHash>,
    },
    /// Print the anonymous id for this device
    Id,
    /// Run the local collector until Ctrl-C
    Serve {
        #[arg(short, long, default_value = "3030")]
        port: u16,

        /// Append received events to this file as JSON lines
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// View, validate or create beacon.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default beacon.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = BeaconConfig::with_cli_args(project_dir.clone(), cli.verbose);
    let log_config = config
        .as_ref()
        .map(LogConfig::from_config)
        .unwrap_or_default();
    logging::init(&log_config);

    match &cli.command {
        Commands::Track {
            event,
            properties,
            user,
        } => {
            cmd::cmd_track(&config?, event, properties, user.as_deref()).await?;
        }
        Commands::Assign {
            subject,
            experiment,
            variants,
            hash,
        } => {
            cmd::cmd_assign(&config?, subject, experiment, variants, *hash)?;
        }
        Commands::Id => cmd::cmd_id(&config?)?,
        Commands::Serve { port, log_file } => {
            cmd::cmd_serve(*port, log_file.as_deref()).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
