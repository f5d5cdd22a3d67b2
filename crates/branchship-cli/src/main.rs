//! Branchship CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod notifier;

#[derive(Parser)]
#[command(name = "branchship")]
#[command(about = "Build branches of a working copy one at a time", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        global = true,
        env = "BRANCHSHIP_CONFIG",
        default_value = "branchship.kdl"
    )]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// List branches of the working copy
    Branches {
        /// Only check whether this branch exists
        name: Option<String>,
    },
    /// Build one or more branches and wait for them to finish
    Build {
        /// Branches to build, in order
        #[arg(required = true)]
        branches: Vec<String>,
        /// Copy finished archives into this directory
        #[arg(long)]
        deliver_to: Option<PathBuf>,
        /// Requester identity checked against the allow-list
        #[arg(long, default_value = "local")]
        requester: String,
    },
    /// Accept build, cancel and queue commands on stdin
    Serve {
        /// Copy finished archives into this directory
        #[arg(long)]
        deliver_to: Option<PathBuf>,
        /// Requester identity checked against the allow-list
        #[arg(long, default_value = "local")]
        requester: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config, cli.json)?;
        }
        Commands::Branches { name } => {
            commands::branches(&cli.config, name.as_deref()).await?;
        }
        Commands::Build {
            branches,
            deliver_to,
            requester,
        } => {
            commands::build::run(&cli.config, &branches, deliver_to, &requester).await?;
        }
        Commands::Serve {
            deliver_to,
            requester,
        } => {
            commands::serve::run(&cli.config, deliver_to, &requester).await?;
        }
    }

    Ok(())
}
