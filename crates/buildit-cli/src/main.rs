//! BuildIt CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildit")]
#[command(about = "BuildIt job dispatch CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "BUILDIT_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Bearer token for submissions and cancellation
    #[arg(long, env = "BUILDIT_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to the configuration file
    #[arg(long, env = "BUILDIT_CONFIG", default_value = "buildit.kdl")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a package build for one or more targets or target groups
    Submit {
        /// Targets or groups, e.g. `amd64` or `mainline`
        #[arg(required = true)]
        targets: Vec<String>,
        /// Package to build; repeat for several
        #[arg(short, long = "package", required = true)]
        packages: Vec<String>,
        /// Git ref of the package tree
        #[arg(long = "ref", default_value = "stable")]
        git_ref: String,
        /// Pull request number the build belongs to
        #[arg(long)]
        pr: Option<u64>,
    },
    /// Show a job
    Show {
        /// Job ID
        id: String,
    },
    /// Cancel a queued or running job
    Cancel {
        /// Job ID
        id: String,
    },
    /// Show queue depth and online workers
    Status,
    /// Run a worker agent for the configured target
    Worker {
        /// Serve this target instead of the configured one
        #[arg(long)]
        target: Option<String>,
        /// Host name reported in the worker id
        #[arg(long, env = "HOSTNAME")]
        hostname: Option<String>,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file; defaults to --config
        path: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Submit {
            targets,
            packages,
            git_ref,
            pr,
        } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.token)?;
            commands::jobs::submit(&client, targets, packages, git_ref, pr).await?;
        }
        Commands::Show { id } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.token)?;
            commands::jobs::show(&client, &id).await?;
        }
        Commands::Cancel { id } => {
            let client = commands::ApiClient::new(&cli.api_url, cli.token)?;
            commands::jobs::cancel(&client, &id).await?;
        }
        Commands::Status => {
            let client = commands::ApiClient::new(&cli.api_url, cli.token)?;
            commands::jobs::status(&client).await?;
        }
        Commands::Worker { target, hostname } => {
            commands::worker::run(&cli.config, target, hostname).await?;
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(&cli.config))?;
        }
    }

    Ok(())
}
