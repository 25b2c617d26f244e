//! Shipyard CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Shipyard deploy and image build CLI", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stage file
    Validate {
        /// Path to the stage file
        #[arg(default_value = "shipyard.kdl")]
        path: PathBuf,
    },
    /// Deploy a reference to a stage
    Deploy {
        /// Path to the stage file
        stages: PathBuf,
        /// Stage name
        stage: String,
        /// Commit, branch or tag to deploy
        reference: String,
        /// Requesting user
        #[arg(long, env = "USER", default_value = "shipyard")]
        user: String,
        /// Confirm the deploy as this user when a buddy check applies
        #[arg(long)]
        confirm_as: Option<String>,
        /// Deploy from a local directory instead of the project repository
        #[arg(long)]
        source: Option<PathBuf>,
        /// Post notifications to this URL instead of the log
        #[arg(long)]
        webhook: Option<String>,
    },
    /// Build a container image from a source directory
    Build {
        /// Directory containing the Dockerfile
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Image repository
        #[arg(long)]
        repository: String,
        /// Image tag
        #[arg(long)]
        image: Option<String>,
        /// Build label, used as the tag when no image name is given
        #[arg(long)]
        label: Option<String>,
        /// Revision written into the REVISION file
        #[arg(long, default_value = "HEAD")]
        reference: String,
        /// Dockerfile path inside the context
        #[arg(long, default_value = "Dockerfile")]
        dockerfile: String,
        /// Push the image after building
        #[arg(long)]
        push: bool,
        /// Also push the `latest` tag
        #[arg(long)]
        latest: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Deploy {
            stages,
            stage,
            reference,
            user,
            confirm_as,
            source,
            webhook,
        } => {
            let config = commands::system_config(cli.config.as_deref())?;
            commands::deploy::run(
                config,
                commands::deploy::DeployArgs {
                    stages,
                    stage,
                    reference,
                    user,
                    confirm_as,
                    source,
                    webhook,
                },
            )
            .await?;
        }
        Commands::Build {
            dir,
            repository,
            image,
            label,
            reference,
            dockerfile,
            push,
            latest,
        } => {
            let config = commands::system_config(cli.config.as_deref())?;
            commands::build::run(
                config,
                commands::build::BuildArgs {
                    dir,
                    repository,
                    image,
                    label,
                    reference,
                    dockerfile,
                    push,
                    latest,
                },
            )
            .await?;
        }
    }

    Ok(())
}
