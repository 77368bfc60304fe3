//! kiln - fire Compose projects into unikernel machines
//!
//! CLI entry point for the compose orchestrator.

use clap::{Args, Parser, Subcommand};
use kiln::compose::{ComposeOrchestrator, OrchestratorOptions};
use kiln::error::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// kiln - Compose-to-unikernel orchestration
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Fire Compose projects into unikernel machines", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// State directory
    #[arg(long, global = true, env = "KILN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage a compose project
    #[command(subcommand)]
    Compose(ComposeCommands),
}

#[derive(Subcommand)]
enum ComposeCommands {
    /// Create and start the project's services
    Up {
        #[command(flatten)]
        common: ComposeArgs,
        #[command(flatten)]
        build: BuildArgs,
        /// Remove machines for services not defined in the compose file
        #[arg(long)]
        remove_orphans: bool,
        /// Services to bring up (all when empty)
        services: Vec<String>,
    },

    /// Create the services and networks without starting them
    Create {
        #[command(flatten)]
        common: ComposeArgs,
        #[command(flatten)]
        build: BuildArgs,
        /// Remove machines for services not defined in the compose file
        #[arg(long)]
        remove_orphans: bool,
        /// Services to create (all when empty)
        services: Vec<String>,
    },

    /// Build or rebuild services
    Build {
        #[command(flatten)]
        common: ComposeArgs,
        #[command(flatten)]
        build: BuildArgs,
        /// Services to build (all when empty)
        services: Vec<String>,
    },

    /// Start created services
    Start {
        #[command(flatten)]
        common: ComposeArgs,
        /// Services to start (all when empty)
        services: Vec<String>,
    },

    /// Stop running services
    Stop {
        #[command(flatten)]
        common: ComposeArgs,
        /// Services to stop (all when empty)
        services: Vec<String>,
    },

    /// Pause running services
    Pause {
        #[command(flatten)]
        common: ComposeArgs,
        /// Services to pause (all when empty)
        services: Vec<String>,
    },

    /// Unpause paused services
    Unpause {
        #[command(flatten)]
        common: ComposeArgs,
        /// Services to unpause (all when empty)
        services: Vec<String>,
    },

    /// Stop and remove the project's machines, networks and volumes
    Down {
        #[command(flatten)]
        common: ComposeArgs,
        /// Also remove named volumes
        #[arg(long)]
        volumes: bool,
        /// Services to tear down (all when empty)
        services: Vec<String>,
    },
}

#[derive(Args)]
struct ComposeArgs {
    /// Compose file to use
    #[arg(short, long)]
    file: Option<String>,

    /// Unikernel image packaged with built services
    #[arg(long, env = "KILN_KERNEL")]
    kernel: Option<PathBuf>,

    /// Disable the live progress display
    #[arg(long)]
    plain: bool,
}

#[derive(Args, Default)]
struct BuildArgs {
    /// Supply build arguments when building a Dockerfile
    #[arg(long = "build-arg")]
    build_args: Vec<String>,

    /// Supply a multi-stage target when building a Dockerfile
    #[arg(long = "build-target")]
    build_target: Option<String>,

    /// Supply secrets when building a Dockerfile
    #[arg(long = "build-secret")]
    build_secrets: Vec<String>,
}

fn orchestrator(
    state_dir: Option<PathBuf>,
    common: ComposeArgs,
    build: BuildArgs,
    remove_orphans: bool,
) -> Result<ComposeOrchestrator> {
    let workdir = std::env::current_dir()?;
    let state_dir = state_dir.unwrap_or_else(default_state_dir);

    ComposeOrchestrator::new(
        &workdir,
        &state_dir,
        OrchestratorOptions {
            compose_file: common.file,
            kernel: common.kernel,
            remove_orphans,
            build_args: build.build_args,
            build_target: build.build_target,
            build_secrets: build.build_secrets,
            no_render: common.plain,
        },
    )
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".local")
        .join("share")
        .join("kiln")
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Compose(command) => match command {
            ComposeCommands::Up {
                common,
                build,
                remove_orphans,
                services,
            } => {
                orchestrator(cli.state_dir, common, build, remove_orphans)?
                    .up(&services)
                    .await
            }
            ComposeCommands::Create {
                common,
                build,
                remove_orphans,
                services,
            } => {
                orchestrator(cli.state_dir, common, build, remove_orphans)?
                    .create(&services)
                    .await
            }
            ComposeCommands::Build {
                common,
                build,
                services,
            } => {
                orchestrator(cli.state_dir, common, build, false)?
                    .build(&services)
                    .await
            }
            ComposeCommands::Start { common, services } => {
                orchestrator(cli.state_dir, common, BuildArgs::default(), false)?
                    .start(&services)
                    .await
            }
            ComposeCommands::Stop { common, services } => {
                orchestrator(cli.state_dir, common, BuildArgs::default(), false)?
                    .stop(&services)
                    .await
            }
            ComposeCommands::Pause { common, services } => {
                orchestrator(cli.state_dir, common, BuildArgs::default(), false)?
                    .pause(&services)
                    .await
            }
            ComposeCommands::Unpause { common, services } => {
                orchestrator(cli.state_dir, common, BuildArgs::default(), false)?
                    .unpause(&services)
                    .await
            }
            ComposeCommands::Down {
                common,
                volumes,
                services,
            } => {
                orchestrator(cli.state_dir, common, BuildArgs::default(), false)?
                    .down(&services, volumes)
                    .await
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        tracing::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
