mod cgroups;
mod config;
mod container;
mod error;
mod fs;
mod image;
mod init;
mod kernel;
mod launch;
mod net;
mod runtime;
mod teardown;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{DEFAULT_ROOT, Paths};
use container::{ContainerId, ResourceLimits};
use error::{Step, StepError, StepExt};
use kernel::Host;
use launch::NamespaceParams;
use runtime::{RunRequest, SelfExec};

/// Runs a command in an isolated container built from a local image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding images and container state
    #[arg(long, global = true, env = "ROCKER_ROOT", default_value = DEFAULT_ROOT)]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command in a new container
    Run(RunArgs),

    #[command(hide = true)]
    ChildMode(NamespaceParams),

    #[command(hide = true)]
    SetupNetns { container_id: ContainerId },

    #[command(hide = true)]
    SetupVeth { container_id: ContainerId },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    limits: ResourceLimits,

    /// Drop all the capabilities for the command
    #[arg(long)]
    drop_caps: bool,

    /// Image to run, as name[:tag] or digest
    image: String,

    /// Command to execute in the container
    #[arg(required = true)]
    command: String,

    /// Arguments for the command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn dispatch(cli: Cli) -> Result<(), StepError> {
    let paths = Paths::new(cli.root);
    match cli.command {
        Commands::Run(args) => {
            let mut command = vec![args.command];
            command.extend(args.args);
            runtime::run(
                &Host::new(&paths),
                &SelfExec::new(&paths.root),
                &paths,
                RunRequest {
                    image: args.image,
                    limits: args.limits,
                    command,
                    drop_caps: args.drop_caps,
                },
            )
        }
        Commands::ChildMode(params) => init::initialize(&Host::new(&paths), &paths, &params),
        Commands::SetupNetns { container_id } => {
            net::create_netns(&paths, &container_id).step(Step::CreateNetns)
        }
        Commands::SetupVeth { container_id } => {
            net::attach_veth(&paths, &container_id).step(Step::AttachVeth)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        tracing::error!(step = %e.step, "aborting");
        eprintln!("Error: {:#}", anyhow::Error::new(e));
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
