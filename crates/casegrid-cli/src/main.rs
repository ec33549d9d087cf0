use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "casegrid",
    about = "casegrid: evaluate case files on a pool of model servers",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the built-in paraboloid model over a case file.
    ///
    /// Cases are read one JSON object per line; every finished case is
    /// appended to the output file. Ctrl-C stops the run after the cases
    /// in progress finish.
    Run {
        /// Case file (JSON lines)
        #[arg(long)]
        cases: PathBuf,
        /// Where to write recorded cases (JSON lines)
        #[arg(short, long)]
        output: PathBuf,
        /// Config file (default: ./casegrid.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Evaluate inline instead of on servers
        #[arg(long)]
        sequential: bool,
        /// Override [allocator].capacity
        #[arg(long)]
        capacity: Option<u32>,
    },
    /// Generate a casegrid.toml scaffold
    Init {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,casegrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            cases,
            output,
            config,
            sequential,
            capacity,
        } => {
            let args = commands::run::RunArgs {
                cases,
                output,
                config,
                sequential,
                capacity,
            };
            commands::run::run(args).await
        }
        Commands::Init { path } => commands::init::init(&path),
    }
}
