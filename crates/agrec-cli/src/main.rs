mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::status::StatusSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "agrec",
    about = "Scheduled radio recorder with leaderless multi-host consolidation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: agrec.yaml in the working directory or above)
    #[arg(long, global = true, env = "AGREC_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the timetable until stopped (SIGINT/SIGTERM stop, SIGHUP restarts)
    Run,

    /// Run one consolidation pass over the shared store
    Cleanup,

    /// Show pending work groups in the shared store
    Status {
        #[command(subcommand)]
        subcommand: Option<StatusSubcommand>,
    },

    /// Show the next recordings the timetable would start
    Timetable {
        /// Number of upcoming recordings to list
        #[arg(long, short = 'n', default_value_t = 10)]
        count: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run | Commands::Cleanup => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = cmd::load_config(cli.config.as_deref()).and_then(|(config, path)| match cli.command {
        Commands::Run => cmd::run::run(&config, path.as_deref()),
        Commands::Cleanup => cmd::cleanup::run(&config, cli.json),
        Commands::Status { subcommand } => cmd::status::run(&config, subcommand, cli.json),
        Commands::Timetable { count } => cmd::timetable::run(&config, count, cli.json),
    });

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
