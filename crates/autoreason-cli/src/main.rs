mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, equipment::EquipmentSubcommand, filter::FilterSubcommand,
    instance::InstanceSubcommand, reason::ReasonSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "autoreason",
    about = "Automated reason assignment for monitored equipment",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .autoreason/)
    #[arg(long, global = true, env = "AUTOREASON_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .autoreason/ with a default config and an empty store
    Init,

    /// Manage equipment
    Equipment {
        #[command(subcommand)]
        subcommand: EquipmentSubcommand,
    },

    /// Manage reasons
    Reason {
        #[command(subcommand)]
        subcommand: ReasonSubcommand,
    },

    /// Manage machine filters
    Filter {
        #[command(subcommand)]
        subcommand: FilterSubcommand,
    },

    /// Manage configured engine instances
    Instance {
        #[command(subcommand)]
        subcommand: InstanceSubcommand,
    },

    /// Validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Run scheduler passes over every engine
    Run {
        /// Stop after this many passes (default: run until interrupted)
        #[arg(long)]
        passes: Option<usize>,

        /// Only run engines of this equipment
        #[arg(long)]
        equipment: Option<u64>,
    },

    /// List committed reason assignments
    Assignments {
        /// Only list assignments of this equipment
        #[arg(long)]
        equipment: Option<u64>,
    },

    /// List persisted cursors
    Cursors,

    /// List audit revisions
    Revisions,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Equipment { subcommand } => cmd::equipment::run(&root, subcommand, cli.json),
        Commands::Reason { subcommand } => cmd::reason::run(&root, subcommand, cli.json),
        Commands::Filter { subcommand } => cmd::filter::run(&root, subcommand, cli.json),
        Commands::Instance { subcommand } => cmd::instance::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Run { passes, equipment } => cmd::run::run(&root, passes, equipment, cli.json),
        Commands::Assignments { equipment } => cmd::assignments::run(&root, equipment, cli.json),
        Commands::Cursors => cmd::cursors::run(&root, cli.json),
        Commands::Revisions => cmd::revisions::run(&root, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
