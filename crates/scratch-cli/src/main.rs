mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, env::EnvSubcommand, scratch::LifecycleOp,
    shared::SharedSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "scratch",
    about = "Per-branch scratch environments behind one shared ingress",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: nearest directory holding scratch.yaml)
    #[arg(long, global = true, env = "SCRATCH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default scratch.yaml and env template (never overwrites)
    Init,

    /// Create a scratch for a branch, or update it if it already exists
    Create {
        branch: String,
        /// Explicit identity instead of the one derived from the branch
        #[arg(long)]
        name: Option<String>,
        /// Service profile to deploy
        #[arg(long)]
        profile: Option<String>,
    },

    /// List scratches with live state
    List,

    /// Show one scratch with per-service health
    Status { name: String },

    /// Bring a stopped scratch back up
    Start { name: String },

    /// Stop a scratch, keeping its files and database
    Stop { name: String },

    /// Stop then start
    Restart { name: String },

    /// Re-render and redeploy only what changed
    Update { name: String },

    /// Rebuild images without cache and redeploy
    Rebuild { name: String },

    /// Drop and recreate the scratch database, then re-run initializers
    WipeDb { name: String },

    /// Tear down a scratch and remove everything it owns
    Delete { name: String },

    /// Read, edit or reset env files
    Env {
        #[command(subcommand)]
        subcommand: EnvSubcommand,
    },

    /// Container output of a scratch
    Logs {
        name: String,
        /// Limit to one service
        #[arg(long, short = 's')]
        service: Option<String>,
        /// Lines per service
        #[arg(long, short = 'n')]
        tail: Option<usize>,
    },

    /// Operation audit logs of a scratch (list, or print one file)
    Oplogs { name: String, file: Option<String> },

    /// Manage shared services
    Shared {
        #[command(subcommand)]
        subcommand: SharedSubcommand,
    },

    /// Print the static nginx rule for the configured routing mode
    Ingress {
        /// host:port the proxy reaches the control API on
        #[arg(long)]
        upstream: Option<String>,
    },

    /// Run the control API, webhook intake and reference ingress
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Inspect and validate scratch.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
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
        Commands::Create {
            branch,
            name,
            profile,
        } => cmd::scratch::create(&root, &branch, name.as_deref(), profile.as_deref(), cli.json),
        Commands::List => cmd::scratch::list(&root, cli.json),
        Commands::Status { name } => cmd::scratch::status(&root, &name, cli.json),
        Commands::Start { name } => cmd::scratch::run(&root, LifecycleOp::Start, &name, cli.json),
        Commands::Stop { name } => cmd::scratch::run(&root, LifecycleOp::Stop, &name, cli.json),
        Commands::Restart { name } => {
            cmd::scratch::run(&root, LifecycleOp::Restart, &name, cli.json)
        }
        Commands::Update { name } => cmd::scratch::update(&root, &name, cli.json),
        Commands::Rebuild { name } => {
            cmd::scratch::run(&root, LifecycleOp::Rebuild, &name, cli.json)
        }
        Commands::WipeDb { name } => {
            cmd::scratch::run(&root, LifecycleOp::WipeDatabase, &name, cli.json)
        }
        Commands::Delete { name } => cmd::scratch::delete(&root, &name, cli.json),
        Commands::Env { subcommand } => cmd::env::run(&root, subcommand, cli.json),
        Commands::Logs {
            name,
            service,
            tail,
        } => cmd::logs::container(&root, &name, service.as_deref(), tail),
        Commands::Oplogs { name, file } => {
            cmd::logs::oplogs(&root, &name, file.as_deref(), cli.json)
        }
        Commands::Shared { subcommand } => cmd::shared::run(&root, subcommand, cli.json),
        Commands::Ingress { upstream } => cmd::ingress::run(&root, upstream.as_deref()),
        Commands::Serve { host, port } => cmd::serve::run(&root, host, port),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
