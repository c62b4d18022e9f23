mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use dglab_core::config::{Config, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dglab",
    about = "Haptic stimulus orchestrator for DG-LAB devices",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: dglab.yaml in the working directory)
    #[arg(long, global = true, env = "DGLAB_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, inspect and validate the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Start the control channel and read host events from stdin
    Serve {
        /// Override server.port from the config
        #[arg(long)]
        port: Option<u16>,
    },

    /// Render a pairing QR code for the DG-LAB app
    Qr {
        /// Host the app should connect to
        #[arg(long)]
        host: String,
        /// Control channel port
        #[arg(long, default_value_t = 9999)]
        port: u16,
        /// Controller identity printed by `dglab serve`
        #[arg(long)]
        id: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match &cli.command {
        Commands::Serve { .. } => {
            // An unreadable config is reported by the command itself.
            let debug = Config::load_or_default(&cli.config)
                .map(|c| c.debug_logging)
                .unwrap_or(false);
            if debug {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            }
        }
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Serve { port } => cmd::serve::run(&cli.config, port, cli.json),
        Commands::Qr { host, port, id } => cmd::qr::run(&host, port, &id, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
