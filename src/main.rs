mod app;
mod block;
mod config;
mod exchange;
mod identity;
mod logging;
mod network;
mod plan;
mod runenv;
mod server;
mod simulate;
mod sync;
mod util;

use std::{env, path::PathBuf, process::exit};

use anyhow::Result;
use clap::{Parser, Subcommand};
use ctrlc;
use log::{error, info, LevelFilter};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write the log to this file
    #[arg(long, global = true, value_name = "/path/to/blockbench.log")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one participant of a test run
    Run {
        /// Location of configuration file
        #[arg(short, long, value_name = "/path/to/config.yaml")]
        config: String,
    },

    /// Host the coordination service
    Serve {
        /// Location of configuration file
        #[arg(short, long, value_name = "/path/to/service.yaml")]
        config: String,
    },

    /// Run a whole cohort inside this process
    Simulate {
        /// Location of configuration file
        #[arg(short, long, value_name = "/path/to/simulation.yaml")]
        config: String,
    },
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run { config } => {
            let config = config::Config::new(&config)?;
            app::App::new(config)?.start().await
        },
        Command::Serve { config } => {
            let config = config::ServiceConfig::new(&config)?;
            app::serve(config).await
        },
        Command::Simulate { config } => {
            let config = config::SimulationConfig::new(&config)?;
            app::simulate(config).await
        },
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    if args.verbose >= 1 {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if let Err(e) = logging::setup_logger(log_level, args.log_file.as_deref()) {
        eprintln!("Failed to initialize logger: {e}. ");
        exit(1);
    }

    info!("Started {} version {}. ", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received SIGINT, shutting down. ");
        exit(0);
    }) {
        error!("Failed to set SIGINT handler: {e}. ");
        exit(1);
    }

    if let Err(e) = dispatch(args.command).await {
        eprintln!("Program failed: {e:#}. ");
        exit(1);
    }
}
