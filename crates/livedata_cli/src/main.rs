//! LiveData CLI
//!
//! Command-line tools for exercising the live query engine against the
//! in-memory store.
//!
//! # Commands
//!
//! - `demo` - Run the insert/update/remove walkthrough and print each callback log
//! - `fuzz` - Run the randomized convergence check

mod commands;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// LiveData command-line tools.
#[derive(Parser)]
#[command(name = "livedata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Poll throttle window in milliseconds
    #[arg(global = true, long, default_value = "50")]
    throttle_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the observe walkthrough and print each step's callbacks
    Demo {
        /// Use a store that reorders equal-sorting documents on every read
        #[arg(short, long)]
        unstable: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the randomized live query convergence check
    Fuzz {
        /// Number of write batches
        #[arg(short, long, default_value = "100")]
        steps: usize,

        /// Largest number of writes per batch
        #[arg(short = 'b', long, default_value = "5")]
        max_batch: usize,

        /// RNG seed (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let throttle = Duration::from_millis(cli.throttle_ms);
    match cli.command {
        Commands::Demo { unstable, format } => {
            commands::demo::run(throttle, unstable, &format).await?;
        }
        Commands::Fuzz {
            steps,
            max_batch,
            seed,
            format,
        } => {
            commands::fuzz::run(throttle, steps, max_batch, seed, &format).await?;
        }
        Commands::Version => {
            println!("LiveData CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
