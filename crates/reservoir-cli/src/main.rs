//! reservoir: connection pool tooling.
//!
//! # Usage
//!
//! ```text
//! reservoir init --url mem://orders
//! reservoir check --config reservoir.toml
//! reservoir simulate --config reservoir.toml --tasks 16 --iterations 100 --hold-ms 5
//! ```

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "reservoir",
    about = "Reservoir: bounded database connection pooling",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a reservoir.toml, print the resolved settings
    Check {
        /// Path to the config file
        #[arg(short, long, default_value = "reservoir.toml")]
        config: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Run a synthetic workload against an in-memory pool and print its statistics.
    ///
    /// Only the `memory` driver is supported; the rest of the config applies
    /// as written.
    Simulate {
        #[arg(short, long, default_value = "reservoir.toml")]
        config: String,
        /// Concurrent tasks
        #[arg(long, default_value = "8")]
        tasks: usize,
        /// Acquire/release cycles per task
        #[arg(long, default_value = "50")]
        iterations: usize,
        /// How long each task holds a connection, in milliseconds
        #[arg(long, default_value = "2")]
        hold_ms: u64,
        /// Fail every Nth statement (0 disables)
        #[arg(long, default_value = "0")]
        fail_every: u64,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Write a scaffold reservoir.toml
    Init {
        /// Directory to write into
        #[arg(short, long, default_value = ".")]
        path: String,
        /// Target URL for the scaffold
        #[arg(short, long, default_value = "mem://reservoir")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("reservoir=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config, format } => commands::check::check(&config, &format),
        Commands::Simulate {
            config,
            tasks,
            iterations,
            hold_ms,
            fail_every,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                tasks,
                iterations,
                hold: std::time::Duration::from_millis(hold_ms),
                fail_every,
            };
            commands::simulate::simulate(&config, &options, &format).await
        }
        Commands::Init { path, url } => commands::init::init(&path, &url),
    }
}
