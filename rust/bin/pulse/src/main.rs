//! `pulse`: command-line driver for the Pulse client core.
//!
//! Prints the resolved configuration, runs a scripted session against the
//! in-memory backend, or reads the feed from the hosted backend.

mod commands;
mod config;

use clap::{Parser, Subcommand};

/// Pulse social client.
#[derive(Parser, Debug)]
#[command(name = "pulse", about = "Pulse social client")]
struct Cli {
    /// Path to config file (default: ~/.pulse/config.toml).
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Override a config key, e.g. `--set feed-page-size=5`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,

    /// Output format: table or json.
    #[arg(long = "output", short = 'o', global = true, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved configuration.
    Config,

    /// Walk a scripted session against a seeded in-memory backend.
    Demo,

    /// Sign in to the hosted backend and print the feed.
    Feed {
        /// Account email.
        #[arg(long)]
        email: String,
        /// Password (default: $PULSE_PASSWORD).
        #[arg(long)]
        password: Option<String>,
        /// Keep the page open and print live changes for this many seconds.
        #[arg(long, default_value_t = 0)]
        watch: u64,
    },

    /// Show version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_output = cli.output == "json";

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(config::default_path);
    let client_config = config::resolve(&config_path, &cli.set)?;

    match cli.command {
        Commands::Config => {
            commands::config::show(&client_config, &config_path, json_output)?;
        }

        Commands::Demo => {
            commands::demo::run(client_config, json_output).await?;
        }

        Commands::Feed {
            email,
            password,
            watch,
        } => {
            let password = match password.or_else(|| std::env::var("PULSE_PASSWORD").ok()) {
                Some(p) if !p.is_empty() => p,
                _ => anyhow::bail!("Provide --password or set PULSE_PASSWORD."),
            };
            commands::feed::run(client_config, &email, &password, watch, json_output).await?;
        }

        Commands::Version => {
            println!("pulse v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
