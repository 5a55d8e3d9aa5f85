use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::serve::PromptMode;

#[derive(Parser, Debug)]
#[command(name = "bastion", version, about = "Bastion database gateway")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway.
    Serve {
        /// Path to the gateway configuration file.
        #[arg(long, short = 'c', env = "BASTION_CONFIG", default_value = "bastion.yaml")]
        config: PathBuf,

        /// How MFA challenges are answered.
        #[arg(long, value_enum, default_value_t = PromptMode::Console)]
        prompt: PromptMode,
    },

    /// Validate a configuration file and print the effective settings.
    Check {
        /// Path to the gateway configuration file.
        #[arg(long, short = 'c', env = "BASTION_CONFIG", default_value = "bastion.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Serve { config, prompt } => commands::serve::serve(config, prompt).await,
        Command::Check { config } => commands::check::check(&config),
    }
}
