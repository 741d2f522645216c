use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cox_gateway::bootstrap;

#[derive(Parser)]
#[command(name = "coxswain", about = "Context-orchestrated LLM turn pipeline")]
struct Cli {
    /// Path to the TOML config file. Env vars override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default).
    Serve,
    /// Load and validate the configuration, then exit.
    ValidateConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cox_gateway=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = bootstrap::load_config(cli.config.as_deref())?;
            let state = bootstrap::build_state(config)?;
            bootstrap::serve(state).await
        }
        Commands::ValidateConfig => {
            let config = bootstrap::load_config(cli.config.as_deref())?;
            println!(
                "configuration ok: {} workflows dir, storage at {}",
                config.workflows.dir.display(),
                config.storage.root.display()
            );
            Ok(())
        }
    }
}
