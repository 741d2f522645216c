//! Startup: config load + validation, adapter construction, state
//! assembly, and the axum server with graceful shutdown.

use std::path::Path;
use std::sync::Arc;

use cox_domain::config::{Config, ConfigSeverity};
use cox_providers::OpenAiCompatProvider;
use cox_tools::HttpToolTransport;

use crate::api;
use crate::state::AppState;

/// Load the configuration (file + env overrides) and validate it.
/// Warnings are logged; errors abort startup.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(p) => Config::load(p)?,
        None => Config::from_env(),
    };

    let issues = config.validate();
    let mut fatal = false;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => {
                tracing::error!(field = %issue.field, "{}", issue.message);
                fatal = true;
            }
            ConfigSeverity::Warning => {
                tracing::warn!(field = %issue.field, "{}", issue.message);
            }
        }
    }
    if fatal {
        anyhow::bail!("configuration has errors; refusing to start");
    }
    Ok(config)
}

/// Build the full application state with the real HTTP adapters.
pub fn build_state(config: Config) -> anyhow::Result<AppState> {
    let provider = Arc::new(OpenAiCompatProvider::from_config(&config.llm)?);
    let transport = Arc::new(HttpToolTransport::new(&config.tools.base_url)?);
    Ok(AppState::build(config, provider, transport)?)
}

/// Run the gateway until ctrl-c.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "coxswain gateway listening");

    let router = api::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
