use std::path::PathBuf;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use serde_json::Value;

use llm_relay::config::AppConfig;
use llm_relay::server::config_routes;
use llm_relay::util::{init_tracing, load_env_files, AppState};

/// LLM Relay: route chat requests to registered model providers.
#[derive(Debug, Parser)]
#[command(name = "llm-relay", version, about)]
struct Cli {
    /// Config file (JSON, or YAML by extension)
    #[arg(long, env = "LLM_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host, overrides HOST from the config file
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides PORT from the config file
    #[arg(long)]
    port: Option<u16>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let env_source = load_env_files();
    let cli = Cli::parse();

    let mut config = AppConfig::discover(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.set("HOST", Value::String(host));
    }
    if let Some(port) = cli.port {
        config.set("PORT", Value::from(port));
    }

    init_tracing(config.log_level().as_deref());
    tracing::info!("Environment loaded from: {}", env_source);
    match config.source() {
        Some(path) => tracing::info!("Config file: {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }

    let host = config.host();
    let port = config.port();
    let state = web::Data::new(AppState::init(config));

    let server_state = state.clone();
    let server = HttpServer::new(move || {
        let state = server_state.clone();
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(|cfg| config_routes(cfg, state.transformers()))
    })
    .bind((host.as_str(), port))
    .with_context(|| format!("Failed to bind {}:{}", host, port))?;

    tracing::info!("Listening on http://{}:{}", host, port);
    server.run().await.context("Server error")?;

    state.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}
