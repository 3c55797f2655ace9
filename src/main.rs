use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;
use hag_controller::cli::{Cli, Command, ExitCode};
use hag_controller::clock::SystemClock;
use hag_controller::config::HagConfig;
use hag_controller::controller::Controller;
use hag_controller::error::HagError;
use hag_controller::evaluation::RuleBasedEngine;
use hag_controller::gateway::{HomeAssistantGateway, PlatformGateway};
use hag_controller::server;

#[tokio::main]
async fn main() -> ProcessExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(cli).await {
        Ok(()) => ProcessExitCode::from(ExitCode::Success as u8),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ProcessExitCode::from(ExitCode::from(&e) as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), HagError> {
    match cli.command {
        Command::Validate { path } => {
            HagConfig::load(path)?;
            println!("configuration valid");
            Ok(())
        }
        Command::Run { bind } => run_daemon(&cli.config, &bind).await,
        Command::Status { url } => run_status(&url).await,
        Command::Override { mode, target_temp, duration_minutes, url } => {
            run_override(&url, mode, target_temp, duration_minutes).await
        }
    }
}

async fn run_daemon(config_path: &str, bind: &str) -> Result<(), HagError> {
    let config = Arc::new(HagConfig::load(config_path)?);

    let gateway: Arc<dyn PlatformGateway> = Arc::new(HomeAssistantGateway::new(
        &config.hass_options.rest_url,
        &config.hass_options.ws_url,
        config.hass_options.token.clone(),
        config.hass_options.max_retries,
        config.hass_options.retry_delay_ms,
        config.hass_options.timeout_ms,
    )?);

    let controller = Arc::new(
        Controller::start(config.clone(), gateway, Arc::new(RuleBasedEngine), Arc::new(SystemClock)).await?,
    );

    let server_controller = controller.clone();
    let bind_addr = bind.to_string();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::start_server(server_controller, &bind_addr).await {
            tracing::error!(error = %e, "status server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| HagError::Connection(format!("failed to listen for shutdown signal: {e}")))?;

    tracing::info!("shutdown signal received");
    server_handle.abort();
    controller.shutdown().await
}

async fn run_status(url: &str) -> Result<(), HagError> {
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{url}/status"))
        .send()
        .await
        .map_err(|e| HagError::Connection(format!("daemon unreachable: {e}")))?;

    let body = resp
        .text()
        .await
        .map_err(|e| HagError::Connection(format!("failed to read status response: {e}")))?;
    println!("{body}");
    Ok(())
}

async fn run_override(
    url: &str,
    mode: hag_controller::state_machine::OverrideMode,
    target_temp: Option<f64>,
    duration_minutes: Option<i64>,
) -> Result<(), HagError> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "mode": mode,
        "targetTemp": target_temp,
        "durationMinutes": duration_minutes,
    });

    let resp = client
        .post(format!("{url}/override"))
        .json(&body)
        .send()
        .await
        .map_err(|e| HagError::Connection(format!("daemon unreachable: {e}")))?;

    if !resp.status().is_success() {
        return Err(HagError::Connection(format!("override rejected: {}", resp.status())));
    }
    println!("override accepted");
    Ok(())
}
