use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vigil_common::clock::{Clock, SystemClock};
use vigil_common::types::Event;
use vigil_notify::channels::in_app::InAppInbox;
use vigil_notify::plugin::PluginRegistry;

use vigil_server::bootstrap;
use vigil_server::config::ServerConfig;
use vigil_server::maintenance;
use vigil_server::pipeline::AlertPipeline;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  vigil-server [config.toml]                 Read NDJSON events from stdin and dispatch alerts");
    eprintln!("  vigil-server check-config <config.toml>    Validate channels, templates, recipients and rules");
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("check-config") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("check-config requires a <config.toml> argument")
            })?;
            run_check_config(config_path)
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/vigil.toml");
            run_server(config_path).await
        }
    }
}

fn run_check_config(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let components = bootstrap::assemble(&config);
    let report = components.report;
    for problem in &report.problems {
        tracing::error!(problem = %problem, "Configuration problem");
    }
    if !report.is_clean() {
        anyhow::bail!("{} configuration problem(s) in '{}'", report.problems.len(), config_path);
    }
    tracing::info!(
        channels = report.channels,
        templates = report.templates,
        recipients = report.recipients,
        rules = report.rules,
        "Configuration OK"
    );
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    vigil_common::id::init(config.id.machine_id, config.id.node_id);

    tracing::info!(
        config = %config_path,
        tick_interval_ms = config.dispatch.tick_interval_ms,
        retention_secs = config.retention_secs,
        "vigil-server starting"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let plugins = PluginRegistry::with_builtins(InAppInbox::with_capacity(config.inbox_capacity));
    let components = bootstrap::assemble_with(&config, &plugins, clock.clone());
    for problem in &components.report.problems {
        tracing::warn!(problem = %problem, "Configuration problem, continuing without it");
    }

    let engine = components.engine.clone();
    let pipeline = AlertPipeline::new(components.rules, engine.clone(), clock.clone());
    engine.start().await;

    let maintenance_handles = maintenance::spawn(
        engine.clone(),
        clock.clone(),
        config.retention_secs,
        config.stats_log_interval_secs,
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reached_eof = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&pipeline, &line).await,
                    Ok(None) => {
                        tracing::info!("Event stream closed");
                        reached_eof = true;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read event stream");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                tracing::info!("Shutting down gracefully");
                break;
            }
        }
    }

    engine.stop().await;
    if reached_eof {
        let flushed = engine.process_tick().await;
        tracing::info!(flushed, "Flushed queued notifications");
    }

    for handle in maintenance_handles {
        handle.abort();
    }
    maintenance::log_stats(&engine);
    tracing::info!("vigil-server stopped");

    Ok(())
}

/// Parses one NDJSON event and writes every resulting alert as a JSON line.
#[allow(clippy::print_stdout)]
async fn handle_line(pipeline: &AlertPipeline, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let event: Event = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed event");
            return;
        }
    };

    let outcome = pipeline.handle_event(&event).await;
    tracing::debug!(
        event_id = %event.id,
        alerts = outcome.alerts.len(),
        messages = outcome.messages.len(),
        failed_actions = outcome.failed_actions.len(),
        "Event processed"
    );
    for alert in &outcome.alerts {
        match serde_json::to_string(alert) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(alert_id = %alert.id(), error = %e, "Failed to serialize alert"),
        }
    }
}
