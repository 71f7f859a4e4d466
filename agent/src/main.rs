//! Agent entry point: configuration, registration, the control link and the
//! background loops (reconcile, heartbeat, reporting), ending in a clean
//! ctrl-c shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lattice_agent::config::{AgentConfig, LoggingConfig};
use lattice_agent::control::{ControlClient, RuleStatusReport, TrafficReport};
use lattice_agent::dispatch::Dispatcher;
use lattice_agent::forwarder::ForwarderSettings;
use lattice_agent::link::{ControlLink, LinkConfig};
use lattice_agent::rules::{RuleManager, StatusEvent};
use lattice_protocol::{install_cipher, PayloadCipher, TrafficStats};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Registration attempts before startup is declared failed.
const MAX_REGISTER_ATTEMPTS: u32 = 5;

#[derive(Parser)]
#[command(name = "lattice-agent", version, about = "Lattice edge agent")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control-plane base URL; with --token forms a minimal config.
    #[arg(long)]
    server: Option<String>,

    /// Registration token.
    #[arg(long)]
    token: Option<String>,
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lattice_agent={0},lattice_protocol={0}",
            logging.level
        ))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.file.is_empty() {
        builder.with_writer(std::io::stderr).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)
            .with_context(|| format!("failed to open log file {}", logging.file))?;
        builder.with_writer(Arc::new(file)).with_ansi(false).init();
    }
    Ok(())
}

/// `http(s)://host[:port]` → `ws(s)://host[:port]/ws`, used when the control
/// plane does not hand back an explicit broker endpoint.
fn derive_ws_endpoint(server_url: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/ws")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::minimal(
            args.server
                .clone()
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            args.token.clone().unwrap_or_default(),
        ),
    };
    if let Some(server) = args.server {
        config.client.server_url = server;
    }
    if let Some(token) = args.token {
        config.client.token = token;
    }
    config.validate()?;
    init_logging(&config.logging)?;

    let control = Arc::new(ControlClient::new(&config.client.server_url));
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());

    // Register with the control plane; failure after the bounded retries is
    // fatal.
    let retry_delay = Duration::from_secs(config.connection.reconnect_interval);
    let mut registration = None;
    for attempt in 1..=MAX_REGISTER_ATTEMPTS {
        match control
            .register(
                &config.client.token,
                &hostname,
                lattice_agent::VERSION,
                config.client.report_ip.as_deref(),
            )
            .await
        {
            Ok(reply) => {
                registration = Some(reply);
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "registration failed");
                if attempt < MAX_REGISTER_ATTEMPTS {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    let registration = registration
        .with_context(|| format!("registration failed after {MAX_REGISTER_ATTEMPTS} attempts"))?;
    let client_id = registration.client_id.clone();
    info!(%client_id, "registered with control plane");

    // The provisioned secret keys the fabric-wide payload cipher.
    install_cipher(PayloadCipher::from_secret(&registration.secret_key));

    let endpoint = if registration.ws_endpoint.is_empty() {
        derive_ws_endpoint(&config.client.server_url)
    } else {
        registration.ws_endpoint.clone()
    };
    let (link, inbound) = ControlLink::start(LinkConfig {
        agent_id: client_id.clone(),
        endpoint,
        reconnect_initial: retry_delay,
        reconnect_max: Duration::from_secs(config.connection.max_reconnect_interval),
    });

    let traffic = Arc::new(TrafficStats::<String>::new());
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<StatusEvent>();
    let settings = ForwarderSettings::from(&config.forwarder);
    let rules = RuleManager::new(link.clone(), traffic.clone(), settings.clone(), status_tx);

    let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);
    let dispatcher = Dispatcher::new(link.clone(), rules.clone(), settings, refresh_tx);
    tokio::spawn(dispatcher.run(inbound));

    // Rule reconcile: on every (re)connect and on pushed RuleUpdates.
    {
        let control = control.clone();
        let rules = rules.clone();
        let client_id = client_id.clone();
        let mut reconnects = link.reconnects();
        tokio::spawn(async move {
            // Force one reconcile up front; later rounds ride on reconnects
            // and pushed updates.
            reconnects.mark_changed();
            loop {
                tokio::select! {
                    changed = reconnects.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    nudge = refresh_rx.recv() => {
                        if nudge.is_none() {
                            break;
                        }
                    }
                }
                match control.get_rules(&client_id).await {
                    Ok(list) => rules.apply(&list).await,
                    Err(e) => warn!(error = %e, "rule fetch failed"),
                }
            }
        });
    }

    // Heartbeat.
    {
        let control = control.clone();
        let client_id = client_id.clone();
        let period = Duration::from_secs(config.connection.heartbeat_interval);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await; // the first tick fires immediately
            loop {
                tick.tick().await;
                if let Err(e) = control.heartbeat(&client_id).await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        });
    }

    // Per-second traffic flush and batched rule-status reporting.
    {
        let control = control.clone();
        let client_id = client_id.clone();
        let traffic = traffic.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;

                let mut statuses = Vec::new();
                while let Ok(event) = status_rx.try_recv() {
                    statuses.push(RuleStatusReport {
                        rule_id: event.rule_id,
                        status: event.status.as_str().to_string(),
                        error: event.error,
                    });
                }
                if !statuses.is_empty() {
                    if let Err(e) = control.report_rule_status(&client_id, &statuses).await {
                        warn!(error = %e, "rule status report failed");
                    }
                }

                let reports: Vec<TrafficReport> = traffic
                    .snapshot()
                    .into_iter()
                    .filter(|row| row.bytes_in > 0 || row.bytes_out > 0 || row.connections > 0)
                    .map(|row| TrafficReport {
                        rule_id: row.key,
                        bytes_in: row.bytes_in,
                        bytes_out: row.bytes_out,
                        connections: row.connections,
                    })
                    .collect();
                if !reports.is_empty() {
                    if let Err(e) = control.report_traffic(&client_id, &reports).await {
                        warn!(error = %e, "traffic report failed");
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    rules.stop_all().await;
    link.close();
    Ok(())
}
