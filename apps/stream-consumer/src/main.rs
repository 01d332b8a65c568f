//! Stream Consumer Binary
//!
//! Opens a streaming session, subscribes to the configured items and prints
//! every message until the run duration elapses or the process is signalled.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-consumer
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `CLIENT_ID`: OAuth2 client id
//! - `CLIENT_SECRET`: OAuth2 client secret
//!
//! ## Optional
//! - `SERVICENAME`: Service to subscribe on (default: `ELEKTRON_DD`)
//! - `ITEM_NAMES`: Comma separated items (default: `EUR=`)
//! - `VIEW_FIELDS`: Comma separated field ids (default: `22,25,15,875,1010`)
//! - `STREAM_URL`: WebSocket endpoint
//! - `TOKEN_URL`: OAuth2 token endpoint
//! - `RUN_DURATION_SECS`: How long to run (default: 900)
//! - `CONSUMER_METRICS_PORT`: Prometheus port, 0 disables (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log filter

use std::sync::Arc;

use anyhow::Context;
use stream_consumer::application::ports::{TokenEndpoint, Transport};
use stream_consumer::domain::message::Message;
use stream_consumer::infrastructure::oauth::HttpTokenEndpoint;
use stream_consumer::infrastructure::transport::WebSocketTransport;
use stream_consumer::{
    ConsumerConfig, MessageHandlers, Session, SessionConfig, SessionEvent, init_metrics,
    init_telemetry,
};
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = init_telemetry().context("failed to initialize telemetry")?;

    tracing::info!("Starting stream consumer");

    let config = ConsumerConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics_port != 0 {
        init_metrics(config.metrics_port).context("failed to start metrics exporter")?;
        tracing::info!(port = config.metrics_port, "Metrics exporter listening");
    }

    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::new(&config.stream_url));
    let endpoint: Arc<dyn TokenEndpoint> = Arc::new(HttpTokenEndpoint::new()?);
    let (session, events) = Session::new(
        transport,
        endpoint,
        console_handlers(),
        SessionConfig::from_consumer(&config),
    );

    tokio::spawn(log_events(events));

    session
        .open(config.credentials.clone())
        .await
        .context("failed to open session")?;

    for request in config.subscription.requests() {
        let item = request.item_name.clone();
        match session.subscribe_request(request).await {
            Ok(handle) => tracing::info!(%handle, item = %item, "Item requested"),
            Err(e) => tracing::error!(item = %item, error = %e, "Item request failed"),
        }
    }

    let outcome = tokio::select! {
        () = tokio::time::sleep(config.run_duration) => {
            tracing::info!(secs = config.run_duration.as_secs(), "Run duration elapsed");
            Ok(())
        }
        () = await_shutdown() => Ok(()),
        result = session.wait_closed() => result,
    };

    session.close().await;
    tracing::info!("Stream consumer stopped");

    outcome.context("session ended abnormally")
}

/// Handlers printing each message to stdout.
fn console_handlers() -> MessageHandlers {
    MessageHandlers::new()
        .on_all(print_message)
        .on_login(print_message)
}

#[allow(clippy::print_stdout)]
fn print_message(message: &Message) {
    println!(
        "{} {} ({}) handle={}",
        message.kind,
        message.name.as_deref().unwrap_or("-"),
        message.service_name.as_deref().unwrap_or("-"),
        message.handle
    );
    if let Some(state) = &message.state {
        println!("  {state}");
    }
    for entry in &message.fields {
        println!("  {}", entry.display());
    }
}

async fn log_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                tracing::debug!(state = %state, "Session state");
            }
            SessionEvent::LoginStatus(state) => {
                tracing::info!(state = %state, "Login status");
            }
            SessionEvent::TokenRenewed { expires_at } => {
                tracing::info!(%expires_at, "Token renewed");
            }
            SessionEvent::TokenRenewalFailed { attempt, error } => {
                tracing::warn!(attempt, error = %error, "Token renewal failed");
            }
            SessionEvent::Unauthenticated => {
                tracing::error!("Token renewal gave up");
            }
            SessionEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
            }
            SessionEvent::Reconnected { attempts } => {
                tracing::info!(attempts, "Reconnected");
            }
            SessionEvent::SessionLost => {
                tracing::error!("Session lost");
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ConsumerConfig) {
    tracing::info!(
        service = %config.subscription.service_name,
        items = ?config.subscription.item_names,
        run_duration_secs = config.run_duration.as_secs(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.stream_url,
        token_url = %config.credentials.token_endpoint(),
        view = ?config.subscription.view_fields,
        "Endpoints"
    );
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
