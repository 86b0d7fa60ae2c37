//! Fraud evaluator binary
//!
//! Reads JSON lines `{"user_id": .., "transaction": {..}}` from stdin and
//! writes one risk score per line to stdout. Logs go to stderr.

use anyhow::Context;
use fraud_engine::notify::ChannelNotifier;
use fraud_engine::{spawn_engine_worker, Config, FraudEngine, Transaction, TransactionSecuritySettings};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Deserialize)]
struct Request {
    user_id: String,
    transaction: Transaction,
    #[serde(default)]
    settings: Option<TransactionSecuritySettings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("FRAUD_ENGINE_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::info!("Starting fraud evaluator");

    // Load configuration
    let config = match std::env::var("FRAUD_ENGINE_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };

    let (notifier, mut notifications) = ChannelNotifier::new(config.notifications.channel_capacity);
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            tracing::info!(
                "Alert {} for {} via {:?}: {}",
                notification.alert.id,
                notification.alert.user_id,
                notification.channels,
                notification.alert.message
            );
        }
    });

    let queue_size = config.worker.queue_size;
    let engine = Arc::new(
        FraudEngine::builder(config)
            .notifier(Arc::new(notifier))
            .build()
            .context("building engine")?,
    );
    let handle = spawn_engine_worker(engine.clone(), queue_size);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let settings = match request.settings {
                    Some(settings) => engine.put_settings(&request.user_id, settings),
                    None => Ok(()),
                };
                match settings {
                    Ok(()) => match handle.evaluate(request.transaction, request.user_id).await {
                        Ok(evaluation) => serde_json::to_string(&evaluation.risk_score)?,
                        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
                    },
                    Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
                }
            }
            Err(e) => serde_json::json!({ "error": format!("malformed request: {}", e) }).to_string(),
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    handle.shutdown().await?;
    tracing::info!(
        "Evaluated {} transactions",
        engine.metrics().evaluations_total.get()
    );
    Ok(())
}
