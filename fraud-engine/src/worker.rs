//! Async front for the engine
//!
//! [`EngineHandle`] is cheap to clone and sends requests through a bounded
//! mailbox to a single dispatcher task. Evaluations run on the blocking
//! pool, so callers for different users proceed in parallel while the
//! engine's per-user locks keep each user's history consistent.

use crate::alerts::SecurityAlert;
use crate::engine::{Evaluation, FraudEngine};
use crate::{Error, Result, Transaction};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Message sent to the engine worker
pub enum EngineMessage {
    /// Evaluate a transaction
    Evaluate {
        transaction: Transaction,
        user_id: String,
        response: oneshot::Sender<Result<Evaluation>>,
    },

    /// Resolve an alert
    ResolveAlert {
        alert_id: Uuid,
        resolution: String,
        response: oneshot::Sender<Result<SecurityAlert>>,
    },

    /// Stop the worker
    Shutdown,
}

/// Handle to the engine worker
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineMessage>,
}

impl EngineHandle {
    /// Evaluate a transaction
    pub async fn evaluate(&self, transaction: Transaction, user_id: impl Into<String>) -> Result<Evaluation> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::Evaluate {
            transaction,
            user_id: user_id.into(),
            response: tx,
        })
        .await?;

        rx.await.map_err(|_| stopped("response channel closed"))?
    }

    /// Resolve an alert
    pub async fn resolve_alert(&self, alert_id: Uuid, resolution: impl Into<String>) -> Result<SecurityAlert> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::ResolveAlert {
            alert_id,
            resolution: resolution.into(),
            response: tx,
        })
        .await?;

        rx.await.map_err(|_| stopped("response channel closed"))?
    }

    /// Shutdown worker
    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineMessage::Shutdown).await
    }

    async fn send(&self, message: EngineMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| stopped("mailbox closed"))
    }
}

fn stopped(detail: &str) -> Error {
    Error::DependencyUnavailable(format!("engine worker: {}", detail))
}

/// Spawn the engine worker
pub fn spawn_engine_worker(engine: Arc<FraudEngine>, queue_size: usize) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel(queue_size.max(1));

    tokio::spawn(async move {
        info!("Engine worker started");

        while let Some(message) = rx.recv().await {
            match message {
                EngineMessage::Evaluate {
                    transaction,
                    user_id,
                    response,
                } => {
                    let engine = Arc::clone(&engine);
                    tokio::task::spawn_blocking(move || {
                        let result = engine.evaluate(&transaction, &user_id);
                        if response.send(result).is_err() {
                            debug!("Caller dropped evaluation of {}", transaction.id);
                        }
                    });
                }
                EngineMessage::ResolveAlert {
                    alert_id,
                    resolution,
                    response,
                } => {
                    let engine = Arc::clone(&engine);
                    tokio::task::spawn_blocking(move || {
                        let _ = response.send(engine.resolve_alert(alert_id, &resolution));
                    });
                }
                EngineMessage::Shutdown => {
                    info!("Engine worker shutting down");
                    break;
                }
            }
        }

        info!("Engine worker stopped");
    });

    EngineHandle { sender: tx }
}
