//! Admin notification sink.
//!
//! `NatsNotify` publishes every domain event emitted by the classifier to
//! a single subject, modeled on the teacher's `EventSystem` in events.rs
//! (same `async_nats::ConnectOptions` retry/backoff shape). Publishing is
//! decoupled from the classifier tick via a bounded `mpsc` channel so a
//! slow or absent NATS connection never stalls a tick (spec.md §4.7).

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, warn};

#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, message: String);
}

pub struct NullNotify;

#[async_trait]
impl NotifySink for NullNotify {
    async fn send(&self, _message: String) {}
}

pub struct NatsNotify {
    tx: mpsc::Sender<String>,
}

impl NatsNotify {
    /// Connects in the background; the returned sink is usable immediately,
    /// queuing messages until the connection completes (or drops them once
    /// the queue fills, per the same degrade-gracefully policy as C3's
    /// persist retries).
    pub async fn connect(url: String, subject: String, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel::<String>(queue_depth);
        let mut messages = ReceiverStream::new(rx);

        tokio::spawn(async move {
            let client = async_nats::ConnectOptions::new()
                .retry_on_initial_connect()
                .reconnect_delay_callback(|attempts| {
                    Duration::from_millis(std::cmp::min(attempts as u64 * 200, 5_000))
                })
                .connect(&url)
                .await;

            let client = match client {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, %url, "giving up connecting to notify sink; messages will be dropped");
                    while messages.next().await.is_some() {}
                    return;
                }
            };

            while let Some(message) = messages.next().await {
                if let Err(e) = client.publish(subject.clone(), message.into()).await {
                    warn!(error = %e, "failed to publish notification");
                }
            }
        });

        Self { tx }
    }
}

#[async_trait]
impl NotifySink for NatsNotify {
    async fn send(&self, message: String) {
        if self.tx.try_send(message).is_err() {
            warn!("notify queue full; dropping message");
        }
    }
}
