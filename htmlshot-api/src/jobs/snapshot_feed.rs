//! Snapshot Feed Subscription
//!
//! Holds one long-lived WebSocket connection to the origin service. Every
//! text or binary frame carries a full JSON [`Snapshot`]; each one replaces
//! the replica's tables in a single LMDB transaction. Frames that fail to
//! decode are logged and skipped so one bad push cannot wedge the feed.
//!
//! The connection is re-established with jittered exponential backoff. The
//! backoff resets after every successful connect. The task exits when the
//! shutdown channel flips to `true` or its sender is dropped.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use htmlshot_core::Snapshot;
use htmlshot_storage::AuthReplica;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ReconnectConfig;
use crate::telemetry::METRICS;

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotFeedConfig {
    /// `ws://` endpoint of the origin's snapshot feed.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` on the upgrade request.
    pub token: Option<SecretString>,
    pub reconnect: ReconnectConfig,
}

fn record_event(event: &str) {
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_feed_event(event);
    }
}

// ============================================================================
// TASK
// ============================================================================

/// Spawn the feed task.
pub fn spawn_snapshot_feed(
    replica: Arc<AuthReplica>,
    config: SnapshotFeedConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(url = %config.url, "Snapshot feed started");
        let reconnect = config.reconnect.clone();
        let mut backoff = reconnect.initial_ms;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = connect(&config) => result,
                _ = shutdown_rx.changed() => break,
            };

            match connected {
                Ok(mut stream) => {
                    tracing::info!(url = %config.url, "Snapshot feed connected");
                    record_event("connected");
                    backoff = reconnect.initial_ms;

                    loop {
                        tokio::select! {
                            message = stream.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    apply_frame(&replica, text.as_bytes()).await;
                                }
                                Some(Ok(Message::Binary(bytes))) => {
                                    apply_frame(&replica, &bytes).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    tracing::warn!(error = %err, "Snapshot feed read failed");
                                    break;
                                }
                            },
                            _ = shutdown_rx.changed() => {
                                if let Err(err) = stream.close(None).await {
                                    tracing::debug!(error = %err, "Snapshot feed close failed");
                                }
                                tracing::info!("Snapshot feed shutting down");
                                return;
                            }
                        }
                    }

                    tracing::warn!("Snapshot feed disconnected");
                    record_event("disconnected");
                }
                Err(err) => {
                    tracing::warn!(error = %err, backoff_ms = backoff, "Snapshot feed connect failed");
                    record_event("connect_failed");
                }
            }

            let delay = jittered_backoff(backoff, reconnect.jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = shutdown_rx.changed() => break,
            }

            let next = (backoff as f64 * reconnect.multiplier) as u64;
            backoff = next.min(reconnect.max_ms);
        }

        tracing::info!("Snapshot feed shutting down");
    })
}

async fn connect(config: &SnapshotFeedConfig) -> Result<FeedStream, tungstenite::Error> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
        value.set_sensitive(true);
        request.headers_mut().insert("authorization", value);
    }
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Decode one frame and apply it. Never fails the feed.
async fn apply_frame(replica: &Arc<AuthReplica>, payload: &[u8]) {
    let snapshot: Snapshot = match serde_json::from_slice(payload) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(error = %err, bytes = payload.len(), "Skipping undecodable snapshot frame");
            record_event("decode_error");
            return;
        }
    };

    let replica = Arc::clone(replica);
    match tokio::task::spawn_blocking(move || replica.apply_snapshot(&snapshot)).await {
        Ok(Ok(status)) => {
            tracing::debug!(last_update = status.last_update, "Snapshot feed frame applied");
            record_event("applied");
            if let Ok(metrics) = METRICS.as_ref() {
                metrics.set_replica_status(&status);
            }
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "Failed to apply auth snapshot");
            record_event("apply_failed");
        }
        Err(err) => {
            tracing::error!(error = %err, "Snapshot apply task panicked");
            record_event("apply_failed");
        }
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}
