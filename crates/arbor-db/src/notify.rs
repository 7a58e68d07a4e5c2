//! Dedicated LISTEN/NOTIFY connection surfacing "pending run inserted"
//! signals to in-process waiters.
//!
//! One long-lived `PgListener` feeds a broadcast channel. If the listen
//! connection drops, the reader loop marks the notifier disconnected and
//! reconnects with backoff; while disconnected, callers fall back to
//! randomized polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use arbor_broker::CancelSignal;

use crate::error::{Result, StoreError};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const FANOUT_CAPACITY: usize = 1024;

/// Channel carrying pending-run notifications for `schema`: `new_run` in
/// the default schema, `<schema>_new_run` otherwise. Must match the
/// `arbor_notify_new_run` trigger function.
pub fn channel_name(schema: Option<&str>) -> String {
    match schema {
        None | Some("public") => "new_run".to_string(),
        Some(schema) => format!("{schema}_new_run"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The inserted run id, as sent by the trigger.
    Payload(String),
    Timeout,
    Cancelled,
}

pub struct Notifier {
    channel: String,
    tx: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Notifier {
    /// Connect the dedicated listener and start its reader loop.
    pub async fn start(pool: &PgPool, channel: &str) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;

        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let reader = {
            let tx = tx.clone();
            let connected = Arc::clone(&connected);
            let channel = channel.to_string();
            let pool = pool.clone();
            tokio::spawn(async move {
                loop {
                    match listener.recv().await {
                        Ok(notification) => {
                            connected.store(true, Ordering::SeqCst);
                            debug!(payload = notification.payload(), "run notification");
                            let _ = tx.send(notification.payload().to_string());
                        }
                        Err(err) => {
                            warn!(%err, "notify connection lost; reconnecting");
                            connected.store(false, Ordering::SeqCst);
                            loop {
                                tokio::time::sleep(RECONNECT_DELAY).await;
                                match PgListener::connect_with(&pool).await {
                                    Ok(mut next) => match next.listen(&channel).await {
                                        Ok(()) => {
                                            listener = next;
                                            connected.store(true, Ordering::SeqCst);
                                            break;
                                        }
                                        Err(err) => {
                                            warn!(%err, "re-listen failed");
                                        }
                                    },
                                    Err(err) => warn!(%err, "notify reconnect failed"),
                                }
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            channel: channel.to_string(),
            tx,
            connected,
            reader,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// False while the listen connection is down; callers should poll.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Invoke `callback` for every notification until the returned guard is
    /// dropped. The callback runs on the notifier's fan-out task and must
    /// not re-enter the notifier.
    pub fn listen<F>(&self, callback: F) -> Result<ListenGuard>
    where
        F: Fn(&str) + Send + 'static,
    {
        if !self.is_connected() {
            return Err(StoreError::Internal(
                "notifier disconnected; poll instead".into(),
            ));
        }
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => callback(&payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(ListenGuard { handle })
    }

    /// Block up to `timeout` for the next notification.
    pub async fn wait_for_notification(
        &self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> WaitOutcome {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(payload) => return WaitOutcome::Payload(payload),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return WaitOutcome::Timeout,
                },
                _ = tokio::time::sleep_until(deadline) => return WaitOutcome::Timeout,
                _ = cancel.aborted() => return WaitOutcome::Cancelled,
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Unsubscribes its callback when dropped.
pub struct ListenGuard {
    handle: JoinHandle<()>,
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
