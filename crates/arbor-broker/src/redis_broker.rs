//! Distributed broker over Redis: per-run streams with app-assigned
//! monotonic ids, pub/sub control channels, and leased run locks.
//!
//! Key layout (one run per family):
//!   arbor:stream:<run_id>            XADD log, entry id `<seq>-0`
//!   arbor:seq:<run_id>               INCR counter backing the entry ids
//!   arbor:resumable:<run_id>         "1" / "0", set once at queue creation
//!   arbor:lock:<run_id>              lease token, TTL-refreshed by holder
//!   arbor:control:<run_id>           pub/sub channel carrying the action

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::streams::StreamRangeReply;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use arbor_schemas::{ControlAction, StreamEvent};

use crate::{BrokerError, CancelSignal, GetOptions, StreamBroker};

/// Lock lease; refreshed at a third of its length while the lock is held.
const LOCK_TTL_SECS: u64 = 60;
const LOCK_REFRESH: Duration = Duration::from_secs(20);
/// Blocking reads poll the stream at this cadence.
const READ_POLL: Duration = Duration::from_millis(50);

struct HeldLock {
    signal: CancelSignal,
    token: String,
    subscriber: JoinHandle<()>,
    refresher: JoinHandle<()>,
}

/// [`StreamBroker`] backed by Redis; safe across processes.
pub struct RedisBroker {
    client: redis::Client,
    held: Mutex<HashMap<Uuid, HeldLock>>,
    /// Local cache of each run's resumable flag.
    resumable: Mutex<HashMap<Uuid, bool>>,
}

fn stream_key(run_id: Uuid) -> String {
    format!("arbor:stream:{run_id}")
}

fn seq_key(run_id: Uuid) -> String {
    format!("arbor:seq:{run_id}")
}

fn resumable_key(run_id: Uuid) -> String {
    format!("arbor:resumable:{run_id}")
}

fn lock_key(run_id: Uuid) -> String {
    format!("arbor:lock:{run_id}")
}

fn control_channel(run_id: Uuid) -> String {
    format!("arbor:control:{run_id}")
}

/// Entry ids are `<seq>-0`; recover the app sequence number.
fn parse_entry_seq(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

impl RedisBroker {
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            held: Mutex::new(HashMap::new()),
            resumable: Mutex::new(HashMap::new()),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, BrokerError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn is_resumable(&self, run_id: Uuid) -> Result<bool, BrokerError> {
        if let Some(flag) = self.resumable.lock().await.get(&run_id) {
            return Ok(*flag);
        }
        let mut conn = self.conn().await?;
        let flag: Option<String> = conn.get(resumable_key(run_id)).await?;
        let resumable = flag.as_deref() != Some("0");
        self.resumable.lock().await.insert(run_id, resumable);
        Ok(resumable)
    }

    fn decode_entry(
        entry: &redis::streams::StreamId,
    ) -> Result<(u64, StreamEvent), BrokerError> {
        let seq = parse_entry_seq(&entry.id).unwrap_or(0);
        let topic: String = entry
            .get("topic")
            .unwrap_or_default();
        let raw: String = entry.get("data").unwrap_or_default();
        let data = serde_json::from_str(&raw)?;
        Ok((seq, StreamEvent { topic, data }))
    }

    /// One non-blocking probe of the run's stream.
    async fn probe(
        &self,
        run_id: Uuid,
        after: u64,
        resumable: bool,
    ) -> Result<Option<(u64, StreamEvent)>, BrokerError> {
        let mut conn = self.conn().await?;
        let key = stream_key(run_id);

        let start = if resumable {
            // Ids past the end of the log behave as if absent.
            let max: Option<u64> = conn.get(seq_key(run_id)).await?;
            let max = max.unwrap_or(0);
            if after > max {
                0
            } else {
                after
            }
        } else {
            0
        };

        let from = format!("{}-0", start + 1);
        let reply: StreamRangeReply = conn.xrange_count(&key, from, "+", 1).await?;
        let Some(entry) = reply.ids.first() else {
            return Ok(None);
        };

        let (seq, event) = Self::decode_entry(entry)?;
        if resumable && start > 0 && seq != start + 1 {
            // The stream lost its head (TTL trim) under a resuming reader.
            return Err(BrokerError::Gap {
                expected: start + 1,
                found: seq,
            });
        }

        if !resumable {
            // One-shot drain: remove the entry from the head of the log.
            let _: i64 = conn.xdel(&key, &[entry.id.as_str()]).await?;
        }
        Ok(Some((seq, event)))
    }

    /// Subscribe to the run's control channel, aborting `signal` when an
    /// action arrives. Runs until the lock is released.
    async fn spawn_control_subscriber(
        &self,
        run_id: Uuid,
        signal: CancelSignal,
    ) -> Result<JoinHandle<()>, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(control_channel(run_id)).await?;

        Ok(tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                match ControlAction::parse(&payload) {
                    Ok(action) => {
                        debug!(%run_id, action = action.as_str(), "control signal received");
                        signal.abort(action);
                    }
                    Err(err) => warn!(%run_id, %err, "ignoring malformed control payload"),
                }
            }
        }))
    }

    fn spawn_lock_refresher(&self, run_id: Uuid, token: String) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOCK_REFRESH);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
                    continue;
                };
                let current: Option<String> = conn.get(lock_key(run_id)).await.unwrap_or(None);
                if current.as_deref() != Some(token.as_str()) {
                    // Lease lost; stop refreshing so the sweeper can act.
                    warn!(%run_id, "run lock lease lost");
                    return;
                }
                let _: Result<bool, _> = conn
                    .expire(lock_key(run_id), LOCK_TTL_SECS as i64)
                    .await;
            }
        })
    }
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn get_queue(&self, run_id: Uuid, resumable: bool) {
        self.resumable.lock().await.insert(run_id, resumable);
        if let Ok(mut conn) = self.conn().await {
            // First writer wins; later subscribers inherit the flag.
            let _: Result<bool, _> = conn
                .set_nx(resumable_key(run_id), if resumable { "1" } else { "0" })
                .await;
        }
    }

    async fn push(&self, run_id: Uuid, event: StreamEvent) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let seq: u64 = conn.incr(seq_key(run_id), 1u64).await?;
        let data = serde_json::to_string(&event.data)?;
        let _: String = conn
            .xadd(
                stream_key(run_id),
                format!("{seq}-0"),
                &[("topic", event.topic.as_str()), ("data", data.as_str())],
            )
            .await?;
        Ok(seq)
    }

    async fn get(
        &self,
        run_id: Uuid,
        opts: GetOptions,
        cancel: &CancelSignal,
    ) -> Result<(u64, StreamEvent), BrokerError> {
        let resumable = self.is_resumable(run_id).await?;
        let after = if resumable {
            opts.last_event_id.unwrap_or(0)
        } else {
            0
        };
        let deadline = tokio::time::Instant::now() + opts.timeout;

        loop {
            if let Some(hit) = self.probe(run_id, after, resumable).await? {
                return Ok(hit);
            }
            tokio::select! {
                _ = tokio::time::sleep(READ_POLL) => {}
                _ = tokio::time::sleep_until(deadline) => return Err(BrokerError::Timeout),
                _ = cancel.aborted() => return Err(BrokerError::Cancelled),
            }
        }
    }

    async fn lock(&self, run_id: Uuid) -> Result<CancelSignal, BrokerError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(lock_key(run_id))
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some())?;
        if !acquired {
            return Err(BrokerError::AlreadyLocked(run_id));
        }

        let signal = CancelSignal::new();
        let subscriber = self.spawn_control_subscriber(run_id, signal.clone()).await?;
        let refresher = self.spawn_lock_refresher(run_id, token.clone());

        self.held.lock().await.insert(
            run_id,
            HeldLock {
                signal: signal.clone(),
                token,
                subscriber,
                refresher,
            },
        );
        Ok(signal)
    }

    async fn unlock(&self, run_id: Uuid) {
        let Some(held) = self.held.lock().await.remove(&run_id) else {
            return;
        };
        held.subscriber.abort();
        held.refresher.abort();

        let Ok(mut conn) = self.conn().await else {
            return;
        };
        // Release only our own lease.
        let current: Option<String> = conn.get(lock_key(run_id)).await.unwrap_or(None);
        if current.as_deref() == Some(held.token.as_str()) {
            let _: Result<i64, _> = conn.del(lock_key(run_id)).await;
        }
    }

    async fn is_locked(&self, run_id: Uuid) -> bool {
        let Ok(mut conn) = self.conn().await else {
            // Can't tell; claim locked so the scheduler skips rather than
            // double-claims.
            return true;
        };
        conn.exists(lock_key(run_id)).await.unwrap_or(true)
    }

    async fn get_control(&self, run_id: Uuid) -> Option<CancelSignal> {
        self.held.lock().await.get(&run_id).map(|h| h.signal.clone())
    }

    async fn publish_control(
        &self,
        run_id: Uuid,
        action: ControlAction,
    ) -> Result<(), BrokerError> {
        // Fast path for a holder in this process; pub/sub covers the rest
        // of the cluster.
        if let Some(signal) = self.get_control(run_id).await {
            signal.abort(action);
        }
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .publish(control_channel(run_id), action.as_str())
            .await?;
        Ok(())
    }

    async fn drop_queue(&self, run_id: Uuid) {
        self.resumable.lock().await.remove(&run_id);
        if let Ok(mut conn) = self.conn().await {
            let _: Result<i64, _> = conn
                .del(&[stream_key(run_id), seq_key(run_id), resumable_key(run_id)])
                .await;
        }
    }

    async fn ready(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_seq_parses_app_assigned_ids() {
        assert_eq!(parse_entry_seq("42-0"), Some(42));
        assert_eq!(parse_entry_seq("1-7"), Some(1));
        assert_eq!(parse_entry_seq("junk"), None);
    }
}
