//! In-process broker: per-run append-only log plus a waiter list, and a
//! plain mutex + broadcast object for the run lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use arbor_schemas::{ControlAction, StreamEvent};

use crate::{BrokerError, CancelSignal, GetOptions, StreamBroker};

struct RunLog {
    resumable: bool,
    /// Sequence id of `events[0]`; stays 1 for resumable logs, advances as
    /// non-resumable reads drain the head.
    head_seq: u64,
    next_seq: u64,
    events: Vec<StreamEvent>,
    notify: Arc<Notify>,
}

impl RunLog {
    fn new(resumable: bool) -> Self {
        Self {
            resumable,
            head_seq: 1,
            next_seq: 1,
            events: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Single-process [`StreamBroker`].
#[derive(Default)]
pub struct MemoryBroker {
    logs: Mutex<HashMap<Uuid, RunLog>>,
    locks: Mutex<HashMap<Uuid, CancelSignal>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take one event at the reader's position without blocking.
    /// Returns the log's notify handle when nothing is available yet.
    async fn poll_next(
        &self,
        run_id: Uuid,
        last_event_id: Option<u64>,
    ) -> Result<(u64, StreamEvent), Arc<Notify>> {
        let mut logs = self.logs.lock().await;
        let log = logs.entry(run_id).or_insert_with(|| RunLog::new(true));

        if log.resumable {
            // Ids past the end of the log behave as if absent.
            let mut after = last_event_id.unwrap_or(0);
            if after >= log.next_seq {
                after = 0;
            }
            let idx = after.saturating_sub(log.head_seq - 1) as usize;
            if let Some(event) = log.events.get(idx) {
                return Ok((log.head_seq + idx as u64, event.clone()));
            }
        } else if let Some(event) = log.events.first() {
            let seq = log.head_seq;
            let event = event.clone();
            log.events.remove(0);
            log.head_seq += 1;
            return Ok((seq, event));
        }

        Err(Arc::clone(&log.notify))
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn get_queue(&self, run_id: Uuid, resumable: bool) {
        let mut logs = self.logs.lock().await;
        logs.entry(run_id)
            .or_insert_with(|| RunLog::new(resumable));
    }

    async fn push(&self, run_id: Uuid, event: StreamEvent) -> Result<u64, BrokerError> {
        let (seq, resumable, notify) = {
            let mut logs = self.logs.lock().await;
            let log = logs.entry(run_id).or_insert_with(|| RunLog::new(true));
            let seq = log.next_seq;
            log.next_seq += 1;
            log.events.push(event);
            (seq, log.resumable, Arc::clone(&log.notify))
        };

        // Resumable logs broadcast to every subscriber; one-shot logs hand
        // the event to a single waiter.
        if resumable {
            notify.notify_waiters();
        } else {
            notify.notify_one();
        }
        Ok(seq)
    }

    async fn get(
        &self,
        run_id: Uuid,
        opts: GetOptions,
        cancel: &CancelSignal,
    ) -> Result<(u64, StreamEvent), BrokerError> {
        let deadline = tokio::time::Instant::now() + opts.timeout;

        loop {
            let notify = match self.poll_next(run_id, opts.last_event_id).await {
                Ok(hit) => return Ok(hit),
                Err(notify) => notify,
            };

            // Register interest before re-checking so a push between the
            // check and the await cannot be missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Ok(hit) = self.poll_next(run_id, opts.last_event_id).await {
                return Ok(hit);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(BrokerError::Timeout),
                _ = cancel.aborted() => return Err(BrokerError::Cancelled),
            }
        }
    }

    async fn lock(&self, run_id: Uuid) -> Result<CancelSignal, BrokerError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(&run_id) {
            return Err(BrokerError::AlreadyLocked(run_id));
        }
        let signal = CancelSignal::new();
        locks.insert(run_id, signal.clone());
        Ok(signal)
    }

    async fn unlock(&self, run_id: Uuid) {
        self.locks.lock().await.remove(&run_id);
    }

    async fn is_locked(&self, run_id: Uuid) -> bool {
        self.locks.lock().await.contains_key(&run_id)
    }

    async fn get_control(&self, run_id: Uuid) -> Option<CancelSignal> {
        self.locks.lock().await.get(&run_id).cloned()
    }

    async fn publish_control(
        &self,
        run_id: Uuid,
        action: ControlAction,
    ) -> Result<(), BrokerError> {
        if let Some(signal) = self.get_control(run_id).await {
            signal.abort(action);
        }
        Ok(())
    }

    async fn drop_queue(&self, run_id: Uuid) {
        let notify = {
            let mut logs = self.logs.lock().await;
            logs.remove(&run_id).map(|log| log.notify)
        };
        // Wake blocked readers so they observe the missing queue as empty
        // rather than hanging until their timeout.
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    async fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: Uuid, n: u64) -> StreamEvent {
        StreamEvent::stream(run_id, "values", json!({ "n": n }))
    }

    #[tokio::test]
    async fn sequence_ids_start_at_one_and_increase() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, true).await;

        for n in 1..=5u64 {
            let seq = broker.push(run_id, event(run_id, n)).await.unwrap();
            assert_eq!(seq, n);
        }
    }

    #[tokio::test]
    async fn resumable_replays_from_any_last_event_id() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, true).await;
        for n in 1..=5u64 {
            broker.push(run_id, event(run_id, n)).await.unwrap();
        }

        let cancel = CancelSignal::new();
        let opts = GetOptions::new(Duration::from_millis(50)).resume_after(2);
        let (seq, ev) = broker.get(run_id, opts, &cancel).await.unwrap();
        assert_eq!(seq, 3);
        assert_eq!(ev.data["n"], 3);

        // Replaying from zero sees the identical sequence again.
        let mut last = 0;
        for expect in 1..=5u64 {
            let opts = GetOptions::new(Duration::from_millis(50)).resume_after(last);
            let (seq, ev) = broker.get(run_id, opts, &cancel).await.unwrap();
            assert_eq!(seq, expect);
            assert_eq!(ev.data["n"], expect);
            last = seq;
        }
    }

    #[tokio::test]
    async fn out_of_range_last_event_id_behaves_as_unset() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, true).await;
        broker.push(run_id, event(run_id, 1)).await.unwrap();

        let cancel = CancelSignal::new();
        let opts = GetOptions::new(Duration::from_millis(50)).resume_after(99);
        let (seq, _) = broker.get(run_id, opts, &cancel).await.unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn non_resumable_drains_on_read() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, false).await;
        broker.push(run_id, event(run_id, 1)).await.unwrap();
        broker.push(run_id, event(run_id, 2)).await.unwrap();

        let cancel = CancelSignal::new();
        let opts = GetOptions::new(Duration::from_millis(50));
        let (s1, _) = broker.get(run_id, opts, &cancel).await.unwrap();
        let (s2, _) = broker.get(run_id, opts, &cancel).await.unwrap();
        assert_eq!((s1, s2), (1, 2));

        // Drained: a third read times out.
        let err = broker.get(run_id, opts, &cancel).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout));
    }

    #[tokio::test]
    async fn get_blocks_until_push_arrives() {
        let broker = Arc::new(MemoryBroker::new());
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, true).await;

        let reader = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let cancel = CancelSignal::new();
                broker
                    .get(run_id, GetOptions::new(Duration::from_secs(2)), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push(run_id, event(run_id, 1)).await.unwrap();

        let (seq, ev) = reader.await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(ev.data["n"], 1);
    }

    #[tokio::test]
    async fn cancelled_wait_returns_cancelled() {
        let broker = Arc::new(MemoryBroker::new());
        let run_id = Uuid::new_v4();
        broker.get_queue(run_id, true).await;

        let cancel = CancelSignal::new();
        let observer = cancel.clone();
        let reader = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .get(run_id, GetOptions::new(Duration::from_secs(5)), &observer)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.abort(ControlAction::Interrupt);

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_unlocked() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();

        let signal = broker.lock(run_id).await.unwrap();
        assert!(broker.is_locked(run_id).await);
        assert!(matches!(
            broker.lock(run_id).await,
            Err(BrokerError::AlreadyLocked(_))
        ));

        broker.publish_control(run_id, ControlAction::Interrupt).await.unwrap();
        assert!(signal.is_aborted());
        assert_eq!(signal.reason(), Some(ControlAction::Interrupt));

        broker.unlock(run_id).await;
        assert!(!broker.is_locked(run_id).await);
        assert!(broker.lock(run_id).await.is_ok());
    }

    #[tokio::test]
    async fn publish_control_without_lock_is_a_no_op() {
        let broker = MemoryBroker::new();
        let run_id = Uuid::new_v4();
        broker
            .publish_control(run_id, ControlAction::Rollback)
            .await
            .unwrap();
        assert!(broker.get_control(run_id).await.is_none());
    }
}
