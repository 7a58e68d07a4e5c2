//! Distributed broker behavior against a real Redis: app-assigned
//! sequence ids, resumable replay, lock exclusivity across broker
//! instances, and control signals reaching a remote holder.
//!
//! Two `RedisBroker` instances sharing one server stand in for two worker
//! processes. Skips when REDIS_URL is not set.

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use arbor_broker::{BrokerError, CancelSignal, GetOptions, RedisBroker, StreamBroker};
use arbor_schemas::{ControlAction, StreamEvent};

fn redis_url() -> Option<String> {
    match std::env::var("REDIS_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("SKIP: REDIS_URL not set");
            None
        }
    }
}

#[tokio::test]
async fn stream_ids_are_monotonic_and_replayable() -> anyhow::Result<()> {
    let Some(url) = redis_url() else { return Ok(()) };
    let producer = RedisBroker::connect(&url)?;
    let consumer = RedisBroker::connect(&url)?;
    let run_id = Uuid::new_v4();

    producer.get_queue(run_id, true).await;
    for n in 1..=4u64 {
        let seq = producer
            .push(run_id, StreamEvent::stream(run_id, "values", json!({"n": n})))
            .await?;
        assert_eq!(seq, n);
    }

    // A consumer in "another process" resumes after id 2.
    let cancel = CancelSignal::new();
    let opts = GetOptions::new(Duration::from_secs(2)).resume_after(2);
    let (seq, event) = consumer.get(run_id, opts, &cancel).await?;
    assert_eq!(seq, 3);
    assert_eq!(event.data["n"], 3);

    // Out-of-range resume behaves as if no last id was given.
    let opts = GetOptions::new(Duration::from_secs(2)).resume_after(99);
    let (seq, _) = consumer.get(run_id, opts, &cancel).await?;
    assert_eq!(seq, 1);

    producer.drop_queue(run_id).await;
    Ok(())
}

#[tokio::test]
async fn non_resumable_queue_drains_on_read() -> anyhow::Result<()> {
    let Some(url) = redis_url() else { return Ok(()) };
    let broker = RedisBroker::connect(&url)?;
    let run_id = Uuid::new_v4();

    broker.get_queue(run_id, false).await;
    broker
        .push(run_id, StreamEvent::stream(run_id, "values", json!({"n": 1})))
        .await?;

    let cancel = CancelSignal::new();
    let opts = GetOptions::new(Duration::from_millis(500));
    let (seq, _) = broker.get(run_id, opts, &cancel).await?;
    assert_eq!(seq, 1);

    let err = broker.get(run_id, opts, &cancel).await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout));

    broker.drop_queue(run_id).await;
    Ok(())
}

#[tokio::test]
async fn lock_is_exclusive_across_instances() -> anyhow::Result<()> {
    let Some(url) = redis_url() else { return Ok(()) };
    let a = RedisBroker::connect(&url)?;
    let b = RedisBroker::connect(&url)?;
    let run_id = Uuid::new_v4();

    let _signal = a.lock(run_id).await?;
    assert!(b.is_locked(run_id).await);
    assert!(matches!(
        b.lock(run_id).await,
        Err(BrokerError::AlreadyLocked(_))
    ));

    a.unlock(run_id).await;
    assert!(!b.is_locked(run_id).await);
    let _signal = b.lock(run_id).await?;
    b.unlock(run_id).await;
    Ok(())
}

#[tokio::test]
async fn control_publish_reaches_the_remote_lock_holder() -> anyhow::Result<()> {
    let Some(url) = redis_url() else { return Ok(()) };
    let holder = RedisBroker::connect(&url)?;
    let canceller = RedisBroker::connect(&url)?;
    let run_id = Uuid::new_v4();

    let signal = holder.lock(run_id).await?;
    // Give the control subscription a moment to be live.
    tokio::time::sleep(Duration::from_millis(200)).await;

    canceller
        .publish_control(run_id, ControlAction::Interrupt)
        .await?;

    tokio::time::timeout(Duration::from_secs(5), signal.aborted())
        .await
        .expect("remote holder must observe the control signal");
    assert_eq!(signal.reason(), Some(ControlAction::Interrupt));

    holder.unlock(run_id).await;
    Ok(())
}
