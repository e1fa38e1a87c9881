use super::*;
use crate::scheduler::triggers::{DateSchedule, Trigger};

use std::sync::atomic::AtomicUsize;

fn runner() -> JobRunner {
    JobRunner::new(
        Duration::seconds(60),
        3,
        std::time::Duration::from_millis(100),
    )
}

fn counting_callback(counter: Arc<AtomicUsize>) -> JobCallback {
    Arc::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
}

fn interval_trigger(anchor: DateTime<Utc>, secs: u32) -> Trigger {
    Trigger::parse(&format!("every {}s", secs), Some(anchor)).unwrap()
}

async fn settle() {
    // Let spawned callbacks run to completion.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_due_job_fires_and_advances() {
    let runner = runner();
    let fired = Arc::new(AtomicUsize::new(0));
    let now = Utc::now();
    let anchor = now - Duration::seconds(30);
    let id = Uuid::new_v4();

    runner
        .add_job(id, interval_trigger(anchor, 10), now, counting_callback(Arc::clone(&fired)))
        .await;

    runner.dispatch_due(now).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let (next, _) = runner.job_info(&id).await.unwrap();
    assert!(next > now);
}

#[tokio::test]
async fn test_not_yet_due_job_does_not_fire() {
    let runner = runner();
    let fired = Arc::new(AtomicUsize::new(0));
    let now = Utc::now();
    let id = Uuid::new_v4();

    runner
        .add_job(
            id,
            interval_trigger(now, 60),
            now + Duration::seconds(60),
            counting_callback(Arc::clone(&fired)),
        )
        .await;

    runner.dispatch_due(now).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_misfire_beyond_grace_dropped() {
    let runner = runner();
    let fired = Arc::new(AtomicUsize::new(0));
    let now = Utc::now();
    let id = Uuid::new_v4();

    // Due five minutes ago, grace is one minute: the fire must be dropped
    // but the trigger still advances.
    runner
        .add_job(
            id,
            interval_trigger(now - Duration::seconds(600), 30),
            now - Duration::minutes(5),
            counting_callback(Arc::clone(&fired)),
        )
        .await;

    runner.dispatch_due(now).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    let (next, _) = runner.job_info(&id).await.unwrap();
    assert!(next > now);
}

#[tokio::test]
async fn test_one_shot_self_removes() {
    let runner = runner();
    let fired = Arc::new(AtomicUsize::new(0));
    let now = Utc::now();
    let at = now - Duration::seconds(5);
    let id = Uuid::new_v4();

    runner
        .add_job(
            id,
            Trigger::Date(DateSchedule { at }),
            at,
            counting_callback(Arc::clone(&fired)),
        )
        .await;

    runner.dispatch_due(now).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(runner.job_info(&id).await.is_none());
    assert_eq!(runner.job_count().await, 0);
}

#[tokio::test]
async fn test_instance_ceiling_skips_fire() {
    let runner = JobRunner::new(
        Duration::seconds(60),
        1,
        std::time::Duration::from_millis(100),
    );
    let started = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(tokio::sync::Notify::new());
    let now = Utc::now();
    let id = Uuid::new_v4();

    let callback: JobCallback = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        Arc::new(move || {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            })
        })
    };

    runner
        .add_job(id, interval_trigger(now - Duration::seconds(10), 1), now, callback)
        .await;

    // First dispatch starts the callback, which then blocks.
    runner.dispatch_due(now).await;
    settle().await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // Second due fire while the first is still running is skipped.
    runner.dispatch_due(now + Duration::seconds(2)).await;
    settle().await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    // Once released, the next due fire goes through again.
    release.notify_waiters();
    settle().await;
    runner.dispatch_due(now + Duration::seconds(4)).await;
    settle().await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remove_job_idempotent() {
    let runner = runner();
    let now = Utc::now();
    let id = Uuid::new_v4();

    runner
        .add_job(
            id,
            interval_trigger(now, 60),
            now + Duration::seconds(60),
            counting_callback(Arc::new(AtomicUsize::new(0))),
        )
        .await;

    assert!(runner.remove_job(&id).await);
    assert!(!runner.remove_job(&id).await);
    assert!(!runner.remove_job(&Uuid::new_v4()).await);
}
