use ace::core::scheduler::{RecurringJob, Trigger, WorkerPool, parse_crontab};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

#[test]
fn test_parse_crontab_accepts_five_field_lines() {
    // Classic crontab: minute hour dom month dow.
    assert!(parse_crontab("0 2 * * *").is_ok());
    assert!(parse_crontab("*/5 * * * 1-5").is_ok());
}

#[test]
fn test_parse_crontab_accepts_lines_with_seconds() {
    assert!(parse_crontab("30 0 2 * * *").is_ok());
}

#[test]
fn test_parse_crontab_rejects_garbage() {
    assert!(parse_crontab("not a crontab").is_err());
    assert!(parse_crontab("99 99 * * *").is_err());
    assert!(parse_crontab("").is_err());
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("jobs did not finish in time");
}

#[tokio::test]
async fn test_worker_pool_runs_every_submitted_job() {
    let (pool, driver) = WorkerPool::new(4);
    let (shutdown_tx, _) = broadcast::channel(1);
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let counter = counter.clone();
        pool.submit(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    wait_for(&counter, 16).await;
    shutdown_tx.send(()).unwrap();
    driver_handle.await.unwrap();
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let (pool, driver) = WorkerPool::new(2);
    let (shutdown_tx, _) = broadcast::channel(1);
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let current = current.clone();
        let peak = peak.clone();
        let done = done.clone();
        pool.submit(async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    wait_for(&done, 8).await;
    assert!(peak.load(Ordering::SeqCst) <= 2, "worker pool exceeded its size");

    shutdown_tx.send(()).unwrap();
    driver_handle.await.unwrap();
}

#[tokio::test]
async fn test_recurring_job_suppresses_overlapping_instances() {
    let (pool, driver) = WorkerPool::new(4);
    let (shutdown_tx, _) = broadcast::channel(1);
    let driver_handle = tokio::spawn(driver.run(shutdown_tx.subscribe()));

    let starts = Arc::new(AtomicUsize::new(0));
    let starts_in_factory = starts.clone();
    let job = RecurringJob::new(
        "overlap-test",
        Trigger::Interval(Duration::from_millis(20)),
        move || {
            let starts = starts_in_factory.clone();
            Box::pin(async move {
                starts.fetch_add(1, Ordering::SeqCst);
                // Far longer than the interval: later firings must be
                // skipped, not queued.
                tokio::time::sleep(Duration::from_millis(500)).await;
            })
        },
    );

    let job_handle = tokio::spawn(job.run(pool, shutdown_tx.subscribe()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        starts.load(Ordering::SeqCst),
        1,
        "a still-running instance must suppress the next firing"
    );

    shutdown_tx.send(()).unwrap();
    let _ = job_handle.await;
    driver_handle.await.unwrap();
}
