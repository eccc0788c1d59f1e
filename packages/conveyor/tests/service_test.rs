//! Scenarios for the composed service: graceful shutdown, lifecycle
//! gating, and readiness.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conveyor::{
    periodic_handler, task_handler, EnqueueOptions, MemoryStorage, PeriodicTaskOptions,
    QueueError, Schedule, Service, ServiceConfig, ServiceState, TaskStatus,
};

#[derive(Debug, Serialize, Deserialize)]
struct Sleepy {
    millis: u64,
}

fn fast_config() -> ServiceConfig {
    ServiceConfig {
        poll_interval: Duration::from_millis(10),
        lock_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_millis(200),
        check_interval: Duration::from_millis(20),
        ..ServiceConfig::default()
    }
}

async fn eventually<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_lets_in_flight_tasks_finish() {
    let storage = Arc::new(MemoryStorage::new());
    let service = Arc::new(
        Service::builder()
            .storage(storage.clone())
            .config(fast_config())
            .build()
            .unwrap(),
    );

    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    service
        .register_handler(task_handler(move |_ctx, task: Sleepy| {
            let started = Arc::clone(&flag);
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(task.millis)).await;
                Ok(())
            }
        }))
        .unwrap();

    let id = service
        .enqueue(&Sleepy { millis: 50 }, EnqueueOptions::new())
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };
    service.ready().await;

    // Cancel while the handler is mid-flight.
    assert!(eventually(|| started.load(Ordering::SeqCst), Duration::from_secs(2)).await);
    ctx.cancel();

    // The handler finishes inside shutdown_timeout and the task is
    // completed, so run returns cleanly.
    run.await.unwrap().unwrap();
    assert_eq!(storage.get_task(id).unwrap().status, TaskStatus::Completed);
    assert!(storage.get_task(id).unwrap().processed_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_timeout_is_reported_when_tasks_overrun() {
    let storage = Arc::new(MemoryStorage::new());
    let service = Arc::new(
        Service::builder()
            .storage(storage.clone())
            .config(ServiceConfig {
                shutdown_timeout: Duration::from_millis(10),
                ..fast_config()
            })
            .build()
            .unwrap(),
    );

    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    service
        .register_handler(task_handler(move |_ctx, task: Sleepy| {
            let started = Arc::clone(&flag);
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(task.millis)).await;
                Ok(())
            }
        }))
        .unwrap();

    service
        .enqueue(&Sleepy { millis: 300 }, EnqueueOptions::new())
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };
    service.ready().await;

    assert!(eventually(|| started.load(Ordering::SeqCst), Duration::from_secs(2)).await);
    ctx.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert_eq!(err, QueueError::ShutdownTimeoutExceeded);
    // The timeout is an error, not a stuck state.
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_is_gated_after_run() {
    let service = Arc::new(
        Service::builder()
            .storage(Arc::new(MemoryStorage::new()))
            .config(fast_config())
            .build()
            .unwrap(),
    );
    service
        .register_handler(periodic_handler("x", |_ctx| async { Ok(()) }))
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };
    service.ready().await;

    assert_eq!(
        service
            .register_handler(periodic_handler("y", |_ctx| async { Ok(()) }))
            .unwrap_err(),
        QueueError::ServiceNotConfiguring
    );
    assert_eq!(
        service
            .add_scheduled_task("y", Schedule::every_minute(), PeriodicTaskOptions::new())
            .unwrap_err(),
        QueueError::ServiceNotConfiguring
    );

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_works_with_worker_skipped() {
    let storage = Arc::new(MemoryStorage::new());
    let service = Arc::new(
        Service::builder()
            .storage(storage.clone())
            .config(fast_config())
            .build()
            .unwrap(),
    );

    // No handlers, no scheduled tasks: both components are skipped,
    // but the service stays up for enqueue.
    let ctx = CancellationToken::new();
    let run = {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };
    service.ready().await;

    service
        .enqueue(&Sleepy { millis: 0 }, EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(storage.task_count(), 1);

    ctx.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn service_runs_scheduler_and_worker_end_to_end() {
    let storage = Arc::new(MemoryStorage::new());
    let service = Arc::new(
        Service::builder()
            .storage(storage.clone())
            .config(fast_config())
            .build()
            .unwrap(),
    );

    let runs = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&runs);
    service
        .register_handler(periodic_handler("heartbeat", move |_ctx| {
            let runs = Arc::clone(&counter);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();
    service
        .add_scheduled_task(
            "heartbeat",
            Schedule::every(Duration::from_secs(1)),
            PeriodicTaskOptions::new(),
        )
        .unwrap();

    let ctx = CancellationToken::new();
    let run = {
        let service = Arc::clone(&service);
        let ctx = ctx.clone();
        tokio::spawn(async move { service.run(ctx).await })
    };
    service.ready().await;
    assert!(service.healthcheck().is_ok());

    assert!(
        eventually(|| runs.load(Ordering::SeqCst) >= 1, Duration::from_secs(5)).await,
        "scheduled task should execute"
    );

    ctx.cancel();
    run.await.unwrap().unwrap();

    let err = service.healthcheck().unwrap_err();
    assert!(err.healthcheck_cause().is_some());
}
