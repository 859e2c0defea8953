//! End-to-end behaviour of the controller manager against in-memory
//! reconcilers and a fake socket.

mod common;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_agent::{Error, Manager, PollInterval};
use common::{manager, run_for, CountingReconciler, FakeSocket};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_manager_polls_and_reconciles() {
    let socket = FakeSocket::new();
    let manager = manager(socket.clone());
    let reconciler = manager
        .add_reconciler("services", || {
            Ok(CountingReconciler::new("service.event", &["svc-1", "svc-2"])
                .with_interval(Duration::from_millis(100)))
        })
        .unwrap();

    run_for(&manager, Duration::from_millis(300)).await;

    assert!(reconciler.polls() > 0, "expected at least one poll");
    assert!(reconciler.reconciles() > 0, "expected at least one reconcile");
    assert_eq!(socket.publishers(), 1);
}

#[tokio::test]
async fn test_zero_interval_never_polls() {
    let manager = manager(FakeSocket::new());
    let reconciler = manager
        .add_reconciler("paused", || {
            Ok(CountingReconciler::new("paused.event", &["a"]).with_interval(Duration::ZERO))
        })
        .unwrap();

    run_for(&manager, Duration::from_millis(300)).await;

    assert_eq!(reconciler.polls(), 0);
    assert_eq!(reconciler.reconciles(), 0);
}

#[tokio::test]
async fn test_dynamic_interval_resumes_polling() {
    let interval_ms = Arc::new(AtomicU64::new(0));
    let provider = Arc::clone(&interval_ms);

    let manager = manager(FakeSocket::new());
    let reconciler = manager
        .add_reconciler("dynamic", move || {
            Ok(CountingReconciler::new("dynamic.event", &["a"]).with_interval(PollInterval::dynamic(
                move || Duration::from_millis(provider.load(Ordering::SeqCst)),
            )))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(reconciler.polls(), 0);

    interval_ms.store(100, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    token.cancel();
    manager.wait().await;

    assert!(reconciler.polls() > 0, "poller should resume once the interval is set");
    assert!(reconciler.reconciles() > 0);
}

#[tokio::test]
async fn test_recovered_panics_keep_controller_running() {
    let socket = FakeSocket::new();
    let manager = Manager::builder()
        .socket(socket)
        .poll_jitter(Duration::ZERO)
        .recover_panic(true)
        .build()
        .unwrap();

    let reconciler = manager
        .add_reconciler("flaky", || {
            Ok(CountingReconciler::new("flaky.event", &["a", "b"])
                .with_interval(Duration::from_millis(50))
                .on_poll(|n| assert!(n != 3, "poll {n} blew up"))
                .panic_on_reconcile(1))
        })
        .unwrap();

    run_for(&manager, Duration::from_secs(1)).await;

    assert!(reconciler.polls() > 3, "polling should survive a panic");
    assert!(reconciler.reconciles() > 1, "workers should survive a panic");
}

#[tokio::test]
async fn test_unrecovered_reconcile_panic_stops_everything() {
    let manager = manager(FakeSocket::new());
    let reconciler = manager
        .add_reconciler("fragile", || {
            Ok(CountingReconciler::new("fragile.event", &["a"])
                .with_interval(Duration::from_millis(20))
                .panic_on_reconcile(1))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();

    tokio::time::timeout(Duration::from_secs(1), token.cancelled())
        .await
        .expect("reconcile panic did not stop the manager");
    assert!(manager.is_faulted());

    let waited = AssertUnwindSafe(manager.wait()).catch_unwind().await;
    assert!(waited.is_err(), "wait should re-raise the panic");

    // nothing keeps polling a controller whose workers are gone
    let polls = reconciler.polls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reconciler.polls(), polls);
    assert_eq!(reconciler.reconciles(), 1);
}

#[tokio::test]
async fn test_unrecovered_poll_panic_stops_everything() {
    let manager = manager(FakeSocket::new());
    manager
        .add_reconciler("fragile", || {
            Ok(CountingReconciler::new("fragile.event", &["a"])
                .with_interval(Duration::from_millis(20))
                .on_poll(|n| assert!(n != 2, "poll {n} blew up")))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();

    tokio::time::timeout(Duration::from_secs(1), token.cancelled())
        .await
        .expect("poll panic did not stop the manager");
    assert!(AssertUnwindSafe(manager.wait()).catch_unwind().await.is_err());
}

#[tokio::test]
async fn test_publish_expires_cache_and_refetches() {
    let socket = FakeSocket::new();
    let manager = manager(socket.clone());
    let reconciler = manager
        .add_reconciler("services", || {
            Ok(CountingReconciler::new("service.event", &["svc-1"]).with_interval(Duration::from_secs(3600)))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();

    assert!(socket.push("service.event", "svc-1", false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(socket.push("service.event", "svc-1", true));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!socket.push("unknown.event", "svc-1", false));

    token.cancel();
    manager.wait().await;

    let seen = reconciler.seen.lock().clone();
    assert_eq!(
        seen,
        vec![
            ("svc-1".to_string(), "svc-1@1".to_string()),
            ("svc-1".to_string(), "svc-1@2".to_string()),
        ]
    );
    assert_eq!(reconciler.polls(), 0);
}

#[tokio::test]
async fn test_double_start_fails() {
    let manager = manager(FakeSocket::new());
    manager
        .add_reconciler("services", || {
            Ok(CountingReconciler::new("service.event", &[]).with_interval(Duration::from_millis(50)))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();
    assert!(matches!(manager.start(token.clone()), Err(Error::AlreadyStarted)));

    let late = manager.add_reconciler("late", || Ok(CountingReconciler::new("late.event", &[])));
    assert!(matches!(late, Err(Error::WiringAfterStart { .. })));

    token.cancel();
    manager.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_is_never_reconciled_concurrently() {
    let socket = FakeSocket::new();
    let manager = Manager::builder()
        .socket(socket.clone())
        .poll_jitter(Duration::ZERO)
        .max_concurrent_reconciles(4)
        .build()
        .unwrap();

    let reconciler = manager
        .add_reconciler("busy", || {
            Ok(CountingReconciler::new("busy.event", &["a", "b"])
                .with_interval(Duration::from_millis(10))
                .reconcile_delay(|_| Some(Duration::from_millis(30))))
        })
        .unwrap();

    let token = CancellationToken::new();
    manager.start(token.clone()).unwrap();
    for _ in 0..20 {
        socket.push("busy.event", "a", false);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();
    manager.wait().await;

    assert!(reconciler.reconciles() > 2);
    assert_eq!(reconciler.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_socket_join_runs_on_poll_interval() {
    let socket = FakeSocket::new();
    let manager = Manager::builder()
        .socket(socket.clone())
        .poll_interval(Duration::from_millis(50))
        .poll_jitter(Duration::ZERO)
        .build()
        .unwrap();

    run_for(&manager, Duration::from_millis(300)).await;

    assert!(socket.joins.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_typed_lookup() {
    let manager = manager(FakeSocket::new());
    manager
        .add_reconciler("services", || Ok(CountingReconciler::new("service.event", &["svc-1"])))
        .unwrap();

    let found = manager.try_reconciler::<CountingReconciler>("services").unwrap();
    assert_eq!(found.ids, vec!["svc-1".to_string()]);
    assert!(matches!(
        manager.try_reconciler::<CountingReconciler>("missing"),
        Err(Error::ReconcilerNotFound(_))
    ));
}
