//! End-to-end delivery tests for the dispatch runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use chanq_core::{BindingRegistry, LeaseConfig, NotificationStore, StoreConfig};
use chanq_proto::{ChangeRecord, ChannelBinding, Operation};
use chanq_server::{
    handler_fn, DispatchConfig, Dispatcher, HandlerError, NotificationHandler, NotificationService,
    ServerConfig,
};

fn bindings() -> Arc<BindingRegistry> {
    Arc::new(
        BindingRegistry::from_bindings([
            ChannelBinding::new("nix_channel_channel", "NixChannel"),
            ChannelBinding::locked("nix_evaluation_channel", "NixEvaluation"),
            ChannelBinding::new("nix_derivation_channel", "NixDerivation"),
            ChannelBinding::locked("cve_record_channel", "CveRecord"),
        ])
        .unwrap(),
    )
}

fn service(workers: usize, lease_timeout: Duration) -> NotificationService {
    let store = NotificationStore::open(&StoreConfig::temporary()).unwrap();
    let config = ServerConfig::default()
        .with_consumer_id("it")
        .with_lease(LeaseConfig::default().with_lease_timeout(lease_timeout))
        .with_dispatch(
            DispatchConfig::default()
                .with_workers_per_channel(workers)
                .with_batch_size(8)
                .with_poll_interval(Duration::from_millis(20)),
        );
    NotificationService::new(&config, bindings(), Arc::new(store))
}

fn recording(seen: Arc<Mutex<Vec<String>>>) -> impl NotificationHandler {
    handler_fn(move |record: ChangeRecord| {
        let seen = seen.clone();
        async move {
            // Yield so that concurrent dispatchers interleave.
            tokio::task::yield_now().await;
            seen.lock().push(record.primary_key);
            Ok(())
        }
    })
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locked_channel_two_dispatchers_process_each_record_once() {
    let service = service(2, Duration::from_secs(30));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut consumers = service.consumers();
    consumers
        .on_notification("CveRecord", recording(seen.clone()))
        .unwrap();

    let handle = service.start(&consumers);
    let producer = handle.producer();
    for pk in ["A", "B", "C"] {
        producer.notify("CveRecord", pk, Operation::Insert).unwrap();
    }

    let queue = service.queue().clone();
    wait_for(|| queue.is_empty("cve_record_channel").unwrap()).await;
    handle.shutdown().await.unwrap();

    let mut processed = seen.lock().clone();
    processed.sort();
    assert_eq!(processed, vec!["A", "B", "C"]);
    assert_eq!(handle.stats().channel_totals("cve_record_channel").processed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locked_channel_many_workers_no_duplicates() {
    let service = service(4, Duration::from_secs(30));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut consumers = service.consumers();
    consumers
        .on_notification("NixEvaluation", recording(seen.clone()))
        .unwrap();

    let handle = service.start(&consumers);
    let producer = handle.producer();
    for i in 0..100 {
        producer
            .notify("NixEvaluation", format!("eval-{i}"), Operation::Update)
            .unwrap();
    }

    let queue = service.queue().clone();
    wait_for(|| queue.is_empty("nix_evaluation_channel").unwrap()).await;
    handle.shutdown().await.unwrap();

    let mut processed = seen.lock().clone();
    assert_eq!(processed.len(), 100);
    processed.sort();
    processed.dedup();
    assert_eq!(processed.len(), 100);
}

/// Handler that signals when called and then never finishes.
fn hanging(started: mpsc::UnboundedSender<String>) -> Arc<dyn NotificationHandler> {
    Arc::new(handler_fn(move |record: ChangeRecord| {
        let started = started.clone();
        async move {
            let _ = started.send(record.primary_key);
            std::future::pending::<()>().await;
            Ok(())
        }
    }))
}

fn dispatcher(service: &NotificationService, id: &str, channel: &str, handler: Arc<dyn NotificationHandler>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        id,
        service.registry().channel(channel).unwrap().clone(),
        service.queue().clone(),
        service.locks().clone(),
        handler,
        DispatchConfig::default(),
    ))
}

#[tokio::test]
async fn unlocked_record_redelivered_after_consumer_killed() {
    let service = service(1, Duration::from_secs(30));
    service
        .producer()
        .notify("NixDerivation", "X", Operation::Insert)
        .unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let doomed = dispatcher(&service, "doomed", "nix_derivation_channel", hanging(started_tx));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let rx = shutdown_rx.clone();
    let task = tokio::spawn(async move { doomed.poll_once(&rx).await });
    assert_eq!(started_rx.recv().await.unwrap(), "X");
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let survivor = dispatcher(
        &service,
        "survivor",
        "nix_derivation_channel",
        Arc::new(recording(seen.clone())),
    );
    let outcome = survivor.poll_once(&shutdown_rx).await.unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(*seen.lock(), vec!["X"]);
    assert!(service.queue().is_empty("nix_derivation_channel").unwrap());
}

#[tokio::test]
async fn locked_record_recovered_only_after_lease_timeout() {
    let service = service(1, Duration::from_millis(300));
    service
        .producer()
        .notify("CveRecord", "CVE-2024-3094", Operation::Update)
        .unwrap();

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let doomed = dispatcher(&service, "doomed", "cve_record_channel", hanging(started_tx));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let rx = shutdown_rx.clone();
    let task = tokio::spawn(async move { doomed.poll_once(&rx).await });
    started_rx.recv().await.unwrap();
    task.abort();
    let _ = task.await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let survivor = dispatcher(&service, "survivor", "cve_record_channel", Arc::new(recording(seen.clone())));

    // The crashed holder's lease is still live.
    let early = survivor.poll_once(&shutdown_rx).await.unwrap();
    assert_eq!(early.processed, 0);
    assert!(seen.lock().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let late = survivor.poll_once(&shutdown_rx).await.unwrap();
    assert_eq!(late.processed, 1);
    assert_eq!(*seen.lock(), vec!["CVE-2024-3094"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_callback_is_retried() {
    let service = service(1, Duration::from_secs(30));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let mut consumers = service.consumers();
    consumers
        .on_notification(
            "NixChannel",
            handler_fn(move |_record: ChangeRecord| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(HandlerError::new("mirror unreachable"));
                    }
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = service.start(&consumers);
    handle
        .producer()
        .notify("NixChannel", "nixos-24.05", Operation::Update)
        .unwrap();

    let queue = service.queue().clone();
    wait_for(|| queue.is_empty("nix_channel_channel").unwrap()).await;
    handle.shutdown().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let totals = handle.stats().totals();
    assert_eq!(totals.failed, 2);
    assert_eq!(totals.processed, 1);
}

async fn failing_records_ahead_do_not_block(entity_type: &'static str, channel: &'static str) {
    let service = service(1, Duration::from_secs(30));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));

    let (recorder, counter) = (seen.clone(), attempts.clone());
    let mut consumers = service.consumers();
    consumers
        .on_notification(
            entity_type,
            handler_fn(move |record: ChangeRecord| {
                let (recorder, counter) = (recorder.clone(), counter.clone());
                async move {
                    if record.primary_key.starts_with("bad-") {
                        counter.fetch_add(1, Ordering::SeqCst);
                        return Err(HandlerError::new("unparseable row"));
                    }
                    recorder.lock().push(record.primary_key);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = service.start(&consumers);
    let producer = handle.producer();
    // More failing records than fit in one batch.
    for i in 0..10 {
        producer.notify(entity_type, format!("bad-{i}"), Operation::Insert).unwrap();
    }
    producer.notify(entity_type, "good", Operation::Insert).unwrap();

    wait_for(|| !seen.lock().is_empty()).await;

    // Failing records are retried at the poll interval, not in a tight loop.
    let before = attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let retried = attempts.load(Ordering::SeqCst) - before;
    handle.shutdown().await.unwrap();

    assert_eq!(*seen.lock(), vec!["good"]);
    assert!(retried < 500, "{retried} retries in 200ms");
    assert_eq!(service.queue().len(channel).unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_records_ahead_do_not_block_unlocked_channel() {
    failing_records_ahead_do_not_block("NixDerivation", "nix_derivation_channel").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_records_ahead_do_not_block_locked_channel() {
    failing_records_ahead_do_not_block("CveRecord", "cve_record_channel").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_slower_than_lease_runs_once() {
    let service = service(2, Duration::from_millis(100));
    let invocations = Arc::new(Mutex::new(Vec::new()));

    let calls = invocations.clone();
    let mut consumers = service.consumers();
    consumers
        .on_notification(
            "NixEvaluation",
            handler_fn(move |record: ChangeRecord| {
                let calls = calls.clone();
                async move {
                    calls.lock().push(record.primary_key);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();

    let handle = service.start(&consumers);
    handle
        .producer()
        .notify("NixEvaluation", "eval-1", Operation::Update)
        .unwrap();

    let queue = service.queue().clone();
    wait_for(|| queue.is_empty("nix_evaluation_channel").unwrap()).await;
    // Give the second dispatcher a few more polls to misbehave.
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.shutdown().await.unwrap();

    assert_eq!(*invocations.lock(), vec!["eval-1"]);
    let totals = handle.stats().channel_totals("nix_evaluation_channel");
    assert_eq!(totals.processed, 1);
    assert_eq!(totals.lease_conflicts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_in_one_channel_does_not_stop_another() {
    let service = service(1, Duration::from_secs(30));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut consumers = service.consumers();
    consumers
        .on_notification(
            "NixDerivation",
            handler_fn(|record: ChangeRecord| async move {
                if record.primary_key == "hello" {
                    panic!("derivation parser exploded");
                }
                Ok(())
            }),
        )
        .unwrap()
        .on_notification("NixChannel", recording(seen.clone()))
        .unwrap();

    let handle = service.start(&consumers);
    let producer = handle.producer();
    producer.notify("NixDerivation", "hello", Operation::Insert).unwrap();
    producer.notify("NixChannel", "nixos-unstable", Operation::Update).unwrap();

    wait_for(|| !seen.lock().is_empty()).await;
    let derivations = handle.stats().channel_totals("nix_derivation_channel");
    handle.shutdown().await.unwrap();

    assert_eq!(*seen.lock(), vec!["nixos-unstable"]);
    assert_eq!(derivations.processed, 0);
    assert_eq!(service.queue().len("nix_derivation_channel").unwrap(), 1);
}
