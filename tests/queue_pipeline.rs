//! End-to-end queue scenarios: priority ordering, retry exhaustion, and
//! crash/resume against a real state file.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use videoarchiver::archiver::settings::ArchiverSettings;
use videoarchiver::{ItemStatus, QueueItem, QueueManager, ShutdownSignal};

fn settings_with_state(dir: &std::path::Path) -> ArchiverSettings {
    let mut settings = ArchiverSettings::default();
    settings.queue.concurrent_downloads = 1;
    settings.persistence.path = Some(dir.join("queue_state.json"));
    settings
}

#[test]
fn priority_ordering_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_state(dir.path());

    // First process lifetime: submit A (pri 0) and B (pri 5), snapshot on
    // submit write-through, then die without a clean shutdown.
    {
        let shutdown = Arc::new(ShutdownSignal::new());
        let manager = QueueManager::new(&settings, shutdown);
        manager.submit("https://a", 1, 10, 100, 1, 0).unwrap();
        manager.submit("https://b", 2, 10, 100, 1, 5).unwrap();
        // No shutdown: simulate a crash by dropping everything.
    }

    // Second lifetime: state reloads, indices rebuild, and the worker
    // claims in (−priority, added_at) order.
    let shutdown = Arc::new(ShutdownSignal::new());
    let manager = QueueManager::new(&settings, shutdown);
    let (pending, processing, _, _) = manager.global_counts();
    assert_eq!((pending, processing), (2, 0));

    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let order_clone = order.clone();
    manager.run(Arc::new(move |item: &mut QueueItem| {
        order_clone.lock().unwrap().push(item.url.clone());
        (true, None)
    }));
    assert!(manager.wait_idle(Duration::from_secs(30)));
    manager.shutdown(Duration::from_secs(10));

    assert_eq!(*order.lock().unwrap(), vec!["https://b", "https://a"]);
    assert_eq!(manager.item_status("https://a"), Some(ItemStatus::Completed));
    assert_eq!(manager.item_status("https://b"), Some(ItemStatus::Completed));
}

#[test]
fn perpetually_failing_item_fails_exactly_after_max_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings_with_state(dir.path());
    settings.queue.max_retries = 2;

    let shutdown = Arc::new(ShutdownSignal::new());
    let manager = QueueManager::new(&settings, shutdown);
    manager.submit("https://u", 1, 10, 100, 1, 0).unwrap();

    let attempts = Arc::new(Mutex::new(0u32));
    let attempts_clone = attempts.clone();
    manager.run(Arc::new(move |_item: &mut QueueItem| {
        *attempts_clone.lock().unwrap() += 1;
        (false, Some("DownloadFailed: x".to_string()))
    }));
    assert!(manager.wait_idle(Duration::from_secs(30)));
    manager.shutdown(Duration::from_secs(10));

    assert_eq!(*attempts.lock().unwrap(), 3);
    assert_eq!(manager.item_status("https://u"), Some(ItemStatus::Failed));

    let metrics = manager.metrics_snapshot();
    assert_eq!(metrics.total_processed, 3);
    assert_eq!(metrics.total_failed, 3);

    // The terminal state is durable: a restart still knows the failure.
    let shutdown = Arc::new(ShutdownSignal::new());
    let reloaded = QueueManager::new(&settings, shutdown);
    assert_eq!(reloaded.item_status("https://u"), Some(ItemStatus::Failed));
    assert_eq!(reloaded.metrics_snapshot().total_failed, 3);
}

#[test]
fn interrupted_processing_items_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_state(dir.path());

    // Crash while an item is mid-flight: persistence captured it in the
    // processing set.
    {
        let shutdown = Arc::new(ShutdownSignal::new());
        let manager = QueueManager::new(&settings, shutdown);
        manager.submit("https://inflight", 1, 10, 100, 1, 0).unwrap();

        let started = Arc::new(Mutex::new(false));
        let started_clone = started.clone();
        manager.run(Arc::new(move |_item: &mut QueueItem| {
            *started_clone.lock().unwrap() = true;
            // Park the attempt so the item stays in processing; the
            // abandoned worker thread dies with the test process, the way a
            // killed process abandons its workers.
            std::thread::sleep(Duration::from_secs(120));
            (false, Some("Shutdown: killed".to_string()))
        }));

        // Wait until the worker holds the item, snapshot, then "crash".
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !*started.lock().unwrap() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.snapshot_now();
        // Drop without shutdown: threads are abandoned like a killed
        // process would abandon them.
    }

    let shutdown = Arc::new(ShutdownSignal::new());
    let manager = QueueManager::new(&settings, shutdown);
    // The loader repairs invariants: the interrupted item is present and
    // will be picked up again once workers start.
    let status = manager.item_status("https://inflight");
    assert!(
        matches!(status, Some(ItemStatus::Processing) | Some(ItemStatus::Pending)),
        "interrupted item must survive the restart, got {status:?}"
    );
}

#[test]
fn submit_while_running_wakes_workers() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_with_state(dir.path());
    let shutdown = Arc::new(ShutdownSignal::new());
    let manager = QueueManager::new(&settings, shutdown);

    manager.run(Arc::new(|_item: &mut QueueItem| (true, None)));
    for i in 0..10 {
        manager
            .submit(format!("https://v/{i}"), i, 10, 100, 1, (i % 3) as u8)
            .unwrap();
    }
    assert!(manager.wait_idle(Duration::from_secs(30)));
    manager.shutdown(Duration::from_secs(10));

    let (_, _, completed, failed) = manager.global_counts();
    assert_eq!((completed, failed), (10, 0));
}
