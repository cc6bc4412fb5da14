use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::archiver::domain::QueueItem;
use crate::archiver::queue::state::FinalizeOutcome;
use crate::archiver::queue::{Inner, ItemHandler};
use crate::sync_ext::{CondvarExt, MutexExt};

/// How long an idle worker parks before re-checking the shutdown flag.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Spawn the worker pool. Pool size is already clamped by the caller.
pub(super) fn spawn_workers(
    inner: &Arc<Inner>,
    handler: Arc<dyn ItemHandler>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let inner_clone = inner.clone();
        let handler_clone = handler.clone();
        let result = std::thread::Builder::new()
            .name(format!("archiver-worker-{index}"))
            .spawn(move || worker_loop(&inner_clone, &*handler_clone));
        match result {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                error!(index, error = %err, "failed to spawn worker thread");
                break;
            }
        }
    }
    info!(workers = handles.len(), "worker pool started");
    handles
}

/// Claim, process, finalize, repeat until shutdown.
fn worker_loop(inner: &Arc<Inner>, handler: &dyn ItemHandler) {
    loop {
        let mut item = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                if inner.shutdown.is_triggered() {
                    return;
                }
                if let Some(item) = state.claim_next() {
                    state.metrics.touch_activity();
                    break item;
                }
                let (guard, _timeout) = inner.cv.wait_timeout_unpoisoned(state, IDLE_WAIT);
                state = guard;
            }
        };

        debug!(url = %item.url, retry = item.retry_count, "worker claimed item");
        let (ok, error) = guarded_handle(handler, &mut item);

        let terminal_copy = item.clone();
        let outcome = {
            let mut state = inner.state.lock_unpoisoned();
            state.finalize(
                item,
                ok,
                error.as_deref(),
                inner.settings.max_retries,
            )
        };

        match outcome {
            FinalizeOutcome::Completed => {
                debug!(url = %terminal_copy.url, "item completed");
            }
            FinalizeOutcome::Retried => {
                debug!(url = %terminal_copy.url, error = ?error, "item requeued for retry");
            }
            FinalizeOutcome::Failed => {
                info!(url = %terminal_copy.url, error = ?error, "item conclusively failed");
                handler.on_terminal_failure(&terminal_copy);
            }
        }
        inner.forget_cancelled(&terminal_copy.url);

        // Terminal transitions write through to the state file so a crash
        // right after an attempt cannot resurrect finished work.
        if matches!(outcome, FinalizeOutcome::Completed | FinalizeOutcome::Failed) {
            inner.persist_now();
        }

        inner.cv.notify_all();
    }
}

/// A panicking handler must not poison the pool: convert the panic into a
/// failed attempt and keep the worker alive.
fn guarded_handle(handler: &dyn ItemHandler, item: &mut QueueItem) -> (bool, Option<String>) {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(item))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_payload_to_string(&*payload);
            error!(url = %item.url, panic = %message, "handler panicked");
            (false, Some(format!("Panic: {message}")))
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickyHandler;
    impl ItemHandler for PanickyHandler {
        fn handle(&self, _item: &mut QueueItem) -> (bool, Option<String>) {
            panic!("boom");
        }
    }

    #[test]
    fn guarded_handle_converts_panics_into_failures() {
        let mut item = QueueItem::new("https://u", 1, 2, 3, 4, 0);
        let (ok, error) = guarded_handle(&PanickyHandler, &mut item);
        assert!(!ok);
        let error = error.unwrap();
        assert!(error.starts_with("Panic:"), "got {error}");
        assert!(error.contains("boom"));
    }
}
