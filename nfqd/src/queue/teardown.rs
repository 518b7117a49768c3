//! Bounded teardown of a queue instance.
//!
//! Destroying a kernel queue can hang indefinitely, and from here a hang looks
//! exactly like a slow teardown. Teardown therefore runs on its own thread
//! while the caller waits at most `teardown_timeout`; past the deadline the
//! source's receive descriptor is aborted, the sink and routing entry are
//! released anyway, and the caller is told the teardown stalled. Whether to
//! exit the process is the caller's decision.

use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel;
use nfqd_common::ProtocolFamily;
use tracing::{debug, error, info, warn};

use super::{QueueState, Shared};
use crate::metrics;

/// Result of closing a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Every teardown step finished within the deadline.
    Graceful { duration: Duration },
    /// The deadline passed with kernel teardown still in progress.
    Stalled { duration: Duration },
    /// The queue had already been closed.
    AlreadyClosed,
}

impl CloseOutcome {
    pub fn is_graceful(&self) -> bool {
        matches!(self, CloseOutcome::Graceful { .. })
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self, CloseOutcome::Stalled { .. })
    }
}

pub(super) fn close(
    shared: Arc<Shared>,
    receiver: Option<thread::JoinHandle<()>>,
    timeout: Duration,
) -> CloseOutcome {
    let start = Instant::now();
    let queue_num = shared.queue_num;
    shared.state.advance(QueueState::Stopping);
    shared.stop.trigger();

    info!(
        event.name = "queue.teardown.started",
        queue.num = queue_num,
        queue.index = %shared.index,
        timeout_ms = timeout.as_millis(),
        "closing queue"
    );

    let (done_tx, done_rx) = channel::bounded::<()>(1);
    // Held outside the closure so a failed spawn does not lose the handle.
    let receiver = Arc::new(Mutex::new(receiver));
    let worker = Arc::clone(&shared);
    let worker_receiver = Arc::clone(&receiver);
    let spawned = thread::Builder::new()
        .name(format!("nfqd-teardown-{queue_num}"))
        .spawn(move || {
            let receiver = take(&worker_receiver);
            teardown_and_join(&worker, receiver);
            let _ = done_tx.send(());
        });

    if let Err(e) = spawned {
        // Without a thread there is no way to bound the wait; tear down inline.
        warn!(
            event.name = "queue.teardown.spawn_failed",
            queue.num = queue_num,
            error.message = %e,
            "failed to spawn teardown thread, tearing down inline"
        );
        teardown_and_join(&shared, take(&receiver));
        return finish(&shared, start);
    }

    match done_rx.recv_timeout(timeout) {
        Ok(()) => finish(&shared, start),
        Err(_) => {
            warn!(
                event.name = "queue.teardown.stalled",
                queue.num = queue_num,
                timeout_ms = timeout.as_millis(),
                "queue stuck, closing by timeout"
            );
            shared.source.abort();
            shared.release();
            shared.state.advance(QueueState::Closed);
            metrics::record_teardown("stalled");
            CloseOutcome::Stalled {
                duration: start.elapsed(),
            }
        }
    }
}

fn take(slot: &Mutex<Option<thread::JoinHandle<()>>>) -> Option<thread::JoinHandle<()>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Run the teardown steps, then wait for the receive thread to exit.
/// Returns `false` if the receive thread panicked.
pub(super) fn teardown_and_join(
    shared: &Shared,
    receiver: Option<thread::JoinHandle<()>>,
) -> bool {
    run_teardown(shared);
    let Some(receiver) = receiver else {
        return true;
    };
    if receiver.join().is_err() {
        error!(
            event.name = "queue.teardown.recv_thread_panicked",
            queue.num = shared.queue_num,
            "receive thread panicked"
        );
        return false;
    }
    debug!(
        event.name = "queue.teardown.recv_thread_joined",
        queue.num = shared.queue_num,
        "receive thread joined"
    );
    true
}

fn finish(shared: &Shared, start: Instant) -> CloseOutcome {
    shared.state.advance(QueueState::Closed);
    metrics::record_teardown("graceful");
    let duration = start.elapsed();
    info!(
        event.name = "queue.teardown.completed",
        queue.num = shared.queue_num,
        duration_ms = duration.as_millis(),
        "queue closed"
    );
    CloseOutcome::Graceful { duration }
}

/// Normal teardown path. Kernel-side failures are logged and do not stop the
/// remaining steps.
fn run_teardown(shared: &Shared) {
    let source = &shared.source;
    for family in ProtocolFamily::ALL {
        if let Err(e) = source.unbind_family(family) {
            warn!(
                event.name = "queue.teardown.unbind_failed",
                queue.num = shared.queue_num,
                family = %family,
                error.message = %e,
                "failed to unbind protocol family"
            );
        }
    }

    if let Err(e) = source.destroy_queue(shared.handle) {
        warn!(
            event.name = "queue.teardown.destroy_failed",
            queue.num = shared.queue_num,
            error.message = %e,
            "queue not destroyed"
        );
    }

    if let Err(e) = source.close() {
        warn!(
            event.name = "queue.teardown.close_failed",
            queue.num = shared.queue_num,
            error.message = %e,
            "kernel handle not closed"
        );
    }

    shared.release();
}
