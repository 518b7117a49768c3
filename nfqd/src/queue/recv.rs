//! Dedicated receive thread for a queue instance.

use std::{io, os::fd::RawFd, sync::Arc, thread};

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, nfds_t, poll, pollfd};
use tracing::{debug, error, info, trace, warn};

use super::Shared;
use crate::metrics;

/// Spawn the receive thread for `shared`.
///
/// The thread:
/// - `poll()`s the source descriptor together with the queue's stop eventfd
/// - Re-checks the stop signal before handling every received chunk
/// - Decodes each chunk through the source and dispatches every event
/// - Skips any chunk that fills the whole buffer, since it may have been cut
///   short; `buffer_size` leaves headroom above the configured copy range
/// - Exits on stop, on a zero-length read, or on a receive error (logged);
///   it never closes the queue itself
///
/// Delivery to the consumer blocks, so while the consumer is not draining
/// packets the thread stops reading and the kernel queue fills up.
///
/// ## Errors
///
/// Returns an error if the thread cannot be spawned due to system resource limitations.
pub(super) fn spawn_receive_thread(
    shared: Arc<Shared>,
    fd: RawFd,
    buffer_size: usize,
) -> Result<thread::JoinHandle<()>, io::Error> {
    thread::Builder::new()
        .name(format!("nfqd-recv-{}", shared.queue_num))
        .spawn(move || receive_loop(&shared, fd, buffer_size))
}

fn receive_loop(shared: &Shared, fd: RawFd, buffer_size: usize) {
    let queue_num = shared.queue_num;
    info!(
        event.name = "queue.recv.started",
        queue.num = queue_num,
        queue.index = %shared.index,
        "receive thread started"
    );

    let mut buf = vec![0u8; buffer_size];
    let mut chunks_received = 0u64;
    let mut fds = [
        pollfd {
            fd,
            events: POLLIN,
            revents: 0,
        },
        pollfd {
            fd: shared.stop.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        },
    ];

    loop {
        // SAFETY: fds array is properly initialized, timeout -1 means wait indefinitely
        let poll_ret = unsafe { poll(fds.as_mut_ptr(), fds.len() as nfds_t, -1) };
        if poll_ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(
                event.name = "queue.recv.poll_error",
                queue.num = queue_num,
                error.message = %err,
                "poll() failed, terminating receive thread"
            );
            break;
        }

        if (fds[1].revents & POLLIN) != 0 || shared.stop.is_stopped() {
            debug!(
                event.name = "queue.recv.stop_signaled",
                queue.num = queue_num,
                chunks_received,
                "stop signal received"
            );
            break;
        }

        let revents = fds[0].revents;
        if (revents & POLLIN) == 0 {
            if (revents & (POLLERR | POLLHUP | POLLNVAL)) != 0 {
                error!(
                    event.name = "queue.recv.socket_error",
                    queue.num = queue_num,
                    revents,
                    "receive descriptor error detected via poll(), terminating receive thread"
                );
                break;
            }
            continue;
        }

        let n = match shared.source.recv(&mut buf) {
            Ok(0) => {
                warn!(
                    event.name = "queue.recv.closed",
                    queue.num = queue_num,
                    chunks_received,
                    "receive descriptor closed, terminating receive thread"
                );
                break;
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!(
                    event.name = "queue.recv.failed",
                    queue.num = queue_num,
                    error.message = %e,
                    error.code = e.raw_os_error().unwrap_or_default(),
                    "terminating, unable to receive packet"
                );
                break;
            }
        };

        if shared.stop.is_stopped() {
            break;
        }
        if n >= buf.len() {
            warn!(
                event.name = "queue.recv.truncated",
                queue.num = queue_num,
                bytes = n,
                buffer_size = buf.len(),
                "received chunk filled the receive buffer and may be truncated, skipping"
            );
            continue;
        }
        chunks_received += 1;
        trace!(
            event.name = "queue.recv.data_received",
            queue.num = queue_num,
            bytes = n,
            "received chunk"
        );

        let source = &shared.source;
        let result = source.handle_chunk(&buf[..n], &mut |event| {
            metrics::record_received(queue_num);
            shared.dispatcher.dispatch(source, event);
        });
        if let Err(e) = result {
            warn!(
                event.name = "queue.recv.decode_failed",
                queue.num = queue_num,
                bytes = n,
                error.message = %e,
                "failed to decode received chunk, skipping"
            );
        }
    }

    info!(
        event.name = "queue.recv.stopped",
        queue.num = queue_num,
        chunks_received,
        "receive thread stopped"
    );
}
