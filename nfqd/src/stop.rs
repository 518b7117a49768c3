use std::{
    io, mem,
    os::fd::RawFd,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam::channel::{self, Receiver, Sender};
use libc::{EFD_CLOEXEC, EFD_NONBLOCK, c_void, eventfd};
use tracing::error;

/// Per-queue cancellation token.
///
/// The receive thread polls [`as_raw_fd`](Self::as_raw_fd) next to the source
/// descriptor, and blocked hand-offs select on [`cancelled`](Self::cancelled),
/// so triggering it wakes both without touching any other queue.
pub struct StopSignal {
    stopped: AtomicBool,
    event_fd: RawFd,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd() is safe to call, we check for errors
        let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let (tx, rx) = channel::bounded(0);
        Ok(Self {
            stopped: AtomicBool::new(false),
            event_fd: fd,
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }

    /// Raise the signal. Returns `false` if it was already raised.
    pub fn trigger(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Dropping the only sender disconnects every `cancelled()` receiver.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();

        let val: u64 = 1;
        // SAFETY: self.event_fd is valid, val is properly initialized
        let ret = unsafe {
            libc::write(
                self.event_fd,
                &val as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            error!(
                event.name = "stop_signal.write_failed",
                error.message = %io::Error::last_os_error(),
                "failed to signal stop eventfd"
            );
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Readable once the signal has been raised.
    pub fn as_raw_fd(&self) -> RawFd {
        self.event_fd
    }

    /// Receiver that disconnects once the signal has been raised.
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Drop for StopSignal {
    fn drop(&mut self) {
        // SAFETY: self.event_fd is a valid file descriptor that we own
        unsafe {
            libc::close(self.event_fd);
        }
    }
}
