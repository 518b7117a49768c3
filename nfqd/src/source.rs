//! Contract with the kernel packet source.
//!
//! The source owns everything below the dispatch layer: the netlink socket,
//! address family binding, queue creation primitives and the decoding of
//! received chunks into packet events. The rest of the crate only ever talks
//! to it through [`PacketSource`].

pub mod loopback;

use std::{io, os::fd::RawFd};

use nfqd_common::{CopyMode, ProtocolFamily};

use crate::registry::RoutingIndex;

pub use loopback::LoopbackSource;

/// Opaque token identifying a queue created by a [`PacketSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(u64);

impl QueueHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A single packet event decoded from a received chunk.
///
/// `payload` borrows the source's receive buffer and is only valid for the
/// duration of the callback it is handed to.
#[derive(Debug, Clone, Copy)]
pub struct RawEvent<'a> {
    pub packet_id: u32,
    pub payload: &'a [u8],
    pub index: RoutingIndex,
    pub queue: QueueHandle,
}

/// Everything the kernel needs to settle a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictRequest<'a> {
    pub packet_id: u32,
    pub verdict: u32,
    pub mark: Option<u32>,
    pub payload: Option<&'a [u8]>,
}

/// The narrow surface the queue lifecycle and dispatcher need from the kernel.
///
/// One source backs exactly one queue instance. Verdicts are issued from
/// consumer threads while the receive thread is blocked in [`recv`], so every
/// method takes `&self` and implementations must be safe to call concurrently.
///
/// [`recv`]: PacketSource::recv
pub trait PacketSource: Send + Sync + 'static {
    fn unbind_family(&self, family: ProtocolFamily) -> io::Result<()>;

    fn bind_family(&self, family: ProtocolFamily) -> io::Result<()>;

    /// Create queue `queue_num`; every event it produces carries `index`.
    fn create_queue(&self, queue_num: u16, index: RoutingIndex) -> io::Result<QueueHandle>;

    fn destroy_queue(&self, queue: QueueHandle) -> io::Result<()>;

    fn set_queue_maxlen(&self, queue: QueueHandle, max_len: u32) -> io::Result<()>;

    fn set_mode(&self, queue: QueueHandle, mode: CopyMode, range: u32) -> io::Result<()>;

    fn set_fail_open(&self, queue: QueueHandle) -> io::Result<()>;

    /// Stop the socket from reporting `ENOBUFS` when the kernel drops
    /// messages it could not deliver.
    fn set_no_enobufs(&self) -> io::Result<()> {
        Ok(())
    }

    /// Descriptor the receive thread polls for readability.
    fn receive_fd(&self) -> io::Result<RawFd>;

    /// Blocking receive of the next raw chunk into `buf`.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Decode `chunk` and invoke `on_event` once per packet it contains.
    fn handle_chunk(&self, chunk: &[u8], on_event: &mut dyn FnMut(RawEvent<'_>))
    -> io::Result<()>;

    fn set_verdict(&self, queue: QueueHandle, request: VerdictRequest<'_>) -> io::Result<()>;

    /// Release the handle to the kernel facility.
    fn close(&self) -> io::Result<()>;

    /// Forcibly release the receive descriptor after teardown stalled.
    /// Must not block.
    fn abort(&self);
}
