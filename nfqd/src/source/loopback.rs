//! In-process packet source backed by a Unix datagram socket pair.
//!
//! Each injected event travels as one datagram through a real socket, so the
//! receive thread polls, receives and decodes exactly the way it does against
//! the kernel. Every control call and verdict is recorded, and individual
//! steps can be made to fail or hang.

use std::{
    collections::HashSet,
    io,
    net::Shutdown,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixDatagram,
    },
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use nfqd_common::{CopyMode, ProtocolFamily};
use tracing::trace;

use super::{PacketSource, QueueHandle, RawEvent, VerdictRequest};
use crate::registry::RoutingIndex;

/// Per-datagram header: packet id (4), routing index (4), queue handle (8).
const HEADER_LEN: usize = 16;

/// Control steps of the source contract, used to script failures and stalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStep {
    Unbind,
    Bind,
    CreateQueue,
    DestroyQueue,
    SetMaxLen,
    SetMode,
    SetFailOpen,
    ReceiveFd,
    Recv,
    Close,
}

/// A control call observed by the source, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Unbind(ProtocolFamily),
    Bind(ProtocolFamily),
    CreateQueue { queue_num: u16, index: RoutingIndex },
    DestroyQueue(QueueHandle),
    SetMaxLen(u32),
    SetMode(CopyMode, u32),
    SetFailOpen,
    SetNoEnobufs,
    Close,
    Abort,
}

/// A verdict issued through the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVerdict {
    pub queue: QueueHandle,
    pub packet_id: u32,
    pub verdict: u32,
    pub mark: Option<u32>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Script {
    failing: HashSet<SourceStep>,
    stalled: HashSet<SourceStep>,
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    index: RoutingIndex,
    queue: QueueHandle,
}

pub struct LoopbackSource {
    tx: UnixDatagram,
    rx: UnixDatagram,
    next_handle: AtomicU64,
    bound: Mutex<Option<Bound>>,
    script: Mutex<Script>,
    calls: Mutex<Vec<SourceCall>>,
    verdict_tx: Sender<RecordedVerdict>,
    verdict_rx: Receiver<RecordedVerdict>,
    stall_tx: Mutex<Option<Sender<()>>>,
    stall_rx: Receiver<()>,
}

impl LoopbackSource {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixDatagram::pair()?;
        let (verdict_tx, verdict_rx) = channel::unbounded();
        let (stall_tx, stall_rx) = channel::bounded(0);
        Ok(Self {
            tx,
            rx,
            next_handle: AtomicU64::new(1),
            bound: Mutex::new(None),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            verdict_tx,
            verdict_rx,
            stall_tx: Mutex::new(Some(stall_tx)),
            stall_rx,
        })
    }

    /// Make `step` return an error from now on.
    pub fn fail_on(&self, step: SourceStep) {
        lock(&self.script).failing.insert(step);
    }

    /// Make `step` block until [`release_stalls`](Self::release_stalls).
    pub fn stall_on(&self, step: SourceStep) {
        lock(&self.script).stalled.insert(step);
    }

    /// Unblock every step currently held by [`stall_on`](Self::stall_on).
    pub fn release_stalls(&self) {
        lock(&self.script).stalled.clear();
        lock(&self.stall_tx).take();
    }

    /// Inject an event for the queue created on this source.
    pub fn inject(&self, packet_id: u32, payload: &[u8]) -> io::Result<()> {
        let bound = (*lock(&self.bound))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no queue created"))?;
        self.inject_routed(bound.index, bound.queue, packet_id, payload)
    }

    /// Inject an event carrying an arbitrary routing index.
    pub fn inject_routed(
        &self,
        index: RoutingIndex,
        queue: QueueHandle,
        packet_id: u32,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut datagram = Vec::with_capacity(HEADER_LEN + payload.len());
        datagram.extend_from_slice(&packet_id.to_be_bytes());
        datagram.extend_from_slice(&index.raw().to_be_bytes());
        datagram.extend_from_slice(&queue.raw().to_be_bytes());
        datagram.extend_from_slice(payload);
        self.tx.send(&datagram)?;
        Ok(())
    }

    /// Routing index and handle of the created queue, if any.
    pub fn bound(&self) -> Option<(RoutingIndex, QueueHandle)> {
        (*lock(&self.bound)).map(|b| (b.index, b.queue))
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        lock(&self.calls).clone()
    }

    /// Wait for the next verdict issued through this source.
    pub fn next_verdict(&self, timeout: Duration) -> Option<RecordedVerdict> {
        match self.verdict_rx.recv_timeout(timeout) {
            Ok(verdict) => Some(verdict),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Verdicts issued so far that have not been taken by `next_verdict`.
    pub fn drain_verdicts(&self) -> Vec<RecordedVerdict> {
        self.verdict_rx.try_iter().collect()
    }

    fn record(&self, call: SourceCall) {
        trace!(
            event.name = "loopback.call",
            call = ?call,
            "loopback source call"
        );
        lock(&self.calls).push(call);
    }

    fn step(&self, step: SourceStep) -> io::Result<()> {
        let (failing, stalled) = {
            let script = lock(&self.script);
            (script.failing.contains(&step), script.stalled.contains(&step))
        };
        if stalled {
            // Returns once release_stalls drops the sender.
            let _ = self.stall_rx.recv();
        }
        if failing {
            return Err(io::Error::other(format!("{step:?} failed")));
        }
        Ok(())
    }
}

impl PacketSource for LoopbackSource {
    fn unbind_family(&self, family: ProtocolFamily) -> io::Result<()> {
        self.record(SourceCall::Unbind(family));
        self.step(SourceStep::Unbind)
    }

    fn bind_family(&self, family: ProtocolFamily) -> io::Result<()> {
        self.record(SourceCall::Bind(family));
        self.step(SourceStep::Bind)
    }

    fn create_queue(&self, queue_num: u16, index: RoutingIndex) -> io::Result<QueueHandle> {
        self.record(SourceCall::CreateQueue { queue_num, index });
        self.step(SourceStep::CreateQueue)?;
        let queue = QueueHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        *lock(&self.bound) = Some(Bound { index, queue });
        Ok(queue)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> io::Result<()> {
        self.record(SourceCall::DestroyQueue(queue));
        self.step(SourceStep::DestroyQueue)?;
        lock(&self.bound).take();
        Ok(())
    }

    fn set_queue_maxlen(&self, _queue: QueueHandle, max_len: u32) -> io::Result<()> {
        self.record(SourceCall::SetMaxLen(max_len));
        self.step(SourceStep::SetMaxLen)
    }

    fn set_mode(&self, _queue: QueueHandle, mode: CopyMode, range: u32) -> io::Result<()> {
        self.record(SourceCall::SetMode(mode, range));
        self.step(SourceStep::SetMode)
    }

    fn set_fail_open(&self, _queue: QueueHandle) -> io::Result<()> {
        self.record(SourceCall::SetFailOpen);
        self.step(SourceStep::SetFailOpen)
    }

    fn set_no_enobufs(&self) -> io::Result<()> {
        self.record(SourceCall::SetNoEnobufs);
        Ok(())
    }

    fn receive_fd(&self) -> io::Result<RawFd> {
        self.step(SourceStep::ReceiveFd)?;
        Ok(self.rx.as_raw_fd())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.step(SourceStep::Recv)?;
        self.rx.recv(buf)
    }

    fn handle_chunk(
        &self,
        chunk: &[u8],
        on_event: &mut dyn FnMut(RawEvent<'_>),
    ) -> io::Result<()> {
        if chunk.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short chunk: {} bytes", chunk.len()),
            ));
        }
        let (header, payload) = chunk.split_at(HEADER_LEN);
        let packet_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let index = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let mut queue = [0u8; 8];
        queue.copy_from_slice(&header[8..16]);

        on_event(RawEvent {
            packet_id,
            payload,
            index: RoutingIndex::new(index),
            queue: QueueHandle::new(u64::from_be_bytes(queue)),
        });
        Ok(())
    }

    fn set_verdict(&self, queue: QueueHandle, request: VerdictRequest<'_>) -> io::Result<()> {
        let _ = self.verdict_tx.send(RecordedVerdict {
            queue,
            packet_id: request.packet_id,
            verdict: request.verdict,
            mark: request.mark,
            payload: request.payload.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.record(SourceCall::Close);
        self.step(SourceStep::Close)?;
        let _ = self.rx.shutdown(Shutdown::Both);
        Ok(())
    }

    fn abort(&self) {
        self.record(SourceCall::Abort);
        let _ = self.rx.shutdown(Shutdown::Both);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_event_round_trips_through_socket() {
        let source = LoopbackSource::new().unwrap();
        let queue = QueueHandle::new(7);
        source
            .inject_routed(RoutingIndex::new(42), queue, 9, b"abc")
            .unwrap();

        let mut buf = [0u8; 64];
        let n = source.recv(&mut buf).unwrap();

        let mut seen = Vec::new();
        source
            .handle_chunk(&buf[..n], &mut |event| {
                seen.push((event.packet_id, event.index, event.queue, event.payload.to_vec()))
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![(9, RoutingIndex::new(42), queue, b"abc".to_vec())]
        );
    }

    #[test]
    fn test_short_chunk_is_rejected() {
        let source = LoopbackSource::new().unwrap();
        let err = source
            .handle_chunk(&[0u8; 3], &mut |_| panic!("no event expected"))
            .expect_err("short chunk must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_inject_requires_created_queue() {
        let source = LoopbackSource::new().unwrap();
        assert!(source.inject(1, b"x").is_err());

        source.create_queue(3, RoutingIndex::new(5)).unwrap();
        assert!(source.inject(1, b"x").is_ok());
    }

    #[test]
    fn test_scripted_failure() {
        let source = LoopbackSource::new().unwrap();
        source.fail_on(SourceStep::Bind);
        assert!(source.bind_family(ProtocolFamily::Inet).is_err());
        assert!(source.unbind_family(ProtocolFamily::Inet).is_ok());
        assert_eq!(
            source.calls(),
            vec![
                SourceCall::Bind(ProtocolFamily::Inet),
                SourceCall::Unbind(ProtocolFamily::Inet)
            ]
        );
    }
}
