//! Channel-backed delivery sink and the consumer-facing packet sequence.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender, TryRecvError};

use crate::{packet::Packet, registry::PacketSink, stop::StopSignal};

/// Sink created for every queue instance.
///
/// The channel has no buffer: a delivery completes only when the consumer
/// takes the packet, which keeps the receive thread in lock-step with the
/// consumer and leaves queueing to the kernel's bounded queue.
pub struct ChannelSink {
    tx: Mutex<Option<Sender<Packet>>>,
    stop: Arc<StopSignal>,
}

impl ChannelSink {
    pub fn new(stop: Arc<StopSignal>) -> (Self, Packets) {
        let (tx, rx) = channel::bounded(0);
        let sink = Self {
            tx: Mutex::new(Some(tx)),
            stop,
        };
        (sink, Packets { rx })
    }

    fn sender(&self) -> Option<Sender<Packet>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PacketSink for ChannelSink {
    fn deliver(&self, packet: Packet) -> Result<(), Packet> {
        let Some(tx) = self.sender() else {
            return Err(packet);
        };
        let cancelled = self.stop.cancelled();

        let mut select = Select::new();
        let send_op = select.send(&tx);
        let cancel_op = select.recv(cancelled);
        let oper = select.select();
        match oper.index() {
            i if i == send_op => oper.send(&tx, packet).map_err(|e| e.into_inner()),
            i => {
                debug_assert_eq!(i, cancel_op);
                let _ = oper.recv(cancelled);
                Err(packet)
            }
        }
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Read-only sequence of packets delivered to one queue instance.
///
/// Iteration blocks for the next packet and ends once the queue is closed.
#[derive(Clone)]
pub struct Packets {
    rx: Receiver<Packet>,
}

impl Packets {
    pub fn recv(&self) -> Option<Packet> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout`; `Disconnected` means the queue is closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Packet, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Packet> {
        match self.rx.try_recv() {
            Ok(packet) => Some(packet),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl Iterator for Packets {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        self.recv()
    }
}

impl<'a> IntoIterator for &'a Packets {
    type Item = Packet;
    type IntoIter = channel::Iter<'a, Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.iter()
    }
}
