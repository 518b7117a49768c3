//! Routing of raw kernel events to queue sinks.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use lazy_static::lazy_static;
use nfqd_common::Verdict;
use tracing::{error, trace, warn};

use crate::{
    metrics,
    packet::Packet,
    registry::Registry,
    source::{PacketSource, RawEvent},
};

/// Verdict applied to packets that cannot reach a consumer.
///
/// Starts as `Drop`; once any queue sharing it goes fail-open it is `Accept`
/// for good.
#[derive(Debug)]
pub struct FailureVerdict(AtomicU32);

impl FailureVerdict {
    pub fn new() -> Self {
        Self(AtomicU32::new(Verdict::Drop.as_u32()))
    }

    pub fn current(&self) -> Verdict {
        match self.0.load(Ordering::SeqCst) {
            1 => Verdict::Accept,
            _ => Verdict::Drop,
        }
    }

    pub fn fail_open(&self) {
        self.0.store(Verdict::Accept.as_u32(), Ordering::SeqCst);
    }

    pub fn is_fail_open(&self) -> bool {
        self.current() == Verdict::Accept
    }
}

impl Default for FailureVerdict {
    fn default() -> Self {
        Self::new()
    }
}

/// How a single event was settled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the queue's consumer.
    Delivered,
    /// No queue is registered under the event's routing index.
    Unroutable(Verdict),
    /// The queue's sink closed before the consumer took the packet.
    Undelivered(Verdict),
}

impl Dispatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dispatch::Delivered => "delivered",
            Dispatch::Unroutable(_) => "unroutable",
            Dispatch::Undelivered(_) => "undelivered",
        }
    }
}

lazy_static! {
    static ref GLOBAL: Dispatcher = Dispatcher::new();
}

/// Shared routing table plus the failure verdict of every queue using it.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    failure: Arc<FailureVerdict>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide dispatcher used by [`Queue::create`](crate::Queue::create).
    pub fn global() -> &'static Dispatcher {
        &GLOBAL
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn failure(&self) -> &Arc<FailureVerdict> {
        &self.failure
    }

    /// Settle one event surfaced by `source`.
    ///
    /// The payload is copied before anything else since the source reuses its
    /// buffer as soon as this returns. Delivery blocks until the consumer
    /// takes the packet so that a slow consumer backs up into the kernel
    /// queue rather than being hidden here.
    pub fn dispatch(&self, source: &Arc<dyn PacketSource>, event: RawEvent<'_>) -> Dispatch {
        let packet = Packet::new(
            event.payload.to_vec(),
            event.packet_id,
            event.queue,
            Arc::clone(source),
            Arc::clone(&self.failure),
        );

        let outcome = match self.registry.lookup(event.index) {
            None => {
                let verdict = self.failure.current();
                let disposition = if verdict == Verdict::Accept {
                    "[fail-open] accepting"
                } else {
                    "dropping"
                };
                warn!(
                    event.name = "dispatch.unroutable",
                    queue.index = %event.index,
                    packet.id = event.packet_id,
                    verdict = %verdict,
                    "{disposition} packet, unexpectedly due to unknown routing index"
                );
                settle(packet, verdict);
                Dispatch::Unroutable(verdict)
            }
            Some(sink) => match sink.deliver(packet) {
                Ok(()) => {
                    trace!(
                        event.name = "dispatch.delivered",
                        queue.index = %event.index,
                        packet.id = event.packet_id,
                        "packet handed to consumer"
                    );
                    Dispatch::Delivered
                }
                Err(packet) => {
                    let verdict = self.failure.current();
                    warn!(
                        event.name = "dispatch.undelivered",
                        queue.index = %event.index,
                        packet.id = event.packet_id,
                        verdict = %verdict,
                        "queue closed before the packet was taken, applying failure verdict"
                    );
                    settle(packet, verdict);
                    Dispatch::Undelivered(verdict)
                }
            },
        };

        metrics::record_dispatch(outcome.as_str());
        outcome
    }
}

fn settle(packet: Packet, verdict: Verdict) {
    let packet_id = packet.id();
    if let Err(e) = packet.set_verdict(verdict) {
        error!(
            event.name = "dispatch.failure_verdict_failed",
            packet.id = packet_id,
            error.message = %e,
            "failed to apply failure verdict"
        );
    }
}
