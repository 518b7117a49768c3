//! One-shot packet handle.
//!
//! Every verdict operation consumes the [`Packet`], so a packet can be
//! settled at most once. A packet dropped without a verdict is settled with
//! the current failure verdict instead of being left pending in the kernel.

use std::{fmt, sync::Arc};

use nfqd_common::{Mark, Verdict, requeue_verdict};
use tracing::{error, warn};

use crate::{
    dispatch::FailureVerdict,
    error::QueueError,
    metrics,
    source::{PacketSource, QueueHandle, VerdictRequest},
};

pub struct Packet {
    payload: Vec<u8>,
    packet_id: u32,
    queue: QueueHandle,
    source: Arc<dyn PacketSource>,
    failure: Arc<FailureVerdict>,
    resolved: bool,
}

impl Packet {
    pub(crate) fn new(
        payload: Vec<u8>,
        packet_id: u32,
        queue: QueueHandle,
        source: Arc<dyn PacketSource>,
        failure: Arc<FailureVerdict>,
    ) -> Self {
        Self {
            payload,
            packet_id,
            queue,
            source,
            failure,
            resolved: false,
        }
    }

    /// Kernel-assigned correlation id.
    pub fn id(&self) -> u32 {
        self.packet_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    pub fn set_verdict(self, verdict: Verdict) -> Result<(), QueueError> {
        self.resolve(verdict.as_u32(), None, None)
    }

    /// Set `mark` with the verdict given by [`Mark::verdict`].
    pub fn set_verdict_mark(self, mark: Mark) -> Result<(), QueueError> {
        self.resolve(mark.verdict().as_u32(), Some(mark.as_u32()), None)
    }

    /// Set an explicit verdict and mark pair.
    pub fn set_verdict_and_mark(self, verdict: Verdict, mark: u32) -> Result<(), QueueError> {
        self.resolve(verdict.as_u32(), Some(mark), None)
    }

    /// Move the packet to queue `queue_num`.
    pub fn set_requeue_verdict(self, queue_num: u16) -> Result<(), QueueError> {
        self.resolve(requeue_verdict(queue_num), None, None)
    }

    pub fn set_requeue_verdict_mark(self, queue_num: u16, mark: u32) -> Result<(), QueueError> {
        self.resolve(requeue_verdict(queue_num), Some(mark), None)
    }

    /// Settle the packet and hand `payload` back to the stack in place of the
    /// original bytes.
    ///
    /// An empty `payload` is rejected; the packet is then settled with the
    /// failure verdict as it goes out of scope.
    pub fn set_verdict_with_packet(self, verdict: Verdict, payload: &[u8]) -> Result<(), QueueError> {
        if payload.is_empty() {
            return Err(QueueError::EmptyPayload {
                packet_id: self.packet_id,
            });
        }
        self.resolve(verdict.as_u32(), None, Some(payload))
    }

    fn resolve(
        mut self,
        verdict: u32,
        mark: Option<u32>,
        payload: Option<&[u8]>,
    ) -> Result<(), QueueError> {
        self.resolved = true;
        self.issue(verdict, mark, payload)
            .map_err(|e| QueueError::verdict(self.packet_id, e))
    }

    fn issue(&self, verdict: u32, mark: Option<u32>, payload: Option<&[u8]>) -> std::io::Result<()> {
        let request = VerdictRequest {
            packet_id: self.packet_id,
            verdict,
            mark,
            payload,
        };
        let result = self.source.set_verdict(self.queue, request);
        metrics::record_verdict(verdict, result.is_ok());
        result
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let verdict = self.failure.current();
        warn!(
            event.name = "packet.dropped_unresolved",
            packet.id = self.packet_id,
            verdict = %verdict,
            "packet released without a verdict, applying failure verdict"
        );
        if let Err(e) = self.issue(verdict.as_u32(), None, None) {
            error!(
                event.name = "packet.fallback_verdict_failed",
                packet.id = self.packet_id,
                error.message = %e,
                "failed to apply failure verdict"
            );
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.packet_id)
            .field("queue", &self.queue)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use nfqd_common::QUEUE_SHIFT;

    use super::*;
    use crate::source::{LoopbackSource, loopback::RecordedVerdict};

    const WAIT: Duration = Duration::from_secs(1);

    pub(crate) fn packet_on(source: &Arc<LoopbackSource>, id: u32, payload: &[u8]) -> Packet {
        Packet::new(
            payload.to_vec(),
            id,
            QueueHandle::new(5),
            source.clone(),
            Arc::new(FailureVerdict::new()),
        )
    }

    fn source() -> Arc<LoopbackSource> {
        Arc::new(LoopbackSource::new().unwrap())
    }

    #[test]
    fn test_set_verdict_forwards_id_handle_and_code() {
        let source = source();
        packet_on(&source, 17, b"data").set_verdict(Verdict::Accept).unwrap();

        assert_eq!(
            source.next_verdict(WAIT),
            Some(RecordedVerdict {
                queue: QueueHandle::new(5),
                packet_id: 17,
                verdict: 1,
                mark: None,
                payload: None,
            })
        );
        assert!(source.drain_verdicts().is_empty());
    }

    #[test]
    fn test_verdict_mark_policy() {
        let source = source();
        packet_on(&source, 1, b"a").set_verdict_mark(Mark::Repeat).unwrap();
        packet_on(&source, 2, b"b").set_verdict_mark(Mark::DropLog).unwrap();

        let repeat = source.next_verdict(WAIT).unwrap();
        assert_eq!(repeat.verdict, Verdict::Repeat.as_u32());
        assert_eq!(repeat.mark, Some(0x11003));

        let drop_log = source.next_verdict(WAIT).unwrap();
        assert_eq!(drop_log.verdict, Verdict::Accept.as_u32());
        assert_eq!(drop_log.mark, Some(0x11010));
    }

    #[test]
    fn test_requeue_verdict_packs_queue() {
        let source = source();
        for (id, queue) in [(1, 0u16), (2, 1), (3, 65535)] {
            packet_on(&source, id, b"x").set_requeue_verdict(queue).unwrap();
            let v = source.next_verdict(WAIT).unwrap();
            assert_eq!(v.verdict, 3 | ((queue as u32) << QUEUE_SHIFT));
            assert_eq!(v.mark, None);
        }
    }

    #[test]
    fn test_requeue_verdict_mark_attaches_mark() {
        let source = source();
        packet_on(&source, 4, b"x")
            .set_requeue_verdict_mark(2, 0xbeef)
            .unwrap();
        let v = source.next_verdict(WAIT).unwrap();
        assert_eq!(v.verdict, 3 | (2 << 16));
        assert_eq!(v.mark, Some(0xbeef));
    }

    #[test]
    fn test_verdict_with_packet_carries_replacement() {
        let source = source();
        packet_on(&source, 8, b"old")
            .set_verdict_with_packet(Verdict::Accept, b"new bytes")
            .unwrap();
        let v = source.next_verdict(WAIT).unwrap();
        assert_eq!(v.payload.as_deref(), Some(&b"new bytes"[..]));
        assert_eq!(v.verdict, Verdict::Accept.as_u32());
    }

    #[test]
    fn test_empty_replacement_is_rejected_and_falls_back() {
        let source = source();
        let err = packet_on(&source, 9, b"old")
            .set_verdict_with_packet(Verdict::Accept, &[])
            .unwrap_err();
        assert!(matches!(err, QueueError::EmptyPayload { packet_id: 9 }));

        // Settled once, with the failure verdict.
        let v = source.next_verdict(WAIT).unwrap();
        assert_eq!(v.packet_id, 9);
        assert_eq!(v.verdict, Verdict::Drop.as_u32());
        assert!(source.drain_verdicts().is_empty());
    }

    #[test]
    fn test_unresolved_packet_uses_failure_verdict_on_drop() {
        let source = source();
        let failure = Arc::new(FailureVerdict::new());
        failure.fail_open();
        let packet = Packet::new(
            b"x".to_vec(),
            21,
            QueueHandle::new(1),
            source.clone(),
            failure,
        );
        drop(packet);

        let v = source.next_verdict(WAIT).unwrap();
        assert_eq!(v.packet_id, 21);
        assert_eq!(v.verdict, Verdict::Accept.as_u32());
    }

    #[test]
    fn test_accessors() {
        let source = source();
        let packet = packet_on(&source, 3, b"hello");
        assert_eq!(packet.id(), 3);
        assert_eq!(packet.payload(), b"hello");
        assert_eq!(packet.len(), 5);
        assert!(!packet.is_empty());
        assert_eq!(packet.queue(), QueueHandle::new(5));
        packet.set_verdict(Verdict::Drop).unwrap();
    }
}
