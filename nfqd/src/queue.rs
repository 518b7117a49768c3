//! Queue instance lifecycle: create, run, close.
//!
//! A [`Queue`] owns one kernel queue bound through a [`PacketSource`], its
//! registry entry, and the receive thread feeding packets to its consumer.

mod recv;
mod state;
mod teardown;

use std::{
    fmt,
    sync::{
        Arc, Mutex, Once, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use nfqd_common::{CopyMode, ProtocolFamily};
use tracing::{error, info, warn};

pub use state::QueueState;
pub use teardown::CloseOutcome;

use crate::{
    conf::QueueConf,
    dispatch::Dispatcher,
    error::QueueError,
    metrics,
    registry::{PacketSink, Registry, RoutingIndex},
    sink::{ChannelSink, Packets},
    source::{PacketSource, QueueHandle},
    stop::StopSignal,
};
use state::StateCell;

/// State shared between the queue handle, its receive thread and teardown.
pub(crate) struct Shared {
    queue_num: u16,
    index: RoutingIndex,
    handle: QueueHandle,
    source: Arc<dyn PacketSource>,
    dispatcher: Dispatcher,
    sink: Arc<ChannelSink>,
    stop: Arc<StopSignal>,
    state: StateCell,
    released: Once,
}

impl Shared {
    /// Close the sink and drop the routing entry. Runs once, whichever of
    /// teardown or the watchdog gets here first.
    fn release(&self) {
        self.released.call_once(|| {
            self.sink.close();
            self.dispatcher.registry().unregister(self.index);
            metrics::QUEUES_ACTIVE.dec();
        });
    }
}

pub struct Queue {
    shared: Arc<Shared>,
    packets: Packets,
    receiver: Mutex<Option<thread::JoinHandle<()>>>,
    teardown_timeout: Duration,
    closing: AtomicBool,
}

impl Queue {
    /// Create and bind queue `conf.queue_num` on the process-wide dispatcher.
    pub fn create(source: Arc<dyn PacketSource>, conf: &QueueConf) -> Result<Self, QueueError> {
        Self::create_with(source, conf, Dispatcher::global().clone())
    }

    /// Create and bind a queue routed through `dispatcher`.
    ///
    /// On error, everything acquired up to the failing step has been released
    /// and nothing is left registered.
    pub fn create_with(
        source: Arc<dyn PacketSource>,
        conf: &QueueConf,
        dispatcher: Dispatcher,
    ) -> Result<Self, QueueError> {
        conf.validate()?;
        let queue_num = conf.queue_num;
        let state = StateCell::new();
        let mut unwind = Unwind::new(
            Arc::clone(&source),
            Arc::clone(dispatcher.registry()),
            queue_num,
        );

        for family in ProtocolFamily::ALL {
            source
                .unbind_family(family)
                .map_err(|source| QueueError::Unbind { family, source })?;
        }
        for family in ProtocolFamily::ALL {
            source
                .bind_family(family)
                .map_err(|source| QueueError::Bind { family, source })?;
        }
        state.advance(QueueState::Bound);

        let stop = Arc::new(StopSignal::new().map_err(QueueError::StopSignal)?);
        let (sink, packets) = ChannelSink::new(Arc::clone(&stop));
        let sink = Arc::new(sink);

        let index = dispatcher
            .registry()
            .register_unique(RoutingIndex::from_clock(), sink.clone())?;
        unwind.index = Some(index);

        let handle = source
            .create_queue(queue_num, index)
            .map_err(|source| QueueError::CreateQueue { queue_num, source })?;
        unwind.queue = Some(handle);

        source
            .set_queue_maxlen(handle, conf.max_queue_len)
            .map_err(|source| QueueError::SetMaxLen {
                max_len: conf.max_queue_len,
                source,
            })?;
        source
            .set_mode(handle, CopyMode::Packet, conf.packet_size)
            .map_err(|source| QueueError::SetMode {
                range: conf.packet_size,
                source,
            })?;
        let fd = source.receive_fd().map_err(QueueError::ReceiveFd)?;

        if conf.no_enobufs
            && let Err(e) = source.set_no_enobufs()
        {
            warn!(
                event.name = "queue.no_enobufs_failed",
                queue.num = queue_num,
                error.message = %e,
                "failed to disable ENOBUFS reporting"
            );
        }

        if conf.fail_open {
            source
                .set_fail_open(handle)
                .map_err(|source| QueueError::FailOpen { queue_num, source })?;
            dispatcher.failure().fail_open();
        }

        let shared = Arc::new(Shared {
            queue_num,
            index,
            handle,
            source: Arc::clone(&source),
            dispatcher,
            sink,
            stop,
            state,
            released: Once::new(),
        });
        let receiver =
            recv::spawn_receive_thread(Arc::clone(&shared), fd, conf.recv_buffer_len())
                .map_err(QueueError::Spawn)?;

        unwind.disarm();
        shared.state.advance(QueueState::Running);
        metrics::QUEUES_ACTIVE.inc();

        info!(
            event.name = "queue.created",
            queue.num = queue_num,
            queue.index = %index,
            queue.max_len = conf.max_queue_len,
            queue.packet_size = conf.packet_size,
            fail_open = conf.fail_open,
            "queue created and receiving"
        );

        Ok(Self {
            shared,
            packets,
            receiver: Mutex::new(Some(receiver)),
            teardown_timeout: conf.teardown_timeout,
            closing: AtomicBool::new(false),
        })
    }

    /// Packets delivered to this queue. The sequence ends once the queue closes.
    pub fn packets(&self) -> Packets {
        self.packets.clone()
    }

    /// Accept packets in the kernel instead of dropping them when this queue
    /// is full, and switch the dispatcher's failure verdict to accept.
    pub fn fail_open(&self) -> Result<(), QueueError> {
        let queue_num = self.shared.queue_num;
        if self.closing.load(Ordering::SeqCst) {
            return Err(QueueError::Closed { queue_num });
        }
        self.shared
            .source
            .set_fail_open(self.shared.handle)
            .map_err(|source| QueueError::FailOpen { queue_num, source })?;
        self.shared.dispatcher.failure().fail_open();
        info!(
            event.name = "queue.fail_open_enabled",
            queue.num = queue_num,
            "fail-open enabled"
        );
        Ok(())
    }

    /// Tear the queue down, waiting at most the configured teardown timeout.
    ///
    /// Only the first call does any work; later calls return
    /// [`CloseOutcome::AlreadyClosed`]. A [`CloseOutcome::Stalled`] result
    /// means kernel teardown is still hanging; the routing entry and sink have
    /// been released regardless, and callers that cannot tolerate a leaked
    /// kernel queue typically exit the process.
    pub fn close(&self) -> CloseOutcome {
        if self.closing.swap(true, Ordering::SeqCst) {
            return CloseOutcome::AlreadyClosed;
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        teardown::close(Arc::clone(&self.shared), receiver, self.teardown_timeout)
    }

    pub fn queue_num(&self) -> u16 {
        self.shared.queue_num
    }

    pub fn index(&self) -> RoutingIndex {
        self.shared.index
    }

    pub fn state(&self) -> QueueState {
        self.shared.state.get()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let CloseOutcome::Stalled { duration } = self.close() {
            error!(
                event.name = "queue.drop_stalled",
                queue.num = self.shared.queue_num,
                duration_ms = duration.as_millis(),
                "queue dropped while kernel teardown was stalled"
            );
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("queue_num", &self.shared.queue_num)
            .field("index", &self.shared.index)
            .field("state", &self.state())
            .finish()
    }
}

/// Releases whatever a failed creation acquired, in reverse order.
struct Unwind {
    source: Arc<dyn PacketSource>,
    registry: Arc<Registry>,
    queue_num: u16,
    index: Option<RoutingIndex>,
    queue: Option<QueueHandle>,
    armed: bool,
}

impl Unwind {
    fn new(source: Arc<dyn PacketSource>, registry: Arc<Registry>, queue_num: u16) -> Self {
        Self {
            source,
            registry,
            queue_num,
            index: None,
            queue: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(queue) = self.queue
            && let Err(e) = self.source.destroy_queue(queue)
        {
            warn!(
                event.name = "queue.unwind.destroy_failed",
                queue.num = self.queue_num,
                error.message = %e,
                "failed to destroy queue while unwinding creation"
            );
        }
        if let Some(index) = self.index {
            self.registry.unregister(index);
        }
        if let Err(e) = self.source.close() {
            warn!(
                event.name = "queue.unwind.close_failed",
                queue.num = self.queue_num,
                error.message = %e,
                "failed to close kernel handle while unwinding creation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nfqd_common::Verdict;

    use super::*;
    use crate::source::{
        LoopbackSource,
        loopback::{SourceCall, SourceStep},
    };

    const WAIT: Duration = Duration::from_secs(2);

    fn conf(queue_num: u16) -> QueueConf {
        QueueConf {
            teardown_timeout: Duration::from_secs(2),
            ..QueueConf::new(queue_num)
        }
    }

    fn loopback() -> Arc<LoopbackSource> {
        Arc::new(LoopbackSource::new().unwrap())
    }

    #[test]
    fn test_create_follows_binding_sequence() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(4), dispatcher.clone()).unwrap();

        assert_eq!(queue.state(), QueueState::Running);
        assert!(dispatcher.registry().contains(queue.index()));

        let calls = source.calls();
        assert_eq!(
            &calls[..7],
            &[
                SourceCall::Unbind(ProtocolFamily::Inet),
                SourceCall::Unbind(ProtocolFamily::Inet6),
                SourceCall::Bind(ProtocolFamily::Inet),
                SourceCall::Bind(ProtocolFamily::Inet6),
                SourceCall::CreateQueue {
                    queue_num: 4,
                    index: queue.index()
                },
                SourceCall::SetMaxLen(1024),
                SourceCall::SetMode(CopyMode::Packet, 0xffff),
            ]
        );
        assert!(calls.contains(&SourceCall::SetNoEnobufs));

        assert!(queue.close().is_graceful());
    }

    #[test]
    fn test_failed_creation_unwinds_everything() {
        for (step, expect_destroy) in [
            (SourceStep::Unbind, false),
            (SourceStep::Bind, false),
            (SourceStep::CreateQueue, false),
            (SourceStep::SetMaxLen, true),
            (SourceStep::SetMode, true),
            (SourceStep::ReceiveFd, true),
        ] {
            let source = loopback();
            source.fail_on(step);
            let dispatcher = Dispatcher::new();

            let err = Queue::create_with(source.clone(), &conf(1), dispatcher.clone())
                .expect_err("creation must fail");

            assert!(dispatcher.registry().is_empty(), "{step:?}: {err}");
            let calls = source.calls();
            assert_eq!(calls.last(), Some(&SourceCall::Close), "{step:?}");
            assert_eq!(
                calls
                    .iter()
                    .any(|c| matches!(c, SourceCall::DestroyQueue(_))),
                expect_destroy,
                "{step:?}"
            );
        }
    }

    #[test]
    fn test_creation_error_names_the_step() {
        let source = loopback();
        source.fail_on(SourceStep::SetMaxLen);
        let err = Queue::create_with(source, &conf(1), Dispatcher::new()).unwrap_err();
        assert!(matches!(err, QueueError::SetMaxLen { max_len: 1024, .. }));
        assert!(err.to_string().contains("unable to set max packets in queue"));
    }

    #[test]
    fn test_close_releases_resources_in_order() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(2), dispatcher.clone()).unwrap();
        let packets = queue.packets();
        let index = queue.index();

        let outcome = queue.close();

        assert!(outcome.is_graceful(), "{outcome:?}");
        assert_eq!(queue.state(), QueueState::Closed);
        assert!(!dispatcher.registry().contains(index));
        assert!(packets.recv().is_none());

        let calls = source.calls();
        let tail: Vec<_> = calls
            .iter()
            .skip_while(|c| **c != SourceCall::SetNoEnobufs)
            .skip(1)
            .cloned()
            .collect();
        let handle = calls.iter().find_map(|c| match c {
            SourceCall::DestroyQueue(h) => Some(*h),
            _ => None,
        });
        assert_eq!(
            tail,
            vec![
                SourceCall::Unbind(ProtocolFamily::Inet),
                SourceCall::Unbind(ProtocolFamily::Inet6),
                SourceCall::DestroyQueue(handle.unwrap()),
                SourceCall::Close,
            ]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let source = loopback();
        let queue = Queue::create_with(source.clone(), &conf(2), Dispatcher::new()).unwrap();

        assert!(queue.close().is_graceful());
        assert_eq!(queue.close(), CloseOutcome::AlreadyClosed);
        drop(queue);

        let closes = source
            .calls()
            .into_iter()
            .filter(|c| *c == SourceCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_teardown_errors_are_not_fatal() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(2), dispatcher.clone()).unwrap();
        source.fail_on(SourceStep::Unbind);
        source.fail_on(SourceStep::DestroyQueue);
        source.fail_on(SourceStep::Close);

        assert!(queue.close().is_graceful());
        assert!(dispatcher.registry().is_empty());
        assert!(queue.packets().recv().is_none());
    }

    #[test]
    fn test_fail_open_switches_failure_verdict() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(2), dispatcher.clone()).unwrap();
        assert_eq!(dispatcher.failure().current(), Verdict::Drop);

        queue.fail_open().unwrap();

        assert_eq!(dispatcher.failure().current(), Verdict::Accept);
        assert!(source.calls().contains(&SourceCall::SetFailOpen));
        queue.close();
        assert!(matches!(
            queue.fail_open(),
            Err(QueueError::Closed { queue_num: 2 })
        ));
    }

    #[test]
    fn test_fail_open_from_conf() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let conf = QueueConf {
            fail_open: true,
            ..conf(2)
        };
        let queue = Queue::create_with(source.clone(), &conf, dispatcher.clone()).unwrap();
        assert!(dispatcher.failure().is_fail_open());
        queue.close();
    }

    #[test]
    fn test_fail_open_error_leaves_failure_verdict() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(2), dispatcher.clone()).unwrap();
        source.fail_on(SourceStep::SetFailOpen);

        assert!(matches!(
            queue.fail_open(),
            Err(QueueError::FailOpen { queue_num: 2, .. })
        ));
        assert_eq!(dispatcher.failure().current(), Verdict::Drop);
        queue.close();
    }

    #[test]
    fn test_receive_failure_stops_loop_without_closing() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(6), dispatcher.clone()).unwrap();
        source.fail_on(SourceStep::Recv);
        source.inject(1, b"wakes the loop").unwrap();

        // Give the receive thread time to hit the failure and exit.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.state(), QueueState::Running);
        assert!(dispatcher.registry().contains(queue.index()));

        assert!(queue.close().is_graceful());
    }

    #[test]
    fn test_queues_stop_independently() {
        let dispatcher = Dispatcher::new();
        let source_a = loopback();
        let source_b = loopback();
        let a = Queue::create_with(source_a.clone(), &conf(10), dispatcher.clone()).unwrap();
        let b = Queue::create_with(source_b.clone(), &conf(11), dispatcher.clone()).unwrap();
        assert_ne!(a.index(), b.index());

        assert!(a.close().is_graceful());

        source_b.inject(77, b"still running").unwrap();
        let packet = b.packets().recv_timeout(WAIT).expect("b keeps receiving");
        assert_eq!(packet.id(), 77);
        packet.set_verdict(Verdict::Accept).unwrap();
        assert!(b.close().is_graceful());
    }

    #[test]
    fn test_teardown_waits_for_receive_thread() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(12), dispatcher.clone()).unwrap();
        queue.closing.store(true, Ordering::SeqCst);
        queue.shared.stop.trigger();
        let real = queue.receiver.lock().unwrap().take().unwrap();
        real.join().unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let slow = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });

        assert!(teardown::teardown_and_join(&queue.shared, Some(slow)));
        assert!(finished.load(Ordering::SeqCst));
        assert!(dispatcher.registry().is_empty());
        assert!(source.calls().contains(&SourceCall::Close));

        let panicked = std::thread::spawn(|| panic!("receive loop failed"));
        assert!(!teardown::teardown_and_join(&queue.shared, Some(panicked)));
    }

    #[test]
    fn test_invalid_conf_is_rejected_before_binding() {
        let source = loopback();
        let conf = QueueConf {
            recv_buffer_size: 0,
            ..conf(1)
        };
        let err = Queue::create_with(source.clone(), &conf, Dispatcher::new()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidConf(_)));
        assert!(source.calls().is_empty());
    }

    #[test]
    fn test_drop_closes_queue() {
        let source = loopback();
        let dispatcher = Dispatcher::new();
        let queue = Queue::create_with(source.clone(), &conf(3), dispatcher.clone()).unwrap();
        let packets = queue.packets();

        drop(queue);

        assert!(dispatcher.registry().is_empty());
        assert!(packets.recv().is_none());
        assert!(source.calls().contains(&SourceCall::Close));
    }
}
