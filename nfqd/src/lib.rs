//! Userspace NFQUEUE dispatch.
//!
//! Packets the firewall redirects to a queue are read by a dedicated receive
//! thread per [`Queue`], routed through a [`Dispatcher`] to the queue's
//! consumer, and answered with exactly one verdict per [`Packet`]. Packets
//! that cannot reach a consumer are settled with the dispatcher's
//! [`FailureVerdict`]: drop, or accept once fail-open is enabled.
//!
//! The kernel side sits behind [`PacketSource`]. [`LoopbackSource`] is an
//! in-process implementation for tests and benchmarks.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nfqd::{LoopbackSource, Queue, QueueConf, Verdict};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(LoopbackSource::new()?);
//! let queue = Queue::create(source, &QueueConf::new(0))?;
//!
//! for packet in queue.packets() {
//!     packet.set_verdict(Verdict::Accept)?;
//! }
//!
//! if queue.close().is_stalled() {
//!     std::process::exit(0);
//! }
//! # Ok(())
//! # }
//! ```

pub mod conf;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod source;
pub mod stop;

pub use conf::{ConfigError, QueueConf};
pub use dispatch::{Dispatch, Dispatcher, FailureVerdict};
pub use error::{QueueError, RegistryError};
pub use nfqd_common::{CopyMode, Mark, ProtocolFamily, Verdict, requeue_verdict};
pub use packet::Packet;
pub use queue::{CloseOutcome, Queue, QueueState};
pub use registry::{PacketSink, Registry, RoutingIndex};
pub use sink::{ChannelSink, Packets};
pub use source::{LoopbackSource, PacketSource, QueueHandle, RawEvent, VerdictRequest};
pub use stop::StopSignal;
