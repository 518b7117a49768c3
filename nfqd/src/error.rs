use std::io;

use nfqd_common::ProtocolFamily;
use thiserror::Error;

use crate::{conf::ConfigError, registry::RoutingIndex};

/// Errors raised while creating, driving or resolving packets on a queue.
///
/// Construction errors name the step that failed; by the time one is
/// returned every resource acquired before that step has been released.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    InvalidConf(#[from] ConfigError),

    #[error("failed to unbind existing handler from {family}: {source}")]
    Unbind {
        family: ProtocolFamily,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind handler to {family}: {source}")]
    Bind {
        family: ProtocolFamily,
        #[source]
        source: io::Error,
    },

    #[error("failed to register routing index: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to bind to queue {queue_num}: {source}")]
    CreateQueue {
        queue_num: u16,
        #[source]
        source: io::Error,
    },

    #[error("unable to set max packets in queue to {max_len}: {source}")]
    SetMaxLen {
        max_len: u32,
        #[source]
        source: io::Error,
    },

    #[error("unable to set packet copy mode with range {range}: {source}")]
    SetMode {
        range: u32,
        #[source]
        source: io::Error,
    },

    #[error("unable to get queue file descriptor: {0}")]
    ReceiveFd(#[source] io::Error),

    #[error("failed to create stop signal: {0}")]
    StopSignal(#[source] io::Error),

    #[error("failed to spawn receive thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("unable to set fail-open on queue {queue_num}: {source}")]
    FailOpen {
        queue_num: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to set verdict for packet {packet_id}: {source}")]
    Verdict {
        packet_id: u32,
        #[source]
        source: io::Error,
    },

    #[error("replacement payload for packet {packet_id} is empty")]
    EmptyPayload { packet_id: u32 },

    #[error("queue {queue_num} is closed")]
    Closed { queue_num: u16 },
}

impl QueueError {
    pub(crate) fn verdict(packet_id: u32, source: io::Error) -> Self {
        Self::Verdict { packet_id, source }
    }
}

/// Errors raised by the routing registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("routing index {0} is already registered")]
    Occupied(RoutingIndex),

    #[error("no free routing index available")]
    Exhausted,
}
