//! Prometheus collectors for the dispatch path and queue lifecycle.
//!
//! Collectors are always updated; [`init`] registers them with [`REGISTRY`]
//! so an embedding application can expose them however it likes.

use std::sync::Once;

use lazy_static::lazy_static;
use nfqd_common::Verdict;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

static INIT: Once = Once::new();

lazy_static! {
    /// Registry holding every nfqd collector.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Raw events decoded by receive threads.
    /// Labels: queue = queue number
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("events_received_total", "Total number of packet events decoded from the kernel")
            .namespace("nfqd")
            .subsystem("queue"),
        &["queue"]
    ).expect("failed to create events_received_total metric");

    /// Labels: outcome = "delivered" | "unroutable" | "undelivered"
    pub static ref DISPATCH_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dispatch_total", "Total number of packet events settled by the dispatcher")
            .namespace("nfqd")
            .subsystem("dispatch"),
        &["outcome"]
    ).expect("failed to create dispatch_total metric");

    /// Labels: verdict = kernel verdict name, status = "ok" | "error"
    pub static ref VERDICTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("verdicts_total", "Total number of verdicts issued to the kernel")
            .namespace("nfqd")
            .subsystem("packet"),
        &["verdict", "status"]
    ).expect("failed to create verdicts_total metric");

    pub static ref QUEUES_ACTIVE: IntGauge = IntGauge::with_opts(
        Opts::new("active", "Number of queue instances currently running")
            .namespace("nfqd")
            .subsystem("queue")
    ).expect("failed to create queue_active metric");

    /// Labels: outcome = "graceful" | "stalled"
    pub static ref TEARDOWN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("teardown_total", "Total number of queue teardowns by outcome")
            .namespace("nfqd")
            .subsystem("queue"),
        &["outcome"]
    ).expect("failed to create teardown_total metric");
}

/// Register all collectors with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let collectors: [Box<dyn prometheus::core::Collector>; 5] = [
            Box::new(EVENTS_RECEIVED_TOTAL.clone()),
            Box::new(DISPATCH_TOTAL.clone()),
            Box::new(VERDICTS_TOTAL.clone()),
            Box::new(QUEUES_ACTIVE.clone()),
            Box::new(TEARDOWN_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(
                    event.name = "metrics.register_failed",
                    error.message = %e,
                    "failed to register collector"
                );
            }
        }
    });
}

pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub(crate) fn record_received(queue_num: u16) {
    EVENTS_RECEIVED_TOTAL
        .with_label_values(&[queue_num.to_string().as_str()])
        .inc();
}

pub(crate) fn record_dispatch(outcome: &str) {
    DISPATCH_TOTAL.with_label_values(&[outcome]).inc();
}

pub(crate) fn record_verdict(code: u32, ok: bool) {
    // Requeue verdicts carry the target queue in the upper half.
    let name = Verdict::try_from(code & 0xffff)
        .map(Verdict::as_str)
        .unwrap_or("unknown");
    let status = if ok { "ok" } else { "error" };
    VERDICTS_TOTAL.with_label_values(&[name, status]).inc();
}

pub(crate) fn record_teardown(outcome: &str) {
    TEARDOWN_TOTAL.with_label_values(&[outcome]).inc();
}
