//! Prometheus metrics for the lock/mint relayer
//!
//! Exposed on the `/metrics` endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Ingestion
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "lockmint_events_observed_total",
        "Lock events yielded by the chain reader",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_ADMITTED: CounterVec = register_counter_vec!(
        "lockmint_events_admitted_total",
        "Lock events admitted by the finality gate (new records only)",
        &["chain"]
    ).unwrap();

    pub static ref REORG_DISCARDS: CounterVec = register_counter_vec!(
        "lockmint_reorg_discards_total",
        "Events dropped because their block is no longer canonical",
        &["chain"]
    ).unwrap();

    pub static ref CHECKPOINT_HEIGHT: GaugeVec = register_gauge_vec!(
        "lockmint_checkpoint_height",
        "Highest fully scanned source height",
        &["chain"]
    ).unwrap();

    pub static ref READER_ERRORS: CounterVec = register_counter_vec!(
        "lockmint_reader_errors_total",
        "Failed chain reads that triggered a reconnect",
        &["chain"]
    ).unwrap();

    // Dispatch
    pub static ref DISPATCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "lockmint_dispatch_attempts_total",
        "Destination submissions by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref RECORDS_CONFIRMED: CounterVec = register_counter_vec!(
        "lockmint_records_confirmed_total",
        "Records that reached Confirmed",
        &["chain"]
    ).unwrap();

    pub static ref RECORDS_ABANDONED: CounterVec = register_counter_vec!(
        "lockmint_records_abandoned_total",
        "Records that reached Abandoned",
        &["chain", "reason"]
    ).unwrap();

    pub static ref STORE_CORRUPTION: CounterVec = register_counter_vec!(
        "lockmint_store_corruption_total",
        "Records frozen after an invariant violation",
        &["chain"]
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "lockmint_relay_latency_seconds",
        "Time from record creation to Confirmed",
        &["chain"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "lockmint_dispatch_queue_depth",
        "Dedup keys waiting in the dispatch queue"
    ).unwrap();

    pub static ref IN_FLIGHT: Gauge = register_gauge!(
        "lockmint_dispatch_in_flight",
        "Records currently claimed by a dispatch worker"
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "lockmint_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn record_event_observed(chain: &str) {
    EVENTS_OBSERVED.with_label_values(&[chain]).inc();
}

pub fn record_event_admitted(chain: &str) {
    EVENTS_ADMITTED.with_label_values(&[chain]).inc();
}

pub fn record_reorg_discard(chain: &str) {
    REORG_DISCARDS.with_label_values(&[chain]).inc();
}

pub fn set_checkpoint(chain: &str, height: u64) {
    CHECKPOINT_HEIGHT
        .with_label_values(&[chain])
        .set(height as f64);
}

pub fn record_reader_error(chain: &str) {
    READER_ERRORS.with_label_values(&[chain]).inc();
}

/// Record a destination submission; `outcome` is one of
/// `submitted`, `recovered`, `transient`, `permanent`
pub fn record_dispatch_attempt(outcome: &str) {
    DISPATCH_ATTEMPTS.with_label_values(&[outcome]).inc();
}

pub fn record_confirmed(chain: &str, latency_seconds: f64) {
    RECORDS_CONFIRMED.with_label_values(&[chain]).inc();
    RELAY_LATENCY
        .with_label_values(&[chain])
        .observe(latency_seconds);
}

pub fn record_abandoned(chain: &str, reason: &str) {
    RECORDS_ABANDONED.with_label_values(&[chain, reason]).inc();
}

pub fn record_store_corruption(chain: &str) {
    STORE_CORRUPTION.with_label_values(&[chain]).inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn set_in_flight(count: usize) {
    IN_FLIGHT.set(count as f64);
}
