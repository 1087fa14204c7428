//! Transaction metrics.
//!
//! Fire-and-forget counters for transaction lifecycle and body throughput.
//! Exposed via Prometheus when the embedding server registers the
//! metriken registry with its admin endpoint.

use metriken::{metric, Counter, Gauge};

// ── Lifecycle ────────────────────────────────────────────────────

#[metric(
    name = "httptxn/transactions/opened",
    description = "Total transactions created"
)]
pub static TXN_OPENED: Counter = Counter::new();

#[metric(
    name = "httptxn/transactions/completed",
    description = "Transactions that finished both directions cleanly"
)]
pub static TXN_COMPLETED: Counter = Counter::new();

#[metric(
    name = "httptxn/transactions/aborted",
    description = "Transactions terminated by abort"
)]
pub static TXN_ABORTED: Counter = Counter::new();

#[metric(
    name = "httptxn/transactions/active",
    description = "Transactions currently attached"
)]
pub static TXN_ACTIVE: Gauge = Gauge::new();

// ── Errors ───────────────────────────────────────────────────────

#[metric(
    name = "httptxn/errors/protocol",
    description = "Protocol errors (invalid transitions, length mismatches)"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "httptxn/errors/timeout",
    description = "Idle timeout expirations"
)]
pub static TIMEOUTS: Counter = Counter::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(
    name = "httptxn/body/ingress_bytes",
    description = "Body bytes received from the codec"
)]
pub static INGRESS_BODY_BYTES: Counter = Counter::new();

#[metric(
    name = "httptxn/body/egress_bytes",
    description = "Body bytes flushed to the transport"
)]
pub static EGRESS_BODY_BYTES: Counter = Counter::new();

// ── Back-pressure ────────────────────────────────────────────────

#[metric(
    name = "httptxn/egress/handler_pauses",
    description = "Handler egress pause notifications"
)]
pub static HANDLER_EGRESS_PAUSES: Counter = Counter::new();

#[metric(
    name = "httptxn/egress/rate_limited",
    description = "Flushes deferred by the egress rate limiter"
)]
pub static RATE_LIMITED_FLUSHES: Counter = Counter::new();

#[metric(
    name = "httptxn/ingress/deferred_events",
    description = "Ingress events queued while the handler was paused"
)]
pub static DEFERRED_INGRESS_EVENTS: Counter = Counter::new();
