//! selwire runtime metrics.
//!
//! Counters for endpoint traffic, buffer-pool leasing, selector activity,
//! and readiness blocking. Exposed through metriken for Prometheus-style
//! exposition by whatever admin surface the embedding server provides.

use metriken::{metric, Counter, Gauge};

// ── Endpoint traffic ─────────────────────────────────────────────

#[metric(name = "selwire/bytes/filled", description = "Total bytes read from endpoints")]
pub static BYTES_FILLED: Counter = Counter::new();

#[metric(name = "selwire/bytes/flushed", description = "Total bytes written to endpoints")]
pub static BYTES_FLUSHED: Counter = Counter::new();

// ── Selector ─────────────────────────────────────────────────────

#[metric(
    name = "selwire/connections/registered",
    description = "Total connections registered with the selector"
)]
pub static CONNECTIONS_REGISTERED: Counter = Counter::new();

#[metric(
    name = "selwire/connections/deregistered",
    description = "Total connections removed from the selector"
)]
pub static CONNECTIONS_DEREGISTERED: Counter = Counter::new();

#[metric(
    name = "selwire/connections/active",
    description = "Connections currently registered"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "selwire/idle/expired",
    description = "Connections expired by the idle sweep"
)]
pub static IDLE_EXPIRED: Counter = Counter::new();

// ── Executor ─────────────────────────────────────────────────────

#[metric(name = "selwire/dispatch/queued", description = "Work units queued")]
pub static DISPATCHES: Counter = Counter::new();

#[metric(
    name = "selwire/dispatch/failures",
    description = "Work units dropped or panicked"
)]
pub static DISPATCH_FAILURES: Counter = Counter::new();

// ── Blocking helpers ─────────────────────────────────────────────

#[metric(
    name = "selwire/block/timeouts",
    description = "block_readable/block_writeable waits that timed out"
)]
pub static BLOCK_TIMEOUTS: Counter = Counter::new();

// ── Buffer pool ──────────────────────────────────────────────────

#[metric(name = "selwire/pool/acquired", description = "Buffers leased from pools")]
pub static POOL_ACQUIRED: Counter = Counter::new();

#[metric(name = "selwire/pool/returned", description = "Buffers returned to pools")]
pub static POOL_RETURNED: Counter = Counter::new();

#[metric(
    name = "selwire/pool/misses",
    description = "Leases served by fresh allocation instead of recycling"
)]
pub static POOL_MISSES: Counter = Counter::new();
