//! HTTP engine metrics, exposed through metriken alongside the core
//! selwire counters.

use metriken::{metric, Counter};

#[metric(
    name = "selwire_http/connections/accepted",
    description = "TCP connections accepted by the server"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "selwire_http/requests/dispatched",
    description = "Requests dispatched to the handler"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "selwire_http/errors/protocol",
    description = "Requests rejected with an error response"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "selwire_http/upgrades",
    description = "Connections handed off after a 101 response"
)]
pub static PROTOCOL_SWITCHES: Counter = Counter::new();
