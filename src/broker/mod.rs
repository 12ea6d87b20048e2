//! Message broker plumbing.
//!
//! - `state`: connection state machine
//! - `transport`: the transport/session traits
//! - `amqp`: lapin-backed AMQP transport
//! - `memory`: in-process transport
//! - `connection`: `BrokerConnection` (lifecycle, publish/consume, reconnect chain)
//! - `message`: wire records exchanged with workers

pub mod amqp;
pub mod connection;
pub mod memory;
pub mod message;
pub mod state;
pub mod transport;

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

pub use amqp::AmqpTransport;
pub use connection::{BrokerConnection, DeliveryHandler, ReconnectOutcome};
pub use memory::MemoryTransport;
pub use message::{InboundResult, OutboundJob};
pub use state::ConnectionState;
pub use transport::{BrokerSession, BrokerTransport, DeliveryStream, LinkEvent, LinkEvents};

/// Endpoint scheme that selects the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Pick a transport for `endpoint`: `memory://` runs in-process, anything else speaks AMQP.
pub fn transport_for(endpoint: &SecretString) -> Arc<dyn BrokerTransport> {
    if endpoint.expose_secret().starts_with(MEMORY_SCHEME) {
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(AmqpTransport::new(endpoint.clone()))
    }
}
