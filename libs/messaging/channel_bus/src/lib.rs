//! Transport-agnostic message bus channels
//!
//! A `Connector` opens `Channel`s for named channel groups. Transports
//! implement both traits; cross-cutting behavior is layered on as decorators
//! that own the channel or connector they wrap:
//!
//! - [`AuditConnector`] / [`AuditChannel`]: report sends after commit and
//!   receives before the handler
//! - [`DependencyResolverConnector`] / [`DependencyResolverChannel`]: a resolver
//!   scope per channel and per delivery
//! - [`PooledDispatchConnector`]: reuse of dispatch-only channels with
//!   generation-based invalidation after connection failures
//!
//! Received messages run inside a [`UnitOfWork`]; [`ChannelReceiver`] drives
//! the receive loop and hands failures to [`PoisonMessageHandler`], which
//! retries, poisons or dead-letters them per the group configuration.
//!
//! [`InMemoryBroker`] provides a complete in-process transport.

pub mod audit;
pub mod channel;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod poison;
pub mod pool;
pub mod receiver;
pub mod resolver;
pub mod serialization;
pub mod test_utils;
pub mod unit_of_work;

pub use audit::{AuditChannel, AuditConnector, Auditor, AuditorFactory};
pub use channel::{Channel, Connector, DeliveryContext, DeliveryHandler, DispatchContext};
pub use config::{
    BusConfig, ChannelGroupConfiguration, ReconnectConfig, RetryPolicy, DEFAULT_MAX_ATTEMPTS,
};
pub use error::ChannelError;
pub use memory::{InMemoryBroker, InMemoryChannel, InMemoryConnector};
pub use message::{ChannelEnvelope, ChannelMessage, EnvelopeState, RETRY_COUNT_HEADER};
pub use poison::{
    append_failure_headers, exception_header, failure_chain, FailureDisposition, FailureFrame,
    PoisonMessageHandler, EXCEPTION_HEADER_PREFIX,
};
pub use pool::{PoolStats, PooledChannel, PooledDispatchConnector, DISPOSED_TOKEN};
pub use receiver::{ChannelReceiver, ReceiverStats};
pub use resolver::{
    resolve, DependencyResolver, DependencyResolverChannel, DependencyResolverConnector,
};
pub use serialization::{JsonSerializer, Serializer, JSON_CONTENT_FORMAT};
pub use unit_of_work::{UnitOfWork, UnitOfWorkState};
