//! Channel and connector contracts
//!
//! Every transport adapter and every decorator implements these traits. A
//! decorator owns its inner `Box<dyn Channel>` / `Box<dyn Connector>` and
//! forwards the read-only surface directly, intercepting only `send` and
//! `receive`.
//!
//! ```text
//! application ──> AuditChannel ──> DependencyResolverChannel ──> transport channel
//!                   send: register audit on commit     send: forward
//!                   receive: audit, then handler       receive: nested resolver scope
//! ```

use crate::config::ChannelGroupConfiguration;
use crate::message::{ChannelEnvelope, ChannelMessage, EnvelopeState};
use crate::resolver::DependencyResolver;
use crate::unit_of_work::UnitOfWork;
use crate::ChannelError;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// A bound conduit for sending and receiving within one channel group
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Channel can still be used
    fn active(&self) -> bool;

    /// Message being delivered right now, if any
    fn current_message(&self) -> Option<ChannelMessage>;

    /// Unit of work that sends and acknowledgements register with
    fn current_transaction(&self) -> Arc<UnitOfWork>;

    fn current_configuration(&self) -> Arc<ChannelGroupConfiguration>;

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        None
    }

    /// Start building a dispatch scoped to this channel. When `alternate` is
    /// given the final send goes through that channel instead.
    fn prepare_dispatch<'a>(
        &'a self,
        message: Option<ChannelMessage>,
        alternate: Option<&'a dyn Channel>,
    ) -> DispatchContext<'a>;

    async fn send(&self, envelope: ChannelEnvelope) -> Result<(), ChannelError>;

    /// Deliver messages to `handler` one at a time until shutdown. A handler
    /// error rolls back that delivery and is returned to the caller.
    async fn receive(&self, handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError>;

    /// Stop accepting deliveries once the in-flight one completes
    fn begin_shutdown(&self);

    /// Release the channel; repeated calls are no-ops
    fn dispose(&self);
}

/// Factory for channels, keyed by channel group name
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>>;

    fn channel_group(&self, name: &str) -> Option<Arc<ChannelGroupConfiguration>> {
        self.channel_groups().into_iter().find(|g| g.name == name)
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError>;

    fn dispose(&self);
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for Arc<T> {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        (**self).channel_groups()
    }

    fn channel_group(&self, name: &str) -> Option<Arc<ChannelGroupConfiguration>> {
        (**self).channel_group(name)
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        (**self).connect(channel_group).await
    }

    fn dispose(&self) {
        (**self).dispose()
    }
}

/// Callback invoked once per delivered message
///
/// `channel` is the outermost channel of the pipeline, so sends made from the
/// handler pass through every decorator.
#[async_trait]
pub trait DeliveryHandler: Send {
    async fn on_delivery(
        &mut self,
        channel: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<(), ChannelError>;
}

#[async_trait]
impl<F> DeliveryHandler for F
where
    F: FnMut(&dyn Channel, &mut DeliveryContext) -> Result<(), ChannelError> + Send,
{
    async fn on_delivery(
        &mut self,
        channel: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<(), ChannelError> {
        (self)(channel, delivery)
    }
}

/// Per-delivery state handed to the handler
pub struct DeliveryContext {
    message: ChannelMessage,
    received: ChannelMessage,
    transaction: Arc<UnitOfWork>,
    configuration: Arc<ChannelGroupConfiguration>,
    resolver: Option<Arc<dyn DependencyResolver>>,
}

impl DeliveryContext {
    pub fn new(
        message: ChannelMessage,
        transaction: Arc<UnitOfWork>,
        configuration: Arc<ChannelGroupConfiguration>,
    ) -> Self {
        Self {
            received: message.clone(),
            message,
            transaction,
            configuration,
            resolver: None,
        }
    }

    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut ChannelMessage {
        &mut self.message
    }

    /// The message exactly as the transport delivered it, before any
    /// decorator or handler touched it
    pub fn received_message(&self) -> &ChannelMessage {
        &self.received
    }

    pub fn transaction(&self) -> &Arc<UnitOfWork> {
        &self.transaction
    }

    pub fn configuration(&self) -> &Arc<ChannelGroupConfiguration> {
        &self.configuration
    }

    /// Resolver scoped to this delivery, when a resolver decorator is installed
    pub fn resolver(&self) -> Option<&Arc<dyn DependencyResolver>> {
        self.resolver.as_ref()
    }

    /// Swap the delivery resolver, returning the previous one
    pub fn replace_resolver(
        &mut self,
        resolver: Option<Arc<dyn DependencyResolver>>,
    ) -> Option<Arc<dyn DependencyResolver>> {
        std::mem::replace(&mut self.resolver, resolver)
    }

    pub fn into_message(self) -> ChannelMessage {
        self.message
    }
}

impl Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("message_id", &self.message.message_id())
            .field("group", &self.configuration.name)
            .field("transaction", &self.transaction)
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Builder for a single dispatch through a channel
pub struct DispatchContext<'a> {
    channel: &'a dyn Channel,
    message: Option<ChannelMessage>,
    recipients: Vec<String>,
    headers: Vec<(String, String)>,
    state: Option<EnvelopeState>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(channel: &'a dyn Channel, message: Option<ChannelMessage>) -> Self {
        Self {
            channel,
            message,
            recipients: Vec::new(),
            headers: Vec::new(),
            state: None,
        }
    }

    pub fn with_message(mut self, message: ChannelMessage) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_destination(mut self, address: impl Into<String>) -> Self {
        self.recipients.push(address.into());
        self
    }

    pub fn with_destinations<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients.extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_state(mut self, state: EnvelopeState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn build(self) -> Result<(&'a dyn Channel, ChannelEnvelope), ChannelError> {
        let mut message = self
            .message
            .ok_or_else(|| ChannelError::invalid_operation("no message to dispatch"))?;
        if self.recipients.is_empty() {
            return Err(ChannelError::invalid_operation(
                "dispatch has no destination",
            ));
        }
        for (key, value) in self.headers {
            message.set_header(key, value);
        }

        let envelope = ChannelEnvelope::with_state(message, self.recipients, self.state)?;
        Ok((self.channel, envelope))
    }

    pub async fn send(self) -> Result<(), ChannelError> {
        let (channel, envelope) = self.build()?;
        channel.send(envelope).await
    }
}

impl Debug for DispatchContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("channel", &self.channel)
            .field("has_message", &self.message.is_some())
            .field("recipients", &self.recipients)
            .finish()
    }
}
