//! Audit decorators
//!
//! `AuditConnector` asks its factory for a set of auditors per channel and wraps
//! the channel in an `AuditChannel`. Outgoing envelopes are audited only once
//! the current unit of work commits; incoming deliveries are audited before the
//! handler runs.

use crate::channel::{Channel, Connector, DeliveryContext, DeliveryHandler, DispatchContext};
use crate::config::ChannelGroupConfiguration;
use crate::message::{ChannelEnvelope, ChannelMessage};
use crate::resolver::DependencyResolver;
use crate::unit_of_work::UnitOfWork;
use crate::ChannelError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observes traffic passing through an audited channel
pub trait Auditor: Send + Sync + Debug {
    /// Called after the transaction carrying `envelope` commits. `incoming`
    /// is the message being handled when the send was made, if any.
    fn audit_send(
        &self,
        envelope: &ChannelEnvelope,
        incoming: Option<&ChannelMessage>,
    ) -> Result<(), ChannelError>;

    fn audit_receive(&self, delivery: &DeliveryContext) -> Result<(), ChannelError>;

    fn dispose(&self) {}
}

/// Builds the auditors for a freshly connected channel
pub type AuditorFactory = Arc<dyn Fn(&dyn Channel) -> Vec<Arc<dyn Auditor>> + Send + Sync>;

pub struct AuditConnector {
    inner: Box<dyn Connector>,
    factory: AuditorFactory,
    disposed: AtomicBool,
}

impl AuditConnector {
    pub fn new(inner: Box<dyn Connector>, factory: AuditorFactory) -> Self {
        Self {
            inner,
            factory,
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connector for AuditConnector {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        self.inner.channel_groups()
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("AuditConnector"));
        }

        let channel = self.inner.connect(channel_group).await?;
        let auditors = (self.factory)(channel.as_ref());
        if auditors.is_empty() {
            tracing::trace!(channel_group, "No auditors configured, channel left unwrapped");
            return Ok(channel);
        }

        Ok(Box::new(AuditChannel::new(channel, auditors)?))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Disposing audit connector");
        self.inner.dispose();
    }
}

impl Debug for AuditConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConnector")
            .field("inner", &self.inner)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Channel that reports its traffic to a non-empty set of auditors
pub struct AuditChannel {
    inner: Box<dyn Channel>,
    auditors: Arc<Vec<Arc<dyn Auditor>>>,
    /// Delivery message as handed to the handler, stamped with `dispatched`
    in_flight: Mutex<Option<ChannelMessage>>,
    disposed: AtomicBool,
}

impl AuditChannel {
    /// Fails with `InvalidArgument` when `auditors` is empty. On failure the
    /// inner channel is disposed, since ownership already moved here.
    pub fn new(
        inner: Box<dyn Channel>,
        auditors: Vec<Arc<dyn Auditor>>,
    ) -> Result<Self, ChannelError> {
        if auditors.is_empty() {
            inner.dispose();
            return Err(ChannelError::invalid_argument(
                "audit channel requires at least one auditor",
            ));
        }

        Ok(Self {
            inner,
            auditors: Arc::new(auditors),
            in_flight: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn auditor_count(&self) -> usize {
        self.auditors.len()
    }

    fn ensure_live(&self) -> Result<(), ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("AuditChannel"));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for AuditChannel {
    fn active(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.inner.active()
    }

    fn current_message(&self) -> Option<ChannelMessage> {
        let in_flight = self.in_flight.lock().clone();
        in_flight.or_else(|| self.inner.current_message())
    }

    fn current_transaction(&self) -> Arc<UnitOfWork> {
        self.inner.current_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfiguration> {
        self.inner.current_configuration()
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        self.inner.current_resolver()
    }

    fn prepare_dispatch<'a>(
        &'a self,
        message: Option<ChannelMessage>,
        alternate: Option<&'a dyn Channel>,
    ) -> DispatchContext<'a> {
        DispatchContext::new(alternate.unwrap_or(self), message)
    }

    async fn send(&self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        self.ensure_live()?;

        let auditors = self.auditors.clone();
        let audited = envelope.clone();
        let incoming = self.current_message();
        self.inner.current_transaction().register(move || {
            let mut first_error = None;
            for auditor in auditors.iter() {
                if let Err(e) = auditor.audit_send(&audited, incoming.as_ref()) {
                    tracing::warn!(?auditor, "Send audit failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })?;

        self.inner.send(envelope).await
    }

    async fn receive(&self, handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError> {
        self.ensure_live()?;
        let mut audited = AuditedDelivery {
            channel: self,
            handler,
        };
        self.inner.receive(&mut audited).await
    }

    fn begin_shutdown(&self) {
        self.inner.begin_shutdown();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispose();
        for auditor in self.auditors.iter() {
            auditor.dispose();
        }
    }
}

impl Debug for AuditChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditChannel")
            .field("inner", &self.inner)
            .field("auditors", &self.auditors.len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

struct AuditedDelivery<'a> {
    channel: &'a AuditChannel,
    handler: &'a mut dyn DeliveryHandler,
}

#[async_trait]
impl DeliveryHandler for AuditedDelivery<'_> {
    async fn on_delivery(
        &mut self,
        _inner: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<(), ChannelError> {
        delivery.message_mut().mark_dispatched(Utc::now());
        for auditor in self.channel.auditors.iter() {
            auditor.audit_receive(delivery)?;
        }

        *self.channel.in_flight.lock() = Some(delivery.message().clone());
        let result = self.handler.on_delivery(self.channel, delivery).await;
        *self.channel.in_flight.lock() = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBroker;
    use crate::test_utils::{CountingChannel, RecordingAuditor};

    fn envelope(to: &str) -> ChannelEnvelope {
        ChannelEnvelope::new(ChannelMessage::new("Ping", Vec::new()), vec![to.to_string()])
            .unwrap()
    }

    #[test]
    fn test_empty_auditor_set_rejected() {
        let inner = CountingChannel::new(ChannelGroupConfiguration::dispatch_only("out"));
        let disposals = inner.dispose_counter();

        let result = AuditChannel::new(Box::new(inner), Vec::new());

        assert!(matches!(result, Err(ChannelError::InvalidArgument(_))));
        assert_eq!(disposals.get(), 1);
    }

    #[test]
    fn test_dispose_once() {
        let inner = CountingChannel::new(ChannelGroupConfiguration::dispatch_only("out"));
        let disposals = inner.dispose_counter();
        let auditor = RecordingAuditor::new();

        let channel = AuditChannel::new(Box::new(inner), vec![auditor.clone()]).unwrap();
        channel.dispose();
        channel.dispose();

        assert_eq!(disposals.get(), 1);
        assert_eq!(auditor.disposals(), 1);
        assert!(!channel.active());
    }

    #[tokio::test]
    async fn test_send_audited_after_commit() {
        let inner = CountingChannel::new(ChannelGroupConfiguration::dispatch_only("out"));
        let transaction = inner.current_transaction();
        let auditor = RecordingAuditor::new();
        let channel = AuditChannel::new(Box::new(inner), vec![auditor.clone()]).unwrap();

        channel.send(envelope("billing")).await.unwrap();
        assert!(auditor.events().is_empty());

        transaction.commit().unwrap();
        assert_eq!(auditor.events(), vec!["send:Ping->billing".to_string()]);
    }

    #[tokio::test]
    async fn test_send_after_dispose_fails() {
        let inner = CountingChannel::new(ChannelGroupConfiguration::dispatch_only("out"));
        let channel = AuditChannel::new(Box::new(inner), vec![RecordingAuditor::new()]).unwrap();
        channel.dispose();

        let err = channel.send(envelope("billing")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Disposed(_)));
    }

    #[tokio::test]
    async fn test_receive_audited_before_handler() {
        let broker = InMemoryBroker::new();
        let group = ChannelGroupConfiguration::receiving("orders", "orders");
        broker.publish("orders", ChannelMessage::new("OrderPlaced", Vec::new()));

        let auditor = RecordingAuditor::new();
        let log = auditor.clone();
        let factory: AuditorFactory = Arc::new(move |_: &dyn Channel| {
            let auditor: Arc<dyn Auditor> = auditor.clone();
            vec![auditor]
        });
        let connector = AuditConnector::new(Box::new(broker.connector(vec![group])), factory);
        let channel = connector.connect("orders").await.unwrap();

        let handler_log = log.clone();
        let mut handler = move |channel: &dyn Channel,
                                delivery: &mut DeliveryContext|
              -> Result<(), ChannelError> {
            assert!(delivery.message().dispatched().is_some());
            handler_log.record("handler");
            channel.begin_shutdown();
            Ok(())
        };
        channel.receive(&mut handler).await.unwrap();

        assert_eq!(
            log.events(),
            vec!["receive:OrderPlaced".to_string(), "handler".to_string()]
        );
    }

    /// Keeps the `dispatched` stamp of the incoming message seen by each send audit
    #[derive(Debug, Default)]
    struct IncomingStamps(parking_lot::Mutex<Vec<bool>>);

    impl Auditor for IncomingStamps {
        fn audit_send(
            &self,
            _envelope: &ChannelEnvelope,
            incoming: Option<&ChannelMessage>,
        ) -> Result<(), ChannelError> {
            let stamped = incoming.is_some_and(|m| m.dispatched().is_some());
            self.0.lock().push(stamped);
            Ok(())
        }

        fn audit_receive(&self, _delivery: &DeliveryContext) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    struct ForwardToBilling;

    #[async_trait]
    impl DeliveryHandler for ForwardToBilling {
        async fn on_delivery(
            &mut self,
            channel: &dyn Channel,
            delivery: &mut DeliveryContext,
        ) -> Result<(), ChannelError> {
            let current = channel.current_message().unwrap();
            assert!(current.dispatched().is_some());
            assert_eq!(current.dispatched(), delivery.message().dispatched());

            channel.begin_shutdown();
            channel
                .prepare_dispatch(Some(ChannelMessage::new("Invoice", Vec::new())), None)
                .with_destination("billing")
                .send()
                .await
        }
    }

    #[tokio::test]
    async fn test_current_message_carries_dispatched_stamp() {
        let broker = InMemoryBroker::new();
        let group = ChannelGroupConfiguration::receiving("orders", "orders");
        broker.publish("orders", ChannelMessage::new("OrderPlaced", Vec::new()));

        let stamps = Arc::new(IncomingStamps::default());
        let inner = broker.connector(vec![group]).connect("orders").await.unwrap();
        let channel = AuditChannel::new(inner, vec![stamps.clone()]).unwrap();

        channel.receive(&mut ForwardToBilling).await.unwrap();

        assert_eq!(broker.len("billing"), 1);
        assert_eq!(*stamps.0.lock(), vec![true]);
        assert!(channel.current_message().is_none());
    }

    #[tokio::test]
    async fn test_connector_skips_wrapping_without_auditors() {
        let broker = InMemoryBroker::new();
        let group = ChannelGroupConfiguration::dispatch_only("out");
        let factory: AuditorFactory = Arc::new(|_: &dyn Channel| Vec::new());
        let connector = AuditConnector::new(Box::new(broker.connector(vec![group])), factory);

        let channel = connector.connect("out").await.unwrap();
        assert!(format!("{:?}", channel).starts_with("InMemoryChannel"));
    }
}
