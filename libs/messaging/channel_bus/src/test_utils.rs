//! Test doubles for channels, connectors, resolvers and auditors
//!
//! Each double exposes shared counters so a test can keep observing a channel
//! after ownership has moved into a decorator or a pool.

use crate::audit::Auditor;
use crate::channel::{Channel, Connector, DeliveryContext, DeliveryHandler, DispatchContext};
use crate::config::ChannelGroupConfiguration;
use crate::message::{ChannelEnvelope, ChannelMessage};
use crate::resolver::DependencyResolver;
use crate::unit_of_work::UnitOfWork;
use crate::ChannelError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared counter
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn incr(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Remote control for a `CountingChannel` that has been moved elsewhere
#[derive(Debug, Clone)]
pub struct ChannelProbe {
    active: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    sends: Counter,
    disposals: Counter,
    sent: Arc<Mutex<Vec<ChannelEnvelope>>>,
}

impl ChannelProbe {
    fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            fail_sends: Arc::new(AtomicBool::new(false)),
            sends: Counter::new(),
            disposals: Counter::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Every following send fails with a connection error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sends(&self) -> usize {
        self.sends.get()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.get()
    }

    pub fn sent(&self) -> Vec<ChannelEnvelope> {
        self.sent.lock().clone()
    }
}

/// Channel that records sends and disposals without touching a transport
#[derive(Debug)]
pub struct CountingChannel {
    configuration: Arc<ChannelGroupConfiguration>,
    transaction: Arc<UnitOfWork>,
    probe: ChannelProbe,
}

impl CountingChannel {
    pub fn new(configuration: ChannelGroupConfiguration) -> Self {
        Self::with_configuration(Arc::new(configuration))
    }

    pub fn with_configuration(configuration: Arc<ChannelGroupConfiguration>) -> Self {
        Self {
            configuration,
            transaction: Arc::new(UnitOfWork::new()),
            probe: ChannelProbe::new(),
        }
    }

    pub fn probe(&self) -> ChannelProbe {
        self.probe.clone()
    }

    pub fn dispose_counter(&self) -> Counter {
        self.probe.disposals.clone()
    }
}

#[async_trait]
impl Channel for CountingChannel {
    fn active(&self) -> bool {
        self.probe.disposals() == 0 && self.probe.active.load(Ordering::SeqCst)
    }

    fn current_message(&self) -> Option<ChannelMessage> {
        None
    }

    /// Shared for the channel's lifetime and never committed by the channel
    fn current_transaction(&self) -> Arc<UnitOfWork> {
        self.transaction.clone()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfiguration> {
        self.configuration.clone()
    }

    fn prepare_dispatch<'a>(
        &'a self,
        message: Option<ChannelMessage>,
        alternate: Option<&'a dyn Channel>,
    ) -> DispatchContext<'a> {
        DispatchContext::new(alternate.unwrap_or(self), message)
    }

    async fn send(&self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        if self.probe.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::connection("counting channel lost its connection"));
        }
        self.probe.sends.incr();
        self.probe.sent.lock().push(envelope);
        Ok(())
    }

    async fn receive(&self, _handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError> {
        Err(ChannelError::invalid_operation(
            "counting channel does not receive",
        ))
    }

    fn begin_shutdown(&self) {}

    fn dispose(&self) {
        self.probe.disposals.incr();
    }
}

/// Connector producing `CountingChannel`s and keeping a probe for each
#[derive(Debug)]
pub struct CountingConnector {
    groups: Vec<Arc<ChannelGroupConfiguration>>,
    connects: Counter,
    disposals: Counter,
    probes: Mutex<Vec<ChannelProbe>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl CountingConnector {
    pub fn new(groups: Vec<ChannelGroupConfiguration>) -> Self {
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            connects: Counter::new(),
            disposals: Counter::new(),
            probes: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.get()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.get()
    }

    /// Probes of every channel created so far, in creation order
    pub fn probes(&self) -> Vec<ChannelProbe> {
        self.probes.lock().clone()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Sleep inside every connect, widening race windows
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl Connector for CountingConnector {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        self.groups.clone()
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ChannelError::connection("counting connector is offline"));
        }
        let configuration = self
            .channel_group(channel_group)
            .ok_or_else(|| ChannelError::UnknownGroup(channel_group.to_string()))?;

        let channel = CountingChannel::with_configuration(configuration);
        self.probes.lock().push(channel.probe());
        self.connects.incr();
        Ok(Box::new(channel))
    }

    fn dispose(&self) {
        self.disposals.incr();
    }
}

/// Resolver whose nested scopes share creation and disposal counters
#[derive(Debug, Clone, Default)]
pub struct CountingResolver {
    created: Counter,
    disposed: Counter,
    services: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl CountingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance returned for `T` by this resolver and its scopes
    pub fn with_service<T: Any + Send + Sync>(mut self, instance: T) -> Self {
        let mut services = (*self.services).clone();
        services.insert(TypeId::of::<T>(), Arc::new(instance));
        self.services = Arc::new(services);
        self
    }

    pub fn as_resolver(&self) -> Arc<dyn DependencyResolver> {
        Arc::new(self.clone())
    }

    pub fn created(&self) -> usize {
        self.created.get()
    }

    pub fn disposed(&self) -> usize {
        self.disposed.get()
    }
}

impl DependencyResolver for CountingResolver {
    fn create_nested_resolver(&self) -> Result<Arc<dyn DependencyResolver>, ChannelError> {
        self.created.incr();
        Ok(Arc::new(self.clone()))
    }

    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&type_id).cloned()
    }

    fn dispose(&self) {
        self.disposed.incr();
    }
}

/// Auditor that keeps a readable log of what it saw
#[derive(Debug, Default)]
pub struct RecordingAuditor {
    events: Mutex<Vec<String>>,
    disposals: Counter,
}

impl RecordingAuditor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.get()
    }
}

impl Auditor for RecordingAuditor {
    fn audit_send(
        &self,
        envelope: &ChannelEnvelope,
        _incoming: Option<&ChannelMessage>,
    ) -> Result<(), ChannelError> {
        let first = envelope.recipients().first().map_or("", String::as_str);
        self.record(&format!("send:{}->{}", envelope.message().message_type(), first));
        Ok(())
    }

    fn audit_receive(&self, delivery: &DeliveryContext) -> Result<(), ChannelError> {
        self.record(&format!("receive:{}", delivery.message().message_type()));
        Ok(())
    }

    fn dispose(&self) {
        self.disposals.incr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[test]
    fn test_resolver_scopes_share_services_and_counters() {
        let root = CountingResolver::new().with_service(Clock(7));
        let nested = root.create_nested_resolver().unwrap();

        assert_eq!(resolve::<Clock>(nested.as_ref()).as_deref(), Some(&Clock(7)));
        nested.dispose();
        assert_eq!(root.created(), 1);
        assert_eq!(root.disposed(), 1);
    }

    #[tokio::test]
    async fn test_probe_controls_moved_channel() {
        let connector = CountingConnector::new(vec![ChannelGroupConfiguration::dispatch_only("out")]);
        let channel = connector.connect("out").await.unwrap();
        let probe = connector.probes()[0].clone();

        probe.set_active(false);
        assert!(!channel.active());

        probe.fail_sends(true);
        let envelope =
            ChannelEnvelope::new(ChannelMessage::new("Ping", Vec::new()), vec!["a".into()])
                .unwrap();
        assert!(channel.send(envelope).await.unwrap_err().is_connection_error());
        assert_eq!(probe.sends(), 0);
    }
}
