//! In-memory transport
//!
//! A process-local broker with named FIFO queues. It implements the full
//! channel contract, including transactional sends, acknowledge-on-commit and
//! requeue-on-rollback, so the decorators, the pool and the failure protocol
//! can run without an external broker.
//!
//! ```rust,ignore
//! let broker = InMemoryBroker::new();
//! let connector = broker.connector(vec![ChannelGroupConfiguration::receiving("orders", "orders")]);
//! let channel = connector.connect("orders").await?;
//! ```

use crate::channel::{Channel, Connector, DeliveryContext, DeliveryHandler, DispatchContext};
use crate::config::{BusConfig, ChannelGroupConfiguration};
use crate::message::{ChannelEnvelope, ChannelMessage};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkState};
use crate::ChannelError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<ChannelMessage>>,
    ready: Notify,
}

struct BrokerState {
    queues: DashMap<String, Arc<MemoryQueue>>,
    online: AtomicBool,
    published: AtomicU64,
}

/// Shared handle to a process-local broker
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: DashMap::new(),
                online: AtomicBool::new(true),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Connector serving the given groups from this broker
    pub fn connector(&self, groups: Vec<ChannelGroupConfiguration>) -> InMemoryConnector {
        InMemoryConnector::new(self.clone(), groups)
    }

    pub fn publish(&self, queue: &str, message: ChannelMessage) {
        let queue = self.queue(queue);
        queue.messages.lock().push_back(message);
        self.state.published.fetch_add(1, Ordering::Relaxed);
        queue.ready.notify_one();
    }

    /// Snapshot of the messages waiting in a queue
    pub fn messages(&self, queue: &str) -> Vec<ChannelMessage> {
        self.state
            .queues
            .get(queue)
            .map(|q| q.messages.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.state
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.lock().len())
    }

    /// Total number of publishes across all queues
    pub fn published(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }

    /// Simulate losing or regaining the broker connection
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::Release);
        if !online {
            for queue in self.state.queues.iter() {
                queue.ready.notify_waiters();
            }
        }
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.state
            .queues
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn pop(&self, queue: &MemoryQueue) -> Option<ChannelMessage> {
        queue.messages.lock().pop_front()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("queues", &self.state.queues.len())
            .field("online", &self.is_online())
            .finish()
    }
}

#[derive(Debug)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    groups: Vec<Arc<ChannelGroupConfiguration>>,
    disposed: AtomicBool,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker, groups: Vec<ChannelGroupConfiguration>) -> Self {
        Self {
            broker,
            groups: groups.into_iter().map(Arc::new).collect(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Connector serving every group of a validated `BusConfig`
    pub fn from_config(broker: InMemoryBroker, config: &BusConfig) -> Result<Self, ChannelError> {
        Ok(Self {
            broker,
            groups: config.channel_groups()?,
            disposed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        self.groups.clone()
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("InMemoryConnector"));
        }
        let configuration = self
            .channel_group(channel_group)
            .ok_or_else(|| ChannelError::UnknownGroup(channel_group.to_string()))?;
        if !self.broker.is_online() {
            return Err(ChannelError::connection("in-memory broker is offline"));
        }

        Ok(Box::new(InMemoryChannel::new(
            self.broker.clone(),
            configuration,
        )))
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// Channel bound to one group of an `InMemoryBroker`
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    configuration: Arc<ChannelGroupConfiguration>,
    /// Collects sends made outside a delivery; committed per send
    dispatch: Mutex<Arc<UnitOfWork>>,
    delivery: Mutex<Option<(ChannelMessage, Arc<UnitOfWork>)>>,
    shutdown: watch::Sender<bool>,
    disposed: AtomicBool,
    fail_next_send: AtomicBool,
}

impl InMemoryChannel {
    pub fn new(broker: InMemoryBroker, configuration: Arc<ChannelGroupConfiguration>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            configuration,
            dispatch: Mutex::new(Arc::new(UnitOfWork::new())),
            delivery: Mutex::new(None),
            shutdown,
            disposed: AtomicBool::new(false),
            fail_next_send: AtomicBool::new(false),
        }
    }

    /// Make the next send fail with a connection error
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::Relaxed);
    }

    fn publish_action(
        &self,
        envelope: ChannelEnvelope,
    ) -> impl FnOnce() -> Result<(), ChannelError> + Send + 'static {
        let broker = self.broker.clone();
        move || {
            if !broker.is_online() {
                return Err(ChannelError::connection("in-memory broker is offline"));
            }
            for recipient in envelope.recipients() {
                broker.publish(recipient, envelope.message().clone());
            }
            Ok(())
        }
    }

    fn take_dispatch_transaction(&self) -> Arc<UnitOfWork> {
        std::mem::replace(&mut *self.dispatch.lock(), Arc::new(UnitOfWork::new()))
    }

    async fn deliver(
        &self,
        message: ChannelMessage,
        queue: &str,
        handler: &mut dyn DeliveryHandler,
    ) -> Result<(), ChannelError> {
        let transaction = Arc::new(UnitOfWork::new());
        *self.delivery.lock() = Some((message.clone(), transaction.clone()));

        let mut context =
            DeliveryContext::new(message, transaction.clone(), self.configuration.clone());
        let result = handler.on_delivery(self, &mut context).await;
        *self.delivery.lock() = None;

        match result {
            Ok(()) => match transaction.state() {
                UnitOfWorkState::Active => transaction.commit(),
                UnitOfWorkState::Committed => Ok(()),
                UnitOfWorkState::RolledBack => {
                    tracing::debug!(queue, "Delivery rolled back, requeueing");
                    self.broker.publish(queue, context.into_message());
                    Ok(())
                }
            },
            Err(e) => {
                if transaction.is_active() {
                    transaction.rollback()?;
                }
                self.broker.publish(queue, context.into_message());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn active(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.broker.is_online()
    }

    fn current_message(&self) -> Option<ChannelMessage> {
        self.delivery.lock().as_ref().map(|(message, _)| message.clone())
    }

    fn current_transaction(&self) -> Arc<UnitOfWork> {
        match self.delivery.lock().as_ref() {
            Some((_, transaction)) => transaction.clone(),
            None => self.dispatch.lock().clone(),
        }
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
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("InMemoryChannel"));
        }

        let delivery_transaction = self
            .delivery
            .lock()
            .as_ref()
            .map(|(_, transaction)| transaction.clone());

        if self.fail_next_send.swap(false, Ordering::Relaxed) || !self.broker.is_online() {
            if delivery_transaction.is_none() {
                let _ = self.take_dispatch_transaction().rollback();
            }
            return Err(ChannelError::connection("in-memory broker is offline"));
        }

        let publish = self.publish_action(envelope);
        match delivery_transaction {
            Some(transaction) if self.configuration.transactional => transaction.register(publish),
            Some(_) => publish(),
            None => {
                let transaction = self.take_dispatch_transaction();
                transaction.register(publish)?;
                transaction.commit()
            }
        }
    }

    async fn receive(&self, handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("InMemoryChannel"));
        }
        if self.configuration.dispatch_only {
            return Err(ChannelError::invalid_operation(format!(
                "group '{}' is dispatch-only",
                self.configuration.name
            )));
        }
        let queue_name = self.configuration.input_queue.clone().ok_or_else(|| {
            ChannelError::invalid_config(format!(
                "group '{}' has no input queue",
                self.configuration.name
            ))
        })?;
        let queue = self.broker.queue(&queue_name);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let stopping = *shutdown.borrow_and_update();
            if stopping || self.disposed.load(Ordering::Acquire) {
                return Ok(());
            }
            if !self.broker.is_online() {
                return Err(ChannelError::connection("in-memory broker is offline"));
            }

            match self.broker.pop(&queue) {
                Some(message) => self.deliver(message, &queue_name, handler).await?,
                None => {
                    tokio::select! {
                        _ = queue.ready.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        tracing::trace!(group = %self.configuration.name, "In-memory channel disposed");
    }
}

impl Debug for InMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("group", &self.configuration.name)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
