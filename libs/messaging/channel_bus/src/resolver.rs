//! Dependency resolver decorators
//!
//! The connector hands every channel its own nested resolver, and the channel
//! opens a further nested scope for each delivery. The delivery scope is
//! exposed through `DeliveryContext::resolver` and, while the handler runs,
//! through `Channel::current_resolver`. It is disposed as soon as the handler
//! returns, whether it succeeded or not.

use crate::channel::{Channel, Connector, DeliveryContext, DeliveryHandler, DispatchContext};
use crate::config::ChannelGroupConfiguration;
use crate::message::{ChannelEnvelope, ChannelMessage};
use crate::unit_of_work::UnitOfWork;
use crate::ChannelError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// IoC container seam
pub trait DependencyResolver: Send + Sync + Debug {
    /// Child scope whose lifetime is controlled by the caller
    fn create_nested_resolver(&self) -> Result<Arc<dyn DependencyResolver>, ChannelError>;

    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;

    fn dispose(&self);
}

/// Typed lookup on top of `resolve_any`
pub fn resolve<T: Any + Send + Sync>(resolver: &dyn DependencyResolver) -> Option<Arc<T>> {
    resolver
        .resolve_any(TypeId::of::<T>())
        .and_then(|instance| instance.downcast::<T>().ok())
}

pub struct DependencyResolverConnector {
    inner: Box<dyn Connector>,
    resolver: Arc<dyn DependencyResolver>,
    disposed: AtomicBool,
}

impl DependencyResolverConnector {
    pub fn new(inner: Box<dyn Connector>, resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            inner,
            resolver,
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connector for DependencyResolverConnector {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        self.inner.channel_groups()
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("DependencyResolverConnector"));
        }

        let channel = self.inner.connect(channel_group).await?;
        let nested = match self.resolver.create_nested_resolver() {
            Ok(nested) => nested,
            Err(e) => {
                channel.dispose();
                return Err(e);
            }
        };

        Ok(Box::new(DependencyResolverChannel::new(channel, nested)))
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Disposing dependency resolver connector");
        self.inner.dispose();
        self.resolver.dispose();
    }
}

impl Debug for DependencyResolverConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyResolverConnector")
            .field("inner", &self.inner)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Channel that owns a resolver scope and opens one per delivery
pub struct DependencyResolverChannel {
    inner: Box<dyn Channel>,
    resolver: Arc<dyn DependencyResolver>,
    /// Scope of the delivery in flight, if any
    delivery_scope: Mutex<Option<Arc<dyn DependencyResolver>>>,
    disposed: AtomicBool,
}

impl DependencyResolverChannel {
    pub fn new(inner: Box<dyn Channel>, resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            inner,
            resolver,
            delivery_scope: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for DependencyResolverChannel {
    fn active(&self) -> bool {
        !self.disposed.load(Ordering::Acquire) && self.inner.active()
    }

    fn current_message(&self) -> Option<ChannelMessage> {
        self.inner.current_message()
    }

    fn current_transaction(&self) -> Arc<UnitOfWork> {
        self.inner.current_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfiguration> {
        self.inner.current_configuration()
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        let scope = self.delivery_scope.lock().clone();
        Some(scope.unwrap_or_else(|| self.resolver.clone()))
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
            return Err(ChannelError::disposed("DependencyResolverChannel"));
        }
        self.inner.send(envelope).await
    }

    async fn receive(&self, handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("DependencyResolverChannel"));
        }
        let mut scoped = ScopedDelivery {
            channel: self,
            handler,
        };
        self.inner.receive(&mut scoped).await
    }

    fn begin_shutdown(&self) {
        self.inner.begin_shutdown();
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispose();
        self.resolver.dispose();
    }
}

impl Debug for DependencyResolverChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyResolverChannel")
            .field("inner", &self.inner)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

struct ScopedDelivery<'a> {
    channel: &'a DependencyResolverChannel,
    handler: &'a mut dyn DeliveryHandler,
}

#[async_trait]
impl DeliveryHandler for ScopedDelivery<'_> {
    async fn on_delivery(
        &mut self,
        _inner: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<(), ChannelError> {
        let nested = self.channel.resolver.create_nested_resolver()?;
        let previous = delivery.replace_resolver(Some(nested.clone()));
        *self.channel.delivery_scope.lock() = Some(nested.clone());

        let result = self.handler.on_delivery(self.channel, delivery).await;

        *self.channel.delivery_scope.lock() = None;
        delivery.replace_resolver(previous);
        nested.dispose();
        result
    }
}
