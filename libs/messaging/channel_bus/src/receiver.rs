//! Receive loop with failure handling and reconnection
//!
//! `ChannelReceiver` connects to one channel group, feeds every delivery to an
//! application handler and routes failures through `PoisonMessageHandler`.
//! When the transport drops, it reconnects with the backoff described by a
//! `ReconnectConfig` until it runs out of attempts or is shut down.

use crate::channel::{Channel, Connector, DeliveryContext, DeliveryHandler};
use crate::config::ReconnectConfig;
use crate::poison::{FailureDisposition, PoisonMessageHandler};
use crate::ChannelError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Counters for a receiver's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub handled: usize,
    pub retried: usize,
    pub redelivered: usize,
    pub poisoned: usize,
    pub dead_lettered: usize,
    pub reconnects: usize,
}

#[derive(Debug, Default)]
struct ReceiverCounters {
    handled: AtomicUsize,
    retried: AtomicUsize,
    redelivered: AtomicUsize,
    poisoned: AtomicUsize,
    dead_lettered: AtomicUsize,
    reconnects: AtomicUsize,
}

impl ReceiverCounters {
    fn record(&self, disposition: FailureDisposition) {
        let counter = match disposition {
            FailureDisposition::DeadLettered => &self.dead_lettered,
            FailureDisposition::Retried { .. } => &self.retried,
            FailureDisposition::Redelivered { .. } => &self.redelivered,
            FailureDisposition::Poisoned { .. } => &self.poisoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ChannelReceiver {
    connector: Arc<dyn Connector>,
    channel_group: String,
    reconnect: ReconnectConfig,
    poison: PoisonMessageHandler,
    counters: ReceiverCounters,
    shutdown: watch::Sender<bool>,
    current: Mutex<Option<Arc<dyn Channel>>>,
}

impl ChannelReceiver {
    pub fn new(connector: Arc<dyn Connector>, channel_group: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connector,
            channel_group: channel_group.into(),
            reconnect: ReconnectConfig::default(),
            poison: PoisonMessageHandler::new(),
            counters: ReceiverCounters::default(),
            shutdown,
            current: Mutex::new(None),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn channel_group(&self) -> &str {
        &self.channel_group
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            handled: c.handled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            poisoned: c.poisoned.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop after the in-flight delivery; `run` then returns `Ok`
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(channel) = self.current.lock().as_ref() {
            channel.begin_shutdown();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receive until shutdown or an unrecoverable error
    pub async fn run<H: DeliveryHandler>(&self, handler: H) -> Result<(), ChannelError> {
        let mut protocol = ProtocolHandler {
            handler,
            poison: self.poison,
            counters: &self.counters,
        };
        let mut failures = 0u32;

        tracing::info!(group = %self.channel_group, "Receiver starting");
        loop {
            if self.is_shutting_down() {
                break;
            }

            let channel: Arc<dyn Channel> = match self.connector.connect(&self.channel_group).await
            {
                Ok(channel) => Arc::from(channel),
                Err(e) if e.is_connection_error() => {
                    failures += 1;
                    self.backoff(failures, e).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if failures > 0 {
                tracing::info!(group = %self.channel_group, failures, "Receiver reconnected");
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                failures = 0;
            }

            *self.current.lock() = Some(channel.clone());
            if self.is_shutting_down() {
                channel.begin_shutdown();
            }
            let result = channel.receive(&mut protocol).await;
            *self.current.lock() = None;
            channel.dispose();

            match result {
                Ok(()) => break,
                Err(e) if e.is_connection_error() => {
                    failures += 1;
                    self.backoff(failures, e).await?;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(group = %self.channel_group, "Receiver stopped");
        Ok(())
    }

    async fn backoff(&self, attempt: u32, error: ChannelError) -> Result<(), ChannelError> {
        let max = self.reconnect.max_retries;
        if max > 0 && attempt > max {
            tracing::error!(
                group = %self.channel_group,
                "Giving up after {} reconnect attempts: {}",
                max,
                error
            );
            return Err(error);
        }

        let delay = self.reconnect.delay_for(attempt);
        tracing::warn!(
            group = %self.channel_group,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Channel unavailable, reconnecting: {}",
            error
        );

        let mut shutdown = self.shutdown.subscribe();
        let stopping = *shutdown.borrow_and_update();
        if stopping {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        Ok(())
    }
}

impl Debug for ChannelReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("channel_group", &self.channel_group)
            .field("connector", &self.connector)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Wraps the application handler with expiry checks and failure routing
struct ProtocolHandler<'a, H> {
    handler: H,
    poison: PoisonMessageHandler,
    counters: &'a ReceiverCounters,
}

#[async_trait]
impl<H: DeliveryHandler> DeliveryHandler for ProtocolHandler<'_, H> {
    async fn on_delivery(
        &mut self,
        channel: &dyn Channel,
        delivery: &mut DeliveryContext,
    ) -> Result<(), ChannelError> {
        if self.poison.is_expired(delivery) {
            let disposition = self.poison.handle_expired(channel, delivery).await?;
            self.counters.record(disposition);
            return Ok(());
        }

        match self.handler.on_delivery(channel, delivery).await {
            Ok(()) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_connection_error() || matches!(e, ChannelError::Disposed(_)) => Err(e),
            Err(e) => {
                let disposition = self.poison.handle_failure(channel, delivery, &e).await?;
                self.counters.record(disposition);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelGroupConfiguration;
    use crate::memory::InMemoryBroker;
    use crate::message::ChannelMessage;
    use crate::test_utils::CountingConnector;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_before_run_returns_immediately() {
        let broker = InMemoryBroker::new();
        let connector = Arc::new(
            broker.connector(vec![ChannelGroupConfiguration::receiving("orders", "orders")]),
        );
        let receiver = ChannelReceiver::new(connector, "orders");
        receiver.shutdown();

        let handler = |_: &dyn Channel, _: &mut DeliveryContext| -> Result<(), ChannelError> {
            Ok(())
        };
        receiver.run(handler).await.unwrap();
        assert_eq!(receiver.stats(), ReceiverStats::default());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_reconnects() {
        let connector = Arc::new(CountingConnector::new(vec![
            ChannelGroupConfiguration::receiving("orders", "orders"),
        ]));
        connector.set_fail_connect(true);
        let reconnect = ReconnectConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_millis(1),
        };
        let receiver = ChannelReceiver::new(connector, "orders").with_reconnect(reconnect);

        let handler = |_: &dyn Channel, _: &mut DeliveryContext| -> Result<(), ChannelError> {
            Ok(())
        };
        let err = receiver.run(handler).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_non_connection_errors_are_fatal() {
        let broker = InMemoryBroker::new();
        let connector = Arc::new(broker.connector(Vec::new()));
        let receiver = ChannelReceiver::new(connector, "orders");

        let handler = |_: &dyn Channel, _: &mut DeliveryContext| -> Result<(), ChannelError> {
            Ok(())
        };
        let err = receiver.run(handler).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn test_handled_message_counted() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", ChannelMessage::new("OrderPlaced", Vec::new()));
        let connector = Arc::new(
            broker.connector(vec![ChannelGroupConfiguration::receiving("orders", "orders")]),
        );
        let receiver = ChannelReceiver::new(connector, "orders");

        let handler = |channel: &dyn Channel, _: &mut DeliveryContext| -> Result<(), ChannelError> {
            channel.begin_shutdown();
            Ok(())
        };
        receiver.run(handler).await.unwrap();

        assert_eq!(receiver.stats().handled, 1);
        assert_eq!(broker.len("orders"), 0);
    }
}
