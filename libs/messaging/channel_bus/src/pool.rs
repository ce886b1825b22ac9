//! Pooled dispatch connector
//!
//! Reuses channels for dispatch-only, synchronous groups. Other groups are
//! passed straight through to the inner connector.
//!
//! ## Generation token
//!
//! The pool carries a signed token. Every leased channel remembers the token
//! seen when it was acquired. A connection failure on a leased channel tries to
//! advance the token with a compare-and-swap; the single winner purges the idle
//! queues, so every channel from the broken generation is dropped exactly once
//! however many leases fail at the same time. Releasing a channel whose token
//! no longer matches disposes it instead of pooling it. Disposing the pool
//! moves the token to `DISPOSED_TOKEN`, which no lease can ever hold.
//!
//! Leases are returned through the `PooledChannel` handle: `dispose()` or drop
//! releases it, a failed send tears it down.

use crate::channel::{Channel, Connector, DeliveryHandler, DispatchContext};
use crate::config::ChannelGroupConfiguration;
use crate::message::{ChannelEnvelope, ChannelMessage};
use crate::resolver::DependencyResolver;
use crate::unit_of_work::UnitOfWork;
use crate::ChannelError;
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashSet;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Token value once the pool has been disposed
pub const DISPOSED_TOKEN: i64 = -1;

/// Statistics for pool monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Current generation token
    pub generation: i64,
    /// Channels created through the inner connector
    pub established: usize,
    /// Leases served from an idle queue
    pub reused: usize,
    /// Channels put back into an idle queue
    pub released: usize,
    /// Channels disposed because they were stale or inactive
    pub discarded: usize,
    /// Leases torn down after a connection failure
    pub teardowns: usize,
    /// Idle-queue purges, one per generation change plus one on dispose
    pub purges: usize,
    /// Channels waiting in idle queues
    pub idle: usize,
    /// Channels currently leased
    pub open: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    established: AtomicUsize,
    reused: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
    teardowns: AtomicUsize,
    purges: AtomicUsize,
}

struct IdleChannel {
    id: u64,
    token: i64,
    channel: Arc<dyn Channel>,
}

struct IdleQueue {
    sender: Sender<IdleChannel>,
    receiver: Receiver<IdleChannel>,
}

impl IdleQueue {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }
}

struct PoolShared {
    inner: Box<dyn Connector>,
    idle: HashMap<String, IdleQueue>,
    open: DashSet<u64>,
    token: AtomicI64,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl PoolShared {
    fn current_token(&self) -> i64 {
        self.token.load(Ordering::Acquire)
    }

    /// Pop the first idle channel of generation `token`, disposing stale ones
    fn pop_idle(&self, queue: &IdleQueue, token: i64) -> Option<IdleChannel> {
        while let Ok(entry) = queue.receiver.try_recv() {
            if entry.token == token {
                return Some(entry);
            }
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            entry.channel.dispose();
        }
        None
    }

    fn release(
        &self,
        id: u64,
        token: i64,
        group: &str,
        channel: &Arc<dyn Channel>,
    ) -> Result<(), ChannelError> {
        if self.open.remove(&id).is_none() {
            return Err(ChannelError::invalid_operation(format!(
                "channel {} is not leased from this pool",
                id
            )));
        }

        let current = self.current_token();
        let queue = match self.idle.get(group) {
            Some(queue) if token == current && channel.active() => queue,
            _ => {
                tracing::debug!(
                    "Discarding channel {} of generation {} (current {})",
                    id,
                    token,
                    current
                );
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                channel.dispose();
                return Ok(());
            }
        };

        let entry = IdleChannel {
            id,
            token,
            channel: channel.clone(),
        };
        if let Err(rejected) = queue.sender.send(entry) {
            rejected.into_inner().channel.dispose();
            return Ok(());
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        // A teardown or dispose that raced this push has already purged; clean up after it
        let after = self.current_token();
        if after == DISPOSED_TOKEN {
            self.purge_idle();
        } else if after != token {
            self.discard_stale(queue, after);
        }
        Ok(())
    }

    /// Dispose entries of `queue` leased under a generation other than `current`
    fn discard_stale(&self, queue: &IdleQueue, current: i64) {
        for _ in 0..queue.receiver.len() {
            let Ok(entry) = queue.receiver.try_recv() else {
                break;
            };
            if entry.token == current {
                if let Err(rejected) = queue.sender.send(entry) {
                    rejected.into_inner().channel.dispose();
                }
                continue;
            }
            tracing::debug!(
                "Discarding stale idle channel {} of generation {}",
                entry.id,
                entry.token
            );
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            entry.channel.dispose();
        }
    }

    fn teardown(&self, id: u64, token: i64, channel: &Arc<dyn Channel>) -> Result<(), ChannelError> {
        let leased = self.open.remove(&id).is_some();
        channel.dispose();
        if !leased {
            return Err(ChannelError::invalid_operation(format!(
                "channel {} is not leased from this pool",
                id
            )));
        }
        self.counters.teardowns.fetch_add(1, Ordering::Relaxed);

        if self
            .token
            .compare_exchange(token, token + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(
                "Connection failure on channel {}, advancing pool generation {} -> {}",
                id,
                token,
                token + 1
            );
            self.purge_idle();
        }
        Ok(())
    }

    fn purge_idle(&self) {
        let mut purged = 0;
        for queue in self.idle.values() {
            while let Ok(entry) = queue.receiver.try_recv() {
                entry.channel.dispose();
                purged += 1;
            }
        }
        self.counters.purges.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Purged {} idle channels", purged);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            generation: self.current_token(),
            established: self.counters.established.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            teardowns: self.counters.teardowns.load(Ordering::Relaxed),
            purges: self.counters.purges.load(Ordering::Relaxed),
            idle: self.idle.values().map(|q| q.receiver.len()).sum(),
            open: self.open.len(),
        }
    }
}

/// Connector decorator that pools dispatch-only synchronous channels
pub struct PooledDispatchConnector {
    shared: Arc<PoolShared>,
}

impl PooledDispatchConnector {
    pub fn new(inner: Box<dyn Connector>) -> Self {
        let idle = inner
            .channel_groups()
            .into_iter()
            .filter(|group| group.is_poolable())
            .map(|group| (group.name.clone(), IdleQueue::new()))
            .collect::<HashMap<_, _>>();
        tracing::debug!("Pooling {} channel groups", idle.len());

        Self {
            shared: Arc::new(PoolShared {
                inner,
                idle,
                open: DashSet::new(),
                token: AtomicI64::new(0),
                next_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn is_pooled(&self, channel_group: &str) -> bool {
        self.shared.idle.contains_key(channel_group)
    }

    pub fn generation(&self) -> i64 {
        self.shared.current_token()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

#[async_trait]
impl Connector for PooledDispatchConnector {
    fn channel_groups(&self) -> Vec<Arc<ChannelGroupConfiguration>> {
        self.shared.inner.channel_groups()
    }

    async fn connect(&self, channel_group: &str) -> Result<Box<dyn Channel>, ChannelError> {
        let shared = &self.shared;
        if shared.current_token() == DISPOSED_TOKEN {
            return Err(ChannelError::disposed("PooledDispatchConnector"));
        }
        let Some(queue) = shared.idle.get(channel_group) else {
            return shared.inner.connect(channel_group).await;
        };

        loop {
            let token = shared.current_token();
            if token == DISPOSED_TOKEN {
                return Err(ChannelError::disposed("PooledDispatchConnector"));
            }

            let (id, channel) = match shared.pop_idle(queue, token) {
                Some(entry) => {
                    shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                    (entry.id, entry.channel)
                }
                None => {
                    let channel: Arc<dyn Channel> =
                        Arc::from(shared.inner.connect(channel_group).await?);
                    shared.counters.established.fetch_add(1, Ordering::Relaxed);
                    (shared.next_id.fetch_add(1, Ordering::Relaxed), channel)
                }
            };

            shared.open.insert(id);
            if !channel.active() {
                shared.open.remove(&id);
                shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                channel.dispose();
                tracing::debug!("Channel {} inactive at lease, retrying", id);
                continue;
            }

            return Ok(Box::new(PooledChannel {
                id,
                token,
                group: channel_group.to_string(),
                channel,
                pool: shared.clone(),
                released: AtomicBool::new(false),
            }));
        }
    }

    fn dispose(&self) {
        let shared = &self.shared;
        loop {
            let current = shared.current_token();
            if current == DISPOSED_TOKEN {
                return;
            }
            if shared
                .token
                .compare_exchange(current, DISPOSED_TOKEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        tracing::info!("Disposing pooled dispatch connector");
        shared.purge_idle();
        shared.inner.dispose();
    }
}

impl Debug for PooledDispatchConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledDispatchConnector")
            .field("inner", &self.shared.inner)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Lease on a pooled channel
///
/// Disposing or dropping the handle returns the channel to the pool.
pub struct PooledChannel {
    id: u64,
    token: i64,
    group: String,
    channel: Arc<dyn Channel>,
    pool: Arc<PoolShared>,
    released: AtomicBool,
}

impl PooledChannel {
    /// Generation token observed when the lease was taken
    pub fn generation(&self) -> i64 {
        self.token
    }

    pub fn release(&self) -> Result<(), ChannelError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool
            .release(self.id, self.token, &self.group, &self.channel)
    }
}

#[async_trait]
impl Channel for PooledChannel {
    fn active(&self) -> bool {
        !self.released.load(Ordering::Acquire) && self.channel.active()
    }

    fn current_message(&self) -> Option<ChannelMessage> {
        self.channel.current_message()
    }

    fn current_transaction(&self) -> Arc<UnitOfWork> {
        self.channel.current_transaction()
    }

    fn current_configuration(&self) -> Arc<ChannelGroupConfiguration> {
        self.channel.current_configuration()
    }

    fn current_resolver(&self) -> Option<Arc<dyn DependencyResolver>> {
        self.channel.current_resolver()
    }

    fn prepare_dispatch<'a>(
        &'a self,
        message: Option<ChannelMessage>,
        alternate: Option<&'a dyn Channel>,
    ) -> DispatchContext<'a> {
        DispatchContext::new(alternate.unwrap_or(self), message)
    }

    async fn send(&self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        if self.released.load(Ordering::Acquire) {
            return Err(ChannelError::disposed("PooledChannel"));
        }

        match self.channel.send(envelope).await {
            Err(e) if e.is_connection_error() => {
                if !self.released.swap(true, Ordering::AcqRel) {
                    if let Err(teardown) = self.pool.teardown(self.id, self.token, &self.channel) {
                        tracing::error!("Teardown of channel {} failed: {}", self.id, teardown);
                    }
                }
                Err(e)
            }
            result => result,
        }
    }

    async fn receive(&self, handler: &mut dyn DeliveryHandler) -> Result<(), ChannelError> {
        self.channel.receive(handler).await
    }

    fn begin_shutdown(&self) {
        self.channel.begin_shutdown();
    }

    fn dispose(&self) {
        if let Err(e) = self.release() {
            tracing::error!("Failed to release pooled channel {}: {}", self.id, e);
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("id", &self.id)
            .field("generation", &self.token)
            .field("group", &self.group)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingConnector;

    fn pool() -> (Arc<CountingConnector>, PooledDispatchConnector) {
        let inner = Arc::new(CountingConnector::new(vec![
            ChannelGroupConfiguration::dispatch_only("out"),
            ChannelGroupConfiguration::receiving("orders", "orders"),
        ]));
        let pool = PooledDispatchConnector::new(Box::new(inner.clone()));
        (inner, pool)
    }

    fn envelope() -> ChannelEnvelope {
        ChannelEnvelope::new(ChannelMessage::new("Ping", Vec::new()), vec!["a".into()]).unwrap()
    }

    #[tokio::test]
    async fn test_released_channel_is_reused() {
        let (inner, pool) = pool();

        for _ in 0..5 {
            let channel = pool.connect("out").await.unwrap();
            channel.send(envelope()).await.unwrap();
            channel.dispose();
        }

        assert_eq!(inner.connects(), 1);
        let stats = pool.stats();
        assert_eq!(stats.reused, 4);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.open, 0);
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let (inner, pool) = pool();

        drop(pool.connect("out").await.unwrap());
        drop(pool.connect("out").await.unwrap());

        assert_eq!(inner.connects(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_non_poolable_group_passes_through() {
        let (inner, pool) = pool();
        assert!(!pool.is_pooled("orders"));

        let channel = pool.connect("orders").await.unwrap();
        assert!(format!("{:?}", channel).starts_with("CountingChannel"));
        channel.dispose();
        pool.connect("orders").await.unwrap();

        assert_eq!(inner.connects(), 2);
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_inactive_idle_channel_replaced() {
        let (inner, pool) = pool();
        pool.connect("out").await.unwrap().dispose();

        let stale = inner.probes()[0].clone();
        stale.set_active(false);
        let channel = pool.connect("out").await.unwrap();

        assert!(channel.active());
        assert_eq!(inner.connects(), 2);
        assert_eq!(stale.disposals(), 1);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_connection_failure_advances_generation_and_purges() {
        let (inner, pool) = pool();
        let failing = pool.connect("out").await.unwrap();
        pool.connect("out").await.unwrap().dispose();
        let idle = inner.probes()[1].clone();

        inner.probes()[0].fail_sends(true);
        let err = failing.send(envelope()).await.unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(pool.generation(), 1);
        assert_eq!(idle.disposals(), 1);
        assert_eq!(inner.probes()[0].disposals(), 1);
        let stats = pool.stats();
        assert_eq!(stats.purges, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.open, 0);

        // handle is already torn down; disposing it is a no-op
        failing.dispose();
        assert_eq!(inner.probes()[0].disposals(), 1);
        assert!(matches!(
            failing.send(envelope()).await,
            Err(ChannelError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_lease_disposed_on_release() {
        let (inner, pool) = pool();
        let first = pool.connect("out").await.unwrap();
        let second = pool.connect("out").await.unwrap();

        inner.probes()[0].fail_sends(true);
        first.send(envelope()).await.unwrap_err();
        second.dispose();

        assert_eq!(inner.probes()[1].disposals(), 1);
        assert_eq!(pool.stats().idle, 0);

        // the next lease belongs to the new generation
        pool.connect("out").await.unwrap();
        assert_eq!(inner.connects(), 3);
    }

    #[tokio::test]
    async fn test_stale_idle_entry_discarded_after_generation_moves() {
        let (inner, pool) = pool();
        let leased = pool.connect("out").await.unwrap();

        // generation moved without this release seeing it
        pool.shared.token.store(1, Ordering::Release);
        pool.connect("out").await.unwrap().dispose();
        let stale =
            crate::test_utils::CountingChannel::new(ChannelGroupConfiguration::dispatch_only("out"));
        let stale_disposals = stale.dispose_counter();
        let queue = &pool.shared.idle["out"];
        let pushed = queue.sender.send(IdleChannel {
            id: 99,
            token: 0,
            channel: Arc::new(stale),
        });
        assert!(pushed.is_ok());
        assert_eq!(pool.stats().idle, 2);

        pool.shared.discard_stale(queue, 1);

        assert_eq!(pool.stats().idle, 1);
        assert_eq!(stale_disposals.get(), 1);
        assert_eq!(inner.probes()[1].disposals(), 0);

        // the old lease is disposed rather than pooled
        leased.dispose();
        assert_eq!(inner.probes()[0].disposals(), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_lease_rejected() {
        let (_inner, pool) = pool();
        let channel: Arc<dyn Channel> = Arc::new(crate::test_utils::CountingChannel::new(
            ChannelGroupConfiguration::dispatch_only("out"),
        ));

        let err = pool.shared.release(999, 0, "out", &channel).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
        let err = pool.shared.teardown(999, 0, &channel).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidOperation(_)));
        assert_eq!(pool.generation(), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let (inner, pool) = pool();
        let leased = pool.connect("out").await.unwrap();
        pool.connect("out").await.unwrap().dispose();

        pool.dispose();
        pool.dispose();

        assert_eq!(pool.generation(), DISPOSED_TOKEN);
        assert_eq!(inner.disposals(), 1);
        assert_eq!(inner.probes()[1].disposals(), 1);
        assert!(matches!(
            pool.connect("out").await,
            Err(ChannelError::Disposed(_))
        ));
        assert!(matches!(
            pool.connect("orders").await,
            Err(ChannelError::Disposed(_))
        ));

        // releasing after dispose disposes instead of pooling
        leased.dispose();
        assert_eq!(inner.probes()[0].disposals(), 1);
        assert_eq!(pool.stats().idle, 0);
    }
}
