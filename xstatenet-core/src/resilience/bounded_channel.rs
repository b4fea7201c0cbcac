//! Bounded FIFO with pluggable overflow behavior: block the writer, drop the
//! incoming item, drop the oldest item, or redirect the overflow into a
//! secondary channel. Single-consumer on the read side.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Base behavior of the underlying queue when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FullMode {
    #[default]
    Wait,
    DropNewest,
    DropOldest,
}

/// Optional layer on top of the base mode. A custom strategy only composes
/// with `FullMode::Wait`; any other pairing is rejected at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowStrategy {
    DropNewest,
    DropOldest,
    Redirect,
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub capacity: usize,
    pub full_mode: FullMode,
    pub strategy: Option<OverflowStrategy>,
}

impl ChannelOptions {
    pub fn wait(capacity: usize) -> Self {
        Self {
            capacity,
            full_mode: FullMode::Wait,
            strategy: None,
        }
    }

    pub fn with_strategy(capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            capacity,
            full_mode: FullMode::Wait,
            strategy: Some(strategy),
        }
    }

    /// The single policy the channel actually runs under.
    fn effective(&self) -> Result<EffectivePolicy> {
        match (self.full_mode, self.strategy) {
            (FullMode::Wait, None) => Ok(EffectivePolicy::Wait),
            (FullMode::DropNewest, None) => Ok(EffectivePolicy::DropNewest),
            (FullMode::DropOldest, None) => Ok(EffectivePolicy::DropOldest),
            (FullMode::Wait, Some(OverflowStrategy::DropNewest)) => Ok(EffectivePolicy::DropNewest),
            (FullMode::Wait, Some(OverflowStrategy::DropOldest)) => Ok(EffectivePolicy::DropOldest),
            (FullMode::Wait, Some(OverflowStrategy::Redirect)) => Ok(EffectivePolicy::Redirect),
            (mode, Some(strategy)) => Err(Error::InvalidChannelConfig {
                reason: format!(
                    "strategy {strategy:?} requires base mode Wait, got {mode:?}"
                ),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EffectivePolicy {
    Wait,
    DropNewest,
    DropOldest,
    Redirect,
}

#[derive(Debug)]
pub struct BoundedChannel<T> {
    name: String,
    capacity: usize,
    policy: EffectivePolicy,
    queue: Mutex<VecDeque<T>>,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    overflow: Option<Arc<BoundedChannel<T>>>,
}

impl<T: Send> BoundedChannel<T> {
    pub fn new(name: impl Into<String>, options: ChannelOptions) -> Result<Arc<Self>> {
        Self::build(name, options, None)
    }

    /// A channel whose overflow is redirected into `overflow`. The overflow
    /// write never blocks; if the overflow channel is also full the item is
    /// rejected.
    pub fn with_overflow(
        name: impl Into<String>,
        options: ChannelOptions,
        overflow: Arc<BoundedChannel<T>>,
    ) -> Result<Arc<Self>> {
        Self::build(name, options, Some(overflow))
    }

    fn build(
        name: impl Into<String>,
        options: ChannelOptions,
        overflow: Option<Arc<BoundedChannel<T>>>,
    ) -> Result<Arc<Self>> {
        if options.capacity == 0 {
            return Err(Error::InvalidChannelConfig {
                reason: "capacity must be at least 1".into(),
            });
        }
        let policy = options.effective()?;
        match (policy, &overflow) {
            (EffectivePolicy::Redirect, None) => {
                return Err(Error::InvalidChannelConfig {
                    reason: "Redirect strategy requires an overflow channel".into(),
                })
            }
            (p, Some(_)) if p != EffectivePolicy::Redirect => {
                return Err(Error::InvalidChannelConfig {
                    reason: "an overflow channel is only valid with the Redirect strategy".into(),
                })
            }
            _ => {}
        }
        Ok(Arc::new(Self {
            name: name.into(),
            capacity: options.capacity,
            policy,
            queue: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            overflow,
        }))
    }

    /// Write one item. `Ok(true)` means accepted (possibly into the overflow
    /// channel); `Ok(false)` means the policy discarded it.
    pub async fn write(&self, item: T) -> Result<bool> {
        loop {
            let wait = self.writable.notified();
            {
                let mut queue = self.queue.lock();
                if self.closed.load(Ordering::Acquire) {
                    return Err(Error::ChannelClosed);
                }
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    drop(queue);
                    self.readable.notify_one();
                    return Ok(true);
                }
                match self.policy {
                    EffectivePolicy::Wait => {}
                    EffectivePolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(channel = %self.name, "dropped newest item");
                        return Ok(false);
                    }
                    EffectivePolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(item);
                        drop(queue);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(channel = %self.name, "dropped oldest item");
                        self.readable.notify_one();
                        return Ok(true);
                    }
                    EffectivePolicy::Redirect => {
                        drop(queue);
                        let overflow = self
                            .overflow
                            .as_ref()
                            .unwrap_or_else(|| unreachable!("validated at construction"));
                        return match overflow.try_write(item) {
                            Ok(()) => Ok(true),
                            Err(_) => {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(channel = %self.name, "overflow channel full, item rejected");
                                Ok(false)
                            }
                        };
                    }
                }
            }
            wait.await;
        }
    }

    /// Non-suspending write; fails with `ChannelFull` at capacity.
    pub fn try_write(&self, item: T) -> Result<()> {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        if queue.len() >= self.capacity {
            return Err(Error::ChannelFull {
                capacity: self.capacity,
            });
        }
        queue.push_back(item);
        drop(queue);
        self.readable.notify_one();
        Ok(())
    }

    /// Read the next item in FIFO order. Returns `None` only once the
    /// channel is closed and drained.
    pub async fn read(&self) -> Option<T> {
        loop {
            let wait = self.readable.notified();
            {
                let mut queue = self.queue.lock();
                if let Some(item) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            wait.await;
        }
    }

    pub fn try_read(&self) -> Option<T> {
        let item = self.queue.lock().pop_front();
        if item.is_some() {
            self.writable.notify_one();
        }
        item
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Point-in-time channel statistics.
#[derive(Clone, Debug)]
pub struct ChannelStats {
    pub name: String,
    pub len: usize,
    pub capacity: usize,
    pub dropped: u64,
}

/// Named channel table with uniform construction and stats.
pub struct BoundedChannelManager<T> {
    channels: DashMap<String, Arc<BoundedChannel<T>>>,
}

impl<T: Send> BoundedChannelManager<T> {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn create(&self, name: &str, options: ChannelOptions) -> Result<Arc<BoundedChannel<T>>> {
        if self.channels.contains_key(name) {
            return Err(Error::InvalidChannelConfig {
                reason: format!("channel '{name}' already exists"),
            });
        }
        let channel = BoundedChannel::new(name, options)?;
        self.channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Create a channel whose overflow redirects into an existing channel.
    pub fn create_with_redirect(
        &self,
        name: &str,
        options: ChannelOptions,
        overflow: &str,
    ) -> Result<Arc<BoundedChannel<T>>> {
        let overflow = self
            .channels
            .get(overflow)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::InvalidChannelConfig {
                reason: format!("overflow channel '{overflow}' does not exist"),
            })?;
        if self.channels.contains_key(name) {
            return Err(Error::InvalidChannelConfig {
                reason: format!("channel '{name}' already exists"),
            });
        }
        let channel = BoundedChannel::with_overflow(name, options, overflow)?;
        self.channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoundedChannel<T>>> {
        self.channels.get(name).map(|c| c.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<BoundedChannel<T>>> {
        self.channels.remove(name).map(|(_, c)| {
            c.close();
            c
        })
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        self.channels
            .iter()
            .map(|entry| ChannelStats {
                name: entry.key().clone(),
                len: entry.len(),
                capacity: entry.capacity(),
                dropped: entry.dropped(),
            })
            .collect()
    }
}

impl<T: Send> Default for BoundedChannelManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let ch = BoundedChannel::new("t", ChannelOptions::wait(4)).unwrap();
        for i in 0..4 {
            assert!(ch.write(i).await.unwrap());
        }
        for i in 0..4 {
            assert_eq!(ch.read().await, Some(i));
        }
    }

    #[tokio::test]
    async fn wait_strategy_blocks_until_capacity_frees() {
        let ch = BoundedChannel::new("t", ChannelOptions::wait(1)).unwrap();
        ch.write(1).await.unwrap();

        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.write(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished(), "writer must be suspended while full");

        assert_eq!(ch.read().await, Some(1));
        assert!(writer.await.unwrap().unwrap());
        assert_eq!(ch.read().await, Some(2));
    }

    #[tokio::test]
    async fn drop_newest_rejects_overflow_and_keeps_oldest() {
        let capacity = 3;
        let ch = BoundedChannel::new(
            "t",
            ChannelOptions::with_strategy(capacity, OverflowStrategy::DropNewest),
        )
        .unwrap();
        for i in 0..capacity as i32 {
            assert!(ch.write(i).await.unwrap());
        }
        assert!(!ch.write(99).await.unwrap(), "overflow write must report false");
        assert_eq!(ch.dropped(), 1);
        assert_eq!(ch.read().await, Some(0), "oldest item must survive");
    }

    #[tokio::test]
    async fn drop_oldest_sheds_from_the_head() {
        let ch = BoundedChannel::new(
            "t",
            ChannelOptions::with_strategy(2, OverflowStrategy::DropOldest),
        )
        .unwrap();
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        assert!(ch.write(3).await.unwrap());
        assert_eq!(ch.read().await, Some(2));
        assert_eq!(ch.read().await, Some(3));
    }

    #[tokio::test]
    async fn redirect_spills_in_order() {
        let manager: BoundedChannelManager<i32> = BoundedChannelManager::new();
        manager.create("overflow", ChannelOptions::wait(10)).unwrap();
        let main = manager
            .create_with_redirect(
                "main",
                ChannelOptions::with_strategy(2, OverflowStrategy::Redirect),
                "overflow",
            )
            .unwrap();
        let overflow = manager.get("overflow").unwrap();

        for i in 1..=5 {
            assert!(main.write(i).await.unwrap());
        }
        assert_eq!(main.read().await, Some(1));
        assert_eq!(main.read().await, Some(2));
        assert_eq!(overflow.read().await, Some(3));
        assert_eq!(overflow.read().await, Some(4));
        assert_eq!(overflow.read().await, Some(5));
    }

    #[tokio::test]
    async fn redirect_reports_false_when_overflow_is_full() {
        let manager: BoundedChannelManager<i32> = BoundedChannelManager::new();
        manager.create("overflow", ChannelOptions::wait(1)).unwrap();
        let main = manager
            .create_with_redirect(
                "main",
                ChannelOptions::with_strategy(1, OverflowStrategy::Redirect),
                "overflow",
            )
            .unwrap();
        assert!(main.write(1).await.unwrap());
        assert!(main.write(2).await.unwrap());
        assert!(!main.write(3).await.unwrap());
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let ch = BoundedChannel::new("t", ChannelOptions::wait(4)).unwrap();
        ch.write(1).await.unwrap();
        ch.close();
        assert!(matches!(ch.write(2).await, Err(Error::ChannelClosed)));
        assert_eq!(ch.read().await, Some(1));
        assert_eq!(ch.read().await, None);
    }

    #[test]
    fn conflicting_configuration_is_rejected() {
        let err = BoundedChannel::<i32>::new(
            "t",
            ChannelOptions {
                capacity: 4,
                full_mode: FullMode::DropNewest,
                strategy: Some(OverflowStrategy::DropOldest),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelConfig { .. }));

        let err = BoundedChannel::<i32>::new(
            "t",
            ChannelOptions::with_strategy(4, OverflowStrategy::Redirect),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidChannelConfig { .. }));
    }
}
