use dashmap::DashMap;
use tracing::debug;
use workerlink_core::{Subscription, SubscriptionKey};

/// Live stream subscriptions of one connection, keyed by the caller's key.
#[derive(Debug)]
pub struct SubscriptionTable {
    subscriptions: DashMap<SubscriptionKey, Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        SubscriptionTable {
            subscriptions: DashMap::new(),
        }
    }

    /// Stores `subscription`, detaching whatever was registered under `key`.
    pub fn insert(&self, key: SubscriptionKey, subscription: Subscription) {
        if let Some(previous) = self.subscriptions.insert(key, subscription) {
            previous.unsubscribe();
        }
    }

    /// Detaches and forgets `key`. Unknown keys are ignored.
    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        match self.subscriptions.remove(key) {
            Some((key, subscription)) => {
                subscription.unsubscribe();
                debug!(key = %key, "subscription removed");
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let keys: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}
