//! Per-message SPF results, shared by the policy requests of one message.
//!
//! The MTA sends one request per recipient, all carrying the same `instance`
//! attribute. Entries are bounded by age and by count so an arbitrary stream
//! of instance tokens cannot grow memory without limit.

use crate::config::CacheConfig;
use crate::spf::SpfResult;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
pub struct CacheEntry {
    pub helo_result: Option<SpfResult>,
    pub mailfrom_result: Option<SpfResult>,
    /// Set once a Received-SPF header has been prepended for this message
    pub header_emitted: bool,
}

pub type SharedEntry = Arc<tokio::sync::Mutex<CacheEntry>>;

struct Slot {
    entry: SharedEntry,
    created: Instant,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Slot>,
    // Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct InstanceCache {
    slots: Mutex<Slots>,
    max_entries: usize,
    ttl: Duration,
}

impl InstanceCache {
    pub fn new(config: &CacheConfig) -> Self {
        InstanceCache {
            slots: Mutex::new(Slots::default()),
            max_entries: config.max_entries.max(1),
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    /// Entry for `instance`, created if unseen or expired. Without an
    /// instance token the entry is private to the caller.
    pub fn get_or_create(&self, instance: Option<&str>) -> SharedEntry {
        let instance = match instance {
            Some(instance) if !instance.is_empty() => instance,
            _ => return SharedEntry::default(),
        };

        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        if let Some(slot) = slots.entries.get(instance) {
            if now.duration_since(slot.created) < self.ttl {
                log::debug!("Cache hit for instance {instance}");
                return slot.entry.clone();
            }
        }
        if slots.entries.remove(instance).is_some() {
            log::debug!("Cache entry for instance {instance} expired");
            slots.order.retain(|key| key != instance);
        }

        if slots.entries.len() >= self.max_entries {
            self.evict(&mut slots, now);
        }

        let entry = SharedEntry::default();
        slots.entries.insert(
            instance.to_string(),
            Slot {
                entry: entry.clone(),
                created: now,
            },
        );
        slots.order.push_back(instance.to_string());
        entry
    }

    fn evict(&self, slots: &mut Slots, now: Instant) {
        let ttl = self.ttl;
        let before = slots.entries.len();
        slots
            .entries
            .retain(|_, slot| now.duration_since(slot.created) < ttl);
        let Slots { entries, order } = slots;
        order.retain(|key| entries.contains_key(key));

        while entries.len() >= self.max_entries {
            match order.pop_front() {
                Some(oldest) => {
                    entries.remove(&oldest);
                }
                None => break,
            }
        }
        log::debug!(
            "Evicted {} cached instances",
            before.saturating_sub(entries.len())
        );
    }

    pub fn len(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, ttl_seconds: u64) -> InstanceCache {
        InstanceCache::new(&CacheConfig {
            max_entries,
            ttl_seconds,
        })
    }

    #[tokio::test]
    async fn test_same_instance_shares_entry() {
        let cache = cache(10, 3600);

        let first = cache.get_or_create(Some("A1"));
        first.lock().await.header_emitted = true;

        let second = cache.get_or_create(Some("A1"));
        assert!(second.lock().await.header_emitted);
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.get_or_create(Some("B2"));
        assert!(!other.lock().await.header_emitted);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_stored() {
        let cache = cache(10, 3600);

        let first = cache.get_or_create(None);
        first.lock().await.header_emitted = true;

        let second = cache.get_or_create(Some(""));
        assert!(!second.lock().await.header_emitted);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = cache(2, 3600);

        let a = cache.get_or_create(Some("a"));
        cache.get_or_create(Some("b"));
        cache.get_or_create(Some("c"));

        assert_eq!(cache.len(), 2);
        let a_again = cache.get_or_create(Some("a"));
        assert!(!Arc::ptr_eq(&a, &a_again));
    }

    #[test]
    fn test_expired_entry_is_replaced() {
        let cache = cache(10, 0);

        let first = cache.get_or_create(Some("A1"));
        let second = cache.get_or_create(Some("A1"));

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
