//! MemoryCache: bounded, thread-safe LRU of live objects
//!
//! One lock guards the recency list, the running totals and the limits.
//! Every operation holds it for O(1) work (trims release it between small
//! batches) and never does I/O under it. Values leaving the cache are handed
//! to the [`ReleasePolicy`] after the lock is dropped.

use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::lifecycle::{LifecycleEvent, LifecycleHub, Subscription};
use crate::limits::MemoryLimits;
use crate::lru::LruList;
use crate::release::ReleasePolicy;
use crate::stats::{CacheStats, Tier};
use crate::worker::Ticker;

/// Entries evicted per lock acquisition during trims
const TRIM_BATCH: usize = 32;

/// Callback run after the cache has reacted to a lifecycle event
pub type MemoryHook<K, V> = Arc<dyn Fn(&MemoryCache<K, V>) + Send + Sync>;

struct State<K, V> {
    lru: LruList<K, V>,
    limits: MemoryLimits,
}

struct Hooks<K, V> {
    remove_all_on_memory_warning: bool,
    remove_all_on_background: bool,
    on_memory_warning: Option<MemoryHook<K, V>>,
    on_background: Option<MemoryHook<K, V>>,
}

struct Inner<K, V> {
    name: RwLock<String>,
    state: Mutex<State<K, V>>,
    hooks: RwLock<Hooks<K, V>>,
    stats: CacheStats,
    release: ReleasePolicy,
    sweeper: Mutex<Option<Ticker>>,
    subscription: Mutex<Option<Subscription>>,
}

/// Thread-safe LRU cache handle; clones share the same cache
pub struct MemoryCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Configures a [`MemoryCache`]
pub struct MemoryCacheBuilder {
    name: String,
    limits: MemoryLimits,
    release: ReleasePolicy,
    hub: Option<LifecycleHub>,
    remove_all_on_memory_warning: bool,
    remove_all_on_background: bool,
}

impl Default for MemoryCacheBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            limits: MemoryLimits::default(),
            release: ReleasePolicy::default(),
            hub: Some(LifecycleHub::global().clone()),
            remove_all_on_memory_warning: true,
            remove_all_on_background: true,
        }
    }
}

impl MemoryCacheBuilder {
    /// Start from the defaults: unbounded, global lifecycle hub, background release
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache name, used in logs
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Initial limits
    pub fn limits(mut self, limits: MemoryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Maximum number of entries
    pub fn count_limit(mut self, count: usize) -> Self {
        self.limits.count_limit = count;
        self
    }

    /// Maximum total cost
    pub fn cost_limit(mut self, cost: u64) -> Self {
        self.limits.cost_limit = cost;
        self
    }

    /// Where evicted values are dropped
    pub fn release(mut self, release: ReleasePolicy) -> Self {
        self.release = release;
        self
    }

    /// Subscribe to this hub instead of the global one; `None` ignores
    /// lifecycle events entirely
    pub fn lifecycle_hub(mut self, hub: Option<LifecycleHub>) -> Self {
        self.hub = hub;
        self
    }

    /// Clear the cache on memory warnings
    pub fn remove_all_on_memory_warning(mut self, enabled: bool) -> Self {
        self.remove_all_on_memory_warning = enabled;
        self
    }

    /// Clear the cache when the application enters the background
    pub fn remove_all_on_background(mut self, enabled: bool) -> Self {
        self.remove_all_on_background = enabled;
        self
    }

    /// Build the cache and start its sweeper
    pub fn build<K, V>(self) -> MemoryCache<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let first_interval = self.limits.auto_trim_interval;
        let cache = MemoryCache {
            inner: Arc::new(Inner {
                name: RwLock::new(self.name),
                state: Mutex::new(State {
                    lru: LruList::new(),
                    limits: self.limits,
                }),
                hooks: RwLock::new(Hooks {
                    remove_all_on_memory_warning: self.remove_all_on_memory_warning,
                    remove_all_on_background: self.remove_all_on_background,
                    on_memory_warning: None,
                    on_background: None,
                }),
                stats: CacheStats::new(),
                release: self.release,
                sweeper: Mutex::new(None),
                subscription: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&cache.inner);
        match Ticker::spawn("stash-memory-trim", first_interval, move |active| {
            let cache = MemoryCache::upgrade(&weak)?;
            if active {
                cache.trim_in_background();
            }
            Some(cache.limits().auto_trim_interval)
        }) {
            Ok(ticker) => *cache.inner.sweeper.lock() = Some(ticker),
            Err(e) => warn!("Memory cache sweeper unavailable: {}", e),
        }

        if let Some(hub) = self.hub {
            let weak = Arc::downgrade(&cache.inner);
            let subscription = hub.subscribe(move |event| {
                if let Some(cache) = MemoryCache::upgrade(&weak) {
                    cache.handle_event(event);
                }
            });
            *cache.inner.subscription.lock() = Some(subscription);
        }

        cache
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an unbounded cache subscribed to the global lifecycle hub
    pub fn new() -> Self {
        MemoryCacheBuilder::default().build()
    }

    fn upgrade(weak: &Weak<Inner<K, V>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Cache name
    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    /// Rename the cache
    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.write() = name.into();
    }

    /// Whether `key` is cached; does not affect recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().lru.contains(key)
    }

    /// Get a value and mark it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.state.lock().lru.get(key, Instant::now()).cloned();
        match value {
            Some(_) => self.inner.stats.record_hit(Tier::Memory),
            None => self.inner.stats.record_miss(),
        }
        value
    }

    /// Insert with zero cost
    pub fn set(&self, key: K, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert or replace, then evict from the tail until within limits
    pub fn set_with_cost(&self, key: K, value: V, cost: u64) {
        let mut garbage = Vec::new();
        let replaced = {
            let mut state = self.inner.state.lock();
            let replaced = state.lru.insert(key, value, cost, Instant::now());
            let (count_limit, cost_limit) = (state.limits.count_limit, state.limits.cost_limit);
            while state.lru.len() > count_limit || state.lru.total_cost() > cost_limit {
                match state.lru.pop_tail() {
                    Some((_, evicted)) => garbage.push(evicted),
                    None => break,
                }
            }
            replaced
        };
        self.inner.stats.record_write();
        self.inner.stats.record_evictions(garbage.len());
        garbage.extend(replaced);
        self.inner.release.release(garbage);
    }

    /// Remove one entry
    pub fn remove(&self, key: &K) {
        let removed = self.inner.state.lock().lru.remove(key);
        if let Some(value) = removed {
            self.inner.release.release(vec![value]);
        }
    }

    /// Remove every entry in one locked step
    pub fn remove_all(&self) {
        let values = self.inner.state.lock().lru.clear();
        self.inner.release.release(values);
    }

    /// Number of entries
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    /// Sum of entry costs
    pub fn total_cost(&self) -> u64 {
        self.inner.state.lock().lru.total_cost()
    }

    /// Hit/miss counters
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// Current limits
    pub fn limits(&self) -> MemoryLimits {
        self.inner.state.lock().limits.clone()
    }

    /// Replace the limits; applied from the next insert or sweep
    pub fn set_limits(&self, limits: MemoryLimits) {
        self.inner.state.lock().limits = limits;
    }

    /// Set the count limit
    pub fn set_count_limit(&self, count: usize) {
        self.inner.state.lock().limits.count_limit = count;
    }

    /// Set the cost limit
    pub fn set_cost_limit(&self, cost: u64) {
        self.inner.state.lock().limits.cost_limit = cost;
    }

    /// Set the age limit
    pub fn set_age_limit(&self, age: Duration) {
        self.inner.state.lock().limits.age_limit = age;
    }

    /// Set the sweep cadence; zero disables sweeping
    pub fn set_auto_trim_interval(&self, interval: Duration) {
        self.inner.state.lock().limits.auto_trim_interval = interval;
    }

    /// Toggle clearing on memory warnings
    pub fn set_remove_all_on_memory_warning(&self, enabled: bool) {
        self.inner.hooks.write().remove_all_on_memory_warning = enabled;
    }

    /// Toggle clearing when entering the background
    pub fn set_remove_all_on_background(&self, enabled: bool) {
        self.inner.hooks.write().remove_all_on_background = enabled;
    }

    /// Run after the cache has reacted to a memory warning
    pub fn on_memory_warning<F>(&self, hook: F)
    where
        F: Fn(&MemoryCache<K, V>) + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_memory_warning = Some(Arc::new(hook));
    }

    /// Run after the cache has reacted to entering the background
    pub fn on_background<F>(&self, hook: F)
    where
        F: Fn(&MemoryCache<K, V>) + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_background = Some(Arc::new(hook));
    }

    /// React to a lifecycle event as if posted by the subscribed hub
    pub fn handle_event(&self, event: LifecycleEvent) {
        let (clear, hook) = {
            let hooks = self.inner.hooks.read();
            match event {
                LifecycleEvent::MemoryWarning => (
                    hooks.remove_all_on_memory_warning,
                    hooks.on_memory_warning.clone(),
                ),
                LifecycleEvent::EnteredBackground => (
                    hooks.remove_all_on_background,
                    hooks.on_background.clone(),
                ),
            }
        };
        if clear {
            debug!("Memory cache {:?} cleared on {:?}", self.name(), event);
            self.remove_all();
        }
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Evict least recently used entries until at most `count` remain
    pub fn trim_to_count(&self, count: usize) {
        if count == 0 {
            self.remove_all();
            return;
        }
        self.trim_while(|lru| lru.len() > count);
    }

    /// Evict least recently used entries until the total cost is at most `cost`
    pub fn trim_to_cost(&self, cost: u64) {
        if cost == 0 {
            self.remove_all();
            return;
        }
        self.trim_while(|lru| lru.total_cost() > cost);
    }

    /// Evict entries not touched within `age`
    pub fn trim_to_age(&self, age: Duration) {
        if age.is_zero() {
            self.remove_all();
            return;
        }
        let now = Instant::now();
        // Entries are ordered by touch time, so the tail is always the oldest
        self.trim_while(|lru| {
            lru.tail_time()
                .map_or(false, |time| now.saturating_duration_since(time) > age)
        });
    }

    fn trim_while<P>(&self, mut over: P)
    where
        P: FnMut(&LruList<K, V>) -> bool,
    {
        loop {
            let mut garbage = Vec::new();
            let done = {
                let mut state = self.inner.state.lock();
                while garbage.len() < TRIM_BATCH && over(&state.lru) {
                    match state.lru.pop_tail() {
                        Some((_, value)) => garbage.push(value),
                        None => break,
                    }
                }
                state.lru.is_empty() || !over(&state.lru)
            };
            self.inner.stats.record_evictions(garbage.len());
            self.inner.release.release(garbage);
            if done {
                break;
            }
        }
    }

    fn trim_in_background(&self) {
        let limits = self.limits();
        self.trim_to_cost(limits.cost_limit);
        self.trim_to_count(limits.count_limit);
        if limits.age_limit != Duration::MAX {
            self.trim_to_age(limits.age_limit);
        }
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn isolated<V: Clone + Send + Sync + 'static>() -> MemoryCache<String, V> {
        MemoryCacheBuilder::new()
            .lifecycle_hub(None)
            .release(ReleasePolicy::Inline)
            .build()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_set_get_contains() {
        let cache = isolated();
        cache.set(key("a"), 1);

        assert!(cache.contains(&key("a")));
        assert_eq!(cache.get(&key("a")), Some(1));
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_count_limit_evicts_first_inserted() {
        let cache = isolated();
        cache.set_count_limit(3);
        for k in ["a", "b", "c", "d"] {
            cache.set(key(k), k);
        }

        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.total_count(), 3);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = isolated();
        cache.set_count_limit(2);
        cache.set(key("x"), 1);
        cache.set(key("y"), 2);
        cache.get(&key("x"));
        cache.set(key("z"), 3);

        assert!(cache.contains(&key("x")));
        assert!(!cache.contains(&key("y")));
        assert!(cache.contains(&key("z")));
    }

    #[test]
    fn test_huge_costs_do_not_overflow() {
        let cache = isolated();
        cache.set_with_cost(key("a"), 1, u64::MAX);
        cache.set_with_cost(key("b"), 2, u64::MAX);
        assert_eq!(cache.total_cost(), u64::MAX);

        cache.trim_to_cost(10);
        assert!(!cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert_eq!(cache.total_cost(), 0);

        cache.set_with_cost(key("c"), 3, 4);
        assert_eq!(cache.total_cost(), 4);
    }

    #[test]
    fn test_cost_limit() {
        let cache = isolated();
        cache.set_cost_limit(10);
        cache.set_with_cost(key("a"), 1, 4);
        cache.set_with_cost(key("b"), 2, 4);
        assert_eq!(cache.total_cost(), 8);

        cache.set_with_cost(key("c"), 3, 4);
        assert_eq!(cache.total_cost(), 8);
        assert!(!cache.contains(&key("a")));
    }

    #[test]
    fn test_replace_updates_cost() {
        let cache = isolated();
        cache.set_with_cost(key("a"), 1, 10);
        cache.set_with_cost(key("a"), 2, 3);

        assert_eq!(cache.total_count(), 1);
        assert_eq!(cache.total_cost(), 3);
        assert_eq!(cache.get(&key("a")), Some(2));
        assert_eq!(cache.stats().evictions(), 0);
    }

    #[test]
    fn test_trim_to_count_and_cost() {
        let cache = isolated();
        for i in 0..100 {
            cache.set_with_cost(format!("k{}", i), i, 1);
        }

        cache.trim_to_count(40);
        assert_eq!(cache.total_count(), 40);
        assert!(cache.contains(&key("k99")));
        assert!(!cache.contains(&key("k59")));

        cache.trim_to_cost(5);
        assert_eq!(cache.total_cost(), 5);
        assert!(cache.contains(&key("k95")));

        cache.trim_to_count(0);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_trim_to_age() {
        let cache = isolated();
        cache.set(key("old"), 1);
        std::thread::sleep(Duration::from_millis(60));
        cache.set(key("new"), 2);

        cache.trim_to_age(Duration::from_millis(30));
        assert!(!cache.contains(&key("old")));
        assert!(cache.contains(&key("new")));
    }

    #[test]
    fn test_touch_resets_age() {
        let cache = isolated();
        cache.set(key("a"), 1);
        cache.set(key("b"), 2);
        std::thread::sleep(Duration::from_millis(60));
        cache.get(&key("a"));

        cache.trim_to_age(Duration::from_millis(30));
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
    }

    #[test]
    fn test_remove_and_remove_all() {
        let cache = isolated();
        cache.set_with_cost(key("a"), 1, 2);
        cache.set_with_cost(key("b"), 2, 3);

        cache.remove(&key("a"));
        cache.remove(&key("missing"));
        assert_eq!(cache.total_count(), 1);
        assert_eq!(cache.total_cost(), 3);

        cache.remove_all();
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn test_lifecycle_events() {
        let hub = LifecycleHub::new();
        let cache: MemoryCache<String, i32> = MemoryCacheBuilder::new()
            .lifecycle_hub(Some(hub.clone()))
            .remove_all_on_background(false)
            .build();
        let warnings = Arc::new(AtomicUsize::new(0));
        let seen = warnings.clone();
        cache.on_memory_warning(move |c| {
            assert_eq!(c.total_count(), 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        cache.set(key("a"), 1);
        hub.post(LifecycleEvent::EnteredBackground);
        assert_eq!(cache.total_count(), 1);

        hub.post(LifecycleEvent::MemoryWarning);
        assert_eq!(cache.total_count(), 0);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes_from_hub() {
        let hub = LifecycleHub::new();
        let cache: MemoryCache<String, i32> = MemoryCacheBuilder::new()
            .lifecycle_hub(Some(hub.clone()))
            .build();
        assert_eq!(hub.listener_count(), 1);

        drop(cache);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_sweeper_applies_age_limit() {
        let cache: MemoryCache<String, i32> = MemoryCacheBuilder::new()
            .lifecycle_hub(None)
            .limits(MemoryLimits {
                age_limit: Duration::from_millis(20),
                auto_trim_interval: Duration::from_millis(10),
                ..MemoryLimits::default()
            })
            .build();
        cache.set(key("a"), 1);

        for _ in 0..100 {
            if cache.total_count() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("sweeper never evicted the stale entry");
    }

    #[test]
    fn test_concurrent_access() {
        let cache: MemoryCache<u32, u32> = MemoryCacheBuilder::new()
            .lifecycle_hub(None)
            .count_limit(64)
            .build();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        cache.set(t * 1000 + i, i);
                        cache.get(&(t * 1000 + i / 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.total_count() <= 64);
    }
}
