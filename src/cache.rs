//! Staleness cache, fetch gate and debouncer shared by the engines.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

/// Most entries a cache keeps before evicting the oldest.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Values keyed by query, considered fresh for `staleness`.
///
/// Expired entries are dropped on insert and at most `capacity` entries are
/// kept, so caller-supplied keys such as search text cannot grow it unbounded.
pub struct QueryCache<K, V> {
    staleness: Duration,
    capacity: usize,
    entries: HashMap<K, CacheEntry<V>>,
}

impl<K: Eq + Hash + Clone, V> QueryCache<K, V> {
    pub fn new(staleness: Duration) -> Self {
        Self::with_capacity(staleness, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(staleness: Duration, capacity: usize) -> Self {
        Self {
            staleness,
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// The cached value if it is younger than the staleness threshold.
    pub fn get_fresh(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| e.fetched_at.elapsed() < self.staleness)
            .map(|e| &e.value)
    }

    pub fn is_stale(&self, key: &K) -> bool {
        self.get_fresh(key).is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key: K, value: V) {
        let staleness = self.staleness;
        self.entries.retain(|_, e| e.fetched_at.elapsed() < staleness);
        while self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

struct GateState<K> {
    issued: u64,
    in_flight: HashMap<K, usize>,
    latest: HashMap<K, u64>,
}

/// Tracks fetches per key.
///
/// A non-forced fetch is refused while another one for the same key is in
/// flight. Every issued ticket gets a sequence number; only the newest ticket
/// of a key is current, so older responses can be dropped on arrival.
pub struct FetchGate<K> {
    state: Arc<Mutex<GateState<K>>>,
}

impl<K: Eq + Hash + Clone> Default for FetchGate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> FetchGate<K> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState {
                issued: 0,
                in_flight: HashMap::new(),
                latest: HashMap::new(),
            })),
        }
    }

    pub fn try_begin(&self, key: &K, force: bool) -> Option<FetchTicket<K>> {
        let mut state = lock(&self.state);
        let running = state.in_flight.get(key).copied().unwrap_or(0);
        if running > 0 && !force {
            return None;
        }
        state.issued += 1;
        let seq = state.issued;
        state.latest.insert(key.clone(), seq);
        *state.in_flight.entry(key.clone()).or_insert(0) += 1;
        Some(FetchTicket {
            state: Arc::clone(&self.state),
            key: key.clone(),
            seq,
        })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.state).in_flight.get(key).copied().unwrap_or(0) > 0
    }

    /// Keys the gate still holds bookkeeping for.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.state).latest.len()
    }
}

/// Held for the duration of one fetch. Releases its slot on drop.
pub struct FetchTicket<K: Eq + Hash> {
    state: Arc<Mutex<GateState<K>>>,
    key: K,
    seq: u64,
}

impl<K: Eq + Hash> FetchTicket<K> {
    /// False once a newer fetch for the same key has been issued.
    pub fn is_current(&self) -> bool {
        lock(&self.state).latest.get(&self.key) == Some(&self.seq)
    }
}

impl<K: Eq + Hash> Drop for FetchTicket<K> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(running) = state.in_flight.get_mut(&self.key) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                state.in_flight.remove(&self.key);
                state.latest.remove(&self.key);
            }
        }
    }
}

/// Trailing-edge debouncer: the handler runs once `delay` has passed without
/// a new value, with the last value pushed.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn<F, Fut>(delay: Duration, mut handler: F) -> Self
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let task = tokio::spawn(async move {
            while let Some(mut latest) = rx.recv().await {
                let mut closed = false;
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(value) => latest = value,
                            None => {
                                closed = true;
                                break;
                            }
                        },
                        _ = tokio::time::sleep(delay) => break,
                    }
                }
                handler(latest).await;
                if closed {
                    break;
                }
            }
        });
        Self { tx, task }
    }

    pub fn push(&self, value: T) {
        // The receiver only goes away together with the task.
        let _ = self.tx.send(value);
    }

    /// Fires any pending value immediately and waits for the handler.
    pub async fn flush(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_staleness() {
        let mut cache = QueryCache::new(Duration::from_secs(300));
        cache.insert("scope", 7);
        assert_eq!(cache.get_fresh(&"scope"), Some(&7));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!cache.is_stale(&"scope"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.is_stale(&"scope"));

        cache.insert("scope", 8);
        cache.invalidate(&"scope");
        assert!(cache.get_fresh(&"scope").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_stays_bounded_under_distinct_keys() {
        let mut cache = QueryCache::with_capacity(Duration::from_secs(300), 16);
        for i in 0..1_000 {
            cache.insert(format!("search-{i}"), i);
        }
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.get_fresh(&"search-999".to_string()), Some(&999));
        assert!(cache.get_fresh(&"search-0".to_string()).is_none());

        tokio::time::advance(Duration::from_secs(301)).await;
        cache.insert("fresh".to_string(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn gate_forgets_keys_once_their_fetches_finish() {
        let gate = FetchGate::new();
        for i in 0..1_000 {
            let ticket = gate.try_begin(&i, false).expect("idle key");
            assert!(ticket.is_current());
        }
        assert_eq!(gate.tracked_keys(), 0);

        let held = gate.try_begin(&7, false).expect("idle key");
        assert_eq!(gate.tracked_keys(), 1);
        drop(held);
        assert_eq!(gate.tracked_keys(), 0);
    }

    #[test]
    fn gate_refuses_duplicate_fetch_unless_forced() {
        let gate = FetchGate::new();
        let first = gate.try_begin(&"pending", false).expect("first fetch");
        assert!(gate.try_begin(&"pending", false).is_none());
        assert!(gate.try_begin(&"other", false).is_some());

        let forced = gate.try_begin(&"pending", true).expect("forced fetch");
        assert!(!first.is_current());
        assert!(forced.is_current());

        drop(first);
        assert!(gate.is_in_flight(&"pending"));
        drop(forced);
        assert!(!gate.is_in_flight(&"pending"));
        assert!(gate.try_begin(&"pending", false).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_coalesces_rapid_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let debouncer = Debouncer::spawn(Duration::from_millis(500), move |text: String| {
            let sink = Arc::clone(&sink);
            async move {
                lock(&sink).push(text);
            }
        });

        for text in ["a", "al", "ali", "alic", "alice"] {
            debouncer.push(text.to_string());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(lock(&seen).is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*lock(&seen), vec!["alice".to_string()]);

        debouncer.push("bob".into());
        debouncer.flush().await;
        assert_eq!(*lock(&seen), vec!["alice".to_string(), "bob".to_string()]);
    }
}
