//! A keyed memoizer for expensive asynchronous computations.
//!
//! Every key gets a slot guarded by an asynchronous mutex: concurrent requests for the same key
//! queue on the slot and all but the first find the value already computed. The table of slots
//! itself is only ever locked for short, synchronous sections.

use crate::config::CacheConfig;

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::time::Instant;

struct Cached<V> {
    value: V,
    /// Validity is measured from the end of the computation, not from the request.
    completed_at: Instant,
}

type Cell<V> = Arc<tokio::sync::Mutex<Option<Cached<V>>>>;

struct Slot<V> {
    cell: Cell<V>,
    last_access: u64,
}

impl<V> Slot<V> {
    // The table holds one reference, any other one is a request in progress.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.cell) > 1
    }
}

struct Table<K, V> {
    slots: HashMap<K, Slot<V>>,
    clock: u64,
}

pub struct ComputationCache<K, V> {
    table: Mutex<Table<K, V>>,
    config: CacheConfig,
}

impl<K, V> ComputationCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                clock: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<Table<K, V>> {
        // The table is consistent at the end of every critical section, a panic in another
        // thread can't leave it half-updated.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &K) -> Cell<V> {
        let mut table = self.table();
        table.clock += 1;
        let clock = table.clock;
        let slot = table.slots.entry(key.clone()).or_insert_with(|| Slot {
            cell: Arc::new(tokio::sync::Mutex::new(None)),
            last_access: clock,
        });
        slot.last_access = clock;
        Arc::clone(&slot.cell)
    }

    /// Get the value for this key, computing it if there is no fresh one.
    ///
    /// At most one computation per key runs at any time. Requests for a key being computed wait
    /// for the computation and share its result. A failed computation is not cached: the error
    /// is returned to the caller which ran it and the next request computes again.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.slot(&key);
        let outcome = {
            let mut cached = cell.lock().await;
            if let Some(entry) = cached.as_ref() {
                if entry.completed_at.elapsed() < self.config.ttl {
                    return Ok(entry.value.clone());
                }
                log::trace!("Cached value expired, computing it again.");
            }
            *cached = None;

            match compute().await {
                Ok(value) => {
                    *cached = Some(Cached {
                        value: value.clone(),
                        completed_at: Instant::now(),
                    });
                    Ok(value)
                }
                Err(e) => Err(e),
            }
        };
        drop(cell);
        self.evict(&key);

        outcome
    }

    /// Same as [`Self::get_or_compute`], for computations taking their input by value. The key
    /// is extracted from the input before it is handed to the computation.
    pub async fn get_or_compute_with<A, KF, F, Fut, E>(
        &self,
        args: A,
        key_fn: KF,
        compute: F,
    ) -> Result<V, E>
    where
        KF: FnOnce(&A) -> K,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = key_fn(&args);
        self.get_or_compute(key, move || compute(args)).await
    }

    /// Forget the value for this key. A computation in progress for it is not interrupted, but
    /// its result won't be served to later requests.
    pub fn invalidate(&self, key: &K) {
        self.table().slots.remove(key);
    }

    pub fn clear(&self) {
        self.table().slots.clear();
    }

    /// Number of keys with a value or a computation in progress. Expired values are only
    /// dropped after the next computation.
    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Purge expired and failed slots, then the least recently used ones until we are under the
    // size limit. Slots in use are never evicted, and neither is the value just computed for
    // `completed`.
    fn evict(&self, completed: &K) {
        let ttl = self.config.ttl;
        let max_entries = self.config.max_entries;
        let mut table = self.table();

        table.slots.retain(|_, slot| {
            if slot.in_use() {
                return true;
            }
            match slot.cell.try_lock() {
                Ok(cached) => cached
                    .as_ref()
                    .map_or(false, |entry| entry.completed_at.elapsed() < ttl),
                Err(_) => true,
            }
        });

        while table.slots.len() > max_entries {
            let lru = table
                .slots
                .iter()
                .filter(|(key, slot)| *key != completed && !slot.in_use())
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(key, _)| key.clone());
            match lru {
                Some(key) => {
                    table.slots.remove(&key);
                }
                None => {
                    log::debug!(
                        "Cache holds {} entries in use, above its limit of {}.",
                        table.slots.len(),
                        max_entries
                    );
                    break;
                }
            }
        }
    }
}

impl<K, V> std::fmt::Debug for ComputationCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len();
        f.debug_struct("ComputationCache")
            .field("entries", &entries)
            .field("config", &self.config)
            .finish()
    }
}
