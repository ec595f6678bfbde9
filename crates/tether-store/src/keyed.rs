//! Two-level owner → key → value cache with LRU eviction and debounced snapshots.
//!
//! Both levels are insertion-ordered [`IndexMap`]s. Touching an owner (`get`,
//! `get_all`, `set`) moves it to the back; eviction always drops the front.
//! Keys inside an owner keep their first-insertion position, so the key
//! evicted on overflow is the least recently *inserted* one.
//!
//! Every mutation restarts a single debounce timer; only the last mutation in
//! a burst writes the snapshot. The snapshot on disk therefore lags memory by
//! at most one debounce interval, or until [`KeyedStore::flush`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::snapshot::{self, Durability};

type OwnerMap = IndexMap<String, Arc<Value>>;

/// What `get` hands back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadPolicy {
    /// The stored `Arc` itself; cheap, shared with every other reader.
    Shared,
    /// A fresh deep copy per read.
    #[default]
    Copy,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_owners: usize,
    pub max_keys_per_owner: usize,
    pub debounce: Duration,
    pub durability: Durability,
    pub read_policy: ReadPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("store.json"),
            max_owners: 1_000,
            max_keys_per_owner: 200,
            debounce: Duration::from_millis(500),
            durability: Durability::Atomic,
            read_policy: ReadPolicy::Copy,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), StoreError> {
        if self.max_owners == 0 {
            return Err(StoreError::InvalidConfig("max_owners must be at least 1".into()));
        }
        if self.max_keys_per_owner == 0 {
            return Err(StoreError::InvalidConfig(
                "max_keys_per_owner must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Change notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    Set { owner: String, key: String },
    KeyDeleted { owner: String, key: String },
    OwnerDeleted { owner: String },
    /// LRU eviction; `key` is `None` when the whole owner was dropped.
    Evicted { owner: String, key: Option<String> },
    FlushFailed { error: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub owners: usize,
    pub keys: usize,
    /// Snapshot writes completed since open.
    pub writes: u64,
}

struct PendingFlush {
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    config: StoreConfig,
    data: Mutex<IndexMap<String, OwnerMap>>,
    pending: Mutex<Option<PendingFlush>>,
    flush_generation: AtomicU64,
    write_lock: Mutex<()>,
    writes: AtomicU64,
    closed: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
}

/// Cloneable handle to the keyed store.
#[derive(Clone)]
pub struct KeyedStore {
    inner: Arc<Inner>,
}

impl KeyedStore {
    /// Open the store, creating an empty snapshot if none exists.
    ///
    /// A snapshot that does not parse is a hard error; nothing is overwritten.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let data = match snapshot::read_snapshot(&config.path)? {
            Some(content) => parse_snapshot(&config, &content)?,
            None => {
                snapshot::write_snapshot(&config.path, b"{}", config.durability)?;
                info!(path = %config.path.display(), "initialized empty store snapshot");
                IndexMap::new()
            }
        };

        let owners = data.len();
        let (events, _) = broadcast::channel(256);
        info!(path = %config.path.display(), owners, "keyed store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                data: Mutex::new(data),
                pending: Mutex::new(None),
                flush_generation: AtomicU64::new(0),
                write_lock: Mutex::new(()),
                writes: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Look up a value and mark the owner as most recently used.
    pub fn get(&self, owner: &str, key: &str) -> Option<Arc<Value>> {
        let mut data = self.inner.data.lock();
        let keys = touch(&mut data, owner)?;
        let value = keys.get(key)?;
        Some(match self.inner.config.read_policy {
            ReadPolicy::Shared => Arc::clone(value),
            ReadPolicy::Copy => Arc::new(Value::clone(value)),
        })
    }

    /// Typed read; `Ok(None)` when absent.
    pub fn get_as<T: DeserializeOwned>(&self, owner: &str, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(owner, key) {
            Some(value) => Ok(Some(T::deserialize(value.as_ref())?)),
            None => Ok(None),
        }
    }

    /// All keys of an owner, in insertion order. Marks the owner as most recently used.
    pub fn get_all(&self, owner: &str) -> Option<IndexMap<String, Value>> {
        let mut data = self.inner.data.lock();
        let keys = touch(&mut data, owner)?;
        Some(
            keys.iter()
                .map(|(k, v)| (k.clone(), Value::clone(v)))
                .collect(),
        )
    }

    pub fn set(&self, owner: &str, key: &str, value: Value) {
        let mut evicted = Vec::new();
        {
            let mut data = self.inner.data.lock();
            if touch(&mut data, owner).is_none() {
                data.insert(owner.to_string(), IndexMap::new());
                while data.len() > self.inner.config.max_owners {
                    if let Some((old, _)) = data.shift_remove_index(0) {
                        evicted.push(StoreEvent::Evicted { owner: old, key: None });
                    }
                }
            }
            if let Some(keys) = data.get_mut(owner) {
                keys.insert(key.to_string(), Arc::new(value));
                while keys.len() > self.inner.config.max_keys_per_owner {
                    if let Some((old, _)) = keys.shift_remove_index(0) {
                        evicted.push(StoreEvent::Evicted {
                            owner: owner.to_string(),
                            key: Some(old),
                        });
                    }
                }
            }
        }

        for event in evicted {
            debug!(?event, "store eviction");
            self.emit(event);
        }
        self.schedule_flush();
        self.emit(StoreEvent::Set {
            owner: owner.to_string(),
            key: key.to_string(),
        });
    }

    pub fn set_as<T: Serialize>(&self, owner: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.set(owner, key, value);
        Ok(())
    }

    /// Remove one key; an owner left empty is removed too.
    pub fn delete_key(&self, owner: &str, key: &str) -> bool {
        let removed = {
            let mut data = self.inner.data.lock();
            let Some(keys) = data.get_mut(owner) else {
                return false;
            };
            let removed = keys.shift_remove(key).is_some();
            if keys.is_empty() {
                data.shift_remove(owner);
            }
            removed
        };

        if removed {
            self.schedule_flush();
            self.emit(StoreEvent::KeyDeleted {
                owner: owner.to_string(),
                key: key.to_string(),
            });
        }
        removed
    }

    pub fn delete_owner(&self, owner: &str) -> bool {
        let removed = self.inner.data.lock().shift_remove(owner).is_some();
        if removed {
            self.schedule_flush();
            self.emit(StoreEvent::OwnerDeleted {
                owner: owner.to_string(),
            });
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let data = self.inner.data.lock();
        StoreStats {
            owners: data.len(),
            keys: data.values().map(IndexMap::len).sum(),
            writes: self.inner.writes.load(Ordering::Relaxed),
        }
    }

    /// Cancel any pending debounce and write the current state now.
    pub fn flush(&self) -> Result<(), StoreError> {
        if let Some(pending) = self.inner.pending.lock().take() {
            pending.cancel.cancel();
        }
        self.inner.write_now()
    }

    /// Final flush. Later mutations stay in memory only.
    pub fn close(&self) -> Result<(), StoreError> {
        let result = self.flush();
        self.inner.closed.store(true, Ordering::Release);
        info!(path = %self.inner.config.path.display(), "keyed store closed");
        result
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn schedule_flush(&self) {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("mutation after close; not persisted");
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime for debounce, flushing synchronously");
            self.inner.write_logged();
            return;
        };

        let generation = self.inner.flush_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let previous = self.inner.pending.lock().replace(PendingFlush {
            generation,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let inner = Arc::clone(&self.inner);
        let debounce = inner.config.debounce;
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    if !inner.claim_pending(generation) {
                        return;
                    }
                    let writer = Arc::clone(&inner);
                    let write = tokio::task::spawn_blocking(move || writer.write_logged());
                    if let Err(e) = write.await {
                        error!(error = %e, "store flush task failed");
                    }
                }
            }
        });
    }
}

impl Inner {
    /// Clear the pending flush if it still belongs to `generation`. A newer
    /// mutation or a forced flush makes the older timer stale.
    fn claim_pending(&self, generation: u64) -> bool {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.generation == generation) {
            *pending = None;
            true
        } else {
            false
        }
    }

    fn write_now(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let bytes = {
            let data = self.data.lock();
            serde_json::to_vec(&*data)?
        };
        snapshot::write_snapshot(&self.config.path, &bytes, self.config.durability)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.config.path.display(), bytes = bytes.len(), "store snapshot written");
        Ok(())
    }

    /// Debounced writes are best-effort: failures are logged and broadcast.
    fn write_logged(&self) {
        if let Err(e) = self.write_now() {
            error!(path = %self.config.path.display(), error = %e, "store flush failed");
            let _ = self.events.send(StoreEvent::FlushFailed {
                error: e.to_string(),
            });
        }
    }
}

/// Move `owner` to the most-recent end and return its key map.
fn touch<'a>(data: &'a mut IndexMap<String, OwnerMap>, owner: &str) -> Option<&'a mut OwnerMap> {
    let idx = data.get_index_of(owner)?;
    let last = data.len() - 1;
    if idx != last {
        let (name, keys) = data.shift_remove_index(idx)?;
        data.insert(name, keys);
    }
    data.last_mut().map(|(_, keys)| keys)
}

fn parse_snapshot(config: &StoreConfig, content: &str) -> Result<IndexMap<String, OwnerMap>, StoreError> {
    let raw: IndexMap<String, IndexMap<String, Value>> =
        serde_json::from_str(content).map_err(|e| StoreError::Corrupt {
            path: config.path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut data: IndexMap<String, OwnerMap> = raw
        .into_iter()
        .filter(|(_, keys)| !keys.is_empty())
        .map(|(owner, keys)| {
            let mut keys: OwnerMap = keys.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
            while keys.len() > config.max_keys_per_owner {
                keys.shift_remove_index(0);
            }
            (owner, keys)
        })
        .collect();
    while data.len() > config.max_owners {
        data.shift_remove_index(0);
    }
    Ok(data)
}
