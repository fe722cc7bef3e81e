//! Content-addressed artifact cache with per-key single-flight.
//!
//! Keys are 64-hex SHA-256 digests over `(tier tag, prompt template
//! version, canonical inputs)`. Concurrent callers of
//! [`ArtifactCache::get_or_compute`] for the same key coalesce onto one
//! computation; late arrivals observe the leader's result through a
//! per-key watch channel rather than a global lock.
//!
//! Persistence is one file per key under the cache directory, written to
//! a temp file and renamed into place. A file that fails to parse (for
//! example a partial write from a killed process) is treated as a miss
//! and recomputed.
//!
//! Waiting on another task's in-flight computation is a suspension
//! point: the wait races the run's cancellation signal, so a canceled
//! run never sits out the leader's LLM call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// Separator between key parts; cannot occur in hex, tags, or versions.
const KEY_SEPARATOR: u8 = 0x1f;

/// Advisory manifest filename.
const MANIFEST_NAME: &str = "index.json";

/// Derives a cache key from a tier tag, the prompt template version, and
/// the canonical input parts, in order.
#[must_use]
pub fn cache_key(tier_tag: &str, template_version: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tier_tag.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(template_version.as_bytes());
    for part in parts {
        hasher.update([KEY_SEPARATOR]);
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// On-disk envelope for one cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    template_version: String,
    created_at: DateTime<Utc>,
    payload: String,
}

/// Advisory manifest listing stored keys.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    key: String,
    template_version: String,
}

/// Broadcast payload for followers of an in-flight computation.
type FlightResult = Option<Result<String, String>>;

enum Slot {
    Ready(String),
    InFlight(watch::Receiver<FlightResult>),
}

/// Shared cache component; all mutation goes through this API.
pub struct ArtifactCache {
    dir: Option<PathBuf>,
    template_version: String,
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicUsize,
    cancel: CancelToken,
}

impl ArtifactCache {
    /// Creates a cache persisted under `dir`, creating the directory if
    /// needed. Waits inside [`ArtifactCache::get_or_compute`] observe
    /// `cancel`.
    pub fn open(dir: &Path, template_version: &str, cancel: CancelToken) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            template_version: template_version.to_string(),
            slots: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            cancel,
        })
    }

    /// Creates a purely in-memory cache (tests, one-shot runs).
    #[must_use]
    pub fn in_memory(template_version: &str, cancel: CancelToken) -> Self {
        Self {
            dir: None,
            template_version: template_version.to_string(),
            slots: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Number of lookups served without running the compute function.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Returns the cached payload for `key`, or runs `compute` exactly
    /// once across all concurrent callers, stores its successful result,
    /// and returns it. A failed computation is not cached; its error is
    /// reported to every caller coalesced onto that flight.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        enum Action {
            Hit(String),
            Wait(watch::Receiver<FlightResult>),
            Lead(watch::Sender<FlightResult>),
        }

        let action = {
            let mut slots = self.slots.lock().await;

            // A dead flight (leader task dropped without reporting) is
            // cleared so a new leader can take over.
            let flight_is_dead = matches!(
                slots.get(key),
                Some(Slot::InFlight(rx)) if rx.has_changed().is_err() && rx.borrow().is_none()
            );
            if flight_is_dead {
                slots.remove(key);
            }

            match slots.get(key) {
                Some(Slot::Ready(payload)) => Action::Hit(payload.clone()),
                Some(Slot::InFlight(rx)) => Action::Wait(rx.clone()),
                None => {
                    if let Some(payload) = self.read_entry(key) {
                        slots.insert(key.to_string(), Slot::Ready(payload.clone()));
                        Action::Hit(payload)
                    } else {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key.to_string(), Slot::InFlight(rx));
                        Action::Lead(tx)
                    }
                }
            }
        };

        match action {
            Action::Hit(payload) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(payload)
            }
            Action::Wait(rx) => {
                // The wait is a suspension point; cancellation must wake
                // it without waiting out the leader's computation.
                let outcome = tokio::select! {
                    () = self.cancel.canceled() => {
                        return Err(anyhow::anyhow!("cache wait canceled"));
                    }
                    outcome = Self::await_flight(rx) => outcome,
                };
                match outcome {
                    Some(Ok(payload)) => {
                        self.hits.fetch_add(1, Ordering::SeqCst);
                        Ok(payload)
                    }
                    Some(Err(message)) => Err(anyhow::anyhow!(message)),
                    // Leader vanished without reporting; retry, possibly
                    // taking over leadership with our own compute.
                    None => Box::pin(self.get_or_compute(key, compute)).await,
                }
            }
            Action::Lead(tx) => {
                let result = compute().await;
                let mut slots = self.slots.lock().await;
                match result {
                    Ok(payload) => {
                        if let Err(e) = self.write_entry(key, &payload) {
                            warn!(key, error = %e, "failed to persist cache entry");
                        }
                        slots.insert(key.to_string(), Slot::Ready(payload.clone()));
                        let _ = tx.send(Some(Ok(payload.clone())));
                        Ok(payload)
                    }
                    Err(err) => {
                        slots.remove(key);
                        let _ = tx.send(Some(Err(err.to_string())));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Waits for a flight to report, returning `None` when the leader was
    /// dropped without reporting.
    async fn await_flight(mut rx: watch::Receiver<FlightResult>) -> FlightResult {
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return Some(outcome);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Drops every key beginning with `prefix`, in memory and on disk.
    /// Returns the number of distinct keys removed; a key present in both
    /// places counts once.
    pub async fn invalidate(&self, prefix: &str) -> Result<usize> {
        let mut removed: HashSet<String> = HashSet::new();
        {
            let mut slots = self.slots.lock().await;
            slots.retain(|key, _| {
                if key.starts_with(prefix) {
                    removed.insert(key.clone());
                    false
                } else {
                    true
                }
            });
        }

        if let Some(dir) = &self.dir {
            for entry in std::fs::read_dir(dir)
                .with_context(|| format!("failed to list cache dir {}", dir.display()))?
            {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name != MANIFEST_NAME && name.starts_with(prefix) {
                    std::fs::remove_file(entry.path()).with_context(|| {
                        format!("failed to remove cache file {}", entry.path().display())
                    })?;
                    removed.insert(name.to_string());
                }
            }
        }
        debug!(prefix, removed = removed.len(), "invalidated cache entries");
        Ok(removed.len())
    }

    /// Writes the advisory `index.json` manifest. Purely informational;
    /// readers never depend on it.
    pub async fn flush_manifest(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let manifest = {
            let slots = self.slots.lock().await;
            Manifest {
                entries: slots
                    .keys()
                    .map(|key| ManifestEntry {
                        key: key.clone(),
                        template_version: self.template_version.clone(),
                    })
                    .collect(),
            }
        };
        let text = serde_json::to_string_pretty(&manifest)?;
        let path = dir.join(MANIFEST_NAME);
        std::fs::write(&path, text)
            .with_context(|| format!("failed to write manifest {}", path.display()))
    }

    /// Reads and validates one entry file; `None` on any defect.
    fn read_entry(&self, key: &str) -> Option<String> {
        let dir = self.dir.as_ref()?;
        let text = std::fs::read_to_string(dir.join(key)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&text).ok()?;
        if entry.key != key {
            warn!(key, "cache file names a different key; ignoring");
            return None;
        }
        Some(entry.payload)
    }

    /// Writes one entry via temp file + rename so readers never observe a
    /// torn write.
    fn write_entry(&self, key: &str, payload: &str) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let entry = CacheEntry {
            key: key.to_string(),
            template_version: self.template_version.clone(),
            created_at: Utc::now(),
            payload: payload.to_string(),
        };
        let text = serde_json::to_string(&entry)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        std::fs::write(tmp.path(), text).context("failed to write cache temp file")?;
        tmp.persist(dir.join(key))
            .with_context(|| format!("failed to persist cache entry {key}"))?;
        Ok(())
    }
}
