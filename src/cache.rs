use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE};
use crate::models::{Fingerprint, ImagePayload};

pub const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_days: u64,
    // None keeps the cache in memory only
    pub path: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            path: None,
            max_entries: 256,
        }
    }
}

// Cache entry with timestamp (epoch millis, so it survives restarts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: ImagePayload,
    pub created_at: i64,
}

// Modified time and size of the store file as last read
type StoreStamp = (SystemTime, u64);

// In memory, plus an optional JSON file shared with other instances.
// Store failures degrade to a miss or a no-op.
pub struct FingerprintCache {
    ttl_ms: i64,
    max_entries: usize,
    path: Option<PathBuf>,
    entries: DashMap<String, CacheEntry>,
    write_lock: Mutex<()>,
    loaded: std::sync::Mutex<Option<StoreStamp>>,
}

impl FingerprintCache {
    pub fn new(config: CacheConfig) -> Self {
        let ttl_ms = (config.ttl_days as i64).saturating_mul(DAY_MS);
        let entries = DashMap::new();
        let mut stamp = None;
        if ttl_ms > 0 {
            if let Some(path) = &config.path {
                stamp = std::fs::metadata(path).ok().and_then(|meta| stamp_of(&meta));
                for (key, entry) in read_store_sync(path) {
                    entries.insert(key, entry);
                }
            }
        }
        info!(
            ttl_days = config.ttl_days,
            loaded = entries.len(),
            durable = config.path.is_some(),
            "fingerprint cache ready"
        );
        CACHE_SIZE.set(entries.len() as f64);
        Self {
            ttl_ms,
            max_entries: config.max_entries.max(1),
            path: config.path,
            entries,
            write_lock: Mutex::new(()),
            loaded: std::sync::Mutex::new(stamp),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl_ms > 0
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<ImagePayload> {
        self.get_at(fingerprint, now_millis()).await
    }

    pub async fn put(&self, fingerprint: &Fingerprint, payload: &ImagePayload) {
        self.put_at(fingerprint, payload, now_millis()).await
    }

    pub async fn get_at(&self, fingerprint: &Fingerprint, now: i64) -> Option<ImagePayload> {
        if !self.is_enabled() {
            return None;
        }
        let key = fingerprint.as_str();

        // clone out so the shard lock is not held across the refresh below
        let mut found = self.entries.get(key).map(|entry| entry.clone());
        if found.is_none() {
            // another instance may have written it since we loaded
            if let Some(path) = &self.path {
                if self.refresh(path).await {
                    found = self.entries.get(key).map(|entry| entry.clone());
                }
            }
        }

        match found {
            Some(entry) if self.is_fresh(&entry, now) => {
                CACHE_HITS.inc();
                debug!(%fingerprint, "cache hit");
                Some(entry.payload)
            }
            _ => {
                CACHE_MISSES.inc();
                debug!(%fingerprint, "cache miss");
                None
            }
        }
    }

    pub async fn put_at(&self, fingerprint: &Fingerprint, payload: &ImagePayload, now: i64) {
        if !self.is_enabled() {
            return;
        }
        let entry = CacheEntry {
            payload: payload.clone(),
            created_at: now,
        };
        self.entries
            .insert(fingerprint.as_str().to_string(), entry.clone());
        self.evict_overflow();
        CACHE_SIZE.set(self.entries.len() as f64);

        if let Some(path) = &self.path {
            if let Err(e) = self.persist(path, fingerprint.as_str(), entry, now).await {
                debug!(%fingerprint, error = %e, "cache store write failed, keeping memory copy");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // Pulls in entries we have not seen, skipping the parse when the file
    // is unchanged since the last read
    async fn refresh(&self, path: &Path) -> bool {
        let Some(stamp) = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|meta| stamp_of(&meta))
        else {
            return false;
        };
        {
            let mut loaded = match self.loaded.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *loaded == Some(stamp) {
                return false;
            }
            *loaded = Some(stamp);
        }

        let on_disk = read_store(path).await;
        debug!(entries = on_disk.len(), "reloaded cache store");
        for (key, entry) in on_disk {
            if !self.entries.contains_key(&key) {
                self.entries.insert(key, entry);
            }
        }
        self.evict_overflow();
        CACHE_SIZE.set(self.entries.len() as f64);
        true
    }

    fn is_fresh(&self, entry: &CacheEntry, now: i64) -> bool {
        now - entry.created_at < self.ttl_ms
    }

    fn evict_overflow(&self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.created_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    // Merge our entry into whatever is on disk now, so concurrent
    // writers do not clobber each other
    async fn persist(
        &self,
        path: &Path,
        key: &str,
        entry: CacheEntry,
        now: i64,
    ) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut on_disk = read_store(path).await;
        on_disk.insert(key.to_string(), entry);
        on_disk.retain(|_, entry| now - entry.created_at < self.ttl_ms);
        while on_disk.len() > self.max_entries {
            let oldest = on_disk
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    on_disk.remove(&key);
                }
                None => break,
            }
        }

        let raw = serde_json::to_vec(&on_disk).map_err(std::io::Error::other)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

async fn read_store(path: &Path) -> HashMap<String, CacheEntry> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn stamp_of(meta: &std::fs::Metadata) -> Option<StoreStamp> {
    meta.modified().ok().map(|modified| (modified, meta.len()))
}

fn read_store_sync(path: &Path) -> HashMap<String, CacheEntry> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
