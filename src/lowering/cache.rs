//! # IR Cache
//!
//! Multi-tier cache for lowered `ApplicationIr`s:
//!
//! 1. In-memory KV (primary, per-process)
//! 2. Filesystem JSON (fallback; a hit re-warms the primary tier)
//! 3. Full regeneration (miss)
//!
//! The key is `sha256(canonicalized spec ‖ enrichment config ‖ schema
//! version)`, so formatting-only spec edits hit the cache while any change
//! to enrichment settings or the IR schema misses it. Entries expire after
//! a configurable TTL (default seven days).

use crate::ir::{ApplicationIr, IrError, IR_SCHEMA_VERSION};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// A cached IR with its storage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    ir: ApplicationIr,
    schema_version: u32,
    cached_at: DateTime<Utc>,
}

/// Cache hit/miss counters, exposed for telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

/// Two-tier IR cache.
pub struct IrCache {
    memory: DashMap<String, CacheEntry>,
    dir: PathBuf,
    ttl: Duration,
    stats: parking_lot::Mutex<CacheStats>,
}

impl IrCache {
    /// Create a cache rooted at `dir` with the given TTL in seconds.
    pub fn new(dir: impl Into<PathBuf>, ttl_seconds: u64) -> Self {
        IrCache {
            memory: DashMap::new(),
            dir: dir.into(),
            ttl: Duration::seconds(ttl_seconds as i64),
            stats: parking_lot::Mutex::new(CacheStats::default()),
        }
    }

    /// Compute the cache key for a canonicalized spec and the enrichment
    /// configuration fingerprint.
    pub fn key(canonical_spec: &str, enrichment_fingerprint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_spec.as_bytes());
        hasher.update(b"\x00");
        hasher.update(enrichment_fingerprint.as_bytes());
        hasher.update(b"\x00");
        hasher.update(IR_SCHEMA_VERSION.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up an IR. Disk hits re-warm the memory tier. Expired entries
    /// are treated as misses; entries whose schema version drifted return
    /// `IrError::SchemaDrift` so the caller can surface it.
    pub fn get(&self, key: &str) -> Result<Option<ApplicationIr>, IrError> {
        if let Some(entry) = self.memory.get(key) {
            if self.expired(&entry) {
                drop(entry);
                self.memory.remove(key);
                self.stats.lock().expirations += 1;
            } else {
                Self::check_version(&entry)?;
                self.stats.lock().memory_hits += 1;
                return Ok(Some(entry.ir.clone()));
            }
        }

        let path = self.entry_path(key);
        if !path.exists() {
            self.stats.lock().misses += 1;
            return Ok(None);
        }
        let entry: CacheEntry = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
        {
            Some(e) => e,
            None => {
                // Unreadable entries are dropped, not fatal.
                let _ = std::fs::remove_file(&path);
                self.stats.lock().misses += 1;
                return Ok(None);
            }
        };

        if self.expired(&entry) {
            let _ = std::fs::remove_file(&path);
            self.stats.lock().expirations += 1;
            return Ok(None);
        }
        Self::check_version(&entry)?;

        // Warm the primary tier.
        self.memory.insert(key.to_string(), entry.clone());
        self.stats.lock().disk_hits += 1;
        Ok(Some(entry.ir))
    }

    /// Store an IR in both tiers. Disk writes are atomic (temp + rename).
    pub fn put(&self, key: &str, ir: &ApplicationIr) -> std::io::Result<()> {
        let entry = CacheEntry {
            ir: ir.clone(),
            schema_version: ir.schema_version,
            cached_at: Utc::now(),
        };
        self.memory.insert(key.to_string(), entry.clone());

        std::fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock()
    }

    fn expired(&self, entry: &CacheEntry) -> bool {
        Utc::now() - entry.cached_at > self.ttl
    }

    fn check_version(entry: &CacheEntry) -> Result<(), IrError> {
        if entry.schema_version != IR_SCHEMA_VERSION {
            return Err(IrError::SchemaDrift {
                found: entry.schema_version,
                current: IR_SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

/// Digest of the raw (canonicalized) spec, recorded in the IR.
pub fn spec_digest(canonical_spec: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_spec.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Remove expired entries from a cache directory. Called opportunistically
/// at pipeline startup.
pub fn sweep_expired(dir: &Path, ttl_seconds: u64) -> std::io::Result<usize> {
    let ttl = Duration::seconds(ttl_seconds as i64);
    let mut removed = 0usize;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stale = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<CacheEntry>(&text).ok())
            .map_or(true, |e| Utc::now() - e.cached_at > ttl);
        if stale {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_includes_enrichment_fingerprint() {
        let a = IrCache::key("spec text", "strict=false");
        let b = IrCache::key("spec text", "strict=true");
        assert_ne!(a, b);
    }

    #[test]
    fn test_roundtrip_memory_and_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = IrCache::new(tmp.path(), 3600);
        let ir = ApplicationIr::new("Shop");
        let key = IrCache::key("spec", "default");

        cache.put(&key, &ir).expect("put");
        let hit = cache.get(&key).expect("get").expect("entry");
        assert_eq!(hit.app_name, "Shop");
        assert_eq!(cache.stats().memory_hits, 1);

        // A fresh cache instance only has the disk tier; the hit should
        // warm memory.
        let cold = IrCache::new(tmp.path(), 3600);
        assert!(cold.get(&key).expect("get").is_some());
        assert_eq!(cold.stats().disk_hits, 1);
        assert!(cold.get(&key).expect("get").is_some());
        assert_eq!(cold.stats().memory_hits, 1);
    }

    #[test]
    fn test_schema_drift_surfaced() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = IrCache::new(tmp.path(), 3600);
        let mut ir = ApplicationIr::new("Shop");
        let key = IrCache::key("spec", "default");
        cache.put(&key, &ir).expect("put");

        // Corrupt the stored version to simulate drift.
        ir.schema_version += 1;
        cache.put(&key, &ir).expect("put");
        assert!(matches!(cache.get(&key), Err(IrError::SchemaDrift { .. })));
    }
}
