//! File-backed cache storage.
//!
//! Each bucket is one JSON file in the store directory. Bucket files are
//! replaced through a uniquely named temporary file and a rename, so a reader
//! never sees a half-written bucket, even with several processes on one store.
//!
//! Parsed buckets are kept in memory and reused for as long as the file's
//! modification time and length are unchanged.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use shutri_net::Request;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::{Cache, CacheEntry, CacheStorage};
use crate::ServiceWorkerError;

const BUCKET_EXT: &str = "json";

#[derive(Deserialize)]
struct BucketFile {
    name: String,
    entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct BucketFileRef<'a> {
    name: &'a str,
    entries: Vec<&'a CacheEntry>,
}

/// What a bucket file looked like when it was last parsed or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Debug)]
struct Loaded {
    stamp: Stamp,
    cache: Cache,
}

/// Cache storage persisted under a directory. Bucket names enumerate sorted.
#[derive(Debug)]
pub struct FileCacheStorage {
    dir: PathBuf,
    loaded: Mutex<HashMap<String, Loaded>>,
}

impl FileCacheStorage {
    /// Open (and create) a store directory.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened cache store");
        Ok(Self {
            dir,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{BUCKET_EXT}", escape_name(name)))
    }

    /// Bring `loaded[name]` in line with the file on disk. Returns whether
    /// the bucket exists.
    async fn refresh(
        &self,
        loaded: &mut HashMap<String, Loaded>,
        name: &str,
    ) -> Result<bool, ServiceWorkerError> {
        let path = self.bucket_path(name);
        let Some(stamp) = stamp(&path).await? else {
            loaded.remove(name);
            return Ok(false);
        };
        if loaded.get(name).is_some_and(|l| l.stamp == stamp) {
            return Ok(true);
        }

        loaded.remove(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let file: BucketFile = serde_json::from_slice(&bytes).map_err(|e| {
            ServiceWorkerError::CacheError(format!("corrupt bucket {}: {e}", path.display()))
        })?;
        trace!(cache = name, entries = file.entries.len(), "Loaded bucket");

        let cache = Cache::from_entries(&file.name, file.entries);
        loaded.insert(name.to_string(), Loaded { stamp, cache });
        Ok(true)
    }

    async fn persist(&self, cache: &Cache) -> Result<Stamp, ServiceWorkerError> {
        let file = BucketFileRef {
            name: &cache.name,
            entries: cache.entries(),
        };
        let json = serde_json::to_vec(&file)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let dir = self.dir.clone();
        let path = self.bucket_path(&cache.name);
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ServiceWorkerError::StateError(format!("bucket write task failed: {e}")))??;

        trace!(cache = %cache.name, entries = cache.len(), "Wrote bucket");
        stamp(&path).await?.ok_or_else(|| {
            ServiceWorkerError::CacheError(format!("bucket {} vanished after write", cache.name))
        })
    }
}

async fn stamp(path: &Path) -> Result<Option<Stamp>, ServiceWorkerError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(Stamp {
            modified: meta.modified()?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStorage for FileCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        if !self.refresh(&mut loaded, name).await? {
            debug!(cache = name, "Creating cache");
            let cache = Cache::new(name);
            let stamp = self.persist(&cache).await?;
            loaded.insert(name.to_string(), Loaded { stamp, cache });
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(stamp(&self.bucket_path(name)).await?.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXT) {
                continue;
            }
            if let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(unescape_name)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        loaded.remove(name);
        match tokio::fs::remove_file(self.bucket_path(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        if !self.refresh(&mut loaded, name).await? {
            return Ok(None);
        }
        Ok(loaded
            .get(name)
            .and_then(|l| l.cache.match_request(request))
            .cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        let current = if self.refresh(&mut loaded, name).await? {
            loaded.remove(name)
        } else {
            None
        };
        let Some(Loaded { mut cache, .. }) = current else {
            return Err(ServiceWorkerError::NotFound(name.to_string()));
        };

        cache.put(entry);
        let stamp = self.persist(&cache).await?;
        loaded.insert(name.to_string(), Loaded { stamp, cache });
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        self.refresh(&mut loaded, name).await?;
        let mut cache = loaded
            .remove(name)
            .map(|l| l.cache)
            .unwrap_or_else(|| Cache::new(name));

        for entry in entries {
            cache.put(entry);
        }
        let stamp = self.persist(&cache).await?;
        loaded.insert(name.to_string(), Loaded { stamp, cache });
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        let mut loaded = self.loaded.lock().await;
        if !self.refresh(&mut loaded, name).await? {
            return Err(ServiceWorkerError::NotFound(name.to_string()));
        }
        Ok(loaded
            .get(name)
            .map(|l| l.cache.entries().into_iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Bucket name to file stem: `[A-Za-z0-9_-]` kept, everything else `%XX`.
fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
