//! Cache buckets and cache storage.
//!
//! A [`Cache`] is one named bucket mapping request identity (method + URL) to
//! a stored response. [`CacheStorage`] is the set of buckets shared by every
//! worker version; buckets are told apart only by name.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use shutri_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Keys ====================

/// Request identity inside a bucket.
///
/// Fragments are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key for a method and URL.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Repeated names stay separate and
    /// values keep their raw bytes.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Copy a response into an entry keyed by `request`.
    ///
    /// The response itself is left untouched so it can still be returned.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let key = CacheKey::for_request(request);
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: key.url,
            method: key.method,
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: shutri_common::now_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response from the stored entry.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("stored url {}: {e}", self.url)))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            ServiceWorkerError::CacheError(format!("stored status {}: {e}", self.status))
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| {
                ServiceWorkerError::CacheError(format!("stored header {name}: {e}"))
            })?;
            let value = HeaderValue::from_bytes(value).map_err(|e| {
                ServiceWorkerError::CacheError(format!("stored value for {name}: {e}"))
            })?;
            headers.append(name, value);
        }

        let mut response = Response::new(url, status, Bytes::from(self.body.clone()));
        response.headers = headers;
        Ok(response)
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A cache bucket. Keys keep their first insertion order.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<CacheKey, CacheEntry>,

    /// Key insertion order.
    order: Vec<CacheKey>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Rebuild a cache from entries in key order.
    pub fn from_entries(name: &str, entries: Vec<CacheEntry>) -> Self {
        let mut cache = Self::new(name);
        for entry in entries {
            cache.put(entry);
        }
        cache
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&CacheKey::for_request(request))
    }

    /// Insert or overwrite an entry.
    pub fn put(&mut self, entry: CacheEntry) {
        let key = entry.key();
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push(key);
        }
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        let key = CacheKey::for_request(request);
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
            true
        } else {
            false
        }
    }

    /// Get all keys in insertion order.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.order.iter().collect()
    }

    /// Get all entries in key order.
    pub fn entries(&self) -> Vec<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Named bucket storage (the `caches` global).
///
/// Per-call operations are atomic. `put_all` commits every entry or none.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// All bucket names.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up a request in one bucket.
    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store an entry in an existing bucket, replacing any entry with the
    /// same key. Fails with `NotFound` if the bucket has been deleted.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Store a batch of entries atomically, creating the bucket if needed.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>)
        -> Result<(), ServiceWorkerError>;

    /// All entries of a bucket in key order.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError>;
}

/// In-memory cache storage. Bucket names enumerate in creation order.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        if !caches.iter().any(|c| c.name == name) {
            debug!(cache = name, "Creating cache");
            caches.push(Cache::new(name));
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.read().await.iter().any(|c| c.name == name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.caches.read().await.iter().map(|c| c.name.clone()).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        Ok(caches.len() != before)
    }

    async fn match_request(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let hit = caches
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.match_request(request))
            .cloned();
        trace!(cache = name, url = %request.url, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))?;
        cache.put(entry);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let index = match caches.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                caches.push(Cache::new(name));
                caches.len() - 1
            }
        };
        for entry in entries {
            caches[index].put(entry);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        let cache = caches
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))?;
        Ok(cache.entries().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn entry(url: &str, body: &str) -> CacheEntry {
        let req = request(url);
        let response = Response::new(req.url.clone(), StatusCode::OK, body.to_string());
        CacheEntry::from_response(&req, &response)
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("sruti-gita-v1");
        cache.put(entry("https://example.com/style.css", "body{}"));

        assert!(cache.match_request(&request("https://example.com/style.css")).is_some());
        assert!(cache.match_request(&request("https://example.com/other.css")).is_none());
    }

    #[test]
    fn test_cache_ignores_fragment() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/index.html", "<p>"));

        assert!(cache
            .match_request(&request("https://example.com/index.html#verse-4"))
            .is_some());
    }

    #[test]
    fn test_cache_method_is_part_of_key() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/api", "{}"));

        let post = Request::post(Url::parse("https://example.com/api").unwrap(), Bytes::new());
        assert!(cache.match_request(&post).is_none());
    }

    #[test]
    fn test_cache_overwrite_keeps_order() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/a.js", "a"));
        cache.put(entry("https://example.com/b.js", "b"));
        cache.put(entry("https://example.com/a.js", "a2"));

        let keys: Vec<_> = cache.keys().into_iter().map(|k| k.url.clone()).collect();
        assert_eq!(keys, vec!["https://example.com/a.js", "https://example.com/b.js"]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.entries()[0].body, b"a2");
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/style.css", ""));

        assert!(cache.delete(&request("https://example.com/style.css")));
        assert!(cache.match_request(&request("https://example.com/style.css")).is_none());
        assert!(cache.is_empty());
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_entry_round_trips_response() {
        let req = request("https://example.com/bg01.mp3");
        let response = Response::new(req.url.clone(), StatusCode::OK, vec![0xff, 0xfb, 0x90])
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("audio/mpeg"),
            );

        let entry = CacheEntry::from_response(&req, &response);
        let rebuilt = entry.to_response().unwrap();

        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body().to_vec(), vec![0xffu8, 0xfb, 0x90]);
        assert_eq!(rebuilt.content_type().unwrap().essence_str(), "audio/mpeg");
        // The source response is still readable after copying.
        assert_eq!(response.body().len(), 3);
    }

    #[test]
    fn test_entry_keeps_repeated_and_binary_headers() {
        let req = request("https://example.com/login");
        let mut response = Response::new(req.url.clone(), StatusCode::OK, "ok");
        response.headers.append(
            http::header::SET_COOKIE,
            HeaderValue::from_static("a=1; Path=/"),
        );
        response.headers.append(
            http::header::SET_COOKIE,
            HeaderValue::from_static("b=2; Expires=Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        response.headers.insert(
            HeaderName::from_static("x-raw"),
            HeaderValue::from_bytes(b"caf\xe9").unwrap(),
        );

        let entry = CacheEntry::from_response(&req, &response);
        let json = serde_json::to_string(&entry).unwrap();
        let rebuilt: CacheEntry = serde_json::from_str(&json).unwrap();
        let rebuilt = rebuilt.to_response().unwrap();

        let cookies: Vec<_> = rebuilt
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            cookies,
            vec!["a=1; Path=/", "b=2; Expires=Wed, 21 Oct 2026 07:28:00 GMT"]
        );
        assert_eq!(rebuilt.headers["x-raw"].as_bytes(), b"caf\xe9");
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let e = entry("https://example.com/x", "A");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["body"], "QQ==");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        storage.open("sruti-gita-v2").await.unwrap();
        storage.open("sruti-gita-v1").await.unwrap();
        storage.open("sruti-gita-v2").await.unwrap();

        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["sruti-gita-v2".to_string(), "sruti-gita-v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_storage_put_requires_bucket() {
        let storage = MemoryCacheStorage::new();
        let err = storage
            .put("gone", entry("https://example.com/x", "B"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::NotFound(_)));
        assert!(!storage.has("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_put_all_and_match() {
        let storage = MemoryCacheStorage::new();
        storage
            .put_all(
                "v1",
                vec![
                    entry("https://example.com/", "root"),
                    entry("https://example.com/index.html", "index"),
                ],
            )
            .await
            .unwrap();

        let hit = storage
            .match_request("v1", &request("https://example.com/index.html"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"index");
        assert_eq!(storage.entries("v1").await.unwrap().len(), 2);
        assert!(storage
            .match_request("v2", &request("https://example.com/index.html"))
            .await
            .unwrap()
            .is_none());
    }
}
