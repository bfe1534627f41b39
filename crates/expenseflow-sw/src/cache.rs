//! Named cache stores (the `caches` global).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use expenseflow_common::ExpenseFlowError;
use expenseflow_net::{Fetcher, Request, Response, ResponseType};
use hashbrown::HashMap;
use http::header::VARY;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache storage shared between event handlers.
pub type SharedCaches = Arc<RwLock<CacheStorage>>;

// ==================== Keys ====================

/// Request descriptor used as a cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Request header values named by the response `Vary` header.
    pub vary: Vec<(String, Option<String>)>,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response type at capture time.
    #[serde(default)]
    pub response_type: ResponseType,

    /// Response headers, in order, with raw values.
    #[serde(with = "header_values")]
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under `request`.
    pub fn capture(request: &Request, response: &Response) -> Self {
        let key = RequestKey::for_request(request);
        Self {
            url: key.url,
            method: key.method,
            vary: vary_values(request, response),
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            response_type: response.response_type,
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response from the stored snapshot.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = Response::new(status, self.body.clone()).with_type(self.response_type);
        response.status_text = self.status_text.clone();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                response.headers.append(name, value);
            }
        }
        if let Ok(url) = Url::parse(&self.url) {
            response = response.with_url(url);
        }
        response
    }

    fn matches_vary(&self, request: &Request) -> bool {
        self.vary.iter().all(|(name, stored)| {
            if name == "*" {
                return false;
            }
            let current = request.headers.get(name.as_str()).and_then(|v| v.to_str().ok());
            current == stored.as_deref()
        })
    }
}

fn vary_values(request: &Request, response: &Response) -> Vec<(String, Option<String>)> {
    response
        .headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .map(|name| {
            let value = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            (name, value)
        })
        .collect()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Header values are written as plain strings; values that are not
/// UTF-8 are written as `{"base64": ...}`.
mod header_values {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S: Serializer>(
        headers: &[(String, Vec<u8>)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let stored: Vec<(&str, Stored)> = headers
            .iter()
            .map(|(name, value)| {
                let value = match std::str::from_utf8(value) {
                    Ok(text) => Stored::Text(text.to_string()),
                    Err(_) => Stored::Binary {
                        base64: STANDARD.encode(value),
                    },
                };
                (name.as_str(), value)
            })
            .collect();
        stored.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, Vec<u8>)>, D::Error> {
        Vec::<(String, Stored)>::deserialize(deserializer)?
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Stored::Text(text) => text.into_bytes(),
                    Stored::Binary { base64 } => {
                        STANDARD.decode(base64).map_err(serde::de::Error::custom)?
                    }
                };
                Ok((name, value))
            })
            .collect()
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

/// A cache instance.
///
/// Each key holds one entry per `Vary` variant.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<RequestKey, Vec<CacheEntry>>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET and HEAD requests can match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET && request.method != Method::HEAD {
            return None;
        }
        self.entries
            .get(&RequestKey::new(&Method::GET, &request.url))?
            .iter()
            .find(|entry| entry.matches_vary(request))
    }

    /// Store a response, replacing the entries `request` would match.
    pub fn put(&mut self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        if !request.is_network_scheme() {
            return Err(ServiceWorkerError::CacheError(format!(
                "unsupported scheme: {}",
                request.url.scheme()
            )));
        }
        let entry = CacheEntry::capture(request, response);
        if let Some(variants) = self.entries.get_mut(&entry.key()) {
            variants.retain(|existing| !existing.matches_vary(request));
        }
        self.insert(entry);
        Ok(())
    }

    /// Add an entry, replacing any variant with the same `Vary` values.
    fn insert(&mut self, entry: CacheEntry) {
        let variants = self.entries.entry(entry.key()).or_default();
        variants.retain(|existing| existing.vary != entry.vary);
        variants.push(entry);
    }

    /// Delete the entries `request` would match.
    pub fn delete(&mut self, request: &Request) -> bool {
        let key = RequestKey::for_request(request);
        let Some(variants) = self.entries.get_mut(&key) else {
            return false;
        };
        let before = variants.len();
        variants.retain(|entry| !entry.matches_vary(request));
        let removed = variants.len() < before;
        if variants.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Get all keys, one per stored entry.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries
            .iter()
            .flat_map(|(key, variants)| std::iter::repeat(key).take(variants.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn all_entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values().flatten()
    }
}

// ==================== Cache Storage ====================

/// Cache storage (caches global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    /// Creation order; aggregate lookups search in this order.
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedCaches {
        Arc::new(RwLock::new(self))
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = %name, "Creating cache");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Match across all caches; the first match wins.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(request))
    }

    /// Serializable copy of every cache.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            caches: self
                .order
                .iter()
                .filter_map(|name| self.caches.get(name))
                .map(|cache| CacheSnapshotEntry {
                    name: cache.name.clone(),
                    entries: cache.all_entries().cloned().collect(),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: CacheSnapshot) -> Self {
        let mut storage = Self::new();
        for stored in snapshot.caches {
            let cache = storage.open(&stored.name);
            for entry in stored.entries {
                cache.insert(entry);
            }
        }
        storage
    }

    /// Write the snapshot as JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| ExpenseFlowError::cache_with_source("failed to encode cache snapshot", e))?;
        tokio::fs::write(path, json)
            .await
            .map_err(ExpenseFlowError::from)?;
        info!(path = %path.display(), caches = self.order.len(), "Cache snapshot saved");
        Ok(())
    }

    /// Load a snapshot; a missing file yields empty storage.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(ExpenseFlowError::from(e).into()),
        };
        let snapshot: CacheSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            ExpenseFlowError::cache_with_source(format!("corrupt cache snapshot {}", path.display()), e)
        })?;
        Ok(Self::from_snapshot(snapshot))
    }
}

/// On-disk form of [`CacheStorage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub caches: Vec<CacheSnapshotEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshotEntry {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}

// ==================== Bulk add ====================

/// Fetch every request and store all responses, or store nothing.
///
/// The named cache is opened before any fetch starts, so it exists even
/// when the bulk add fails.
pub async fn add_all(
    caches: &SharedCaches,
    cache_name: &str,
    fetcher: &dyn Fetcher,
    requests: &[Request],
) -> Result<usize> {
    caches.write().await.open(cache_name);

    let responses = futures::future::try_join_all(requests.iter().map(|request| async move {
        let response = fetcher.fetch(request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::CacheError(format!(
                "{} responded {}",
                request.url, response.status
            )));
        }
        Ok(response)
    }))
    .await?;

    let mut storage = caches.write().await;
    let cache = storage.open(cache_name);
    for (request, response) in requests.iter().zip(&responses) {
        cache.put(request, response)?;
    }
    debug!(cache = %cache_name, count = responses.len(), "Bulk add stored");
    Ok(responses.len())
}
