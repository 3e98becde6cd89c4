//! Blob storage facade for detector state
//!
//! State files are named blobs inside a single remote document (a GitHub gist by
//! default). The facade adds the enabled flag, retries, not-found-as-empty and
//! per-document write serialization; dirty-flag discipline stays with callers.

use crate::config::StorageConfig;
use crate::services::retry::{with_retry, RetryConfig, Retryable};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const GITHUB_API: &str = "https://api.github.com";

/// Errors surfaced by blob stores
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not configured")]
    NotConfigured,
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed storage response: {0}")]
    Malformed(String),
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            StorageError::Http(_) => true,
            StorageError::Status { status, .. } => *status == 429 || *status >= 500,
            StorageError::NotConfigured | StorageError::Malformed(_) => false,
        }
    }
}

/// Raw named-blob backend
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the document or the file does not exist
    async fn load(&self, doc_id: &str, name: &str) -> Result<Option<String>, StorageError>;

    /// Create or overwrite
    async fn save(&self, doc_id: &str, name: &str, content: &str) -> Result<(), StorageError>;
}

/// Storage facade shared by every persisting component
pub struct BlobStorage {
    store: Option<Arc<dyn BlobStore>>,
    doc_id: String,
    retry: RetryConfig,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BlobStorage {
    pub fn new(store: Arc<dyn BlobStore>, doc_id: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            store: Some(store),
            doc_id: doc_id.into(),
            retry,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A facade that reports itself disabled; every call returns `NotConfigured`
    pub fn disabled() -> Self {
        Self {
            store: None,
            doc_id: String::new(),
            retry: RetryConfig::default(),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build the gist-backed facade, or a disabled one when no gist id is set
    pub fn from_config(config: &StorageConfig) -> Self {
        if !config.is_enabled() {
            return Self::disabled();
        }
        let store = GistStore::new(config.github_token.clone());
        Self::new(
            Arc::new(store),
            config.gist_id.trim(),
            RetryConfig::with_max_retries(config.max_retries),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some() && !self.doc_id.is_empty()
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Load a named blob from the default document. Missing blobs load as empty content.
    pub async fn load(&self, name: &str) -> Result<String, StorageError> {
        let doc_id = self.doc_id.clone();
        self.load_doc(name, &doc_id).await
    }

    pub async fn load_doc(&self, name: &str, doc_id: &str) -> Result<String, StorageError> {
        let store = self.store()?;
        if doc_id.is_empty() {
            return Err(StorageError::NotConfigured);
        }
        let content = with_retry(&self.retry, &format!("load {}", name), || {
            let store = store.clone();
            async move { store.load(doc_id, name).await }
        })
        .await?;
        if content.is_none() {
            debug!("[Storage] {} not found in {}, starting empty", name, doc_id);
        }
        Ok(content.unwrap_or_default())
    }

    /// Save a named blob to the default document
    pub async fn save(&self, name: &str, content: &str) -> Result<(), StorageError> {
        let doc_id = self.doc_id.clone();
        self.save_doc(name, content, &doc_id).await
    }

    /// Writes to the same document are serialized; different documents proceed in parallel.
    pub async fn save_doc(&self, name: &str, content: &str, doc_id: &str) -> Result<(), StorageError> {
        let store = self.store()?;
        if doc_id.is_empty() {
            return Err(StorageError::NotConfigured);
        }
        let lock = {
            let mut locks = self.doc_locks.lock().await;
            locks
                .entry(doc_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        with_retry(&self.retry, &format!("save {}", name), || {
            let store = store.clone();
            async move { store.save(doc_id, name, content).await }
        })
        .await
    }

    fn store(&self) -> Result<Arc<dyn BlobStore>, StorageError> {
        self.store.clone().ok_or(StorageError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct GistResponse {
    #[serde(default)]
    files: HashMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

/// GitHub gist backend: the gist is the document, its files are the blobs
pub struct GistStore {
    client: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GistStore {
    pub fn new(token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("polymarket-sentinel")
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            token,
            api_base: GITHUB_API.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl BlobStore for GistStore {
    async fn load(&self, doc_id: &str, name: &str) -> Result<Option<String>, StorageError> {
        let url = format!("{}/gists/{}", self.api_base, doc_id);
        let response = self.request(reqwest::Method::GET, &url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status { status, body });
        }

        let gist: GistResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Malformed(e.to_string()))?;

        let Some(file) = gist.files.get(name) else {
            return Ok(None);
        };

        // Large files are truncated in the gist payload and must be fetched raw
        if file.truncated {
            if let Some(raw_url) = &file.raw_url {
                let raw = self.request(reqwest::Method::GET, raw_url).send().await?;
                if !raw.status().is_success() {
                    let status = raw.status().as_u16();
                    let body = raw.text().await.unwrap_or_default();
                    return Err(StorageError::Status { status, body });
                }
                return Ok(Some(raw.text().await?));
            }
        }

        Ok(file.content.clone())
    }

    async fn save(&self, doc_id: &str, name: &str, content: &str) -> Result<(), StorageError> {
        let url = format!("{}/gists/{}", self.api_base, doc_id);
        // Gists delete files written with empty content
        let content = if content.is_empty() { "\n" } else { content };
        let body = json!({ "files": { name: { "content": content } } });

        let response = self
            .request(reqwest::Method::PATCH, &url)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status { status, body });
        }
        Ok(())
    }
}

/// In-process blob store for tests and storage-less runs
#[derive(Default)]
pub struct MemoryStore {
    blobs: std::sync::Mutex<HashMap<(String, String), String>>,
    saves: AtomicU64,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail with a non-retryable error
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, doc_id: &str, name: &str) -> Option<String> {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(&(doc_id.to_string(), name.to_string())).cloned())
    }

    pub fn put(&self, doc_id: &str, name: &str, content: &str) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert((doc_id.to_string(), name.to_string()), content.to_string());
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn load(&self, doc_id: &str, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.get(doc_id, name))
    }

    async fn save(&self, doc_id: &str, name: &str, content: &str) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                status: 400,
                body: "save rejected".to_string(),
            });
        }
        self.put(doc_id, name, content);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_storage() -> (Arc<MemoryStore>, BlobStorage) {
        let store = Arc::new(MemoryStore::new());
        let storage = BlobStorage::new(store.clone(), "doc1", RetryConfig::with_max_retries(0));
        (store, storage)
    }

    #[tokio::test]
    async fn test_missing_blob_loads_empty() {
        let (_, storage) = memory_storage();
        assert_eq!(storage.load("nothing.json").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let (store, storage) = memory_storage();
        storage.save("state.json", "{\"a\":1}").await.unwrap();
        assert_eq!(storage.load("state.json").await.unwrap(), "{\"a\":1}");
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_storage_refuses_work() {
        let storage = BlobStorage::disabled();
        assert!(!storage.is_enabled());
        assert!(matches!(storage.load("x").await, Err(StorageError::NotConfigured)));
        assert!(matches!(storage.save("x", "y").await, Err(StorageError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_concurrent_saves_to_distinct_names() {
        let (store, storage) = memory_storage();
        let storage = Arc::new(storage);
        let mut handles = Vec::new();
        for i in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.save(&format!("file{}.txt", i), &format!("content {}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.save_count(), 8);
        assert_eq!(store.get("doc1", "file3.txt").as_deref(), Some("content 3"));
    }

    #[test]
    fn test_status_errors_retry_only_when_transient() {
        assert!(StorageError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(StorageError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!StorageError::Status { status: 422, body: String::new() }.is_retryable());
        assert!(!StorageError::Malformed("bad".into()).is_retryable());
    }
}
