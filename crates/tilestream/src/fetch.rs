//! Byte sources for the loader.
//!
//! # Implementations
//!
//! - [`HttpFetcher`]: `http://` and `https://` keys via reqwest
//! - [`FileFetcher`]: filesystem paths and `file://` keys (native only)
//! - [`RoutingFetcher`]: picks one of the above per key
//! - [`MemoryFetcher`]: fixed in-memory contents, for tests and tooling

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::key::ResourceKey;

/// Future type for fetch operations.
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes>> + Send + 'a>>;

/// Retrieves the raw bytes for a key.
///
/// Failures are returned as-is; the loader does not retry.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a> {
        (**self).fetch(key)
    }
}

/// Fetches keys over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a default HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher with a custom HTTP client.
    #[must_use]
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let url = key.as_str();
            tracing::debug!(url, "fetching");

            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Fetch {
                    key: url.to_string(),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            response.bytes().await.map_err(|e| Error::Fetch {
                key: url.to_string(),
                message: e.to_string(),
            })
        })
    }
}

/// Reads keys from the local filesystem.
///
/// Relative keys are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    root: Option<std::path::PathBuf>,
}

impl FileFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative keys against `root`.
    #[must_use]
    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path(&self, key: &ResourceKey) -> std::path::PathBuf {
        let raw = key.as_str();
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        match &self.root {
            Some(root) if !raw.starts_with('/') => root.join(raw),
            _ => std::path::PathBuf::from(raw),
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let path = self.path(key);
            tracing::debug!(path = %path.display(), "reading");
            tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|source| Error::Io {
                    path: path.display().to_string(),
                    source,
                })
        })
    }
}

/// Sends remote keys to an [`HttpFetcher`] and everything else to a
/// [`FileFetcher`].
#[derive(Debug, Clone, Default)]
pub struct RoutingFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl RoutingFetcher {
    #[must_use]
    pub fn new(http: HttpFetcher, file: FileFetcher) -> Self {
        Self { http, file }
    }
}

impl Fetcher for RoutingFetcher {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a> {
        if key.is_remote() {
            self.http.fetch(key)
        } else {
            self.file.fetch(key)
        }
    }
}

/// Serves fixed contents from memory and counts fetches per key.
///
/// Keys without contents fail with [`Error::Fetch`].
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    contents: HashMap<ResourceKey, Bytes>,
    fetches: parking_lot::Mutex<HashMap<ResourceKey, usize>>,
    total: AtomicUsize,
}

impl MemoryFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for `key`.
    #[must_use]
    pub fn with(mut self, key: impl Into<ResourceKey>, bytes: impl Into<Bytes>) -> Self {
        self.contents.insert(key.into(), bytes.into());
        self
    }

    /// Number of fetches started for `key`.
    #[must_use]
    pub fn fetch_count(&self, key: &ResourceKey) -> usize {
        self.fetches.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of fetches started for any key.
    #[must_use]
    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch<'a>(&'a self, key: &'a ResourceKey) -> FetchFuture<'a> {
        *self.fetches.lock().entry(key.clone()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        let result = self.contents.get(key).cloned().ok_or_else(|| Error::Fetch {
            key: key.to_string(),
            message: "not found".to_string(),
        });
        Box::pin(async move { result })
    }
}
