//! Deduplicating, priority-scheduled loading of streamed 3D tile content.
//!
//! This crate turns many overlapping requests for tile content into a
//! minimal set of fetches, decodes the results off the async runtime,
//! caches them under a bounded budget and delivers them to every waiting
//! consumer, nearest content first.
//!
//! # Design principles
//!
//! - **One fetch per key**: Concurrent requests for the same resource share
//!   a fetch and a cache entry
//! - **Always answered**: Every registration receives exactly one
//!   [`Delivery`], whether loaded, failed or cancelled
//! - **Sync decoding**: Decoding is synchronous (`tilestream-decode`) and
//!   runs on a blocking worker
//! - **Injected collaborators**: Fetcher, formats, diagnostics and release
//!   hook are supplied through [`TileContentLoader::builder`]
//!
//! # Example
//!
//! ```ignore
//! use tilestream::{ConsumerId, LoaderConfig, TileContentLoader, TileRequest};
//!
//! let loader = TileContentLoader::new(LoaderConfig::default())?;
//! let _drivers = loader.spawn_drivers();
//!
//! let delivery = loader
//!     .request_async(TileRequest::new("https://example.com/tiles/0.b3dm", ConsumerId(1)))?
//!     .await?;
//! ```

pub mod cache;
mod config;
mod diagnostics;
mod driver;
mod error;
pub mod fetch;
pub mod format;
mod key;
mod loader;
pub mod registry;
pub mod scheduler;
mod types;

pub use cache::ContentCache;
pub use config::LoaderConfig;
pub use diagnostics::{DiagnosticsSink, NoDiagnostics, TracingDiagnostics};
pub use driver::DriverHandle;
pub use error::{Error, Result};
pub use fetch::{Fetcher, FileFetcher, HttpFetcher, MemoryFetcher, RoutingFetcher};
pub use format::{
    B3dmFormat, ContentFormat, DecodedContent, FormatDispatcher, GlbFormat, TilesetFormat,
};
pub use key::ResourceKey;
pub use loader::{LoaderBuilder, TileContentLoader, TileRequest};
pub use registry::RequestRegistry;
pub use scheduler::{Ranking, TaskQueue};
pub use types::{Callback, ConsumerId, Delivery, LoaderStats, PriorityFn, SiblingsFn, no_siblings};

// Re-export decode types for convenience.
pub use tilestream_decode::{B3dm, DecodeError, DecodeWarning};
