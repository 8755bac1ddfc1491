//! Shared types passed between consumers and the loader.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::format::DecodedContent;
use crate::key::ResourceKey;

/// Identifies one consumer of the loader.
///
/// A consumer may wait on many keys at once but only once per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ConsumerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The outcome handed to a consumer callback, exactly once per registration.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// The content was loaded (or already cached).
    Loaded(Arc<DecodedContent>),
    /// Fetching or decoding failed. Every waiter receives the same error.
    Failed(Arc<Error>),
    /// The registration was withdrawn before content arrived.
    Cancelled,
}

impl Delivery {
    #[must_use]
    pub fn content(&self) -> Option<&Arc<DecodedContent>> {
        match self {
            Delivery::Loaded(content) => Some(content),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Delivery::Loaded(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Delivery::Cancelled)
    }
}

/// Consumer callback invoked with the [`Delivery`] for one key.
pub type Callback = Box<dyn FnOnce(Delivery) + Send>;

/// Distance-like ranking; smaller values are scheduled sooner.
pub type PriorityFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Keys that should be loaded together with a task's key.
pub type SiblingsFn = Arc<dyn Fn() -> Vec<ResourceKey> + Send + Sync>;

/// A [`SiblingsFn`] with no siblings.
#[must_use]
pub fn no_siblings() -> SiblingsFn {
    Arc::new(Vec::new)
}

/// Snapshot of loader state, returned by
/// [`TileContentLoader::stats`](crate::TileContentLoader::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Decoded entries held by the cache.
    pub cache_size: usize,
    /// Fetch tasks waiting for a slot.
    pub pending_fetches: usize,
    /// Fetches currently running.
    pub in_flight_fetches: usize,
    /// Delivery tasks waiting for the next delivery tick.
    pub pending_deliveries: usize,
    /// Keys with at least one registered consumer.
    pub registered_keys: usize,
    /// Registered format names, in dispatch order.
    pub supported_formats: Vec<&'static str>,
}
