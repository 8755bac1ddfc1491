//! Reporting of load outcomes.
//!
//! The loader never logs failures on its own behalf; it reports them to a
//! [`DiagnosticsSink`]. [`TracingDiagnostics`] is the default sink.

use crate::error::Error;
use crate::format::DecodedContent;
use crate::key::ResourceKey;

/// Receives load outcomes. All methods default to doing nothing.
///
/// Methods may be called from any thread, but never while the loader's
/// lock is held.
pub trait DiagnosticsSink: Send + Sync {
    /// Content for `key` was decoded and cached.
    fn loaded(&self, key: &ResourceKey, content: &DecodedContent) {
        let _ = (key, content);
    }

    /// Fetching or decoding `key` failed.
    fn failed(&self, key: &ResourceKey, error: &Error) {
        let _ = (key, error);
    }

    /// A consumer of `key` was cancelled. `aborted` is true if this also
    /// aborted the fetch.
    fn cancelled(&self, key: &ResourceKey, aborted: bool) {
        let _ = (key, aborted);
    }
}

/// Logs outcomes with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn loaded(&self, key: &ResourceKey, content: &DecodedContent) {
        tracing::debug!(key = %key, kind = content.kind(), "loaded");
        if let DecodedContent::Tile(b3dm) = content {
            for warning in &b3dm.warnings {
                tracing::warn!(key = %key, "{warning}");
            }
        }
    }

    fn failed(&self, key: &ResourceKey, error: &Error) {
        tracing::warn!(key = %key, "load failed: {error}");
    }

    fn cancelled(&self, key: &ResourceKey, aborted: bool) {
        tracing::debug!(key = %key, aborted, "cancelled");
    }
}

/// Discards every outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl DiagnosticsSink for NoDiagnostics {}
