//! Per-key consumer registrations.
//!
//! The registry only tracks who is waiting on what. It never runs a
//! callback itself while borrowed by the loader: [`RequestRegistry::take`]
//! hands the callbacks out so the caller can invoke them after releasing
//! its lock.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::key::ResourceKey;
use crate::types::{Callback, ConsumerId, Delivery};

struct Registration {
    consumer: ConsumerId,
    callback: Callback,
    cancel: Option<CancellationToken>,
}

/// Result of a successful [`RequestRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    /// The key was already cached when the consumer registered.
    pub already_cached: bool,
    /// No other consumer was waiting on the key.
    pub is_first_consumer: bool,
}

/// Consumers waiting on each key, in registration order.
#[derive(Default)]
pub struct RequestRegistry {
    keys: HashMap<ResourceKey, Vec<Registration>>,
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` as waiting on `key`.
    ///
    /// `already_cached` is the result of the caller's cache lookup, made
    /// under the same lock as this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if `consumer` is already
    /// waiting on `key`. The new callback is dropped without being called.
    pub fn register(
        &mut self,
        key: &ResourceKey,
        consumer: ConsumerId,
        callback: Callback,
        cancel: Option<CancellationToken>,
        already_cached: bool,
    ) -> Result<Registered> {
        let registrations = self.keys.entry(key.clone()).or_default();
        if registrations.iter().any(|r| r.consumer == consumer) {
            return Err(Error::DuplicateRegistration {
                key: key.to_string(),
                consumer,
            });
        }

        let is_first_consumer = registrations.is_empty();
        registrations.push(Registration {
            consumer,
            callback,
            cancel,
        });

        Ok(Registered {
            already_cached,
            is_first_consumer,
        })
    }

    /// Remove one consumer's registration and return its callback.
    pub fn unregister(&mut self, key: &ResourceKey, consumer: ConsumerId) -> Option<Callback> {
        let registrations = self.keys.get_mut(key)?;
        let position = registrations.iter().position(|r| r.consumer == consumer)?;
        let registration = registrations.remove(position);
        if registrations.is_empty() {
            self.keys.remove(key);
        }
        Some(registration.callback)
    }

    /// Remove every registration for `key`, returning the callbacks in
    /// registration order.
    pub fn take(&mut self, key: &ResourceKey) -> Vec<Callback> {
        self.keys
            .remove(key)
            .map(|registrations| registrations.into_iter().map(|r| r.callback).collect())
            .unwrap_or_default()
    }

    /// Invoke every callback registered for `key` once and clear them.
    pub fn deliver_and_clear(&mut self, key: &ResourceKey, delivery: &Delivery) {
        deliver(self.take(key), delivery);
    }

    /// Unregister every consumer whose cancel token has fired.
    ///
    /// Returns the removed callbacks with their keys.
    pub fn sweep_cancelled(&mut self) -> Vec<(ResourceKey, Callback)> {
        let mut cancelled = Vec::new();

        self.keys.retain(|key, registrations| {
            let mut kept = Vec::with_capacity(registrations.len());
            for registration in registrations.drain(..) {
                if registration
                    .cancel
                    .as_ref()
                    .is_some_and(CancellationToken::is_cancelled)
                {
                    cancelled.push((key.clone(), registration.callback));
                } else {
                    kept.push(registration);
                }
            }
            *registrations = kept;
            !registrations.is_empty()
        });

        cancelled
    }

    /// Whether any consumer is waiting on `key`.
    #[must_use]
    pub fn is_live(&self, key: &ResourceKey) -> bool {
        self.keys.contains_key(key)
    }

    #[must_use]
    pub fn consumer_count(&self, key: &ResourceKey) -> usize {
        self.keys.get(key).map_or(0, Vec::len)
    }

    /// Keys with at least one registration, in no particular order.
    pub fn registered_keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.keys()
    }
}

/// Invoke each callback with its own copy of `delivery`.
pub fn deliver(callbacks: Vec<Callback>, delivery: &Delivery) {
    for callback in callbacks {
        callback(delivery.clone());
    }
}
