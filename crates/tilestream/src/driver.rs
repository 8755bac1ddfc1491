//! Periodic fetch and delivery drivers.
//!
//! Each driver runs on its own fixed interval and sleeps for whatever is
//! left of the interval after its tick. The delivery driver keeps ticking
//! back-to-back while deliveries remain and its time budget allows.
//!
//! Drivers hold only a weak reference to the loader and stop on their own
//! once every [`TileContentLoader`] clone is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::loader::{Shared, TileContentLoader};

/// Owns the driver tasks. Dropping it stops both drivers.
#[derive(Debug)]
pub struct DriverHandle {
    fetch: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl DriverHandle {
    /// Whether both drivers have stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.fetch.is_finished() && self.delivery.is_finished()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.fetch.abort();
        self.delivery.abort();
    }
}

pub(crate) fn spawn(loader: &TileContentLoader) -> DriverHandle {
    let config = loader.config();
    let fetch_interval = config.fetch_interval();
    let delivery_interval = config.delivery_interval();
    let delivery_budget = config.delivery_budget();

    tracing::info!(
        fetch_interval_ms = config.fetch_interval_ms,
        delivery_interval_ms = config.delivery_interval_ms,
        "starting drivers"
    );

    DriverHandle {
        fetch: tokio::spawn(run_fetch_driver(
            Arc::downgrade(&loader.shared),
            fetch_interval,
        )),
        delivery: tokio::spawn(run_delivery_driver(
            Arc::downgrade(&loader.shared),
            delivery_interval,
            delivery_budget,
        )),
    }
}

fn upgrade(shared: &Weak<Shared>) -> Option<TileContentLoader> {
    shared.upgrade().map(|shared| TileContentLoader { shared })
}

async fn run_fetch_driver(shared: Weak<Shared>, interval: Duration) {
    loop {
        let started = Instant::now();
        {
            let Some(loader) = upgrade(&shared) else {
                break;
            };
            loader.tick_fetch();
        }
        tokio::time::sleep(remaining(interval, started)).await;
    }
    tracing::info!("fetch driver stopped");
}

async fn run_delivery_driver(shared: Weak<Shared>, interval: Duration, budget: Duration) {
    loop {
        let started = Instant::now();
        {
            let Some(loader) = upgrade(&shared) else {
                break;
            };
            drain_deliveries(&loader, started, budget);
        }
        tokio::time::sleep(remaining(interval, started)).await;
    }
    tracing::info!("delivery driver stopped");
}

/// Tick deliveries until none are pending or `budget` has passed since
/// `started`. Always ticks at least once. Returns the number of ticks.
fn drain_deliveries(loader: &TileContentLoader, started: Instant, budget: Duration) -> usize {
    let mut ticks = 0;
    loop {
        loader.tick_delivery();
        ticks += 1;
        if !loader.has_pending_deliveries() || started.elapsed() >= budget {
            return ticks;
        }
    }
}

/// What is left of `interval` after a wake-up that began at `started`.
fn remaining(interval: Duration, started: Instant) -> Duration {
    interval.saturating_sub(started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::fetch::MemoryFetcher;
    use crate::loader::TileRequest;
    use crate::types::{ConsumerId, Delivery};
    use bytes::Bytes;
    use serde_json::json;
    use tilestream_decode::ContainerEncoder;
    use tokio::sync::oneshot;

    fn tile() -> Bytes {
        ContainerEncoder::new(b"glTF\x02\x00\x00\x00".to_vec())
            .feature_json(json!({ "BATCH_LENGTH": 1 }))
            .encode()
            .unwrap()
            .into()
    }

    /// A loader with every key cached, each waiting on a delivery tick of
    /// its own. Keys are ranked nearest first in the order given.
    async fn loader_with_pending_deliveries(
        keys: &[&str],
        config: LoaderConfig,
    ) -> (TileContentLoader, Vec<oneshot::Receiver<Delivery>>) {
        let fetcher = keys
            .iter()
            .fold(MemoryFetcher::new(), |fetcher, key| fetcher.with(*key, tile()));
        let loader = TileContentLoader::builder()
            .config(config)
            .fetcher(fetcher)
            .build()
            .unwrap();

        let receivers = (1u32..)
            .zip(keys)
            .map(|(distance, key)| {
                let request = TileRequest::new(*key, ConsumerId(u64::from(distance)))
                    .priority(move || f64::from(distance))
                    .depth(1);
                loader.request_async(request).unwrap()
            })
            .collect();

        for _ in 0..2000 {
            if loader.stats().pending_deliveries == keys.len() {
                return (loader, receivers);
            }
            loader.tick_fetch();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("fetches did not complete");
    }

    #[tokio::test]
    async fn test_drain_ticks_until_nothing_is_pending() {
        let keys = ["a.b3dm", "b.b3dm", "c.b3dm"];
        let (loader, mut receivers) =
            loader_with_pending_deliveries(&keys, LoaderConfig::default()).await;
        tokio::time::pause();

        let ticks = drain_deliveries(&loader, Instant::now(), Duration::from_millis(8));

        assert_eq!(ticks, keys.len());
        for rx in &mut receivers {
            assert!(rx.try_recv().unwrap().is_loaded());
        }
    }

    #[tokio::test]
    async fn test_drain_stops_when_budget_is_spent() {
        let keys = ["a.b3dm", "b.b3dm", "c.b3dm"];
        let (loader, mut receivers) =
            loader_with_pending_deliveries(&keys, LoaderConfig::default()).await;
        tokio::time::pause();

        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(10)).await;

        assert_eq!(drain_deliveries(&loader, started, Duration::from_millis(8)), 1);
        assert_eq!(loader.stats().pending_deliveries, 2);
        assert!(receivers[0].try_recv().unwrap().is_loaded());
        assert!(receivers[1].try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_wakeup_shortens_sleep() {
        let interval = Duration::from_millis(16);
        let started = Instant::now();
        assert_eq!(remaining(interval, started), interval);

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(remaining(interval, started), Duration::from_millis(11));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(remaining(interval, started), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_one_wakeup_delivers_every_pending_key() {
        let hour = Duration::from_secs(3600);
        let keys = ["a.b3dm", "b.b3dm", "c.b3dm", "d.b3dm"];
        let config = LoaderConfig::default()
            .with_fetch_interval(hour)
            .with_delivery_interval(hour);
        let (loader, mut receivers) = loader_with_pending_deliveries(&keys, config).await;
        tokio::time::pause();

        let woke = Instant::now();
        let _drivers = loader.spawn_drivers();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Still inside the first interval, so the driver woke exactly once.
        assert_eq!(woke.elapsed(), Duration::ZERO);
        for rx in &mut receivers {
            assert!(rx.try_recv().unwrap().is_loaded());
        }
        assert_eq!(loader.stats().pending_deliveries, 0);
    }

    #[tokio::test]
    async fn test_drivers_stop_with_loader() {
        let loader = TileContentLoader::builder()
            .config(
                LoaderConfig::default()
                    .with_fetch_interval(Duration::from_millis(1))
                    .with_delivery_interval(Duration::from_millis(1)),
            )
            .fetcher(MemoryFetcher::new())
            .build()
            .unwrap();
        let handle = loader.spawn_drivers();
        drop(loader);

        for _ in 0..1000 {
            if handle.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("drivers kept running after the loader was dropped");
    }
}
