//! `fetch`: drive the loader against a list of keys.

use std::fmt;

use tilestream::{
    ConsumerId, DecodedContent, Delivery, FileFetcher, HttpFetcher, LoaderConfig, LoaderStats,
    ResourceKey, RoutingFetcher, TileContentLoader, TileRequest,
};
use web_time::Instant;

/// Outcome for one requested key.
#[derive(Debug)]
pub struct Outcome {
    pub key: ResourceKey,
    pub result: Result<String, String>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(summary) => write!(f, "ok     {} ({summary})", self.key),
            Err(error) => write!(f, "failed {} ({error})", self.key),
        }
    }
}

/// Outcomes for every key plus the loader's final state.
#[derive(Debug)]
pub struct Report {
    pub outcomes: Vec<Outcome>,
    pub stats: LoaderStats,
    pub elapsed_ms: u128,
}

fn describe(content: &DecodedContent) -> String {
    match content {
        DecodedContent::Tile(b3dm) => format!(
            "tile, {} instances, {} byte payload, {} warnings",
            b3dm.batch_length(),
            b3dm.payload.len(),
            b3dm.warnings.len()
        ),
        DecodedContent::Tileset(value) => {
            let version = value
                .pointer("/asset/version")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown");
            format!("tileset, version {version}")
        }
        DecodedContent::Model(bytes) => format!("model, {} bytes", bytes.len()),
    }
}

/// Request every key at once and wait for all deliveries.
///
/// Relative keys are read from `root` when one is given.
///
/// # Errors
///
/// Returns a message if the loader cannot be built or a key is rejected
/// before it is queued.
pub async fn fetch_all(
    keys: &[String],
    config: LoaderConfig,
    root: Option<&std::path::Path>,
) -> Result<Report, String> {
    let file = root.map_or_else(FileFetcher::new, FileFetcher::with_root);
    let loader = TileContentLoader::builder()
        .config(config)
        .fetcher(RoutingFetcher::new(HttpFetcher::new(), file))
        .build()
        .map_err(|e| e.to_string())?;
    let _drivers = loader.spawn_drivers();

    let started = Instant::now();
    let mut pending = Vec::with_capacity(keys.len());
    for (id, raw) in (0u64..).zip(keys) {
        let key = ResourceKey::new(raw);
        let rx = loader
            .request_async(TileRequest::new(key.clone(), ConsumerId(id)))
            .map_err(|e| e.to_string())?;
        pending.push((key, rx));
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    for (key, rx) in pending {
        let result = match rx.await {
            Ok(Delivery::Loaded(content)) => Ok(describe(&content)),
            Ok(Delivery::Failed(error)) => Err(error.to_string()),
            Ok(Delivery::Cancelled) => Err("cancelled".to_string()),
            Err(_) => Err("loader dropped the request".to_string()),
        };
        tracing::debug!(key = %key, ok = result.is_ok(), "delivered");
        outcomes.push(Outcome { key, result });
    }

    Ok(Report {
        outcomes,
        stats: loader.stats(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tilestream_decode::ContainerEncoder;

    #[tokio::test]
    async fn test_fetch_local_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path();
        let tile = ContainerEncoder::new(b"glTF\x02\x00\x00\x00".to_vec())
            .feature_json(json!({ "BATCH_LENGTH": 5 }))
            .encode()
            .unwrap();
        std::fs::write(dir.join("0.b3dm"), tile).unwrap();
        std::fs::write(dir.join("tileset.json"), br#"{"asset":{"version":"1.1"}}"#).unwrap();

        let config = LoaderConfig::default()
            .with_fetch_interval(Duration::from_millis(1))
            .with_delivery_interval(Duration::from_millis(1));
        let keys = ["tileset.json", "0.b3dm?v=3", "missing.b3dm"].map(String::from);
        let report = fetch_all(&keys, config, Some(dir)).await.unwrap();

        let lines: Vec<String> = report.outcomes.iter().map(ToString::to_string).collect();
        assert!(lines[0].contains("version 1.1"), "{lines:?}");
        assert!(lines[1].starts_with("ok     0.b3dm"), "{lines:?}");
        assert!(lines[1].contains("5 instances"), "{lines:?}");
        assert!(lines[2].starts_with("failed missing.b3dm"), "{lines:?}");
        assert_eq!(report.stats.cache_size, 2);
    }

    #[tokio::test]
    async fn test_unsupported_key_is_rejected() {
        let keys = ["points.pnts".to_string()];
        assert!(fetch_all(&keys, LoaderConfig::default(), None).await.is_err());
    }
}
