//! Content formats and extension-based dispatch.
//!
//! A [`ContentFormat`] turns fetched bytes into [`DecodedContent`]. The
//! [`FormatDispatcher`] holds formats in registration order and picks the
//! first one that claims a key.
//!
//! # Built-in formats
//!
//! - [`B3dmFormat`]: `.b3dm` batched 3D model containers
//! - [`TilesetFormat`]: `.json` tileset manifests
//! - [`GlbFormat`]: `.glb` bare binary glTF models

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tilestream_decode::{
    B3dm, DecodeError, DecodeOptions, PayloadKind, ValidationOptions, decode_b3dm, validate,
};

use crate::error::{Error, Result};
use crate::key::ResourceKey;

/// Decoded content held by the cache and handed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedContent {
    /// A batched 3D model container.
    Tile(B3dm),
    /// A parsed tileset manifest.
    Tileset(Value),
    /// A bare binary glTF model.
    Model(Bytes),
}

impl DecodedContent {
    /// Short name of the content kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedContent::Tile(_) => "tile",
            DecodedContent::Tileset(_) => "tileset",
            DecodedContent::Model(_) => "model",
        }
    }

    #[must_use]
    pub fn as_tile(&self) -> Option<&B3dm> {
        match self {
            DecodedContent::Tile(b3dm) => Some(b3dm),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tileset(&self) -> Option<&Value> {
        match self {
            DecodedContent::Tileset(value) => Some(value),
            _ => None,
        }
    }
}

/// Decoder for one kind of resource.
///
/// `load` is synchronous and may be expensive; the loader runs it on a
/// blocking worker.
pub trait ContentFormat: Send + Sync {
    /// Name reported by [`FormatDispatcher::supported_formats`].
    fn name(&self) -> &'static str;

    /// Whether this format handles `key`.
    fn supports(&self, key: &ResourceKey) -> bool;

    /// Decode fetched bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid for this format.
    fn load(&self, key: &ResourceKey, bytes: Bytes) -> Result<DecodedContent>;
}

/// Decodes `.b3dm` containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct B3dmFormat {
    decode: DecodeOptions,
    /// Reject containers whose validation report has errors.
    strict: bool,
}

impl B3dmFormat {
    #[must_use]
    pub fn new(decode: DecodeOptions) -> Self {
        Self {
            decode,
            strict: decode.strict,
        }
    }
}

impl ContentFormat for B3dmFormat {
    fn name(&self) -> &'static str {
        "b3dm"
    }

    fn supports(&self, key: &ResourceKey) -> bool {
        key.has_extension("b3dm")
    }

    fn load(&self, key: &ResourceKey, bytes: Bytes) -> Result<DecodedContent> {
        let b3dm = decode_b3dm(&bytes, &self.decode)?;

        if self.strict {
            let report = validate(
                &b3dm,
                &ValidationOptions {
                    strict: true,
                    ..ValidationOptions::default()
                },
            );
            if report.has_errors() {
                return Err(Error::Validation {
                    key: key.to_string(),
                    findings: report.errors().map(|f| f.message.clone()).collect(),
                });
            }
        }

        Ok(DecodedContent::Tile(b3dm))
    }
}

/// Parses `.json` tileset manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TilesetFormat;

impl ContentFormat for TilesetFormat {
    fn name(&self) -> &'static str {
        "tileset"
    }

    fn supports(&self, key: &ResourceKey) -> bool {
        key.has_extension("json")
    }

    fn load(&self, _key: &ResourceKey, bytes: Bytes) -> Result<DecodedContent> {
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| DecodeError::Format {
            context: "tileset",
            detail: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(DecodeError::Format {
                context: "tileset",
                detail: "top level is not an object".to_string(),
            }
            .into());
        }
        Ok(DecodedContent::Tileset(value))
    }
}

/// Passes `.glb` models through after checking their magic.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlbFormat;

impl ContentFormat for GlbFormat {
    fn name(&self) -> &'static str {
        "glb"
    }

    fn supports(&self, key: &ResourceKey) -> bool {
        key.has_extension("glb")
    }

    fn load(&self, _key: &ResourceKey, bytes: Bytes) -> Result<DecodedContent> {
        if PayloadKind::sniff(&bytes) != PayloadKind::BinaryGltf {
            return Err(DecodeError::Format {
                context: "glb",
                detail: "missing glTF magic".to_string(),
            }
            .into());
        }
        Ok(DecodedContent::Model(bytes))
    }
}

/// Ordered registry of content formats.
#[derive(Clone, Default)]
pub struct FormatDispatcher {
    formats: Vec<Arc<dyn ContentFormat>>,
}

impl FormatDispatcher {
    /// Create a dispatcher with no formats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dispatcher with the built-in formats, in the order
    /// b3dm, tileset, glb.
    #[must_use]
    pub fn with_builtin(decode: DecodeOptions) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(B3dmFormat::new(decode));
        dispatcher.register(TilesetFormat);
        dispatcher.register(GlbFormat);
        dispatcher
    }

    /// Append a format. Earlier formats win when several support a key.
    pub fn register(&mut self, format: impl ContentFormat + 'static) -> &mut Self {
        self.formats.push(Arc::new(format));
        self
    }

    /// Find the first format that supports `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dispatch`] if no format supports the key.
    pub fn dispatch(&self, key: &ResourceKey) -> Result<Arc<dyn ContentFormat>> {
        self.formats
            .iter()
            .find(|format| format.supports(key))
            .cloned()
            .ok_or_else(|| Error::Dispatch {
                key: key.to_string(),
            })
    }

    /// Names of the registered formats, in dispatch order.
    #[must_use]
    pub fn supported_formats(&self) -> Vec<&'static str> {
        self.formats.iter().map(|format| format.name()).collect()
    }
}

impl fmt::Debug for FormatDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatDispatcher")
            .field("formats", &self.supported_formats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tilestream_decode::ContainerEncoder;

    const GLB: &[u8] = b"glTF\x02\x00\x00\x00";

    struct Everything;

    impl ContentFormat for Everything {
        fn name(&self) -> &'static str {
            "everything"
        }

        fn supports(&self, _key: &ResourceKey) -> bool {
            true
        }

        fn load(&self, _key: &ResourceKey, bytes: Bytes) -> Result<DecodedContent> {
            Ok(DecodedContent::Model(bytes))
        }
    }

    #[test]
    fn test_dispatch_by_extension() {
        let dispatcher = FormatDispatcher::with_builtin(DecodeOptions::default());

        let name = |key: &str| dispatcher.dispatch(&ResourceKey::new(key)).unwrap().name();
        assert_eq!(name("tiles/0.b3dm"), "b3dm");
        assert_eq!(name("https://host/tileset.JSON?v=1"), "tileset");
        assert_eq!(name("model.glb"), "glb");
        assert!(matches!(
            dispatcher.dispatch(&ResourceKey::new("tiles/0.pnts")),
            Err(Error::Dispatch { .. })
        ));
        assert_eq!(dispatcher.supported_formats(), ["b3dm", "tileset", "glb"]);
    }

    #[test]
    fn test_first_registered_wins() {
        let mut dispatcher = FormatDispatcher::new();
        dispatcher.register(Everything).register(GlbFormat);

        let format = dispatcher.dispatch(&ResourceKey::new("a.glb")).unwrap();
        assert_eq!(format.name(), "everything");
    }

    #[test]
    fn test_b3dm_load() {
        let data = ContainerEncoder::new(GLB.to_vec())
            .feature_json(json!({ "BATCH_LENGTH": 3 }))
            .encode()
            .unwrap();
        let key = ResourceKey::new("a.b3dm");

        let content = B3dmFormat::default()
            .load(&key, Bytes::from(data))
            .unwrap();
        assert_eq!(content.as_tile().unwrap().batch_length(), 3);
    }

    #[test]
    fn test_strict_b3dm_rejects_validation_errors() {
        let data = ContainerEncoder::new(GLB.to_vec())
            .feature_json(json!({ "BATCH_LENGTH": 3 }))
            .batch_json(json!({ "id": [1] }))
            .encode()
            .unwrap();
        let key = ResourceKey::new("a.b3dm");

        let lenient = B3dmFormat::default().load(&key, Bytes::from(data.clone()));
        assert!(lenient.is_ok());

        let strict = B3dmFormat::new(DecodeOptions {
            strict: true,
            ..DecodeOptions::default()
        })
        .load(&key, Bytes::from(data));
        assert!(matches!(strict, Err(Error::Validation { .. })));
    }

    #[test]
    fn test_tileset_and_glb_load() {
        let key = ResourceKey::new("tileset.json");
        let content = TilesetFormat
            .load(&key, Bytes::from_static(br#"{"asset":{"version":"1.0"}}"#))
            .unwrap();
        assert_eq!(content.as_tileset().unwrap()["asset"]["version"], "1.0");
        assert!(TilesetFormat.load(&key, Bytes::from_static(b"[1]")).is_err());

        let key = ResourceKey::new("m.glb");
        assert!(GlbFormat.load(&key, Bytes::from_static(GLB)).is_ok());
        assert!(matches!(
            GlbFormat.load(&key, Bytes::from_static(b"nope")),
            Err(Error::Decode(_))
        ));
    }
}
