//! Container encoding.
//!
//! Segments are padded the way the 3D Tiles format recommends: each JSON
//! segment with spaces so the following segment starts on an 8-byte
//! boundary, each binary segment with zeros to a multiple of 8 bytes.

use serde_json::Value;

use crate::error::{DecodeError, DecodeResult};
use crate::header::{ContainerHeader, HEADER_LENGTH, MAGIC, VERSION};

/// Builder that writes a batched 3D model container.
#[derive(Debug, Clone)]
pub struct ContainerEncoder {
    version: u32,
    feature_json: Vec<u8>,
    feature_binary: Vec<u8>,
    batch_json: Vec<u8>,
    batch_binary: Vec<u8>,
    payload: Vec<u8>,
}

impl ContainerEncoder {
    /// Start a container around `payload` with empty metadata tables.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            feature_json: Vec::new(),
            feature_binary: Vec::new(),
            batch_json: Vec::new(),
            batch_binary: Vec::new(),
            payload,
        }
    }

    /// Override the header version.
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn feature_json(self, json: Value) -> Self {
        self.feature_json_raw(json.to_string().into_bytes())
    }

    /// Set the feature table JSON bytes verbatim (padding is still added).
    #[must_use]
    pub fn feature_json_raw(mut self, json: Vec<u8>) -> Self {
        self.feature_json = json;
        self
    }

    #[must_use]
    pub fn feature_binary(mut self, binary: Vec<u8>) -> Self {
        self.feature_binary = binary;
        self
    }

    #[must_use]
    pub fn batch_json(self, json: Value) -> Self {
        self.batch_json_raw(json.to_string().into_bytes())
    }

    /// Set the batch table JSON bytes verbatim (padding is still added).
    #[must_use]
    pub fn batch_json_raw(mut self, json: Vec<u8>) -> Self {
        self.batch_json = json;
        self
    }

    #[must_use]
    pub fn batch_binary(mut self, binary: Vec<u8>) -> Self {
        self.batch_binary = binary;
        self
    }

    /// Write the container.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Format`] if the container would exceed the
    /// 4 GiB addressable by the header.
    pub fn encode(&self) -> DecodeResult<Vec<u8>> {
        let mut body = Vec::new();
        let mut lengths = [0u32; 4];

        let segments: [(&[u8], u8); 4] = [
            (&self.feature_json, b' '),
            (&self.feature_binary, 0),
            (&self.batch_json, b' '),
            (&self.batch_binary, 0),
        ];
        for (i, (segment, pad)) in segments.into_iter().enumerate() {
            let start = body.len();
            body.extend_from_slice(segment);
            if !segment.is_empty() {
                let end = (HEADER_LENGTH + body.len()).next_multiple_of(8) - HEADER_LENGTH;
                body.resize(end, pad);
            }
            lengths[i] = to_u32(body.len() - start)?;
        }

        let header = ContainerHeader {
            magic: MAGIC,
            version: self.version,
            byte_length: to_u32(HEADER_LENGTH + body.len() + self.payload.len())?,
            feature_table_json_length: lengths[0],
            feature_table_binary_length: lengths[1],
            batch_table_json_length: lengths[2],
            batch_table_binary_length: lengths[3],
        };

        let mut out = Vec::with_capacity(header.byte_length as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

fn to_u32(len: usize) -> DecodeResult<u32> {
    u32::try_from(len).map_err(|_| DecodeError::Format {
        context: "encode",
        detail: format!("{len} bytes do not fit in a 32-bit length"),
    })
}
