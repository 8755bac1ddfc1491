//! Fixed 28-byte container header.

use crate::cursor::BinaryCursor;
use crate::error::{DecodeError, DecodeResult};

/// Magic bytes at the start of every batched 3D model container.
pub const MAGIC: [u8; 4] = *b"b3dm";

/// The only container version this crate understands.
pub const VERSION: u32 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_LENGTH: usize = 28;

/// Parsed container header.
///
/// Lengths are stored as read from the wire; [`ContainerHeader::parse`]
/// checks them against the actual buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub byte_length: u32,
    pub feature_table_json_length: u32,
    pub feature_table_binary_length: u32,
    pub batch_table_json_length: u32,
    pub batch_table_binary_length: u32,
}

impl ContainerHeader {
    /// Read the header fields without checking them.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if fewer than 28 bytes remain.
    pub fn read(cursor: &mut BinaryCursor<'_>) -> DecodeResult<Self> {
        if cursor.remaining() < HEADER_LENGTH {
            return Err(DecodeError::Truncated {
                context: "header",
                expected: HEADER_LENGTH,
                actual: cursor.remaining(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(cursor.read_slice(4, "magic")?);

        Ok(Self {
            magic,
            version: cursor.read_u32("version")?,
            byte_length: cursor.read_u32("byteLength")?,
            feature_table_json_length: cursor.read_u32("featureTableJSONByteLength")?,
            feature_table_binary_length: cursor.read_u32("featureTableBinaryByteLength")?,
            batch_table_json_length: cursor.read_u32("batchTableJSONByteLength")?,
            batch_table_binary_length: cursor.read_u32("batchTableBinaryByteLength")?,
        })
    }

    /// Read and check the header against a buffer of `actual_length` bytes.
    ///
    /// The version is not checked here; the decoder decides whether a
    /// mismatch is fatal.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::Truncated`] if the buffer is shorter than the header
    ///   or the declared tables do not fit.
    /// - [`DecodeError::Format`] on bad magic, a `byteLength` that differs
    ///   from the buffer length, or an empty payload.
    pub fn parse(data: &[u8]) -> DecodeResult<Self> {
        let header = Self::read(&mut BinaryCursor::new(data))?;

        if header.magic != MAGIC {
            return Err(DecodeError::Format {
                context: "header",
                detail: format!(
                    "expected magic \"b3dm\", got {:?}",
                    String::from_utf8_lossy(&header.magic)
                ),
            });
        }

        if header.byte_length as usize != data.len() {
            return Err(DecodeError::Format {
                context: "header",
                detail: format!(
                    "byteLength is {} but the buffer holds {} bytes",
                    header.byte_length,
                    data.len()
                ),
            });
        }

        let tables_end = header.tables_end();
        if tables_end > data.len() as u64 {
            return Err(DecodeError::Truncated {
                context: "metadata tables",
                expected: usize::try_from(tables_end).unwrap_or(usize::MAX),
                actual: data.len(),
            });
        }

        if header.payload_length() == 0 {
            return Err(DecodeError::Format {
                context: "payload",
                detail: "container has no payload".to_string(),
            });
        }

        Ok(header)
    }

    /// Total length of both metadata tables.
    ///
    /// Summed in `u64`: four `u32` lengths can overflow a 32-bit `usize`.
    #[must_use]
    pub fn tables_length(&self) -> u64 {
        u64::from(self.feature_table_json_length)
            + u64::from(self.feature_table_binary_length)
            + u64::from(self.batch_table_json_length)
            + u64::from(self.batch_table_binary_length)
    }

    /// Offset one past the batch table binary segment.
    #[must_use]
    pub fn tables_end(&self) -> u64 {
        HEADER_LENGTH as u64 + self.tables_length()
    }

    /// Offset of the embedded payload, saturating at `usize::MAX` for a
    /// header that [`ContainerHeader::parse`] would reject.
    #[must_use]
    pub fn payload_offset(&self) -> usize {
        usize::try_from(self.tables_end()).unwrap_or(usize::MAX)
    }

    /// Length of the embedded payload, or zero if the tables overrun it.
    #[must_use]
    pub fn payload_length(&self) -> usize {
        let length = u64::from(self.byte_length).saturating_sub(self.tables_end());
        usize::try_from(length).unwrap_or(usize::MAX)
    }

    /// Serialize the header to its 28-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[..4].copy_from_slice(&self.magic);
        let fields = [
            self.version,
            self.byte_length,
            self.feature_table_json_length,
            self.feature_table_binary_length,
            self.batch_table_json_length,
            self.batch_table_binary_length,
        ];
        for (i, field) in fields.iter().enumerate() {
            let start = 4 + i * 4;
            out[start..start + 4].copy_from_slice(&field.to_le_bytes());
        }
        out
    }
}
