//! Bounds-checked sequential reading over a byte buffer.

use crate::error::{DecodeError, DecodeResult};

/// A sequential little-endian reader over a borrowed byte slice.
///
/// Every read checks the remaining length first and fails with
/// [`DecodeError::Truncated`] instead of panicking. The cursor only advances
/// when a read succeeds.
#[derive(Debug, Clone)]
pub struct BinaryCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BinaryCursor<'a> {
    /// Create a cursor positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current byte offset from the start of the buffer.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether the cursor has consumed the whole buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `len` bytes as a sub-slice.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if fewer than `len` bytes remain.
    pub fn read_slice(&mut self, len: usize, context: &'static str) -> DecodeResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated {
                context,
                expected: len,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Take every remaining byte.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }

    /// Advance past `len` bytes without reading them.
    pub fn skip(&mut self, len: usize, context: &'static str) -> DecodeResult<()> {
        self.read_slice(len, context).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self, context: &'static str) -> DecodeResult<[u8; N]> {
        let slice = self.read_slice(N, context)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(slice);
        Ok(bytes)
    }

    pub fn read_u8(&mut self, context: &'static str) -> DecodeResult<u8> {
        Ok(self.read_array::<1>(context)?[0])
    }

    pub fn read_i8(&mut self, context: &'static str) -> DecodeResult<i8> {
        Ok(i8::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_u16(&mut self, context: &'static str) -> DecodeResult<u16> {
        Ok(u16::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_i16(&mut self, context: &'static str) -> DecodeResult<i16> {
        Ok(i16::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_u32(&mut self, context: &'static str) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_i32(&mut self, context: &'static str) -> DecodeResult<i32> {
        Ok(i32::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_f32(&mut self, context: &'static str) -> DecodeResult<f32> {
        Ok(f32::from_le_bytes(self.read_array(context)?))
    }

    pub fn read_f64(&mut self, context: &'static str) -> DecodeResult<f64> {
        Ok(f64::from_le_bytes(self.read_array(context)?))
    }

    /// Read a fixed-length byte string and decode it as UTF-8.
    ///
    /// Trailing NUL and space padding is stripped.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if the buffer is too short, or
    /// [`DecodeError::Format`] if the bytes are not valid UTF-8.
    pub fn read_padded_str(&mut self, len: usize, context: &'static str) -> DecodeResult<&'a str> {
        let bytes = self.read_slice(len, context)?;
        let end = bytes
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map_or(0, |i| i + 1);
        std::str::from_utf8(&bytes[..end]).map_err(|e| DecodeError::Format {
            context,
            detail: format!("invalid utf-8: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_width_reads() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xABu8.to_le_bytes());
        data.extend_from_slice(&(-2i16).to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.extend_from_slice(&(-0.25f64).to_le_bytes());

        let mut cursor = BinaryCursor::new(&data);
        assert_eq!(cursor.read_u8("a").unwrap(), 0xAB);
        assert_eq!(cursor.read_i16("b").unwrap(), -2);
        assert_eq!(cursor.read_u32("c").unwrap(), 0xDEAD_BEEF);
        assert!((cursor.read_f32("d").unwrap() - 1.5).abs() < f32::EPSILON);
        assert!((cursor.read_f64("e").unwrap() + 0.25).abs() < f64::EPSILON);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_truncated_read_does_not_advance() {
        let data = [1, 2, 3];
        let mut cursor = BinaryCursor::new(&data);
        cursor.read_u8("first").unwrap();

        let err = cursor.read_u32("word").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                context: "word",
                expected: 4,
                actual: 2,
            }
        );
        assert_eq!(cursor.offset(), 1);
        assert_eq!(cursor.read_u16("half").unwrap(), 0x0302);
    }

    #[test]
    fn test_padded_str_strips_nul_and_space() {
        let data = b"{\"a\":1}  \0\0rest";
        let mut cursor = BinaryCursor::new(data);
        assert_eq!(cursor.read_padded_str(11, "json").unwrap(), "{\"a\":1}");
        assert_eq!(cursor.read_rest(), b"rest");
    }

    #[test]
    fn test_padded_str_all_padding_is_empty() {
        let data = [0u8; 8];
        let mut cursor = BinaryCursor::new(&data);
        assert_eq!(cursor.read_padded_str(8, "json").unwrap(), "");
    }

    #[test]
    fn test_padded_str_rejects_invalid_utf8() {
        let data = [0xFF, 0xFE];
        let mut cursor = BinaryCursor::new(&data);
        assert!(matches!(
            cursor.read_padded_str(2, "json"),
            Err(DecodeError::Format { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_reads_never_exceed_buffer(
            data in proptest::collection::vec(any::<u8>(), 0..64),
            reads in proptest::collection::vec(0usize..16, 0..16),
        ) {
            let mut cursor = BinaryCursor::new(&data);
            for len in reads {
                let before = cursor.offset();
                match cursor.read_slice(len, "prop") {
                    Ok(slice) => prop_assert_eq!(slice.len(), len),
                    Err(_) => prop_assert_eq!(cursor.offset(), before),
                }
                prop_assert!(cursor.offset() <= data.len());
            }
        }
    }
}
