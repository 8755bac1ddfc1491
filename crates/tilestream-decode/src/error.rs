//! Error types for decoding operations.

use std::fmt;

use crate::table::TableKind;

/// Errors that can occur while decoding a tile container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bad magic, unsupported version, or inconsistent sizes.
    Format {
        context: &'static str,
        detail: String,
    },
    /// The buffer ended before a declared field was complete.
    Truncated {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A metadata table or one of its properties is malformed or missing.
    Schema { property: String, detail: String },
    /// A binary property access reached past the end of its binary segment.
    BinaryBounds {
        property: String,
        end: usize,
        len: usize,
    },
}

impl DecodeError {
    /// Create a schema error for the given property.
    pub(crate) fn schema(property: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Schema {
            property: property.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format { context, detail } => {
                write!(f, "invalid format in {context}: {detail}")
            }
            Self::Truncated {
                context,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "truncated {context}: expected {expected} bytes, got {actual}"
                )
            }
            Self::Schema { property, detail } => {
                write!(f, "invalid property {property}: {detail}")
            }
            Self::BinaryBounds { property, end, len } => {
                write!(
                    f,
                    "property {property} reads up to byte {end} of a {len}-byte binary segment"
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// A non-fatal finding recorded while decoding.
///
/// Warnings never abort a decode; they are returned alongside the result so
/// the caller can log or escalate them.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeWarning {
    /// A metadata table property failed to parse and was left out.
    SkippedProperty {
        table: TableKind,
        property: String,
        error: DecodeError,
    },
    /// The header declares a version other than 1.
    UnsupportedVersion(u32),
    /// The feature table has no `BATCH_LENGTH`; zero instances were assumed.
    MissingBatchLength,
    /// `RTC_CENTER` was present but malformed and was ignored.
    InvalidRtcCenter(DecodeError),
    /// The batch table JSON could not be parsed and was treated as empty.
    InvalidBatchTable(DecodeError),
    /// The payload is neither binary nor JSON glTF.
    UnknownPayload { leading: [u8; 4] },
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SkippedProperty {
                table,
                property,
                error,
            } => write!(f, "skipped {} property {property}: {error}", table.as_str()),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported container version {version}")
            }
            Self::MissingBatchLength => f.write_str("feature table has no BATCH_LENGTH"),
            Self::InvalidRtcCenter(error) => write!(f, "ignored RTC_CENTER: {error}"),
            Self::InvalidBatchTable(error) => write!(f, "ignored batch table: {error}"),
            Self::UnknownPayload { leading } => {
                write!(f, "unrecognized payload starting with {leading:02x?}")
            }
        }
    }
}

/// Result type for decoding operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
