//! Batched 3D model container decoding.
//!
//! A container is decoded in a single pass: header, feature table, batch
//! table, then the payload. Header and size problems are fatal; problems
//! with individual metadata properties are recorded as warnings and the
//! property is skipped.

use glam::DVec3;
use serde_json::{Map, Value};

use crate::cursor::BinaryCursor;
use crate::element::{ComponentType, ElementType};
use crate::error::{DecodeError, DecodeResult, DecodeWarning};
use crate::header::{ContainerHeader, HEADER_LENGTH, VERSION};
use crate::table::{BinaryProperty, MetadataTable, TableKind, json_kind};

/// Feature table key holding the number of instances in the payload.
pub const BATCH_LENGTH: &str = "BATCH_LENGTH";

/// Feature table key holding the local origin of the payload geometry.
pub const RTC_CENTER: &str = "RTC_CENTER";

/// Options controlling how forgiving the decoder is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Treat an unsupported version as a fatal error instead of a warning.
    pub strict: bool,
    /// Fail when the feature table has no `BATCH_LENGTH`.
    pub require_batch_length: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            strict: false,
            require_batch_length: true,
        }
    }
}

/// Format of the embedded payload, as sniffed from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Binary glTF (`glTF` magic).
    BinaryGltf,
    /// JSON glTF (first non-whitespace byte is `{`).
    JsonGltf,
    Unknown,
}

impl PayloadKind {
    /// Sniff the payload format.
    #[must_use]
    pub fn sniff(payload: &[u8]) -> Self {
        if payload.starts_with(b"glTF") {
            return Self::BinaryGltf;
        }
        match payload.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Self::JsonGltf,
            _ => Self::Unknown,
        }
    }
}

/// The feature table with its global semantics resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    /// Number of distinct instances (batch ids) in the payload.
    pub batch_length: usize,
    /// Translation to add to payload positions, if any.
    pub rtc_center: Option<DVec3>,
    /// Custom per-resource properties.
    pub table: MetadataTable,
}

/// A decoded batched 3D model container.
#[derive(Debug, Clone, PartialEq)]
pub struct B3dm {
    pub header: ContainerHeader,
    pub feature_table: FeatureTable,
    pub batch_table: MetadataTable,
    /// The embedded payload, copied verbatim.
    pub payload: Vec<u8>,
    pub payload_kind: PayloadKind,
    /// Non-fatal findings, in the order they were encountered.
    pub warnings: Vec<DecodeWarning>,
}

impl B3dm {
    /// Number of instances described by the batch table.
    #[must_use]
    pub fn batch_length(&self) -> usize {
        self.feature_table.batch_length
    }

    /// Local origin of the payload geometry, if any.
    #[must_use]
    pub fn rtc_center(&self) -> Option<DVec3> {
        self.feature_table.rtc_center
    }
}

/// Decode a batched 3D model container.
///
/// # Errors
///
/// - [`DecodeError::Truncated`] if the buffer is shorter than the header or
///   the declared tables.
/// - [`DecodeError::Format`] on bad magic, a mismatched `byteLength`, an
///   empty payload, or (with `options.strict`) an unsupported version.
/// - [`DecodeError::Schema`] if the feature table JSON is not UTF-8, is
///   malformed, or `BATCH_LENGTH` is missing (when required) or invalid.
pub fn decode_b3dm(data: &[u8], options: &DecodeOptions) -> DecodeResult<B3dm> {
    let header = ContainerHeader::parse(data)?;
    let mut warnings = Vec::new();

    if header.version != VERSION {
        if options.strict {
            return Err(DecodeError::Format {
                context: "header",
                detail: format!("unsupported version {}", header.version),
            });
        }
        warnings.push(DecodeWarning::UnsupportedVersion(header.version));
    }

    let mut cursor = BinaryCursor::new(data);
    cursor.skip(HEADER_LENGTH, "header")?;

    let feature_json_length = header.feature_table_json_length as usize;
    let feature_json = read_table_json(&mut cursor, feature_json_length, TableKind::Feature)?;
    let feature_binary = cursor
        .read_slice(
            header.feature_table_binary_length as usize,
            "feature table binary",
        )?
        .to_vec();
    let feature_json = MetadataTable::parse_json(feature_json, TableKind::Feature)?;
    let mut feature_table = decode_feature_table(
        feature_json,
        feature_binary,
        options,
        &mut warnings,
    )?;
    feature_table.table.json_byte_length = feature_json_length;

    let batch_json_length = header.batch_table_json_length as usize;
    let batch_json = match read_table_json(&mut cursor, batch_json_length, TableKind::Batch) {
        Ok(text) => MetadataTable::parse_json(text, TableKind::Batch),
        Err(e @ DecodeError::Schema { .. }) => Err(e),
        Err(e) => return Err(e),
    };
    let batch_json = batch_json.unwrap_or_else(|error| {
        warnings.push(DecodeWarning::InvalidBatchTable(error));
        Map::new()
    });
    let batch_binary = cursor
        .read_slice(
            header.batch_table_binary_length as usize,
            "batch table binary",
        )?
        .to_vec();
    let mut batch_table = MetadataTable::from_parts(
        TableKind::Batch,
        batch_json,
        batch_binary,
        feature_table.batch_length,
        &[],
        &mut warnings,
    );
    batch_table.json_byte_length = batch_json_length;

    let payload = cursor.read_rest().to_vec();
    let payload_kind = PayloadKind::sniff(&payload);
    if payload_kind == PayloadKind::Unknown {
        let mut leading = [0u8; 4];
        let n = payload.len().min(4);
        leading[..n].copy_from_slice(&payload[..n]);
        warnings.push(DecodeWarning::UnknownPayload { leading });
    }

    Ok(B3dm {
        header,
        feature_table,
        batch_table,
        payload,
        payload_kind,
        warnings,
    })
}

fn decode_feature_table(
    json: Map<String, Value>,
    binary: Vec<u8>,
    options: &DecodeOptions,
    warnings: &mut Vec<DecodeWarning>,
) -> DecodeResult<FeatureTable> {
    let batch_length = match json.get(BATCH_LENGTH) {
        Some(value) => parse_batch_length(value, &binary)?,
        None if options.require_batch_length => {
            return Err(DecodeError::schema(
                BATCH_LENGTH,
                "missing required feature table property",
            ));
        }
        None => {
            warnings.push(DecodeWarning::MissingBatchLength);
            0
        }
    };

    let rtc_center = match json.get(RTC_CENTER).map(|v| parse_rtc_center(v, &binary)) {
        Some(Ok(center)) => Some(center),
        Some(Err(error)) => {
            warnings.push(DecodeWarning::InvalidRtcCenter(error));
            None
        }
        None => None,
    };

    let table = MetadataTable::from_parts(
        TableKind::Feature,
        json,
        binary,
        1,
        &[BATCH_LENGTH, RTC_CENTER],
        warnings,
    );

    Ok(FeatureTable {
        batch_length,
        rtc_center,
        table,
    })
}

fn parse_batch_length(value: &Value, binary: &[u8]) -> DecodeResult<usize> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(descriptor) if descriptor.contains_key("byteOffset") => {
            let property = BinaryProperty::from_json(
                BATCH_LENGTH,
                descriptor,
                Some(ComponentType::UnsignedInt),
                Some(ElementType::Scalar),
                1,
            )?;
            property.element(BATCH_LENGTH, binary, 0)?.as_scalar()
        }
        other => {
            return Err(DecodeError::schema(
                BATCH_LENGTH,
                format!("expected a non-negative integer, got {}", json_kind(other)),
            ));
        }
    };

    match number {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX.into() => Ok(n as usize),
        _ => Err(DecodeError::schema(
            BATCH_LENGTH,
            format!("expected a non-negative integer, got {value}"),
        )),
    }
}

fn parse_rtc_center(value: &Value, binary: &[u8]) -> DecodeResult<DVec3> {
    let center = match value {
        Value::Array(items) if items.len() == 3 => {
            let mut xyz = [0.0; 3];
            for (slot, item) in xyz.iter_mut().zip(items) {
                *slot = item
                    .as_f64()
                    .ok_or_else(|| DecodeError::schema(RTC_CENTER, "components must be numbers"))?;
            }
            DVec3::from_array(xyz)
        }
        Value::Array(items) => {
            return Err(DecodeError::schema(
                RTC_CENTER,
                format!("expected 3 components, got {}", items.len()),
            ));
        }
        Value::Object(descriptor) if descriptor.contains_key("byteOffset") => {
            let property = BinaryProperty::from_json(
                RTC_CENTER,
                descriptor,
                Some(ComponentType::Float),
                Some(ElementType::Vec3),
                1,
            )?;
            property
                .element(RTC_CENTER, binary, 0)?
                .as_vec3()
                .ok_or_else(|| DecodeError::schema(RTC_CENTER, "binary value must be a VEC3"))?
        }
        other => {
            return Err(DecodeError::schema(
                RTC_CENTER,
                format!("expected an array of 3 numbers, got {}", json_kind(other)),
            ));
        }
    };

    if !center.is_finite() {
        return Err(DecodeError::schema(RTC_CENTER, "components must be finite"));
    }
    Ok(center)
}

/// Read a table's JSON header.
///
/// Text that is not UTF-8 is a schema problem of that table, not a
/// container format error.
fn read_table_json<'a>(
    cursor: &mut BinaryCursor<'a>,
    len: usize,
    kind: TableKind,
) -> DecodeResult<&'a str> {
    let context = match kind {
        TableKind::Feature => "feature table json",
        TableKind::Batch => "batch table json",
    };
    cursor
        .read_padded_str(len, context)
        .map_err(|error| match error {
            DecodeError::Format { detail, .. } => DecodeError::schema(kind.as_str(), detail),
            other => other,
        })
}
