//! Post-decode validation.
//!
//! Decoding only rejects containers that cannot be read at all. This pass
//! looks at a successfully decoded container and classifies anything
//! suspicious as a warning or an error. In strict mode every warning is
//! reported as an error.

use std::fmt;

use serde_json::Value;

use crate::b3dm::{B3dm, PayloadKind};
use crate::error::{DecodeError, DecodeWarning};
use crate::header::HEADER_LENGTH;
use crate::table::{MetadataTable, Property};

/// Batch table keys that never describe per-instance values.
const RESERVED_KEYS: [&str; 2] = ["extensions", "extras"];

/// Thresholds used by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationOptions {
    /// Promote every warning to an error.
    pub strict: bool,
    /// A table JSON segment larger than this is reported.
    pub large_table_bytes: usize,
    /// A JSON segment more than this many times its binary segment is reported.
    pub json_heavy_ratio: f64,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            strict: false,
            large_table_bytes: 1024 * 1024,
            json_heavy_ratio: 4.0,
        }
    }
}

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{label}: {}", self.message)
    }
}

/// All findings for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

struct Collector {
    strict: bool,
    findings: Vec<Finding>,
}

impl Collector {
    fn warn(&mut self, message: String) {
        let severity = if self.strict {
            Severity::Error
        } else {
            Severity::Warning
        };
        self.findings.push(Finding { severity, message });
    }

    fn error(&mut self, message: String) {
        self.findings.push(Finding {
            severity: Severity::Error,
            message,
        });
    }
}

/// Validate a decoded container.
#[must_use]
pub fn validate(b3dm: &B3dm, options: &ValidationOptions) -> ValidationReport {
    let mut out = Collector {
        strict: options.strict,
        findings: Vec::new(),
    };

    for warning in &b3dm.warnings {
        match warning {
            DecodeWarning::SkippedProperty {
                error: DecodeError::BinaryBounds { .. },
                ..
            }
            | DecodeWarning::MissingBatchLength => out.error(warning.to_string()),
            // Reported below from the sniffed kind.
            DecodeWarning::UnknownPayload { .. } => {}
            other => out.warn(other.to_string()),
        }
    }

    check_table("feature table", &b3dm.feature_table.table, options, &mut out);
    check_table("batch table", &b3dm.batch_table, options, &mut out);
    check_batch_counts(b3dm, &mut out);

    let header = &b3dm.header;
    let segments = [
        ("feature table JSON", header.feature_table_json_length),
        ("feature table binary", header.feature_table_binary_length),
        ("batch table JSON", header.batch_table_json_length),
        ("batch table binary", header.batch_table_binary_length),
    ];
    let mut offset = HEADER_LENGTH;
    for (name, length) in segments {
        offset += length as usize;
        if length > 0 && offset % 8 != 0 {
            out.warn(format!("{name} ends at unaligned offset {offset}"));
        }
    }

    if b3dm.batch_table.binary.len() > b3dm.payload.len() {
        out.warn(format!(
            "batch table binary ({} bytes) is larger than the payload ({} bytes)",
            b3dm.batch_table.binary.len(),
            b3dm.payload.len()
        ));
    }

    if b3dm.payload_kind == PayloadKind::Unknown {
        out.warn("payload is neither binary nor JSON glTF".to_string());
    }

    ValidationReport {
        findings: out.findings,
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_table(
    name: &str,
    table: &MetadataTable,
    options: &ValidationOptions,
    out: &mut Collector,
) {
    let json_length = table.json_byte_length;
    let binary_length = table.binary.len();

    if json_length > options.large_table_bytes {
        out.warn(format!("{name} JSON is large ({json_length} bytes)"));
    }

    if binary_length > 0 && json_length as f64 > binary_length as f64 * options.json_heavy_ratio {
        out.warn(format!(
            "{name} is JSON-heavy ({json_length} bytes of JSON for {binary_length} bytes of binary)"
        ));
    }

    if binary_length > 0 && table.binary_properties().next().is_none() {
        out.warn(format!(
            "{name} has {binary_length} bytes of binary that no property references"
        ));
    }
}

fn check_batch_counts(b3dm: &B3dm, out: &mut Collector) {
    let batch_length = b3dm.batch_length();

    for (name, property) in &b3dm.batch_table.properties {
        if RESERVED_KEYS.contains(&name.as_str()) {
            continue;
        }
        let count = match property {
            Property::Binary(binary) => binary.count,
            Property::Literal(Value::Array(items)) => items.len(),
            Property::Literal(_) => {
                out.warn(format!(
                    "batch table property {name} is neither an array nor a binary reference"
                ));
                continue;
            }
        };
        if count != batch_length {
            out.error(format!(
                "batch table property {name} has {count} values but BATCH_LENGTH is {batch_length}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::b3dm::{DecodeOptions, decode_b3dm};
    use crate::encode::ContainerEncoder;
    use serde_json::json;

    const GLB: &[u8] = b"glTF\x02\x00\x00\x00";

    fn decode(encoder: ContainerEncoder) -> B3dm {
        let data = encoder.encode().unwrap();
        decode_b3dm(
            &data,
            &DecodeOptions {
                require_batch_length: false,
                ..DecodeOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_clean_container() {
        let b3dm = decode(
            ContainerEncoder::new(GLB.to_vec())
                .feature_json(json!({ "BATCH_LENGTH": 2 }))
                .batch_json(json!({ "id": [1, 2] })),
        );
        let report = validate(&b3dm, &ValidationOptions::default());
        assert!(report.is_clean(), "{:?}", report.findings);
    }

    #[test]
    fn test_missing_batch_length_is_error() {
        let b3dm = decode(ContainerEncoder::new(GLB.to_vec()));
        let report = validate(&b3dm, &ValidationOptions::default());
        assert!(report.has_errors());
    }

    #[test]
    fn test_count_mismatch_is_error() {
        let b3dm = decode(
            ContainerEncoder::new(GLB.to_vec())
                .feature_json(json!({ "BATCH_LENGTH": 3 }))
                .batch_json(json!({ "id": [1, 2], "extras": { "note": "x" } })),
        );
        let report = validate(&b3dm, &ValidationOptions::default());
        let errors: Vec<_> = report.errors().collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("id"));
    }

    #[test]
    fn test_overrun_is_error_and_schema_problem_is_warning() {
        let b3dm = decode(
            ContainerEncoder::new(GLB.to_vec())
                .feature_json(json!({
                    "BATCH_LENGTH": 0,
                    "big": { "byteOffset": 0, "componentType": "DOUBLE", "type": "VEC4" },
                    "odd": { "byteOffset": 0, "componentType": "NOPE", "type": "SCALAR" },
                }))
                .feature_binary(vec![0; 8]),
        );
        let report = validate(&b3dm, &ValidationOptions::default());
        assert!(report.errors().any(|f| f.message.contains("big")));
        assert!(report.warnings().any(|f| f.message.contains("odd")));
    }

    #[test]
    fn test_json_heavy_and_large_tables_warn() {
        let b3dm = decode(
            ContainerEncoder::new(GLB.to_vec())
                .feature_json(json!({
                    "BATCH_LENGTH": 0,
                    "description": "a long descriptive string that dwarfs the binary segment",
                    "v": { "byteOffset": 0, "componentType": "BYTE", "type": "SCALAR" },
                }))
                .feature_binary(vec![1]),
        );
        let options = ValidationOptions {
            large_table_bytes: 16,
            ..ValidationOptions::default()
        };
        let report = validate(&b3dm, &options);
        assert!(!report.has_errors());
        assert!(report.warnings().any(|f| f.message.contains("JSON-heavy")));
        assert!(report.warnings().any(|f| f.message.contains("large")));
    }

    #[test]
    fn test_strict_promotes_warnings() {
        let b3dm = decode(
            ContainerEncoder::new(b"\x00\x01\x02\x03".to_vec())
                .feature_json(json!({ "BATCH_LENGTH": 0 })),
        );

        let lenient = validate(&b3dm, &ValidationOptions::default());
        assert!(!lenient.has_errors());
        assert_eq!(lenient.warnings().count(), 1);

        let strict = validate(
            &b3dm,
            &ValidationOptions {
                strict: true,
                ..ValidationOptions::default()
            },
        );
        assert!(strict.has_errors());
        assert_eq!(strict.warnings().count(), 0);
    }

    #[test]
    fn test_unreferenced_binary_warns() {
        let b3dm = decode(
            ContainerEncoder::new(GLB.to_vec())
                .feature_json(json!({ "BATCH_LENGTH": 0 }))
                .batch_json(json!({}))
                .batch_binary(vec![0; 8]),
        );
        let report = validate(&b3dm, &ValidationOptions::default());
        assert!(
            report
                .warnings()
                .any(|f| f.message.contains("no property references"))
        );
    }
}
