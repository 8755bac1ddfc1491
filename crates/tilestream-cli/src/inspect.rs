//! `inspect`: decode and validate a local container.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use tilestream_decode::{
    B3dm, DecodeOptions, Property, Severity, ValidationOptions, ValidationReport, decode_b3dm,
    validate,
};

/// Machine-readable summary of one container.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub path: String,
    pub version: u32,
    pub byte_length: u32,
    pub batch_length: usize,
    pub rtc_center: Option<[f64; 3]>,
    pub feature_properties: Vec<PropertySummary>,
    pub batch_properties: Vec<PropertySummary>,
    pub payload_kind: String,
    pub payload_length: usize,
    pub findings: Vec<FindingSummary>,
}

#[derive(Debug, Serialize)]
pub struct PropertySummary {
    pub name: String,
    /// `literal` or the binary layout, e.g. `FLOAT VEC3 x4`.
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct FindingSummary {
    pub severity: &'static str,
    pub message: String,
}

impl Summary {
    #[must_use]
    pub fn new(path: &Path, b3dm: &B3dm, report: &ValidationReport) -> Self {
        Self {
            path: path.display().to_string(),
            version: b3dm.header.version,
            byte_length: b3dm.header.byte_length,
            batch_length: b3dm.batch_length(),
            rtc_center: b3dm.rtc_center().map(|c| c.to_array()),
            feature_properties: properties(&b3dm.feature_table.table.properties),
            batch_properties: properties(&b3dm.batch_table.properties),
            payload_kind: format!("{:?}", b3dm.payload_kind),
            payload_length: b3dm.payload.len(),
            findings: report
                .findings
                .iter()
                .map(|f| FindingSummary {
                    severity: match f.severity {
                        Severity::Warning => "warning",
                        Severity::Error => "error",
                    },
                    message: f.message.clone(),
                })
                .collect(),
        }
    }

    /// Render the summary as indented text.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.path);
        let _ = writeln!(out, "  version:        {}", self.version);
        let _ = writeln!(out, "  byte length:    {}", self.byte_length);
        let _ = writeln!(out, "  batch length:   {}", self.batch_length);
        if let Some([x, y, z]) = self.rtc_center {
            let _ = writeln!(out, "  rtc center:     ({x}, {y}, {z})");
        }
        let _ = writeln!(
            out,
            "  payload:        {} ({} bytes)",
            self.payload_kind, self.payload_length
        );

        for (title, props) in [
            ("feature table", &self.feature_properties),
            ("batch table", &self.batch_properties),
        ] {
            if !props.is_empty() {
                let _ = writeln!(out, "  {title}:");
                for prop in props {
                    let _ = writeln!(out, "    {}: {}", prop.name, prop.kind);
                }
            }
        }

        for finding in &self.findings {
            let _ = writeln!(out, "  {}: {}", finding.severity, finding.message);
        }
        out
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == "error")
    }
}

fn properties(props: &std::collections::BTreeMap<String, Property>) -> Vec<PropertySummary> {
    props
        .iter()
        .map(|(name, prop)| PropertySummary {
            name: name.clone(),
            kind: match prop {
                Property::Literal(_) => "literal".to_string(),
                Property::Binary(binary) => format!(
                    "{} {} x{} @{}",
                    binary.layout.component_type,
                    binary.layout.element_type,
                    binary.count,
                    binary.byte_offset
                ),
            },
        })
        .collect()
}

/// Decode and validate the container at `path`.
///
/// # Errors
///
/// Returns a message if the file cannot be read or decoding fails.
pub fn inspect(path: &Path, strict: bool) -> Result<Summary, String> {
    let data = std::fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;

    let b3dm = decode_b3dm(
        &data,
        &DecodeOptions {
            strict,
            require_batch_length: false,
        },
    )
    .map_err(|e| format!("{}: {e}", path.display()))?;

    let report = validate(
        &b3dm,
        &ValidationOptions {
            strict,
            ..ValidationOptions::default()
        },
    );

    Ok(Summary::new(path, &b3dm, &report))
}
