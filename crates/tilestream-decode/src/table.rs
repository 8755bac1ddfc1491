//! Feature and batch table parsing.
//!
//! Both tables share the same shape: a JSON object followed by a binary
//! segment. Each JSON property is either a literal value or a descriptor
//! pointing into the binary segment:
//!
//! ```json
//! { "byteOffset": 0, "componentType": "FLOAT", "type": "VEC3", "count": 4 }
//! ```

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::cursor::BinaryCursor;
use crate::element::{ComponentType, Element, ElementLayout, ElementType};
use crate::error::{DecodeError, DecodeResult, DecodeWarning};

/// Which of the two metadata tables a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Feature,
    Batch,
}

impl TableKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature table",
            Self::Batch => "batch table",
        }
    }
}

/// A property whose values live in the table's binary segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryProperty {
    /// Offset of the first element from the start of the binary segment.
    pub byte_offset: usize,
    pub layout: ElementLayout,
    /// Number of elements.
    pub count: usize,
}

impl BinaryProperty {
    /// Parse a binary descriptor object.
    ///
    /// `default_component` is used when the descriptor omits
    /// `componentType` (only global semantics such as `BATCH_LENGTH` have
    /// one). `default_count` is used when it omits `count`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Schema`] if a field is missing or malformed.
    pub fn from_json(
        name: &str,
        descriptor: &Map<String, Value>,
        default_component: Option<ComponentType>,
        default_element: Option<ElementType>,
        default_count: usize,
    ) -> DecodeResult<Self> {
        let byte_offset = descriptor
            .get("byteOffset")
            .and_then(Value::as_u64)
            .ok_or_else(|| DecodeError::schema(name, "byteOffset must be a non-negative integer"))?;

        let component_type = match descriptor.get("componentType") {
            Some(Value::String(s)) => s.parse().map_err(|e| rename(e, name))?,
            Some(_) => return Err(DecodeError::schema(name, "componentType must be a string")),
            None => default_component
                .ok_or_else(|| DecodeError::schema(name, "missing componentType"))?,
        };

        // The 3D Tiles schema calls this field `type`; accept the long name too.
        let element_type = match descriptor.get("type").or_else(|| descriptor.get("elementType"))
        {
            Some(Value::String(s)) => s.parse().map_err(|e| rename(e, name))?,
            Some(_) => return Err(DecodeError::schema(name, "type must be a string")),
            None => {
                default_element.ok_or_else(|| DecodeError::schema(name, "missing type"))?
            }
        };

        let count = match descriptor.get("count") {
            Some(v) => to_usize(
                v.as_u64().ok_or_else(|| {
                    DecodeError::schema(name, "count must be a non-negative integer")
                })?,
                name,
            )?,
            None => default_count,
        };

        Ok(Self {
            byte_offset: to_usize(byte_offset, name)?,
            layout: ElementLayout::new(component_type, element_type),
            count,
        })
    }

    /// Size of one element in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.layout.element_size()
    }

    /// One past the last byte covered by all `count` elements.
    #[must_use]
    pub fn end(&self) -> usize {
        self.byte_offset
            .saturating_add(self.count.saturating_mul(self.element_size()))
    }

    /// Check that every element lies inside a binary segment of `len` bytes.
    pub fn check_bounds(&self, name: &str, len: usize) -> DecodeResult<()> {
        let end = self.end();
        if end > len {
            return Err(DecodeError::BinaryBounds {
                property: name.to_string(),
                end,
                len,
            });
        }
        Ok(())
    }

    /// Read element `index` from `binary`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::BinaryBounds`] if `index >= count` or if
    /// `byte_offset + (index + 1) * element_size` exceeds `binary.len()`.
    pub fn element(&self, name: &str, binary: &[u8], index: usize) -> DecodeResult<Element> {
        let size = self.element_size();
        let start = self.byte_offset.saturating_add(index.saturating_mul(size));
        let end = start.saturating_add(size);
        if index >= self.count || end > binary.len() {
            return Err(DecodeError::BinaryBounds {
                property: name.to_string(),
                end,
                len: binary.len(),
            });
        }
        self.layout.read(&mut BinaryCursor::new(&binary[start..end]))
    }

    /// Read all `count` elements from `binary`.
    pub fn elements(&self, name: &str, binary: &[u8]) -> DecodeResult<Vec<Element>> {
        self.check_bounds(name, binary.len())?;
        let mut cursor = BinaryCursor::new(&binary[self.byte_offset..self.end()]);
        (0..self.count).map(|_| self.layout.read(&mut cursor)).collect()
    }
}

/// A single metadata table property.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// A value stored directly in the JSON.
    Literal(Value),
    /// A typed array stored in the binary segment.
    Binary(BinaryProperty),
}

/// A decoded feature or batch table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    /// The table JSON as parsed.
    pub json: Map<String, Value>,
    /// The raw binary segment.
    pub binary: Vec<u8>,
    /// Properties that parsed successfully, by name.
    pub properties: BTreeMap<String, Property>,
    /// Length of the JSON segment on the wire, including padding.
    pub json_byte_length: usize,
}

impl MetadataTable {
    /// Parse the JSON header of a table.
    ///
    /// Trailing NUL and space padding is stripped; an empty segment is `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Schema`] if the JSON is malformed or is not an
    /// object.
    pub fn parse_json(text: &str, kind: TableKind) -> DecodeResult<Map<String, Value>> {
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(DecodeError::schema(
                kind.as_str(),
                format!("expected a JSON object, got {}", json_kind(&other)),
            )),
            Err(e) => Err(DecodeError::schema(kind.as_str(), e.to_string())),
        }
    }

    /// Build a table from parsed JSON and its binary segment.
    ///
    /// Keys listed in `skip` are left out of `properties` (they are global
    /// semantics the caller interprets itself). Properties that fail to
    /// parse or overrun the binary segment are recorded in `warnings` and
    /// skipped; they never fail the whole table.
    pub fn from_parts(
        kind: TableKind,
        json: Map<String, Value>,
        binary: Vec<u8>,
        default_count: usize,
        skip: &[&str],
        warnings: &mut Vec<DecodeWarning>,
    ) -> Self {
        let mut properties = BTreeMap::new();

        for (name, value) in &json {
            if skip.contains(&name.as_str()) {
                continue;
            }
            match Self::parse_property(name, value, binary.len(), default_count) {
                Ok(property) => {
                    properties.insert(name.clone(), property);
                }
                Err(error) => warnings.push(DecodeWarning::SkippedProperty {
                    table: kind,
                    property: name.clone(),
                    error,
                }),
            }
        }

        Self {
            json,
            binary,
            properties,
            json_byte_length: 0,
        }
    }

    fn parse_property(
        name: &str,
        value: &Value,
        binary_len: usize,
        default_count: usize,
    ) -> DecodeResult<Property> {
        match value {
            Value::Object(descriptor) if descriptor.contains_key("byteOffset") => {
                let property =
                    BinaryProperty::from_json(name, descriptor, None, None, default_count)?;
                property.check_bounds(name, binary_len)?;
                Ok(Property::Binary(property))
            }
            other => Ok(Property::Literal(other.clone())),
        }
    }

    /// Whether the table has neither JSON properties nor binary data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.json.is_empty() && self.binary.is_empty()
    }

    /// Look up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Read element `index` of a binary property.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Schema`] if the property does not exist or is
    /// a literal, or [`DecodeError::BinaryBounds`] if the access is out of
    /// range.
    pub fn element(&self, name: &str, index: usize) -> DecodeResult<Element> {
        match self.properties.get(name) {
            Some(Property::Binary(property)) => property.element(name, &self.binary, index),
            Some(Property::Literal(_)) => {
                Err(DecodeError::schema(name, "literal property has no binary elements"))
            }
            None => Err(DecodeError::schema(name, "no such property")),
        }
    }

    /// Iterate over binary properties.
    pub fn binary_properties(&self) -> impl Iterator<Item = (&str, &BinaryProperty)> {
        self.properties.iter().filter_map(|(name, p)| match p {
            Property::Binary(b) => Some((name.as_str(), b)),
            Property::Literal(_) => None,
        })
    }
}

fn rename(error: DecodeError, property: &str) -> DecodeError {
    match error {
        DecodeError::Schema { detail, .. } => DecodeError::schema(property, detail),
        other => other,
    }
}

fn to_usize(value: u64, name: &str) -> DecodeResult<usize> {
    usize::try_from(value).map_err(|_| DecodeError::schema(name, "value exceeds address space"))
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
