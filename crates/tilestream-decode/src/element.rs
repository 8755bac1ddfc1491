//! Typed element layout and extraction for binary metadata properties.
//!
//! A binary property is described by a component type (the scalar storage
//! type) and an element type (how many components make one element). The
//! byte size of one element is `component_size * arity`.

use std::fmt;
use std::str::FromStr;

use glam::{DMat2, DMat3, DMat4, DVec2, DVec3, DVec4};

use crate::cursor::BinaryCursor;
use crate::error::{DecodeError, DecodeResult};

/// Scalar storage type of a binary property component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Float,
    Double,
}

impl ComponentType {
    /// Size of one component in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Byte | Self::UnsignedByte => 1,
            Self::Short | Self::UnsignedShort => 2,
            Self::Int | Self::UnsignedInt | Self::Float => 4,
            Self::Double => 8,
        }
    }

    /// Name as written in metadata table JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Byte => "BYTE",
            Self::UnsignedByte => "UNSIGNED_BYTE",
            Self::Short => "SHORT",
            Self::UnsignedShort => "UNSIGNED_SHORT",
            Self::Int => "INT",
            Self::UnsignedInt => "UNSIGNED_INT",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
        }
    }

    /// Read one component as `f64`.
    ///
    /// Every component type converts to `f64` without loss.
    pub fn read(self, cursor: &mut BinaryCursor<'_>) -> DecodeResult<f64> {
        const CONTEXT: &str = "element component";
        Ok(match self {
            Self::Byte => f64::from(cursor.read_i8(CONTEXT)?),
            Self::UnsignedByte => f64::from(cursor.read_u8(CONTEXT)?),
            Self::Short => f64::from(cursor.read_i16(CONTEXT)?),
            Self::UnsignedShort => f64::from(cursor.read_u16(CONTEXT)?),
            Self::Int => f64::from(cursor.read_i32(CONTEXT)?),
            Self::UnsignedInt => f64::from(cursor.read_u32(CONTEXT)?),
            Self::Float => f64::from(cursor.read_f32(CONTEXT)?),
            Self::Double => cursor.read_f64(CONTEXT)?,
        })
    }

    /// Append one component to `out`.
    ///
    /// Values outside the component's range saturate; fractional values are
    /// truncated toward zero for integer components.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn write(self, value: f64, out: &mut Vec<u8>) {
        match self {
            Self::Byte => out.extend_from_slice(&(value as i8).to_le_bytes()),
            Self::UnsignedByte => out.push(value as u8),
            Self::Short => out.extend_from_slice(&(value as i16).to_le_bytes()),
            Self::UnsignedShort => out.extend_from_slice(&(value as u16).to_le_bytes()),
            Self::Int => out.extend_from_slice(&(value as i32).to_le_bytes()),
            Self::UnsignedInt => out.extend_from_slice(&(value as u32).to_le_bytes()),
            Self::Float => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Self::Double => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

impl FromStr for ComponentType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BYTE" => Self::Byte,
            "UNSIGNED_BYTE" => Self::UnsignedByte,
            "SHORT" => Self::Short,
            "UNSIGNED_SHORT" => Self::UnsignedShort,
            "INT" => Self::Int,
            "UNSIGNED_INT" => Self::UnsignedInt,
            "FLOAT" => Self::Float,
            "DOUBLE" => Self::Double,
            other => {
                return Err(DecodeError::schema(
                    "componentType",
                    format!("unknown component type {other:?}"),
                ));
            }
        })
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of one element of a binary property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl ElementType {
    /// Number of components per element.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 | Self::Mat2 => 4,
            Self::Mat3 => 9,
            Self::Mat4 => 16,
        }
    }

    /// Name as written in metadata table JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "SCALAR",
            Self::Vec2 => "VEC2",
            Self::Vec3 => "VEC3",
            Self::Vec4 => "VEC4",
            Self::Mat2 => "MAT2",
            Self::Mat3 => "MAT3",
            Self::Mat4 => "MAT4",
        }
    }
}

impl FromStr for ElementType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SCALAR" => Self::Scalar,
            "VEC2" => Self::Vec2,
            "VEC3" => Self::Vec3,
            "VEC4" => Self::Vec4,
            "MAT2" => Self::Mat2,
            "MAT3" => Self::Mat3,
            "MAT4" => Self::Mat4,
            other => {
                return Err(DecodeError::schema(
                    "type",
                    format!("unknown element type {other:?}"),
                ));
            }
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte layout of one element: a component type repeated `arity` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementLayout {
    pub component_type: ComponentType,
    pub element_type: ElementType,
}

impl ElementLayout {
    #[must_use]
    pub const fn new(component_type: ComponentType, element_type: ElementType) -> Self {
        Self {
            component_type,
            element_type,
        }
    }

    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size(self) -> usize {
        self.component_type.size() * self.element_type.arity()
    }

    /// Read one element from the cursor.
    ///
    /// Matrices are stored column-major, matching glam.
    pub fn read(self, cursor: &mut BinaryCursor<'_>) -> DecodeResult<Element> {
        let mut components = [0.0f64; 16];
        let arity = self.element_type.arity();
        for component in &mut components[..arity] {
            *component = self.component_type.read(cursor)?;
        }
        Ok(Element::from_components(
            self.element_type,
            &components[..arity],
        ))
    }

    /// Append one element to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Schema`] if the element's shape does not match
    /// this layout.
    pub fn write(self, element: &Element, out: &mut Vec<u8>) -> DecodeResult<()> {
        if element.element_type() != self.element_type {
            return Err(DecodeError::schema(
                "type",
                format!(
                    "cannot store {} element as {}",
                    element.element_type(),
                    self.element_type
                ),
            ));
        }
        for value in element.components() {
            self.component_type.write(value, out);
        }
        Ok(())
    }
}

/// One decoded element of a binary property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    Scalar(f64),
    Vec2(DVec2),
    Vec3(DVec3),
    Vec4(DVec4),
    Mat2(DMat2),
    Mat3(DMat3),
    Mat4(DMat4),
}

impl Element {
    /// Build an element from exactly `element_type.arity()` components.
    ///
    /// # Panics
    ///
    /// Panics if `components` is shorter than the element's arity.
    #[must_use]
    pub fn from_components(element_type: ElementType, components: &[f64]) -> Self {
        let c = components;
        match element_type {
            ElementType::Scalar => Self::Scalar(c[0]),
            ElementType::Vec2 => Self::Vec2(DVec2::new(c[0], c[1])),
            ElementType::Vec3 => Self::Vec3(DVec3::new(c[0], c[1], c[2])),
            ElementType::Vec4 => Self::Vec4(DVec4::new(c[0], c[1], c[2], c[3])),
            ElementType::Mat2 => Self::Mat2(DMat2::from_cols_slice(&c[..4])),
            ElementType::Mat3 => Self::Mat3(DMat3::from_cols_slice(&c[..9])),
            ElementType::Mat4 => Self::Mat4(DMat4::from_cols_slice(&c[..16])),
        }
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Scalar(_) => ElementType::Scalar,
            Self::Vec2(_) => ElementType::Vec2,
            Self::Vec3(_) => ElementType::Vec3,
            Self::Vec4(_) => ElementType::Vec4,
            Self::Mat2(_) => ElementType::Mat2,
            Self::Mat3(_) => ElementType::Mat3,
            Self::Mat4(_) => ElementType::Mat4,
        }
    }

    /// The element's components in storage order.
    #[must_use]
    pub fn components(&self) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![*v],
            Self::Vec2(v) => v.to_array().to_vec(),
            Self::Vec3(v) => v.to_array().to_vec(),
            Self::Vec4(v) => v.to_array().to_vec(),
            Self::Mat2(m) => m.to_cols_array().to_vec(),
            Self::Mat3(m) => m.to_cols_array().to_vec(),
            Self::Mat4(m) => m.to_cols_array().to_vec(),
        }
    }

    /// The scalar value, if this is a scalar element.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// The vector value, if this is a VEC3 element.
    #[must_use]
    pub fn as_vec3(&self) -> Option<DVec3> {
        match self {
            Self::Vec3(v) => Some(*v),
            _ => None,
        }
    }
}
