//! Decode batched 3D model (b3dm) tile containers.
//!
//! This crate provides pure synchronous decoding of the binary tile
//! container used by streamed 3D tile sets: a fixed header, a feature table
//! and a batch table (each a JSON object plus a binary segment of typed
//! arrays), and an opaque embedded payload (normally glTF).
//!
//! # Design principles
//!
//! - **Synchronous**: No async, no threading primitives
//! - **User-controlled parallelism**: Callers decide where decoding runs
//! - **Partial metadata is fine**: A bad table property is skipped and
//!   reported as a [`DecodeWarning`]; only header and size problems fail
//!   the whole container
//!
//! # Key functions
//!
//! - [`decode_b3dm`]: Decode a complete container
//! - [`validate`]: Classify findings on a decoded container
//! - [`ContainerEncoder`]: Write a container (fixtures and tooling)
//! - [`BinaryCursor`]: Bounds-checked little-endian reader

mod error;

pub mod b3dm;
pub mod cursor;
pub mod element;
pub mod encode;
pub mod header;
pub mod table;
pub mod validate;

pub use b3dm::{B3dm, DecodeOptions, FeatureTable, PayloadKind, decode_b3dm};
pub use cursor::BinaryCursor;
pub use element::{ComponentType, Element, ElementLayout, ElementType};
pub use encode::ContainerEncoder;
pub use error::{DecodeError, DecodeResult, DecodeWarning};
pub use header::ContainerHeader;
pub use table::{BinaryProperty, MetadataTable, Property, TableKind};
pub use validate::{Finding, Severity, ValidationOptions, ValidationReport, validate};
