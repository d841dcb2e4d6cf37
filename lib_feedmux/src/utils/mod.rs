//! # Utilities Module
//!
//! Helpers that sit next to the core but are never consulted by it.

#![forbid(unsafe_code)]

/// Per-field type inference over a sample of rows.
pub mod field_types;

pub use field_types::{infer_field_types, FieldType};
