//! Foundation types: errors and identifiers.

pub mod error;
pub mod ids;
