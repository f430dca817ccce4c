//! Scene tree data model and its in-memory index.

pub(crate) mod index;
pub mod node;
