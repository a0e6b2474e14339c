//! Adapters between the pipeline and external file formats.

pub mod csv;
pub mod json;
