//! Memory core: data model, tiered store, scoring, retrieval and compression.

pub mod compression;
pub mod importance;
pub mod metadata;
pub mod retrieval;
pub mod scoring;
pub mod symbols;
pub mod tiered;
pub mod types;
