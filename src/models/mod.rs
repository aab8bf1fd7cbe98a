//! Core data models for the object store.
//!
//! Records serialize as JSON via `serde` using the wire shape
//! `{ name, lastModifiedUtc, size }`.

pub mod object;
