//! Single-node object store: flat, name-keyed blobs stored as files in one
//! directory, with an in-memory metadata index kept in step with the disk.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
