//! Engine layer: the metadata index and the storage service built on it.

pub mod object_index;
pub mod storage_service;
