//! Represents an object (file) stored directly under the storage root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fs::Metadata, io};

/// Metadata describing a single stored blob.
///
/// The record never carries content bytes. Every field is derived from a
/// `stat` of the backing file, so a lost index can always be rebuilt from
/// the directory contents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    /// Object identifier, also the file name beneath the storage root.
    pub name: String,

    /// Timestamp of the last write to the backing file.
    pub last_modified_utc: DateTime<Utc>,

    /// Length of the backing file in bytes.
    pub size: u64,
}

impl ObjectRecord {
    pub fn new(name: impl Into<String>, last_modified_utc: DateTime<Utc>, size: u64) -> Self {
        Self {
            name: name.into(),
            last_modified_utc,
            size,
        }
    }

    /// Build a record from filesystem metadata of the object's backing file.
    pub fn from_metadata(name: impl Into<String>, meta: &Metadata) -> io::Result<Self> {
        let modified = meta.modified()?;
        Ok(Self::new(name, DateTime::<Utc>::from(modified), meta.len()))
    }
}
