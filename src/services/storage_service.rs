//! src/services/storage_service.rs
//!
//! StorageService — name-addressed object storage over a single flat
//! directory. Object payloads live at `base_path/{name}`; metadata lives in
//! the in-memory [`ObjectIndex`], derived entirely from `stat` calls so a
//! full rescan can always rebuild it.
//!
//! Writes do not publish to the index by themselves. Callers follow the
//! write protocol (`write` then `reindex`), which [`StorageService::upload`]
//! bundles for the HTTP layer.

use crate::{
    models::object::ObjectRecord,
    services::object_index::{ObjectIndex, Upsert},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take},
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object name `{0}` must be a single path segment")]
    InvalidName(String),
    #[error("object `{name}` is not accessible: {reason}")]
    NotAccessible { name: String, reason: String },
    #[error("offset {offset} is out of range for object `{name}` of length {len}")]
    OutOfRange { name: String, offset: u64, len: u64 },
    #[error("transfer of object `{name}` failed: {source}")]
    TransferFailed {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("object `{0}` vanished from storage; stale index entry removed")]
    StaleIndexRemoved(String),
    #[error("failed to scan storage directory {}: {source}", .path.display())]
    DirectoryScanFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("object `{0}` not found")]
    NotIndexed(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Names with this prefix are reserved for readiness scratch files and are
/// never valid object names nor indexed by a rescan.
pub const READYZ_PREFIX: &str = ".readyz-";

fn not_accessible(name: &str, reason: impl ToString) -> StorageError {
    StorageError::NotAccessible {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn transfer_failed(name: &str, source: io::Error) -> StorageError {
    StorageError::TransferFailed {
        name: name.to_string(),
        source,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseMode {
    Shared,
    Exclusive,
}

#[derive(Default, Debug)]
struct Lease {
    readers: usize,
    writer: bool,
}

/// Per-name access leases: any number of readers or a single writer.
///
/// Mirrors a deny-write share mode for readers and a deny-all share mode for
/// writers, enforced in-process since the store is single-node.
#[derive(Default, Debug)]
struct LeaseTable {
    leases: Mutex<HashMap<String, Lease>>,
}

impl LeaseTable {
    fn acquire(self: &Arc<Self>, name: &str, mode: LeaseMode) -> Option<LeaseGuard> {
        let mut leases = self.leases.lock();
        let lease = leases.entry(name.to_string()).or_default();
        match mode {
            LeaseMode::Shared if !lease.writer => lease.readers += 1,
            LeaseMode::Exclusive if !lease.writer && lease.readers == 0 => lease.writer = true,
            _ => return None,
        }
        Some(LeaseGuard {
            table: Arc::clone(self),
            name: name.to_string(),
            mode,
        })
    }

    fn release(&self, name: &str, mode: LeaseMode) {
        let mut leases = self.leases.lock();
        let idle = match leases.get_mut(name) {
            Some(lease) => {
                match mode {
                    LeaseMode::Shared => lease.readers = lease.readers.saturating_sub(1),
                    LeaseMode::Exclusive => lease.writer = false,
                }
                !lease.writer && lease.readers == 0
            }
            None => false,
        };
        if idle {
            leases.remove(name);
        }
    }
}

/// Released on drop, including when a transfer future is cancelled.
#[derive(Debug)]
struct LeaseGuard {
    table: Arc<LeaseTable>,
    name: String,
    mode: LeaseMode,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.table.release(&self.name, self.mode);
    }
}

/// An opened object positioned at the start of the requested window.
///
/// Holds a shared lease for as long as it lives, so writers to the same
/// name are refused until the reader is dropped.
#[derive(Debug)]
pub struct ObjectReader {
    inner: Take<File>,
    len: u64,
    _lease: LeaseGuard,
}

impl ObjectReader {
    /// Number of bytes this reader yields.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// StorageService provides the engine operations:
/// - Index queries (`get_index`, `list_index`)
/// - Whole and ranged reads
/// - Offset writes that never truncate
/// - Index refresh (`reindex`, `index_all`) and removal
///
/// Cloning is cheap; all clones share the same index and lease table.
#[derive(Clone, Debug)]
pub struct StorageService {
    index: Arc<ObjectIndex>,
    leases: Arc<LeaseTable>,

    /// Directory holding one regular file per object.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a service rooted at `base_path` with an empty index.
    ///
    /// No filesystem access happens here; call [`StorageService::index_all`]
    /// to create the root and load existing objects.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            index: Arc::new(ObjectIndex::new()),
            leases: Arc::new(LeaseTable::default()),
            base_path: base_path.into(),
        }
    }

    /// Resolve an object name to its payload path.
    ///
    /// The name must be usable verbatim as one path segment.
    fn object_path(&self, name: &str) -> StorageResult<PathBuf> {
        let single_segment = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.starts_with(READYZ_PREFIX)
            && !name.bytes().any(|b| b == b'/' || b == b'\\' || b == b'\0');
        if !single_segment {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.base_path.join(name))
    }

    /// Scratch path for a readiness check, unique per `token`.
    ///
    /// Lives under the storage root but can never collide with an object.
    pub fn readyz_scratch_path(&self, token: &str) -> PathBuf {
        self.base_path.join(format!("{READYZ_PREFIX}{token}"))
    }

    fn scan_failed(&self, source: io::Error) -> StorageError {
        StorageError::DirectoryScanFailed {
            path: self.base_path.clone(),
            source,
        }
    }

    /// Number of objects currently indexed.
    pub fn indexed_count(&self) -> usize {
        self.index.len()
    }

    /// Rebuild the whole index from the storage root.
    ///
    /// Creates the root if it does not exist yet. Only regular files are
    /// indexed. On failure the previous index is kept as-is.
    pub async fn index_all(&self) -> StorageResult<usize> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|err| self.scan_failed(err))?;

        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|err| self.scan_failed(err))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| self.scan_failed(err))?
        {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // removed between listing and stat
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    records.push(Err(err));
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!("skipping non UTF-8 file name {:?}", entry.file_name());
                continue;
            };
            if name.starts_with(READYZ_PREFIX) {
                continue;
            }
            records.push(ObjectRecord::from_metadata(name, &meta));
        }

        let count = self
            .index
            .rebuild_all(records)
            .map_err(|err| self.scan_failed(err))?;
        info!("indexed {} objects under {}", count, self.base_path.display());
        Ok(count)
    }

    /// Pure index lookup; never touches the filesystem.
    pub fn get_index(&self, name: &str) -> Option<ObjectRecord> {
        self.index.lookup(name)
    }

    /// Records newer than `since` and not newer than `until`, newest first,
    /// capped at `limit`.
    pub fn list_index(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<ObjectRecord> {
        self.index.range(since, until, limit)
    }

    /// Open an object for reading, confined to `[from, to)`.
    ///
    /// `to` defaults to the file length. Bounds are checked against the
    /// length observed after opening. A concurrent writer makes this fail
    /// with `NotAccessible`.
    pub async fn open_reader(
        &self,
        name: &str,
        from: u64,
        to: Option<u64>,
    ) -> StorageResult<ObjectReader> {
        let path = self.object_path(name)?;
        let lease = self
            .leases
            .acquire(name, LeaseMode::Shared)
            .ok_or_else(|| not_accessible(name, "object is being written"))?;

        let mut file = File::open(&path)
            .await
            .map_err(|err| not_accessible(name, err))?;
        let meta = file
            .metadata()
            .await
            .map_err(|err| not_accessible(name, err))?;
        if !meta.is_file() {
            return Err(not_accessible(name, "not a regular file"));
        }
        let len = meta.len();

        let to = to.unwrap_or(len);
        if to > len {
            return Err(StorageError::OutOfRange {
                name: name.to_string(),
                offset: to,
                len,
            });
        }
        if from > to {
            return Err(StorageError::OutOfRange {
                name: name.to_string(),
                offset: from,
                len,
            });
        }
        if from > 0 {
            file.seek(SeekFrom::Start(from))
                .await
                .map_err(|err| transfer_failed(name, err))?;
        }

        Ok(ObjectReader {
            inner: file.take(to - from),
            len: to - from,
            _lease: lease,
        })
    }

    /// Copy the entire object into `dst`. Returns the number of bytes copied.
    pub async fn read<W>(&self, name: &str, dst: &mut W) -> StorageResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.open_reader(name, 0, None).await?;
        copy_out(name, &mut reader, dst).await
    }

    /// Copy bytes `[from, to)` of the object into `dst`.
    ///
    /// The copy stops at `to` even if the file has grown since it was opened.
    pub async fn read_range<W>(
        &self,
        name: &str,
        from: u64,
        to: u64,
        dst: &mut W,
    ) -> StorageResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.open_reader(name, from, Some(to)).await?;
        copy_out(name, &mut reader, dst).await
    }

    /// Write all of `src` into the object starting at `from`.
    ///
    /// The file is created when writing from offset 0 and is never truncated:
    /// existing bytes in the range are overwritten and the file grows if `src`
    /// runs past the current end. Starting beyond the current end is refused.
    /// The index is left untouched; see [`StorageService::reindex`].
    pub async fn write<R>(&self, name: &str, from: u64, src: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.object_path(name)?;
        let _lease = self.acquire(name, LeaseMode::Exclusive)?;
        self.write_leased(name, from, src).await
    }

    fn acquire(&self, name: &str, mode: LeaseMode) -> StorageResult<LeaseGuard> {
        self.leases
            .acquire(name, mode)
            .ok_or_else(|| not_accessible(name, "object is in use"))
    }

    /// Body of [`StorageService::write`]; the caller holds the exclusive lease.
    async fn write_leased<R>(&self, name: &str, from: u64, src: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.object_path(name)?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|err| not_accessible(name, err))?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create(from == 0)
            .open(&path)
            .await
        {
            Ok(file) => file,
            // absent objects have length 0
            Err(err) if err.kind() == ErrorKind::NotFound && from > 0 => {
                return Err(StorageError::OutOfRange {
                    name: name.to_string(),
                    offset: from,
                    len: 0,
                });
            }
            Err(err) => return Err(not_accessible(name, err)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|err| not_accessible(name, err))?
            .len();
        if from > len {
            return Err(StorageError::OutOfRange {
                name: name.to_string(),
                offset: from,
                len,
            });
        }

        file.seek(SeekFrom::Start(from))
            .await
            .map_err(|err| transfer_failed(name, err))?;
        let written = tokio::io::copy(src, &mut file)
            .await
            .map_err(|err| transfer_failed(name, err))?;
        file.flush()
            .await
            .map_err(|err| transfer_failed(name, err))?;
        file.sync_all()
            .await
            .map_err(|err| transfer_failed(name, err))?;

        debug!("wrote {} bytes to {} at offset {}", written, path.display(), from);
        Ok(written)
    }

    /// Re-derive the record for `name` from the filesystem.
    ///
    /// Inserts or updates the record when the file is accessible. When the
    /// file has vanished but the name is still indexed, the entry is dropped
    /// and `StaleIndexRemoved` is reported. Holds a shared lease, so it
    /// cannot interleave with a write or a remove of the same name.
    pub async fn reindex(&self, name: &str) -> StorageResult<ObjectRecord> {
        self.object_path(name)?;
        let _lease = self.acquire(name, LeaseMode::Shared)?;
        self.reindex_leased(name).await
    }

    /// Body of [`StorageService::reindex`]; the caller holds a lease on `name`.
    async fn reindex_leased(&self, name: &str) -> StorageResult<ObjectRecord> {
        let path = self.object_path(name)?;
        let stat = fs::metadata(&path).await.and_then(|meta| {
            if meta.is_file() {
                ObjectRecord::from_metadata(name, &meta)
            } else {
                Err(io::Error::other("not a regular file"))
            }
        });

        match stat {
            Ok(record) => match self.index.upsert(record.clone()) {
                Upsert::Stale => {
                    debug!("kept newer index entry for {}", name);
                    Ok(self.index.lookup(name).unwrap_or(record))
                }
                outcome => {
                    debug!("reindexed {} (size={}, {:?})", name, record.size, outcome);
                    Ok(record)
                }
            },
            Err(err) => {
                if self.index.remove(name).is_some() {
                    warn!("dropping stale index entry for {}: {}", name, err);
                    Err(StorageError::StaleIndexRemoved(name.to_string()))
                } else {
                    Err(not_accessible(name, err))
                }
            }
        }
    }

    /// Write then reindex, publishing whatever state the file ended up in.
    ///
    /// The exclusive lease is held across both steps. The reindex runs even
    /// when the write fails, and still runs (on a spawned task) when this
    /// future is dropped mid-transfer, so a partially written file is never
    /// hidden from the index. A write error takes precedence over the
    /// reindex outcome.
    pub async fn upload<R>(&self, name: &str, from: u64, src: &mut R) -> StorageResult<ObjectRecord>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.object_path(name)?;
        let pending = PendingReindex {
            service: self.clone(),
            name: name.to_string(),
            lease: Some(self.acquire(name, LeaseMode::Exclusive)?),
        };

        let written = self.write_leased(name, from, src).await;
        let indexed = pending.finish().await;
        match (written, indexed) {
            (Err(err), indexed) => {
                if let Err(reindex_err) = indexed {
                    debug!("reindex after failed write of {}: {}", name, reindex_err);
                }
                Err(err)
            }
            (Ok(_), indexed) => indexed,
        }
    }

    /// Remove an object from the index and delete its payload.
    ///
    /// Names that are not indexed are rejected without touching the
    /// filesystem. Takes the exclusive lease, so an object that is being
    /// written, reindexed or read fails with `NotAccessible`. File deletion
    /// is best-effort: failures are logged and the removal still succeeds.
    pub async fn remove(&self, name: &str) -> StorageResult<ObjectRecord> {
        let path = self.object_path(name)?;
        let _lease = self.acquire(name, LeaseMode::Exclusive)?;
        let record = self
            .index
            .remove(name)
            .ok_or_else(|| StorageError::NotIndexed(name.to_string()))?;

        remove_payload(&path).await;
        Ok(record)
    }
}

/// Reindex owed by an upload that holds the exclusive lease.
///
/// If dropped before [`PendingReindex::finish`] completes, the reindex is
/// handed to a spawned task together with the lease.
struct PendingReindex {
    service: StorageService,
    name: String,
    lease: Option<LeaseGuard>,
}

impl PendingReindex {
    async fn finish(mut self) -> StorageResult<ObjectRecord> {
        let result = self.service.reindex_leased(&self.name).await;
        self.lease.take();
        result
    }
}

impl Drop for PendingReindex {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime to reindex {} after cancelled upload", self.name);
            return;
        };
        let service = self.service.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            let _lease = lease;
            match service.reindex_leased(&name).await {
                Ok(record) => debug!(
                    "reindexed {} after cancelled upload (size={})",
                    name, record.size
                ),
                Err(err) => warn!("reindex of {} after cancelled upload failed: {}", name, err),
            }
        });
    }
}

async fn copy_out<W>(name: &str, reader: &mut ObjectReader, dst: &mut W) -> StorageResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy(reader, dst)
        .await
        .map_err(|err| transfer_failed(name, err))
}

async fn remove_payload(path: &Path) {
    match fs::remove_file(path).await {
        Ok(_) => debug!("removed physical file {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("file {} already missing", path.display());
        }
        Err(err) => warn!("failed to remove {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn service() -> (TempDir, StorageService) {
        let dir = TempDir::new().unwrap();
        let service = StorageService::new(dir.path().join("objects"));
        service.index_all().await.unwrap();
        (dir, service)
    }

    async fn read_all(service: &StorageService, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        service.read(name, &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, service) = service().await;
        let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

        let written = service.write("blob.bin", 0, &mut payload.as_slice()).await.unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(read_all(&service, "blob.bin").await, payload);
    }

    #[tokio::test]
    async fn offset_write_overwrites_without_truncating() {
        let (_dir, service) = service().await;
        service.write("a.txt", 0, &mut &b"AAAA"[..]).await.unwrap();
        service.write("a.txt", 2, &mut &b"BB"[..]).await.unwrap();
        assert_eq!(read_all(&service, "a.txt").await, b"AABB");

        service.write("a.txt", 4, &mut &b"CC"[..]).await.unwrap();
        service.write("a.txt", 0, &mut &b"D"[..]).await.unwrap();
        assert_eq!(read_all(&service, "a.txt").await, b"DABBCC");
    }

    #[tokio::test]
    async fn write_past_end_is_out_of_range() {
        let (_dir, service) = service().await;
        service.write("a.txt", 0, &mut &b"AAAA"[..]).await.unwrap();

        let err = service.write("a.txt", 5, &mut &b"B"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 5, len: 4, .. }));
        assert_eq!(read_all(&service, "a.txt").await, b"AAAA");
    }

    #[tokio::test]
    async fn offset_write_to_missing_object_creates_nothing() {
        let (_dir, service) = service().await;
        let err = service.write("ghost", 3, &mut &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 3, len: 0, .. }));
        assert!(!service.base_path.join("ghost").exists());
    }

    #[tokio::test]
    async fn write_does_not_touch_the_index() {
        let (_dir, service) = service().await;
        service.write("a.txt", 0, &mut &b"hello"[..]).await.unwrap();
        assert!(service.get_index("a.txt").is_none());

        let record = service.reindex("a.txt").await.unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(service.get_index("a.txt"), Some(record));
    }

    #[tokio::test]
    async fn reindex_is_idempotent() {
        let (_dir, service) = service().await;
        service.write("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        let first = service.reindex("a.txt").await.unwrap();
        let second = service.reindex("a.txt").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.indexed_count(), 1);
    }

    #[tokio::test]
    async fn reindex_drops_entry_for_vanished_file() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();
        std::fs::remove_file(service.base_path.join("a.txt")).unwrap();

        let err = service.reindex("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::StaleIndexRemoved(ref n) if n == "a.txt"));
        assert!(service.get_index("a.txt").is_none());

        let err = service.reindex("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotAccessible { .. }));
    }

    #[tokio::test]
    async fn upload_publishes_post_write_state() {
        let (_dir, service) = service().await;
        let record = service.upload("a.txt", 0, &mut &b"AAAA"[..]).await.unwrap();
        assert_eq!(record.size, 4);

        let record = service.upload("a.txt", 3, &mut &b"BBB"[..]).await.unwrap();
        assert_eq!(record.size, 6);
        assert_eq!(service.get_index("a.txt").unwrap().size, 6);
    }

    #[tokio::test]
    async fn failed_upload_still_reports_write_error() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"AAAA"[..]).await.unwrap();

        let err = service.upload("a.txt", 9, &mut &b"B"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { .. }));
        assert_eq!(service.get_index("a.txt").unwrap().size, 4);
    }

    #[tokio::test]
    async fn range_read_is_capped_at_upper_bound() {
        let (_dir, service) = service().await;
        service.write("n", 0, &mut &b"0123456789"[..]).await.unwrap();

        let mut out = Vec::new();
        let copied = service.read_range("n", 2, 5, &mut out).await.unwrap();
        assert_eq!(copied, 3);
        assert_eq!(out, b"234");

        let mut out = Vec::new();
        service.read_range("n", 7, 10, &mut out).await.unwrap();
        assert_eq!(out, b"789");

        let mut out = Vec::new();
        let err = service.read_range("n", 0, 11, &mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 11, len: 10, .. }));
        let err = service.read_range("n", 6, 4, &mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { offset: 6, .. }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn read_of_missing_object_is_not_accessible() {
        let (_dir, service) = service().await;
        let mut out = Vec::new();
        let err = service.read("nope", &mut out).await.unwrap_err();
        assert!(matches!(err, StorageError::NotAccessible { .. }));
    }

    #[tokio::test]
    async fn open_reader_blocks_writers_until_dropped() {
        let (_dir, service) = service().await;
        service.write("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        let reader = service.open_reader("a.txt", 0, None).await.unwrap();
        assert_eq!(reader.len(), 5);
        let second = service.open_reader("a.txt", 0, None).await.unwrap();

        let err = service.write("a.txt", 0, &mut &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::NotAccessible { .. }));

        drop(reader);
        drop(second);
        service.write("a.txt", 0, &mut &b"J"[..]).await.unwrap();
        assert_eq!(read_all(&service, "a.txt").await, b"Jello");
    }

    #[test]
    fn lease_table_allows_one_writer_or_many_readers() {
        let table = Arc::new(LeaseTable::default());

        let writer = table.acquire("a", LeaseMode::Exclusive).unwrap();
        assert!(table.acquire("a", LeaseMode::Exclusive).is_none());
        assert!(table.acquire("a", LeaseMode::Shared).is_none());
        let other = table.acquire("b", LeaseMode::Exclusive).unwrap();
        drop(writer);

        let r1 = table.acquire("a", LeaseMode::Shared).unwrap();
        let r2 = table.acquire("a", LeaseMode::Shared).unwrap();
        assert!(table.acquire("a", LeaseMode::Exclusive).is_none());
        drop(r1);
        assert!(table.acquire("a", LeaseMode::Exclusive).is_none());
        drop(r2);
        drop(other);

        assert!(table.leases.lock().is_empty());
        assert!(table.acquire("a", LeaseMode::Exclusive).is_some());
    }

    #[tokio::test]
    async fn remove_waits_for_lease_holders() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        // a reindex in flight holds a shared lease
        let reindexing = service.leases.acquire("a.txt", LeaseMode::Shared).unwrap();
        let err = service.remove("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotAccessible { .. }));
        assert!(service.get_index("a.txt").is_some());
        assert!(service.base_path.join("a.txt").exists());
        drop(reindexing);

        let reader = service.open_reader("a.txt", 0, None).await.unwrap();
        assert!(service.remove("a.txt").await.is_err());
        drop(reader);

        service.remove("a.txt").await.unwrap();
        assert!(service.get_index("a.txt").is_none());
        assert!(!service.base_path.join("a.txt").exists());
    }

    #[tokio::test]
    async fn reindex_refused_while_upload_holds_the_object() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        let writing = service
            .leases
            .acquire("a.txt", LeaseMode::Exclusive)
            .unwrap();
        std::fs::remove_file(service.base_path.join("a.txt")).unwrap();
        let err = service.reindex("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotAccessible { .. }));
        assert!(service.get_index("a.txt").is_some());
        drop(writing);

        let err = service.reindex("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::StaleIndexRemoved(_)));
    }

    #[tokio::test]
    async fn reindex_keeps_newer_indexed_timestamp() {
        let (_dir, service) = service().await;
        let record = service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        let future = record.last_modified_utc + chrono::Duration::days(1);
        service
            .index
            .upsert(ObjectRecord::new("a.txt", future, 5));

        let reindexed = service.reindex("a.txt").await.unwrap();
        assert_eq!(reindexed.last_modified_utc, future);
        assert_eq!(service.get_index("a.txt").unwrap().last_modified_utc, future);
    }

    #[tokio::test]
    async fn rescan_ignores_readiness_scratch_files() {
        let (_dir, service) = service().await;
        std::fs::write(service.readyz_scratch_path("abc"), b"readyz").unwrap();
        std::fs::write(service.base_path.join("real"), b"x").unwrap();

        assert_eq!(service.index_all().await.unwrap(), 1);
        assert!(service.get_index("real").is_some());
        assert!(service.list_index(None, None, 20).iter().all(|r| r.name == "real"));
    }

    #[tokio::test]
    async fn remove_unindexed_name_leaves_filesystem_alone() {
        let (_dir, service) = service().await;
        std::fs::write(service.base_path.join("orphan"), b"data").unwrap();

        let err = service.remove("orphan").await.unwrap_err();
        assert!(matches!(err, StorageError::NotIndexed(_)));
        assert!(service.base_path.join("orphan").exists());
    }

    #[tokio::test]
    async fn remove_succeeds_when_file_already_missing() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();
        std::fs::remove_file(service.base_path.join("a.txt")).unwrap();

        let removed = service.remove("a.txt").await.unwrap();
        assert_eq!(removed.name, "a.txt");
        assert!(service.get_index("a.txt").is_none());
    }

    #[tokio::test]
    async fn remove_deletes_payload() {
        let (_dir, service) = service().await;
        service.upload("a.txt", 0, &mut &b"hello"[..]).await.unwrap();

        service.remove("a.txt").await.unwrap();
        assert!(!service.base_path.join("a.txt").exists());
        assert!(service.list_index(None, None, 20).is_empty());
    }

    #[tokio::test]
    async fn index_all_picks_up_existing_files_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("objects");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("one"), b"1").unwrap();
        std::fs::write(root.join("two"), b"22").unwrap();

        let service = StorageService::new(&root);
        assert_eq!(service.index_all().await.unwrap(), 2);
        assert_eq!(service.get_index("two").unwrap().size, 2);
        assert!(service.get_index("nested").is_none());
        assert_eq!(service.list_index(None, None, 20).len(), 2);
    }

    #[tokio::test]
    async fn failed_scan_keeps_previous_index() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"file").unwrap();

        let service = StorageService::new(&root);
        service
            .index
            .upsert(ObjectRecord::new("kept", Utc::now(), 1));

        let err = service.index_all().await.unwrap_err();
        assert!(matches!(err, StorageError::DirectoryScanFailed { .. }));
        assert!(service.get_index("kept").is_some());
    }

    #[tokio::test]
    async fn names_must_be_single_segments() {
        let (_dir, service) = service().await;
        for name in ["", ".", "..", "a/b", "../escape", "a\\b", ".readyz-1234"] {
            let err = service.write(name, 0, &mut &b"x"[..]).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidName(_)), "{name:?}");
        }
    }

    #[tokio::test]
    async fn listing_is_limited_and_newest_first() {
        let (_dir, service) = service().await;
        for i in 0..5 {
            service
                .upload(&format!("o{i}"), 0, &mut &b"x"[..])
                .await
                .unwrap();
        }
        let listed = service.list_index(None, None, 3);
        assert_eq!(listed.len(), 3);
        assert!(
            listed
                .windows(2)
                .all(|w| w[0].last_modified_utc >= w[1].last_modified_utc)
        );
    }
}
