//! Durable segment queue.
//!
//! Persists finalized segments before acknowledging the enqueue, and hands
//! them to consumers in FIFO order with an explicit per-segment
//! acknowledgment. A crash after `enqueue` returns success never loses the
//! segment: the directory is rescanned on open and unacknowledged segments
//! re-enter the queue.
//!
//! # On-disk layout
//!
//! One immutable file per segment in a flat directory:
//!
//! ```text
//! {dir}/
//!   000000000.seg           ← oldest unacknowledged segment
//!   000000001.seg
//!   000000002.seg.tmp       ← in-flight write, discarded on reopen
//!   000000003.seg.corrupt   ← quarantined, never redelivered
//! ```
//!
//! Each file is a 24-byte header (magic, version, meta/raw/compressed
//! lengths, crc32 over everything after the header), a serde_json manifest
//! carrying the segment's meta map and enqueue time, and the
//! zstd-compressed payload. Files are written to the `.tmp` name through a
//! memory mapping, msync'd, and published with an atomic rename.
//!
//! # Backpressure
//!
//! `enqueue` never blocks on a full queue: once the configured count, byte,
//! or age limit on unacknowledged data is reached it fails fast with
//! [`Error::QueueFull`], which upstream producers treat as the signal to
//! slow down or shed load.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, QuantaClock};
use crate::hub::StatsHub;
use crate::mmapfile::{MmapFile, MmapFileMut};
use crate::model::{MetaMap, SerializedSegment};
use crate::stats::SerializerStats;
use crate::{Error, Result};

const SEG_MAGIC: u32 = u32::from_le_bytes(*b"RQSG");
const SEG_VERSION: u32 = 1;
const SEG_HEADER_SIZE: usize = 24;

const SEG_SUFFIX: &str = ".seg";
const TMP_SUFFIX: &str = ".seg.tmp";
const CORRUPT_SUFFIX: &str = ".seg.corrupt";

/// Sidecar data stored alongside the payload in every segment file.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    meta: MetaMap,
    enqueued_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of unacknowledged segments before `enqueue` fails
    /// with `QueueFull`.
    pub max_pending_segments: usize,
    /// Maximum total on-disk bytes of unacknowledged segments.
    pub max_pending_bytes: u64,
    /// `enqueue` fails once the oldest undelivered segment is older than
    /// this. `Duration::ZERO` disables the age limit.
    pub max_segment_age: Duration,
    /// zstd level for segment payloads.
    pub compression_level: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_segments: 1024,
            max_pending_bytes: 1024 * 1024 * 1024,
            max_segment_age: Duration::ZERO,
            compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: u64,
    file_len: u64,
    enqueued_at_ms: i64,
}

struct State {
    pending: VecDeque<Entry>,
    next_id: u64,
    /// Segments handed to a consumer and not yet acknowledged.
    inflight: usize,
    /// On-disk bytes of all unacknowledged segments (pending + inflight).
    unacked_bytes: u64,
    closed: bool,
}

struct Shared {
    dir: PathBuf,
    config: QueueConfig,
    clock: Box<dyn Clock>,
    hub: StatsHub,
    state: Mutex<State>,
    available: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Durable FIFO of serialized segments. Cheap to clone; all clones share the
/// same directory and in-memory index.
#[derive(Clone)]
pub struct DurableQueue {
    shared: Arc<Shared>,
}

impl DurableQueue {
    /// Opens (or creates) a queue directory, resuming any segments that were
    /// enqueued but not acknowledged before the last shutdown.
    ///
    /// Ages are tracked with a TSC-backed clock; enqueue reads it on every
    /// call and wall-clock syscalls would show up at relay throughput.
    pub fn open(dir: impl AsRef<Path>, config: QueueConfig, hub: StatsHub) -> Result<Self> {
        Self::open_with_clock(dir, config, hub, QuantaClock::new())
    }

    pub fn open_with_clock(
        dir: impl AsRef<Path>,
        config: QueueConfig,
        hub: StatsHub,
        clock: impl Clock,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut recovered: Vec<Entry> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(TMP_SUFFIX) {
                // Interrupted write; the enqueue never returned success.
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            let Some(id) = parse_segment_filename(name) else {
                continue;
            };
            let path = entry.path();
            match probe_segment(&path) {
                Ok((manifest, file_len)) => recovered.push(Entry {
                    id,
                    file_len,
                    enqueued_at_ms: manifest.enqueued_at_ms,
                }),
                Err(err) => {
                    warn!("quarantining unreadable segment {}: {err}", path.display());
                    quarantine(&dir, id);
                }
            }
        }
        recovered.sort_unstable_by_key(|e| e.id);

        let next_id = recovered.last().map(|e| e.id + 1).unwrap_or(0);
        let unacked_bytes = recovered.iter().map(|e| e.file_len).sum();
        if !recovered.is_empty() {
            debug!(
                "resuming queue at {} with {} unacknowledged segments",
                dir.display(),
                recovered.len()
            );
        }

        let state = State {
            pending: recovered.into(),
            next_id,
            inflight: 0,
            unacked_bytes,
            closed: false,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                config,
                clock: Box::new(clock),
                hub,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    /// Durably appends one segment and returns its id.
    ///
    /// Only returns `Ok` once the segment is on disk and would survive a
    /// crash. Fails fast with [`Error::QueueFull`] when the unacknowledged
    /// backlog exceeds the configured count, byte, or age limit.
    pub fn enqueue(&self, meta: &MetaMap, payload: &[u8]) -> Result<u64> {
        let shared = &self.shared;
        let now_ms = shared.clock.now_ms();
        let compressed = zstd::bulk::compress(payload, shared.config.compression_level)?;
        let manifest = serde_json::to_vec(&Manifest {
            meta: meta.clone(),
            enqueued_at_ms: now_ms,
        })
        .map_err(|_| Error::Corrupt("segment meta is not JSON-serializable"))?;
        let file_len = (SEG_HEADER_SIZE + manifest.len() + compressed.len()) as u64;

        let id = {
            let mut state = shared.lock_state();
            if state.closed {
                return Err(Error::Cancelled);
            }
            let unacked = state.pending.len() + state.inflight;
            if unacked >= shared.config.max_pending_segments {
                return Err(Error::QueueFull);
            }
            if state.unacked_bytes + file_len > shared.config.max_pending_bytes {
                return Err(Error::QueueFull);
            }
            if !shared.config.max_segment_age.is_zero() {
                let age_limit_ms = shared.config.max_segment_age.as_millis() as i64;
                if let Some(oldest) = state.pending.front() {
                    if now_ms - oldest.enqueued_at_ms > age_limit_ms {
                        return Err(Error::QueueFull);
                    }
                }
            }
            let id = state.next_id;
            state.next_id += 1;
            id
        };

        write_segment(&shared.dir, id, &manifest, &compressed, payload.len() as u32)?;

        {
            let mut state = shared.lock_state();
            let entry = Entry {
                id,
                file_len,
                enqueued_at_ms: now_ms,
            };
            // Concurrent enqueuers publish out of id order occasionally;
            // keep the pending queue sorted so delivery stays FIFO.
            let position = state
                .pending
                .iter()
                .rposition(|e| e.id < id)
                .map(|p| p + 1)
                .unwrap_or(0);
            state.pending.insert(position, entry);
            state.unacked_bytes += file_len;
            shared.available.notify_one();
        }

        shared.hub.send_serializer_stats(&SerializerStats {
            segment_id_written: id,
            uncompressed_bytes_written: payload.len() as u64,
            compressed_bytes_written: file_len,
            ..SerializerStats::default()
        });
        Ok(id)
    }

    /// Removes and returns the next unacknowledged segment, blocking while
    /// the queue is empty.
    ///
    /// Returns [`Error::Cancelled`] promptly when `cancel` fires or the
    /// queue is closed. Segments that fail their integrity checks are
    /// quarantined and skipped; the consumer never sees them.
    pub fn dequeue(&self, cancel: &CancelToken) -> Result<Delivery> {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        loop {
            if cancel.is_cancelled() || state.closed {
                return Err(Error::Cancelled);
            }
            let Some(entry) = state.pending.pop_front() else {
                state = match shared.available.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                continue;
            };
            state.inflight += 1;
            drop(state);

            match read_segment(&shared.dir, entry.id) {
                Ok((manifest, payload, compressed_len)) => {
                    shared.hub.send_serializer_stats(&SerializerStats {
                        segment_id_read: entry.id,
                        uncompressed_bytes_read: payload.len() as u64,
                        compressed_bytes_read: compressed_len,
                        ..SerializerStats::default()
                    });
                    return Ok(Delivery {
                        segment: SerializedSegment {
                            meta: manifest.meta,
                            payload,
                        },
                        entry,
                        shared: Arc::clone(shared),
                        completed: false,
                    });
                }
                Err(err) => {
                    warn!(
                        "quarantining segment {} in {}: {err}",
                        entry.id,
                        shared.dir.display()
                    );
                    quarantine(&shared.dir, entry.id);
                    shared.hub.send_serializer_stats(&SerializerStats {
                        errors: 1,
                        ..SerializerStats::default()
                    });
                    state = shared.lock_state();
                    state.inflight -= 1;
                    state.unacked_bytes = state.unacked_bytes.saturating_sub(entry.file_len);
                }
            }
        }
    }

    /// A token that unblocks `dequeue` calls on this queue when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Closes the queue: wakes all blocked consumers and fails further
    /// operations with [`Error::Cancelled`]. On-disk state is untouched.
    pub fn close(&self) {
        let mut state = self.shared.lock_state();
        state.closed = true;
        self.shared.available.notify_all();
    }

    /// Segments waiting to be dequeued.
    pub fn pending(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Segments dequeued but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.shared.lock_state().inflight
    }
}

/// Cancels blocked [`DurableQueue::dequeue`] calls. Cloneable; any clone
/// cancels for all holders.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        // Take the lock so a consumer between its flag check and wait still
        // observes the wakeup.
        let _state = self.shared.lock_state();
        self.shared.available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One dequeued segment awaiting acknowledgment.
///
/// `ack(true)` deletes the segment from durable storage; `ack(false)`
/// returns it to the front of the queue for redelivery. Dropping an
/// unacknowledged delivery behaves like `ack(false)`, so no code path can
/// silently lose a segment.
pub struct Delivery {
    pub segment: SerializedSegment,
    entry: Entry,
    shared: Arc<Shared>,
    completed: bool,
}

impl Delivery {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn ack(mut self, success: bool) {
        self.complete(success);
    }

    fn complete(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        if success {
            let path = segment_path(&self.shared.dir, self.entry.id);
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("failed to delete acknowledged segment {}: {err}", path.display());
            }
            let mut state = self.shared.lock_state();
            state.inflight -= 1;
            state.unacked_bytes = state.unacked_bytes.saturating_sub(self.entry.file_len);
        } else {
            let mut state = self.shared.lock_state();
            state.inflight -= 1;
            state.pending.push_front(self.entry);
            self.shared.available.notify_one();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.complete(false);
    }
}

fn segment_filename(id: u64) -> String {
    format!("{id:09}{SEG_SUFFIX}")
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_filename(id))
}

fn segment_tmp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:09}{TMP_SUFFIX}"))
}

fn parse_segment_filename(name: &str) -> Option<u64> {
    let base = name.strip_suffix(SEG_SUFFIX)?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

fn quarantine(dir: &Path, id: u64) {
    let from = segment_path(dir, id);
    let to = dir.join(format!("{id:09}{CORRUPT_SUFFIX}"));
    // A missing file needs no quarantine; it is already out of the way.
    let _ = std::fs::rename(from, to);
}

fn write_segment(
    dir: &Path,
    id: u64,
    manifest: &[u8],
    compressed: &[u8],
    raw_len: u32,
) -> Result<()> {
    let total = SEG_HEADER_SIZE + manifest.len() + compressed.len();
    let tmp_path = segment_tmp_path(dir, id);

    let mut crc = crc32fast::Hasher::new();
    crc.update(manifest);
    crc.update(compressed);
    let crc = crc.finalize();

    let mut header = [0u8; SEG_HEADER_SIZE];
    header[0..4].copy_from_slice(&SEG_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&SEG_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(manifest.len() as u32).to_le_bytes());
    header[12..16].copy_from_slice(&raw_len.to_le_bytes());
    header[16..20].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
    header[20..24].copy_from_slice(&crc.to_le_bytes());

    let mut file = MmapFileMut::create(&tmp_path, total)?;
    file.range_mut(0, SEG_HEADER_SIZE)?.copy_from_slice(&header);
    file.range_mut(SEG_HEADER_SIZE, manifest.len())?
        .copy_from_slice(manifest);
    file.range_mut(SEG_HEADER_SIZE + manifest.len(), compressed.len())?
        .copy_from_slice(compressed);
    file.sync()?;
    drop(file);

    std::fs::rename(&tmp_path, segment_path(dir, id))?;
    Ok(())
}

struct SegmentHeader {
    meta_len: usize,
    raw_len: usize,
    compressed_len: usize,
    crc: u32,
}

fn parse_header(buf: &[u8]) -> Result<SegmentHeader> {
    if buf.len() < SEG_HEADER_SIZE {
        return Err(Error::Corrupt("segment shorter than header"));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length"));
    if magic != SEG_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length"));
    if version != SEG_VERSION {
        return Err(Error::UnsupportedFormat(version));
    }
    let meta_len = u32::from_le_bytes(buf[8..12].try_into().expect("slice length")) as usize;
    let raw_len = u32::from_le_bytes(buf[12..16].try_into().expect("slice length")) as usize;
    let compressed_len = u32::from_le_bytes(buf[16..20].try_into().expect("slice length")) as usize;
    let crc = u32::from_le_bytes(buf[20..24].try_into().expect("slice length"));
    let expected = SEG_HEADER_SIZE
        .checked_add(meta_len)
        .and_then(|n| n.checked_add(compressed_len))
        .ok_or(Error::Corrupt("segment length overflow"))?;
    if expected != buf.len() {
        return Err(Error::Corrupt("segment length mismatch"));
    }
    Ok(SegmentHeader {
        meta_len,
        raw_len,
        compressed_len,
        crc,
    })
}

/// Parses header and manifest without decompressing the payload; used when
/// rebuilding the in-memory index on open.
fn probe_segment(path: &Path) -> Result<(Manifest, u64)> {
    let mmap = MmapFile::open(path)?;
    let buf = mmap.as_slice();
    let header = parse_header(buf)?;
    let manifest = parse_manifest(buf, &header)?;
    Ok((manifest, mmap.len() as u64))
}

fn parse_manifest(buf: &[u8], header: &SegmentHeader) -> Result<Manifest> {
    let meta_bytes = &buf[SEG_HEADER_SIZE..SEG_HEADER_SIZE + header.meta_len];
    serde_json::from_slice(meta_bytes).map_err(|_| Error::Corrupt("segment manifest is invalid"))
}

fn read_segment(dir: &Path, id: u64) -> Result<(Manifest, Vec<u8>, u64)> {
    let path = segment_path(dir, id);
    let mmap = MmapFile::open(&path)?;
    let buf = mmap.as_slice();
    let header = parse_header(buf)?;

    let mut crc = crc32fast::Hasher::new();
    crc.update(&buf[SEG_HEADER_SIZE..]);
    if crc.finalize() != header.crc {
        return Err(Error::Corrupt("segment crc mismatch"));
    }

    let manifest = parse_manifest(buf, &header)?;
    let compressed =
        &buf[SEG_HEADER_SIZE + header.meta_len..SEG_HEADER_SIZE + header.meta_len + header.compressed_len];
    let payload = zstd::bulk::decompress(compressed, header.raw_len)
        .map_err(|_| Error::Corrupt("segment payload does not decompress"))?;
    if payload.len() != header.raw_len {
        return Err(Error::Corrupt("decompressed length mismatch"));
    }
    Ok((manifest, payload, mmap.len() as u64))
}
