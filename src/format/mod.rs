//! Segment formats.
//!
//! A [`Codec`] turns accumulated samples and metadata records into immutable
//! segment buffers and back. Two interchangeable versions exist:
//!
//! - [`v1::V1Format`] — string-keyed reference format. Every record carries
//!   its label names and values in full, fixed-width integers throughout.
//!   Simple and self-describing, at a large byte and allocation cost.
//! - [`v2::V2Format`] — dictionary format. Labels reference a shared string
//!   table by varint index, records are encoded straight into one growable
//!   buffer, timestamps are delta-encoded.
//!
//! Decoded records are checked out of a [`DatumPool`] and handed back when
//! the caller drops (or explicitly releases) the [`PooledItem`] guard.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::model::{Exemplar, Histogram, Label, MetaMap, MetricMetadata, Sample};
use crate::{Error, Result};

pub mod v1;
pub mod v2;
pub(crate) mod wire;

/// Meta key declaring the segment's format version.
pub const META_FORMAT: &str = "format";
/// Meta key carrying the total record count of the segment.
pub const META_RECORD_COUNT: &str = "record_count";
/// Meta key carrying the series record count (V1).
pub const META_SERIES_COUNT: &str = "series_count";
/// Meta key carrying the metadata record count (V1).
pub const META_META_COUNT: &str = "meta_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
}

impl FormatVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            FormatVersion::V1 => "v1",
            FormatVersion::V2 => "v2",
        }
    }

    pub fn number(self) -> u32 {
        match self {
            FormatVersion::V1 => 1,
            FormatVersion::V2 => 2,
        }
    }

    pub(crate) fn magic(self) -> u32 {
        match self {
            FormatVersion::V1 => u32::from_le_bytes(*b"RQV1"),
            FormatVersion::V2 => u32::from_le_bytes(*b"RQV2"),
        }
    }

    fn from_meta(s: &str) -> Option<Self> {
        match s {
            "v1" => Some(FormatVersion::V1),
            "v2" => Some(FormatVersion::V2),
            _ => None,
        }
    }

    fn from_magic(magic: u32) -> Option<Self> {
        [FormatVersion::V1, FormatVersion::V2]
            .into_iter()
            .find(|v| v.magic() == magic)
    }
}

/// Rejects segments whose meta map declares a different format version.
pub(crate) fn check_declared_format(meta: &MetaMap, expect: FormatVersion) -> Result<()> {
    match meta.get(META_FORMAT) {
        None => Ok(()),
        Some(declared) => match FormatVersion::from_meta(declared) {
            Some(version) if version == expect => Ok(()),
            Some(version) => Err(Error::UnsupportedFormat(version.number())),
            None => Err(Error::UnsupportedFormat(0)),
        },
    }
}

/// Rejects segments whose leading magic word belongs to a different version,
/// so a mis-routed buffer fails loudly instead of being misinterpreted.
pub(crate) fn check_magic(cursor: &mut wire::Cursor<'_>, expect: FormatVersion) -> Result<()> {
    let magic = cursor.get_u32()?;
    if magic == expect.magic() {
        return Ok(());
    }
    match FormatVersion::from_magic(magic) {
        Some(other) => Err(Error::UnsupportedFormat(other.number())),
        None => Err(Error::Corrupt("bad segment magic")),
    }
}

/// A borrowed view of one sample as handed from the accumulator to a codec.
///
/// Labels are exposed only through [`SampleRef::labels`], which yields them
/// in sorted, de-duplicated order regardless of the caller's input order.
pub struct SampleRef<'a> {
    pub timestamp_ms: i64,
    pub value: f64,
    labels: &'a [Label],
    order: &'a [u32],
    pub exemplar: Option<&'a Exemplar>,
    pub histogram: Option<&'a Histogram>,
}

impl<'a> SampleRef<'a> {
    pub(crate) fn new(
        timestamp_ms: i64,
        value: f64,
        labels: &'a [Label],
        order: &'a [u32],
        exemplar: Option<&'a Exemplar>,
        histogram: Option<&'a Histogram>,
    ) -> Self {
        Self {
            timestamp_ms,
            value,
            labels,
            order,
            exemplar,
            histogram,
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &'a Label> + '_ {
        self.order.iter().map(move |&i| &self.labels[i as usize])
    }

    pub fn label_count(&self) -> usize {
        self.order.len()
    }
}

/// Encode/decode of one segment format version.
///
/// Append calls accumulate state inside the codec; `finish` drains that state
/// into one or more segment buffers and leaves the codec ready for reuse.
pub trait Codec {
    fn version(&self) -> FormatVersion;

    fn append_sample(&mut self, sample: &SampleRef<'_>) -> Result<()>;

    fn append_metadata(&mut self, metadata: &MetricMetadata) -> Result<()>;

    /// Drains accumulated records into segment buffers, invoking `sink` once
    /// per segment in record order.
    fn finish(&mut self, sink: &mut dyn FnMut(&MetaMap, &[u8]) -> Result<()>) -> Result<()>;

    /// Decodes one segment. Every returned item is checked out of the
    /// codec's [`DatumPool`] and must be released by the caller.
    fn unmarshal(&self, meta: &MetaMap, buf: &[u8]) -> Result<Vec<PooledItem>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Series,
    Metadata,
}

/// A decoded record: either a reconstructed [`Sample`] or a metadata entry.
#[derive(Debug)]
pub struct DecodedItem {
    pub kind: ItemKind,
    pub sample: Sample,
    pub metadata: MetricMetadata,
}

impl DecodedItem {
    pub fn is_metadata(&self) -> bool {
        self.kind == ItemKind::Metadata
    }

    fn clear(&mut self) {
        self.kind = ItemKind::Series;
        self.sample.timestamp_ms = 0;
        self.sample.value = 0.0;
        self.sample.labels.clear();
        self.sample.exemplar = None;
        self.sample.histogram = None;
        self.metadata.family_name.clear();
        self.metadata.unit.clear();
        self.metadata.help.clear();
        self.metadata.kind.clear();
    }
}

impl Default for DecodedItem {
    fn default() -> Self {
        Self {
            kind: ItemKind::Series,
            sample: Sample::default(),
            metadata: MetricMetadata::default(),
        }
    }
}

/// Free-list pool of [`DecodedItem`]s, safe for concurrent checkout and
/// release. Counters expose checkout behavior so pooling effectiveness is
/// observable in tests.
#[derive(Clone, Default)]
pub struct DatumPool {
    shared: Arc<PoolShared>,
}

#[derive(Debug, Default)]
struct PoolShared {
    free: Mutex<Vec<DecodedItem>>,
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl DatumPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> PooledItem {
        let recycled = {
            let mut free = lock_free_list(&self.shared.free);
            free.pop()
        };
        let item = match recycled {
            Some(item) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                DecodedItem::default()
            }
        };
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledItem {
            item: Some(item),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Items currently checked out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Total items ever created because the free list was empty.
    pub fn allocated(&self) -> u64 {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Total checkouts satisfied from the free list.
    pub fn reused(&self) -> u64 {
        self.shared.reused.load(Ordering::Relaxed)
    }

    /// Items sitting idle in the free list.
    pub fn idle(&self) -> usize {
        lock_free_list(&self.shared.free).len()
    }
}

fn lock_free_list(free: &Mutex<Vec<DecodedItem>>) -> std::sync::MutexGuard<'_, Vec<DecodedItem>> {
    match free.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Guard owning one checked-out [`DecodedItem`].
///
/// Dropping the guard returns the item to the pool; [`PooledItem::release`]
/// does the same explicitly. Either way the item is handed back exactly once,
/// on every exit path.
#[derive(Debug)]
pub struct PooledItem {
    item: Option<DecodedItem>,
    shared: Arc<PoolShared>,
}

impl PooledItem {
    /// Returns this item to the pool. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Deref for PooledItem {
    type Target = DecodedItem;

    fn deref(&self) -> &DecodedItem {
        self.item.as_ref().expect("pooled item already released")
    }
}

impl DerefMut for PooledItem {
    fn deref_mut(&mut self) -> &mut DecodedItem {
        self.item.as_mut().expect("pooled item already released")
    }
}

impl Drop for PooledItem {
    fn drop(&mut self) {
        if let Some(mut item) = self.item.take() {
            item.clear();
            lock_free_list(&self.shared.free).push(item);
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_released_items() {
        let pool = DatumPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.outstanding(), 2);

        a.release();
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);

        let _c = pool.get();
        assert_eq!(pool.allocated(), 2, "checkout should reuse a pooled item");
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn released_items_come_back_cleared() {
        let pool = DatumPool::new();
        let mut item = pool.get();
        item.kind = ItemKind::Metadata;
        item.sample.labels.push(Label::new("job", "relay"));
        item.metadata.family_name.push_str("requests_total");
        drop(item);

        let item = pool.get();
        assert_eq!(item.kind, ItemKind::Series);
        assert!(item.sample.labels.is_empty());
        assert!(item.metadata.family_name.is_empty());
    }

    #[test]
    fn cross_version_meta_is_rejected() {
        let mut meta = MetaMap::new();
        meta.insert(META_FORMAT.to_string(), "v2".to_string());
        let err = check_declared_format(&meta, FormatVersion::V1).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(2)));

        meta.insert(META_FORMAT.to_string(), "v9".to_string());
        let err = check_declared_format(&meta, FormatVersion::V1).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(0)));
    }

    #[test]
    fn cross_version_magic_is_rejected() {
        let mut buf = Vec::new();
        wire::put_u32(&mut buf, FormatVersion::V2.magic());
        let mut cursor = wire::Cursor::new(&buf);
        let err = check_magic(&mut cursor, FormatVersion::V1).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(2)));

        let garbage = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut cursor = wire::Cursor::new(&garbage);
        assert!(matches!(
            check_magic(&mut cursor, FormatVersion::V1),
            Err(Error::Corrupt(_))
        ));
    }
}
