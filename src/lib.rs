//! Durable, high-throughput metrics relay queue.
//!
//! Sits between a metrics-ingestion path and its network senders: samples,
//! exemplars, and metadata are accumulated into batches, serialized by one of
//! two interchangeable binary formats, persisted to a crash-safe FIFO of
//! segment files, and handed to sender workers with explicit per-segment
//! acknowledgment. Runtime statistics fan out through a concurrency-safe hub
//! that keeps producers and consumers decoupled.
//!
//! The building blocks, leaves first:
//!
//! - [`format`] — the V1 (string-keyed) and V2 (dictionary) segment codecs
//!   and the object pool backing decoded records.
//! - [`batch`] — the per-shard accumulator enforcing label invariants.
//! - [`queue`] — the durable segment queue with backpressure and restart
//!   recovery.
//! - [`hub`] / [`stats`] — pub/sub distribution of runtime stats snapshots.

pub mod batch;
pub mod clock;
pub mod error;
pub mod format;
pub mod hub;
mod mmapfile;
pub mod model;
pub mod queue;
pub mod stats;

pub use batch::Accumulator;
pub use clock::{Clock, QuantaClock, SystemClock};
pub use error::{Error, Result};
pub use format::v1::V1Format;
pub use format::v2::V2Format;
pub use format::{Codec, DatumPool, DecodedItem, FormatVersion, ItemKind, PooledItem};
pub use hub::{Release, StatsHub};
pub use model::{
    BucketSpan, Exemplar, Histogram, HistogramCount, Label, MetaMap, MetricMetadata, Sample,
    SerializedSegment,
};
pub use queue::{CancelToken, Delivery, DurableQueue, QueueConfig};
pub use stats::{NetworkStats, ParallelismStats, SerializerStats, SignalStats};
