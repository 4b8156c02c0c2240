use std::collections::HashMap;

/// Per-segment side-channel metadata (format name, record counts, ...).
pub type MetaMap = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One time-series point as accepted by the accumulator and reconstructed by
/// the formats. Values round-trip bit-exact; labels keep their sorted order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
    pub labels: Vec<Label>,
    pub exemplar: Option<Exemplar>,
    pub histogram: Option<Histogram>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Exemplar {
    pub value: f64,
    pub timestamp_ms: Option<i64>,
    pub labels: Vec<Label>,
}

/// Native-histogram payload. Integer histograms carry span deltas, float
/// histograms carry absolute counts; the count fields distinguish the two.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub count: HistogramCount,
    pub sum: f64,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: HistogramCount,
    pub negative_spans: Vec<BucketSpan>,
    pub negative_deltas: Vec<i64>,
    pub negative_counts: Vec<f64>,
    pub positive_spans: Vec<BucketSpan>,
    pub positive_deltas: Vec<i64>,
    pub positive_counts: Vec<f64>,
    pub reset_hint: i32,
    pub timestamp_ms: i64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            count: HistogramCount::Int(0),
            sum: 0.0,
            schema: 0,
            zero_threshold: 0.0,
            zero_count: HistogramCount::Int(0),
            negative_spans: Vec::new(),
            negative_deltas: Vec::new(),
            negative_counts: Vec::new(),
            positive_spans: Vec::new(),
            positive_deltas: Vec::new(),
            positive_counts: Vec::new(),
            reset_hint: 0,
            timestamp_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramCount {
    Int(u64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketSpan {
    pub offset: i32,
    pub length: u32,
}

/// Metric family metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricMetadata {
    pub family_name: String,
    pub unit: String,
    pub help: String,
    pub kind: String,
}

/// One finalized, serialized batch: the unit of durability and of network
/// transmission. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedSegment {
    pub meta: MetaMap,
    pub payload: Vec<u8>,
}
