//! String-keyed reference format.
//!
//! Every series record carries its label names and values in full, with
//! fixed-width lengths and integers throughout. One owned intermediate record
//! is kept per appended sample until `finish` drains them. This is the
//! compatibility baseline: self-describing and simple to decode anywhere, at
//! a byte and allocation cost the dictionary format exists to avoid.

use crate::format::wire::{self, Cursor};
use crate::format::{
    check_declared_format, check_magic, Codec, DatumPool, FormatVersion, ItemKind, PooledItem,
    SampleRef, META_FORMAT, META_META_COUNT, META_RECORD_COUNT, META_SERIES_COUNT,
};
use crate::model::{
    BucketSpan, Exemplar, Histogram, HistogramCount, Label, MetaMap, MetricMetadata,
};
use crate::Result;

const FLAG_EXEMPLAR: u8 = 1 << 0;
const FLAG_HISTOGRAM: u8 = 1 << 1;

struct SeriesRecord {
    timestamp_ms: i64,
    value: f64,
    labels: Vec<Label>,
    exemplar: Option<Exemplar>,
    histogram: Option<Histogram>,
}

/// V1 codec. See the module docs for the layout.
#[derive(Default)]
pub struct V1Format {
    series: Vec<SeriesRecord>,
    metadata: Vec<MetricMetadata>,
    pool: DatumPool,
}

impl V1Format {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: DatumPool) -> Self {
        Self {
            pool,
            ..Self::default()
        }
    }

    pub fn pool(&self) -> &DatumPool {
        &self.pool
    }
}

impl Codec for V1Format {
    fn version(&self) -> FormatVersion {
        FormatVersion::V1
    }

    fn append_sample(&mut self, sample: &SampleRef<'_>) -> Result<()> {
        self.series.push(SeriesRecord {
            timestamp_ms: sample.timestamp_ms,
            value: sample.value,
            labels: sample.labels().cloned().collect(),
            exemplar: sample.exemplar.cloned(),
            histogram: sample.histogram.cloned(),
        });
        Ok(())
    }

    fn append_metadata(&mut self, metadata: &MetricMetadata) -> Result<()> {
        self.metadata.push(metadata.clone());
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn FnMut(&MetaMap, &[u8]) -> Result<()>) -> Result<()> {
        let mut buf = Vec::new();
        wire::put_u32(&mut buf, FormatVersion::V1.magic());
        wire::put_u32(&mut buf, self.series.len() as u32);
        wire::put_u32(&mut buf, self.metadata.len() as u32);
        for record in &self.series {
            encode_series(&mut buf, record);
        }
        for metadata in &self.metadata {
            wire::put_str32(&mut buf, &metadata.family_name);
            wire::put_str32(&mut buf, &metadata.unit);
            wire::put_str32(&mut buf, &metadata.help);
            wire::put_str32(&mut buf, &metadata.kind);
        }

        let mut meta = MetaMap::new();
        meta.insert(META_FORMAT.to_string(), self.version().as_str().to_string());
        meta.insert(META_SERIES_COUNT.to_string(), self.series.len().to_string());
        meta.insert(META_META_COUNT.to_string(), self.metadata.len().to_string());
        meta.insert(
            META_RECORD_COUNT.to_string(),
            (self.series.len() + self.metadata.len()).to_string(),
        );

        let result = sink(&meta, &buf);
        self.series.clear();
        self.metadata.clear();
        result
    }

    fn unmarshal(&self, meta: &MetaMap, buf: &[u8]) -> Result<Vec<PooledItem>> {
        check_declared_format(meta, FormatVersion::V1)?;
        let mut cursor = Cursor::new(buf);
        check_magic(&mut cursor, FormatVersion::V1)?;

        let series_count = cursor.get_u32()?;
        let meta_count = cursor.get_u32()?;

        let mut items = Vec::new();
        for _ in 0..series_count {
            let mut item = self.pool.get();
            item.kind = ItemKind::Series;
            decode_series(&mut cursor, &mut item)?;
            items.push(item);
        }
        for _ in 0..meta_count {
            let mut item = self.pool.get();
            item.kind = ItemKind::Metadata;
            item.metadata.family_name.push_str(cursor.get_str32()?);
            item.metadata.unit.push_str(cursor.get_str32()?);
            item.metadata.help.push_str(cursor.get_str32()?);
            item.metadata.kind.push_str(cursor.get_str32()?);
            items.push(item);
        }
        Ok(items)
    }
}

fn encode_series(buf: &mut Vec<u8>, record: &SeriesRecord) {
    wire::put_i64(buf, record.timestamp_ms);
    wire::put_f64(buf, record.value);
    wire::put_u32(buf, record.labels.len() as u32);
    for label in &record.labels {
        wire::put_str32(buf, &label.name);
        wire::put_str32(buf, &label.value);
    }

    let mut flags = 0u8;
    if record.exemplar.is_some() {
        flags |= FLAG_EXEMPLAR;
    }
    if record.histogram.is_some() {
        flags |= FLAG_HISTOGRAM;
    }
    wire::put_u8(buf, flags);

    if let Some(exemplar) = &record.exemplar {
        wire::put_f64(buf, exemplar.value);
        wire::put_u8(buf, exemplar.timestamp_ms.is_some() as u8);
        wire::put_i64(buf, exemplar.timestamp_ms.unwrap_or(0));
        wire::put_u32(buf, exemplar.labels.len() as u32);
        for label in &exemplar.labels {
            wire::put_str32(buf, &label.name);
            wire::put_str32(buf, &label.value);
        }
    }

    if let Some(histogram) = &record.histogram {
        encode_histogram(buf, histogram);
    }
}

fn decode_series(cursor: &mut Cursor<'_>, item: &mut PooledItem) -> Result<()> {
    item.sample.timestamp_ms = cursor.get_i64()?;
    item.sample.value = cursor.get_f64()?;
    let label_count = cursor.get_u32()?;
    for _ in 0..label_count {
        let name = cursor.get_str32()?.to_string();
        let value = cursor.get_str32()?.to_string();
        item.sample.labels.push(Label { name, value });
    }

    let flags = cursor.get_u8()?;
    if flags & FLAG_EXEMPLAR != 0 {
        let value = cursor.get_f64()?;
        let has_ts = cursor.get_u8()? != 0;
        let ts = cursor.get_i64()?;
        let label_count = cursor.get_u32()?;
        let mut labels = Vec::new();
        for _ in 0..label_count {
            let name = cursor.get_str32()?.to_string();
            let label_value = cursor.get_str32()?.to_string();
            labels.push(Label {
                name,
                value: label_value,
            });
        }
        item.sample.exemplar = Some(Exemplar {
            value,
            timestamp_ms: has_ts.then_some(ts),
            labels,
        });
    }
    if flags & FLAG_HISTOGRAM != 0 {
        item.sample.histogram = Some(decode_histogram(cursor)?);
    }
    Ok(())
}

fn encode_count(buf: &mut Vec<u8>, count: HistogramCount) {
    match count {
        HistogramCount::Int(v) => {
            wire::put_u8(buf, 0);
            wire::put_u64(buf, v);
        }
        HistogramCount::Float(v) => {
            wire::put_u8(buf, 1);
            wire::put_f64(buf, v);
        }
    }
}

fn decode_count(cursor: &mut Cursor<'_>) -> Result<HistogramCount> {
    Ok(match cursor.get_u8()? {
        0 => HistogramCount::Int(cursor.get_u64()?),
        _ => HistogramCount::Float(cursor.get_f64()?),
    })
}

fn encode_histogram(buf: &mut Vec<u8>, histogram: &Histogram) {
    encode_count(buf, histogram.count);
    wire::put_f64(buf, histogram.sum);
    wire::put_i32(buf, histogram.schema);
    wire::put_f64(buf, histogram.zero_threshold);
    encode_count(buf, histogram.zero_count);
    for (spans, deltas, counts) in [
        (
            &histogram.negative_spans,
            &histogram.negative_deltas,
            &histogram.negative_counts,
        ),
        (
            &histogram.positive_spans,
            &histogram.positive_deltas,
            &histogram.positive_counts,
        ),
    ] {
        wire::put_u32(buf, spans.len() as u32);
        for span in spans {
            wire::put_i32(buf, span.offset);
            wire::put_u32(buf, span.length);
        }
        wire::put_u32(buf, deltas.len() as u32);
        for delta in deltas {
            wire::put_i64(buf, *delta);
        }
        wire::put_u32(buf, counts.len() as u32);
        for count in counts {
            wire::put_f64(buf, *count);
        }
    }
    wire::put_i32(buf, histogram.reset_hint);
    wire::put_i64(buf, histogram.timestamp_ms);
}

fn decode_histogram(cursor: &mut Cursor<'_>) -> Result<Histogram> {
    let mut histogram = Histogram {
        count: decode_count(cursor)?,
        sum: cursor.get_f64()?,
        schema: cursor.get_i32()?,
        zero_threshold: cursor.get_f64()?,
        zero_count: decode_count(cursor)?,
        ..Histogram::default()
    };
    for side in 0..2 {
        let span_count = cursor.get_u32()?;
        let mut spans = Vec::new();
        for _ in 0..span_count {
            spans.push(BucketSpan {
                offset: cursor.get_i32()?,
                length: cursor.get_u32()?,
            });
        }
        let delta_count = cursor.get_u32()?;
        let mut deltas = Vec::new();
        for _ in 0..delta_count {
            deltas.push(cursor.get_i64()?);
        }
        let count_count = cursor.get_u32()?;
        let mut counts = Vec::new();
        for _ in 0..count_count {
            counts.push(cursor.get_f64()?);
        }
        if side == 0 {
            histogram.negative_spans = spans;
            histogram.negative_deltas = deltas;
            histogram.negative_counts = counts;
        } else {
            histogram.positive_spans = spans;
            histogram.positive_deltas = deltas;
            histogram.positive_counts = counts;
        }
    }
    histogram.reset_hint = cursor.get_i32()?;
    histogram.timestamp_ms = cursor.get_i64()?;
    Ok(histogram)
}
