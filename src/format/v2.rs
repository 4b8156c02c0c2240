//! Dictionary segment format.
//!
//! Label names and values are interned once per segment into a shared string
//! table and referenced by varint index from each record, so repeated label
//! sets cost two or three bytes per label instead of the full strings.
//! Records are encoded directly into one growable buffer as they are
//! appended — no per-sample intermediate structs — and record timestamps are
//! zigzag deltas against the previous record, which collapses the common
//! same-millisecond batch to a single byte each.
//!
//! Layout: magic, record count, string table, then the record stream.

use std::collections::HashMap;

use crate::format::wire::{self, Cursor};
use crate::format::{
    check_declared_format, check_magic, Codec, DatumPool, FormatVersion, ItemKind, PooledItem,
    SampleRef, META_FORMAT, META_RECORD_COUNT,
};
use crate::model::{
    BucketSpan, Exemplar, Histogram, HistogramCount, Label, MetaMap, MetricMetadata,
};
use crate::{Error, Result};

const REC_SERIES: u8 = 0;
const REC_METADATA: u8 = 1;

const FLAG_EXEMPLAR: u8 = 1 << 0;
const FLAG_HISTOGRAM: u8 = 1 << 1;
const FLAG_EXEMPLAR_TS: u8 = 1 << 2;

/// V2 codec. See the module docs for the layout.
#[derive(Default)]
pub struct V2Format {
    dict: HashMap<String, u32>,
    body: Vec<u8>,
    record_count: u64,
    last_ts: i64,
    pool: DatumPool,
}

impl V2Format {
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

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&index) = self.dict.get(s) {
            return index;
        }
        let index = self.dict.len() as u32;
        self.dict.insert(s.to_string(), index);
        index
    }
}

impl Codec for V2Format {
    fn version(&self) -> FormatVersion {
        FormatVersion::V2
    }

    fn append_sample(&mut self, sample: &SampleRef<'_>) -> Result<()> {
        wire::put_u8(&mut self.body, REC_SERIES);
        let delta = sample.timestamp_ms - self.last_ts;
        self.last_ts = sample.timestamp_ms;
        wire::put_ivarint(&mut self.body, delta);
        wire::put_f64(&mut self.body, sample.value);

        wire::put_uvarint(&mut self.body, sample.label_count() as u64);
        for label in sample.labels() {
            let name = self.intern(&label.name);
            let value = self.intern(&label.value);
            wire::put_uvarint(&mut self.body, u64::from(name));
            wire::put_uvarint(&mut self.body, u64::from(value));
        }

        let mut flags = 0u8;
        if sample.exemplar.is_some() {
            flags |= FLAG_EXEMPLAR;
        }
        if sample.histogram.is_some() {
            flags |= FLAG_HISTOGRAM;
        }
        if sample.exemplar.is_some_and(|e| e.timestamp_ms.is_some()) {
            flags |= FLAG_EXEMPLAR_TS;
        }
        wire::put_u8(&mut self.body, flags);

        if let Some(exemplar) = sample.exemplar {
            wire::put_f64(&mut self.body, exemplar.value);
            if let Some(ts) = exemplar.timestamp_ms {
                wire::put_ivarint(&mut self.body, ts - sample.timestamp_ms);
            }
            wire::put_uvarint(&mut self.body, exemplar.labels.len() as u64);
            for label in &exemplar.labels {
                let name = self.intern(&label.name);
                let value = self.intern(&label.value);
                wire::put_uvarint(&mut self.body, u64::from(name));
                wire::put_uvarint(&mut self.body, u64::from(value));
            }
        }

        if let Some(histogram) = sample.histogram {
            let base_ts = sample.timestamp_ms;
            encode_histogram(&mut self.body, histogram, base_ts);
        }

        self.record_count += 1;
        Ok(())
    }

    fn append_metadata(&mut self, metadata: &MetricMetadata) -> Result<()> {
        wire::put_u8(&mut self.body, REC_METADATA);
        for field in [
            metadata.family_name.as_str(),
            metadata.unit.as_str(),
            metadata.help.as_str(),
            metadata.kind.as_str(),
        ] {
            let index = self.intern(field);
            wire::put_uvarint(&mut self.body, u64::from(index));
        }
        self.record_count += 1;
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn FnMut(&MetaMap, &[u8]) -> Result<()>) -> Result<()> {
        // Rebuild the string table in index order; the map is the only copy.
        let mut strings: Vec<&str> = vec![""; self.dict.len()];
        for (s, &index) in &self.dict {
            strings[index as usize] = s.as_str();
        }

        let mut buf = Vec::with_capacity(self.body.len() + 64);
        wire::put_u32(&mut buf, FormatVersion::V2.magic());
        wire::put_uvarint(&mut buf, self.record_count);
        wire::put_uvarint(&mut buf, strings.len() as u64);
        for s in strings {
            wire::put_str(&mut buf, s);
        }
        buf.extend_from_slice(&self.body);

        let mut meta = MetaMap::new();
        meta.insert(META_FORMAT.to_string(), self.version().as_str().to_string());
        meta.insert(META_RECORD_COUNT.to_string(), self.record_count.to_string());

        let result = sink(&meta, &buf);
        self.dict.clear();
        self.body.clear();
        self.record_count = 0;
        self.last_ts = 0;
        result
    }

    fn unmarshal(&self, meta: &MetaMap, buf: &[u8]) -> Result<Vec<PooledItem>> {
        check_declared_format(meta, FormatVersion::V2)?;
        let mut cursor = Cursor::new(buf);
        check_magic(&mut cursor, FormatVersion::V2)?;

        let record_count = cursor.get_uvarint()?;
        let string_count = cursor.get_uvarint()?;
        let mut strings: Vec<&str> = Vec::new();
        for _ in 0..string_count {
            strings.push(cursor.get_str()?);
        }

        let mut items = Vec::new();
        let mut last_ts = 0i64;
        for _ in 0..record_count {
            let mut item = self.pool.get();
            match cursor.get_u8()? {
                REC_SERIES => {
                    item.kind = ItemKind::Series;
                    last_ts += cursor.get_ivarint()?;
                    decode_series(&mut cursor, &strings, last_ts, &mut item)?;
                }
                REC_METADATA => {
                    item.kind = ItemKind::Metadata;
                    item.metadata.family_name.push_str(get_string(&mut cursor, &strings)?);
                    item.metadata.unit.push_str(get_string(&mut cursor, &strings)?);
                    item.metadata.help.push_str(get_string(&mut cursor, &strings)?);
                    item.metadata.kind.push_str(get_string(&mut cursor, &strings)?);
                }
                _ => return Err(Error::Corrupt("unknown record kind")),
            }
            items.push(item);
        }
        if !cursor.is_empty() {
            return Err(Error::Corrupt("trailing bytes after last record"));
        }
        Ok(items)
    }
}

fn get_string<'a>(cursor: &mut Cursor<'_>, strings: &[&'a str]) -> Result<&'a str> {
    let index = cursor.get_uvarint()? as usize;
    strings
        .get(index)
        .copied()
        .ok_or(Error::Corrupt("string index out of range"))
}

fn decode_series(
    cursor: &mut Cursor<'_>,
    strings: &[&str],
    timestamp_ms: i64,
    item: &mut PooledItem,
) -> Result<()> {
    item.sample.timestamp_ms = timestamp_ms;
    item.sample.value = cursor.get_f64()?;

    let label_count = cursor.get_uvarint()?;
    for _ in 0..label_count {
        let name = get_string(cursor, strings)?.to_string();
        let value = get_string(cursor, strings)?.to_string();
        item.sample.labels.push(Label { name, value });
    }

    let flags = cursor.get_u8()?;
    if flags & FLAG_EXEMPLAR != 0 {
        let value = cursor.get_f64()?;
        let ts = if flags & FLAG_EXEMPLAR_TS != 0 {
            Some(timestamp_ms + cursor.get_ivarint()?)
        } else {
            None
        };
        let label_count = cursor.get_uvarint()?;
        let mut labels = Vec::new();
        for _ in 0..label_count {
            let name = get_string(cursor, strings)?.to_string();
            let label_value = get_string(cursor, strings)?.to_string();
            labels.push(Label {
                name,
                value: label_value,
            });
        }
        item.sample.exemplar = Some(Exemplar {
            value,
            timestamp_ms: ts,
            labels,
        });
    }
    if flags & FLAG_HISTOGRAM != 0 {
        item.sample.histogram = Some(decode_histogram(cursor, timestamp_ms)?);
    }
    Ok(())
}

fn encode_count(buf: &mut Vec<u8>, count: HistogramCount) {
    match count {
        HistogramCount::Int(v) => {
            wire::put_u8(buf, 0);
            wire::put_uvarint(buf, v);
        }
        HistogramCount::Float(v) => {
            wire::put_u8(buf, 1);
            wire::put_f64(buf, v);
        }
    }
}

fn decode_count(cursor: &mut Cursor<'_>) -> Result<HistogramCount> {
    Ok(match cursor.get_u8()? {
        0 => HistogramCount::Int(cursor.get_uvarint()?),
        _ => HistogramCount::Float(cursor.get_f64()?),
    })
}

fn encode_histogram(buf: &mut Vec<u8>, histogram: &Histogram, base_ts: i64) {
    encode_count(buf, histogram.count);
    wire::put_f64(buf, histogram.sum);
    wire::put_ivarint(buf, i64::from(histogram.schema));
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
        wire::put_uvarint(buf, spans.len() as u64);
        for span in spans {
            wire::put_ivarint(buf, i64::from(span.offset));
            wire::put_uvarint(buf, u64::from(span.length));
        }
        wire::put_uvarint(buf, deltas.len() as u64);
        for delta in deltas {
            wire::put_ivarint(buf, *delta);
        }
        wire::put_uvarint(buf, counts.len() as u64);
        for count in counts {
            wire::put_f64(buf, *count);
        }
    }
    wire::put_ivarint(buf, i64::from(histogram.reset_hint));
    wire::put_ivarint(buf, histogram.timestamp_ms - base_ts);
}

fn decode_histogram(cursor: &mut Cursor<'_>, base_ts: i64) -> Result<Histogram> {
    let mut histogram = Histogram {
        count: decode_count(cursor)?,
        sum: cursor.get_f64()?,
        schema: decode_i32(cursor)?,
        zero_threshold: cursor.get_f64()?,
        zero_count: decode_count(cursor)?,
        ..Histogram::default()
    };
    for side in 0..2 {
        let span_count = cursor.get_uvarint()?;
        let mut spans = Vec::new();
        for _ in 0..span_count {
            let offset = decode_i32(cursor)?;
            let length = cursor.get_uvarint()?;
            let length =
                u32::try_from(length).map_err(|_| Error::Corrupt("span length overflow"))?;
            spans.push(BucketSpan { offset, length });
        }
        let delta_count = cursor.get_uvarint()?;
        let mut deltas = Vec::new();
        for _ in 0..delta_count {
            deltas.push(cursor.get_ivarint()?);
        }
        let count_count = cursor.get_uvarint()?;
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
    histogram.reset_hint = decode_i32(cursor)?;
    histogram.timestamp_ms = base_ts + cursor.get_ivarint()?;
    Ok(histogram)
}

fn decode_i32(cursor: &mut Cursor<'_>) -> Result<i32> {
    i32::try_from(cursor.get_ivarint()?).map_err(|_| Error::Corrupt("value overflows i32"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests_support::{
        marshal_one, sample_float_histogram, sample_full, sample_plain, sorted_ref,
    };
    use crate::format::v1::V1Format;
    use crate::Error;

    #[test]
    fn round_trip_preserves_every_field() {
        let mut format = V2Format::new();
        format
            .append_sample(&sorted_ref(&sample_full()))
            .expect("append sample");
        format
            .append_metadata(&MetricMetadata {
                family_name: "http_requests".into(),
                unit: "requests".into(),
                help: "Total requests".into(),
                kind: "counter".into(),
            })
            .expect("append metadata");
        format
            .append_sample(&sorted_ref(&sample_float_histogram()))
            .expect("append float histogram");

        let (meta, buf) = marshal_one(&mut format);
        assert_eq!(meta.get(META_RECORD_COUNT).map(String::as_str), Some("3"));

        let items = format.unmarshal(&meta, &buf).expect("unmarshal");
        assert_eq!(items.len(), 3);
        // Record order is preserved, metadata interleaved with series.
        assert_eq!(items[0].kind, ItemKind::Series);
        assert_eq!(items[0].sample, sample_full());
        assert_eq!(items[1].kind, ItemKind::Metadata);
        assert_eq!(items[1].metadata.help, "Total requests");
        assert_eq!(items[2].kind, ItemKind::Series);
        assert_eq!(items[2].sample, sample_float_histogram());
    }

    #[test]
    fn timestamps_survive_out_of_order_appends() {
        let mut format = V2Format::new();
        // Deltas go forward, backward, and far forward.
        for &ts in &[1_700_000_000_000i64, 1_699_999_999_000, 1_700_000_100_000] {
            format
                .append_sample(&sorted_ref(&sample_plain(ts, ts as f64)))
                .expect("append");
        }
        let (meta, buf) = marshal_one(&mut format);
        let items = format.unmarshal(&meta, &buf).expect("unmarshal");
        let timestamps: Vec<i64> = items.iter().map(|i| i.sample.timestamp_ms).collect();
        assert_eq!(
            timestamps,
            vec![1_700_000_000_000, 1_699_999_999_000, 1_700_000_100_000]
        );
    }

    #[test]
    fn repeated_label_sets_are_interned() {
        let mut format = V2Format::new();
        for i in 0..100 {
            format
                .append_sample(&sorted_ref(&sample_plain(1_000 + i, i as f64)))
                .expect("append");
        }
        let (meta, buf) = marshal_one(&mut format);
        let items = format.unmarshal(&meta, &buf).expect("unmarshal");
        assert_eq!(items.len(), 100);
        for item in &items {
            assert_eq!(item.sample.labels, sample_plain(0, 0.0).labels);
        }
        // Four unique strings total; each further record pays index bytes only.
        assert!(
            buf.len() < 100 * 24,
            "interned encoding unexpectedly large: {} bytes",
            buf.len()
        );
    }

    #[test]
    fn finish_resets_state_for_reuse() {
        let mut format = V2Format::new();
        format
            .append_sample(&sorted_ref(&sample_plain(5_000, 1.0)))
            .expect("append");
        let (first_meta, _) = marshal_one(&mut format);
        assert_eq!(first_meta.get(META_RECORD_COUNT).map(String::as_str), Some("1"));

        let (second_meta, buf) = marshal_one(&mut format);
        assert_eq!(second_meta.get(META_RECORD_COUNT).map(String::as_str), Some("0"));
        let items = format.unmarshal(&second_meta, &buf).expect("unmarshal");
        assert!(items.is_empty());
    }

    #[test]
    fn rejects_v1_segments() {
        let mut v1 = V1Format::new();
        v1.append_sample(&sorted_ref(&sample_plain(1_000, 1.0)))
            .expect("append");
        let (meta, buf) = marshal_one(&mut v1);

        let v2 = V2Format::new();
        // The meta map names the other version.
        let err = v2.unmarshal(&meta, &buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(1)));
        // Without meta, the magic word still gives it away.
        let err = v2.unmarshal(&MetaMap::new(), &buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(1)));
    }

    #[test]
    fn rejects_v2_segments_in_v1() {
        let mut v2 = V2Format::new();
        v2.append_sample(&sorted_ref(&sample_plain(1_000, 1.0)))
            .expect("append");
        let (meta, buf) = marshal_one(&mut v2);

        let v1 = V1Format::new();
        let err = v1.unmarshal(&meta, &buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(2)));
        let err = v1.unmarshal(&MetaMap::new(), &buf).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(2)));
    }

    #[test]
    fn truncated_buffer_is_corrupt() {
        let mut format = V2Format::new();
        format
            .append_sample(&sorted_ref(&sample_full()))
            .expect("append");
        let (meta, buf) = marshal_one(&mut format);
        let err = format.unmarshal(&meta, &buf[..buf.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
