//! Batch accumulator.
//!
//! A mutable builder feeding one codec instance. One accumulator serves one
//! producer at a time; parallel producers shard across accumulator instances
//! rather than sharing one. The accumulator owns the label-set invariant:
//! codecs always receive labels sorted by name and free of duplicates.

use crate::format::{Codec, SampleRef};
use crate::model::{Exemplar, Histogram, Label, MetaMap, MetricMetadata};
use crate::{Error, Result};

pub struct Accumulator<C: Codec> {
    codec: C,
    /// Reusable label-sort scratch; indices into the caller's label slice.
    order: Vec<u32>,
    pending: usize,
    emit_empty: bool,
    samples_total: u64,
    exemplars_total: u64,
    metadata_total: u64,
    newest_timestamp_ms: i64,
}

impl<C: Codec> Accumulator<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            order: Vec::new(),
            pending: 0,
            emit_empty: false,
            samples_total: 0,
            exemplars_total: 0,
            metadata_total: 0,
            newest_timestamp_ms: 0,
        }
    }

    /// Allow `marshal` to emit a segment even when nothing was accumulated.
    pub fn with_empty_segments(mut self, enabled: bool) -> Self {
        self.emit_empty = enabled;
        self
    }

    /// Appends one point.
    ///
    /// Fails with [`Error::InvalidLabelSet`] if `labels` is empty or contains
    /// duplicate names. Labels may arrive in any order; they reach the codec
    /// sorted by name.
    pub fn add_sample(
        &mut self,
        timestamp_ms: i64,
        value: f64,
        labels: &[Label],
        histogram: Option<&Histogram>,
        exemplar: Option<&Exemplar>,
    ) -> Result<()> {
        if labels.is_empty() {
            return Err(Error::InvalidLabelSet);
        }
        self.order.clear();
        self.order.extend(0..labels.len() as u32);
        self.order
            .sort_unstable_by(|&a, &b| labels[a as usize].name.cmp(&labels[b as usize].name));
        for pair in self.order.windows(2) {
            if labels[pair[0] as usize].name == labels[pair[1] as usize].name {
                return Err(Error::InvalidLabelSet);
            }
        }

        let sample = SampleRef::new(timestamp_ms, value, labels, &self.order, exemplar, histogram);
        self.codec.append_sample(&sample)?;

        self.pending += 1;
        self.samples_total += 1;
        if exemplar.is_some() {
            self.exemplars_total += 1;
        }
        if timestamp_ms > self.newest_timestamp_ms {
            self.newest_timestamp_ms = timestamp_ms;
        }
        Ok(())
    }

    /// Appends one metric-family metadata record.
    pub fn add_metadata(&mut self, metadata: &MetricMetadata) -> Result<()> {
        self.codec.append_metadata(metadata)?;
        self.pending += 1;
        self.metadata_total += 1;
        Ok(())
    }

    /// Finalizes the accumulated records into one or more segments, invoking
    /// `sink` once per segment in record order.
    ///
    /// Fails with [`Error::EmptyBatch`] when nothing was accumulated, unless
    /// empty-segment emission was enabled. On return the accumulator is
    /// cleared and ready for reuse.
    pub fn marshal(
        &mut self,
        sink: &mut dyn FnMut(&MetaMap, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if self.pending == 0 && !self.emit_empty {
            return Err(Error::EmptyBatch);
        }
        self.codec.finish(sink)?;
        self.pending = 0;
        Ok(())
    }

    /// Records accumulated since the last `marshal`.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Samples accepted over the accumulator's lifetime.
    pub fn samples_total(&self) -> u64 {
        self.samples_total
    }

    pub fn exemplars_total(&self) -> u64 {
        self.exemplars_total
    }

    pub fn metadata_total(&self) -> u64 {
        self.metadata_total
    }

    /// Highest sample timestamp seen so far.
    pub fn newest_timestamp_ms(&self) -> i64 {
        self.newest_timestamp_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::v1::V1Format;
    use crate::format::v2::V2Format;

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect()
    }

    #[test]
    fn empty_label_set_is_rejected() {
        let mut acc = Accumulator::new(V2Format::new());
        let err = acc.add_sample(1_000, 1.0, &[], None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidLabelSet));
        assert!(acc.is_empty());
    }

    #[test]
    fn duplicate_label_names_are_rejected() {
        let mut acc = Accumulator::new(V2Format::new());
        let dup = labels(&[("job", "a"), ("instance", "x"), ("job", "b")]);
        let err = acc.add_sample(1_000, 1.0, &dup, None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidLabelSet));
    }

    #[test]
    fn labels_reach_the_codec_sorted() {
        let mut acc = Accumulator::new(V1Format::new());
        let unsorted = labels(&[("zone", "eu"), ("app", "relay"), ("job", "scrape")]);
        acc.add_sample(1_000, 1.0, &unsorted, None, None).expect("add");

        let mut segment = None;
        acc.marshal(&mut |meta, buf| {
            segment = Some((meta.clone(), buf.to_vec()));
            Ok(())
        })
        .expect("marshal");
        let (meta, buf) = segment.expect("segment emitted");

        let items = acc.codec().unmarshal(&meta, &buf).expect("unmarshal");
        let names: Vec<&str> = items[0].sample.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["app", "job", "zone"]);
    }

    #[test]
    fn marshal_of_empty_batch_fails_unless_enabled() {
        let mut acc = Accumulator::new(V2Format::new());
        let err = acc.marshal(&mut |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, Error::EmptyBatch));

        let mut acc = Accumulator::new(V2Format::new()).with_empty_segments(true);
        let mut emitted = 0;
        acc.marshal(&mut |_, _| {
            emitted += 1;
            Ok(())
        })
        .expect("marshal");
        assert_eq!(emitted, 1);
    }

    #[test]
    fn accumulator_is_reusable_after_marshal() {
        let mut acc = Accumulator::new(V2Format::new());
        let lbls = labels(&[("job", "relay")]);
        acc.add_sample(1_000, 1.0, &lbls, None, None).expect("add");
        assert_eq!(acc.len(), 1);
        acc.marshal(&mut |_, _| Ok(())).expect("marshal");
        assert!(acc.is_empty());

        acc.add_sample(2_000, 2.0, &lbls, None, None).expect("add");
        let mut segment = None;
        acc.marshal(&mut |meta, buf| {
            segment = Some((meta.clone(), buf.to_vec()));
            Ok(())
        })
        .expect("marshal");
        let (meta, buf) = segment.expect("segment emitted");
        let items = acc.codec().unmarshal(&meta, &buf).expect("unmarshal");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sample.timestamp_ms, 2_000);
    }

    #[test]
    fn counters_track_accepted_records() {
        let mut acc = Accumulator::new(V2Format::new());
        let lbls = labels(&[("job", "relay")]);
        let exemplar = Exemplar {
            value: 1.5,
            timestamp_ms: Some(900),
            labels: labels(&[("trace_id", "t1")]),
        };
        acc.add_sample(5_000, 1.0, &lbls, None, Some(&exemplar)).expect("add");
        acc.add_sample(3_000, 2.0, &lbls, None, None).expect("add");
        acc.add_metadata(&MetricMetadata {
            family_name: "m".into(),
            ..MetricMetadata::default()
        })
        .expect("metadata");

        assert_eq!(acc.samples_total(), 2);
        assert_eq!(acc.exemplars_total(), 1);
        assert_eq!(acc.metadata_total(), 1);
        assert_eq!(acc.newest_timestamp_ms(), 5_000);
        assert_eq!(acc.len(), 3);
    }
}
