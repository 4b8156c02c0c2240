//! Point-in-time stats snapshots.
//!
//! Producers build one snapshot per reporting interval and push it through
//! the [`StatsHub`](crate::hub::StatsHub); the hub never retains them.

use std::time::Duration;

/// Per-signal delivery counters for one reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalStats {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub retried_429: u64,
    pub retried_5xx: u64,
}

/// Outcome of one network send attempt, split by signal type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkStats {
    pub series: SignalStats,
    pub histograms: SignalStats,
    pub metadata: SignalStats,
    pub send_duration: Duration,
    /// Highest sample timestamp shipped, in seconds. Zero when the attempt
    /// carried no newer data.
    pub newest_timestamp_seconds: i64,
    pub series_bytes: u64,
    pub metadata_bytes: u64,
}

impl NetworkStats {
    pub fn total_sent(&self) -> u64 {
        self.series.sent + self.histograms.sent + self.metadata.sent
    }

    pub fn total_failed(&self) -> u64 {
        self.series.failed + self.histograms.failed + self.metadata.failed
    }

    pub fn total_retried(&self) -> u64 {
        self.series.retried + self.histograms.retried + self.metadata.retried
    }

    pub fn total_retried_429(&self) -> u64 {
        self.series.retried_429 + self.histograms.retried_429 + self.metadata.retried_429
    }

    pub fn total_retried_5xx(&self) -> u64 {
        self.series.retried_5xx + self.histograms.retried_5xx + self.metadata.retried_5xx
    }
}

/// Serializer-side activity: records accepted and segment bytes moved to and
/// from durable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializerStats {
    pub series_stored: u64,
    pub exemplars_stored: u64,
    pub metadata_stored: u64,
    pub errors: u64,
    /// Highest sample timestamp accepted, in seconds.
    pub newest_timestamp_seconds: i64,
    pub segment_id_written: u64,
    pub segment_id_read: u64,
    pub uncompressed_bytes_written: u64,
    pub compressed_bytes_written: u64,
    pub uncompressed_bytes_read: u64,
    pub compressed_bytes_read: u64,
}

/// Connection-count targets published by the adaptive sender pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParallelismStats {
    pub min_connections: u32,
    pub max_connections: u32,
    pub desired_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_aggregate_all_signal_types() {
        let stats = NetworkStats {
            series: SignalStats {
                sent: 10,
                failed: 1,
                retried: 2,
                retried_429: 1,
                retried_5xx: 1,
            },
            histograms: SignalStats {
                sent: 5,
                ..SignalStats::default()
            },
            metadata: SignalStats {
                sent: 3,
                failed: 2,
                ..SignalStats::default()
            },
            ..NetworkStats::default()
        };
        assert_eq!(stats.total_sent(), 18);
        assert_eq!(stats.total_failed(), 3);
        assert_eq!(stats.total_retried(), 2);
        assert_eq!(stats.total_retried_429(), 1);
        assert_eq!(stats.total_retried_5xx(), 1);
    }
}
