use crate::accumulator::{LatencyAccumulator, LatencySummary};
use crate::error::DigestError;
use crate::fingerprint::fingerprint;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Per-fingerprint state held by the [`AggregationTable`].
#[derive(Debug, Default)]
struct FingerprintEntry {
    latency: LatencyAccumulator,
    last_query: String,
    // MD5 of each distinct raw text; keeps memory flat for long queries.
    distinct_queries: HashSet<[u8; 16]>,
}

/// Mapping from fingerprint to its latency accumulator and raw-query
/// bookkeeping. Mutation takes `&mut self`: exactly one owner writes to a
/// table at a time, and [`finalize`](Self::finalize) consumes it.
#[derive(Debug, Default)]
pub struct AggregationTable {
    entries: HashMap<String, FingerprintEntry>,
}

/// Finalized statistics for one fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct QueryDigest {
    #[serde(rename = "query")]
    pub fingerprint: String,
    pub last_query: String,
    pub unique_queries: usize,
    pub time_percent: f64,
    #[serde(rename = "time")]
    pub metrics: LatencySummary,
}

impl QueryDigest {
    /// Hex MD5 of the fingerprint, a short stable identifier for reports.
    pub fn query_id(&self) -> String {
        format!("{:x}", md5::compute(&self.fingerprint))
    }
}

impl AggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fingerprints `raw_query` and inserts it.
    pub fn record(&mut self, raw_query: &str, nanos: u64) -> Result<(), DigestError> {
        let fp = fingerprint(raw_query);
        self.insert(fp, raw_query, nanos)
    }

    /// Adds one observation under `fingerprint`. A duration that would
    /// overflow the fingerprint's cumulative time is rejected with
    /// [`DigestError::DurationOverflow`] and leaves the table unchanged.
    pub fn insert(
        &mut self,
        fingerprint: String,
        raw_query: &str,
        nanos: u64,
    ) -> Result<(), DigestError> {
        let entry = match self.entries.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                if occupied.get_mut().latency.add(nanos).is_none() {
                    let fingerprint = occupied.key().clone();
                    return Err(DigestError::DurationOverflow { fingerprint });
                }
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(FingerprintEntry::default());
                // first sample of a zeroed accumulator cannot overflow
                let _ = entry.latency.add(nanos);
                entry
            }
        };
        entry.distinct_queries.insert(md5::compute(raw_query).0);
        entry.last_query.clear();
        entry.last_query.push_str(raw_query);
        Ok(())
    }

    /// Converts every accumulator into a [`QueryDigest`] and assigns each
    /// its share of the total cumulative time. The order of the returned
    /// digests is unspecified.
    pub fn finalize(self) -> Result<Vec<QueryDigest>, DigestError> {
        let mut digests = Vec::with_capacity(self.entries.len());
        for (fp, entry) in self.entries {
            digests.push(QueryDigest {
                fingerprint: fp,
                last_query: entry.last_query,
                unique_queries: entry.distinct_queries.len(),
                time_percent: 0.0,
                metrics: entry.latency.summarize()?,
            });
        }

        let total: u128 = digests.iter().map(|d| d.metrics.cumulative as u128).sum();
        if total > 0 {
            for digest in &mut digests {
                digest.time_percent = 100.0 * digest.metrics.cumulative as f64 / total as f64;
            }
        }

        debug!(fingerprints = digests.len(), total_cumulative_ns = %total, "finalized digests");
        Ok(digests)
    }
}
