use crate::error::DigestError;
use crate::fingerprint::fingerprint;
use crate::parser::Record;
use crate::table::AggregationTable;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Records buffered per fingerprint worker between pipeline stages.
const QUEUE_DEPTH_PER_WORKER: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Number of fingerprint workers; `1` ingests inline on the caller's thread.
    pub jobs: usize,
    /// Abort on the first undecodable entry or read failure instead of
    /// skipping it.
    pub strict: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            strict: false,
        }
    }
}

/// What happened to the input during ingestion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: u64,
    pub skipped: u64,
    /// The input failed before it was exhausted; the table holds what was
    /// read up to that point.
    pub interrupted: bool,
}

/// Routes every decoded record into a fresh [`AggregationTable`].
///
/// With `jobs > 1`, fingerprints are computed by a pool of worker threads
/// while a single aggregator thread owns the table and applies every
/// insert. Both queues are bounded, so a slow aggregator applies
/// backpressure all the way to the reader. If the aggregator stops early,
/// the workers exit and the reader's next send fails instead of blocking.
pub fn ingest<I>(
    records: I,
    options: IngestOptions,
) -> Result<(AggregationTable, IngestReport), DigestError>
where
    I: IntoIterator<Item = Result<Record, DigestError>>,
{
    let mut report = IngestReport::default();
    let table = if options.jobs <= 1 {
        let mut table = AggregationTable::new();
        feed(records, options.strict, &mut report, |record| {
            table.record(&record.query, record.nanos).map(|()| true)
        })?;
        table
    } else {
        ingest_parallel(records, options, &mut report)?
    };

    info!(
        accepted = report.accepted,
        skipped = report.skipped,
        interrupted = report.interrupted,
        fingerprints = table.len(),
        "ingestion finished"
    );
    Ok((table, report))
}

fn ingest_parallel<I>(
    records: I,
    options: IngestOptions,
    report: &mut IngestReport,
) -> Result<AggregationTable, DigestError>
where
    I: IntoIterator<Item = Result<Record, DigestError>>,
{
    let depth = options.jobs * QUEUE_DEPTH_PER_WORKER;
    let strict = options.strict;
    let (work_tx, work_rx) = mpsc::sync_channel::<Record>(depth);
    let (done_tx, done_rx) = mpsc::sync_channel::<(String, Record)>(depth);
    // Shared by the workers only; the receiver closes when the last one exits.
    let work_rx = Arc::new(Mutex::new(work_rx));

    info!(workers = options.jobs, queue_depth = depth, "starting fingerprint workers");

    thread::scope(|s| {
        for _ in 0..options.jobs {
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            s.spawn(move || loop {
                let next = match work_rx.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => break,
                };
                let Ok(record) = next else { break };
                let fp = fingerprint(&record.query);
                if done_tx.send((fp, record)).is_err() {
                    break;
                }
            });
        }
        drop(work_rx);
        drop(done_tx);

        let aggregator = s.spawn(move || {
            let mut table = AggregationTable::new();
            let mut rejected = 0u64;
            for (fp, record) in done_rx {
                if let Err(e) = table.insert(fp, &record.query, record.nanos) {
                    if strict {
                        return Err(e);
                    }
                    warn!(error = %e, "skipping record");
                    rejected += 1;
                }
            }
            Ok((table, rejected))
        });

        let fed = feed(records, strict, report, |record| {
            Ok(work_tx.send(record).is_ok())
        });
        // Closing the work queue lets workers drain it and exit, which in
        // turn closes the result queue for the aggregator.
        drop(work_tx);

        let (table, rejected) = aggregator
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
        fed?;
        report.accepted -= rejected;
        report.skipped += rejected;
        Ok(table)
    })
}

/// Pulls records from the input and hands each one to `sink`. `sink`
/// returns `Ok(false)` when downstream has gone away and `Err` when it
/// rejects the record.
///
/// A read failure ends only the source that raised it; records from later
/// sources are still consumed.
fn feed<I, F>(
    records: I,
    strict: bool,
    report: &mut IngestReport,
    mut sink: F,
) -> Result<(), DigestError>
where
    I: IntoIterator<Item = Result<Record, DigestError>>,
    F: FnMut(Record) -> Result<bool, DigestError>,
{
    for item in records {
        match item {
            Ok(record) => match sink(record) {
                Ok(true) => report.accepted += 1,
                Ok(false) => {
                    report.interrupted = true;
                    break;
                }
                Err(e) if strict => return Err(e),
                Err(e) => {
                    warn!(error = %e, "skipping record");
                    report.skipped += 1;
                }
            },
            Err(e) if strict => return Err(e),
            Err(e @ DigestError::Parse { .. }) => {
                warn!(error = %e, "skipping undecodable entry");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(error = %e, "input source failed; continuing with the next one");
                report.interrupted = true;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    fn record(query: &str, nanos: u64) -> Result<Record, DigestError> {
        Ok(Record {
            query: query.to_string(),
            nanos,
        })
    }

    fn workload() -> Vec<Result<Record, DigestError>> {
        (0..5_000u64)
            .map(|i| match i % 3 {
                0 => record(&format!("SELECT * FROM t WHERE id = {i}"), i),
                1 => record(&format!("UPDATE u SET n = 'x{i}' WHERE id = {i}"), 2 * i),
                _ => record(&format!("DELETE FROM v WHERE id IN ({i}, {})", i + 1), 7),
            })
            .collect()
    }

    fn summary(table: AggregationTable) -> HashMap<String, (u64, u64, u64, u64, usize)> {
        table
            .finalize()
            .unwrap()
            .into_iter()
            .map(|d| {
                let m = d.metrics;
                (d.fingerprint, (m.count, m.cumulative, m.p50, m.p99, d.unique_queries))
            })
            .collect()
    }

    #[test]
    fn test_sequential_ingest() {
        let input = vec![
            record("SELECT * FROM t WHERE id=1", 10),
            record("SELECT * FROM t WHERE id=2", 20),
            record("SELECT name FROM u", 5),
        ];
        let (table, report) = ingest(input, IngestOptions::default()).unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(report.skipped, 0);
        assert!(!report.interrupted);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (seq, seq_report) = ingest(workload(), IngestOptions::default()).unwrap();
        let options = IngestOptions {
            jobs: 4,
            strict: false,
        };
        let (par, par_report) = ingest(workload(), options).unwrap();

        assert_eq!(seq_report, par_report);
        assert_eq!(par_report.accepted, 5_000);
        assert_eq!(summary(seq), summary(par));
    }

    #[test]
    fn test_parse_errors_are_skipped() {
        let input = vec![
            record("SELECT 1", 1),
            Err(DigestError::parse("in.log", 2, "bad line")),
            record("SELECT 2", 2),
        ];
        for jobs in [1, 3] {
            let options = IngestOptions { jobs, strict: false };
            let (table, report) = ingest(input_clone(&input), options).unwrap();
            assert_eq!(report.accepted, 2);
            assert_eq!(report.skipped, 1);
            let digests = table.finalize().unwrap();
            assert_eq!(digests[0].metrics.count, 2);
        }
    }

    #[test]
    fn test_strict_mode_aborts() {
        let input = vec![
            record("SELECT 1", 1),
            Err(DigestError::parse("in.log", 2, "bad line")),
        ];
        for jobs in [1, 2] {
            let options = IngestOptions { jobs, strict: true };
            let err = ingest(input_clone(&input), options).unwrap_err();
            assert!(matches!(err, DigestError::Parse { line: 2, .. }));
        }
    }

    #[test]
    fn test_read_failure_does_not_stop_later_records() {
        let input = vec![
            record("SELECT 1", 1),
            record("SELECT 2", 2),
            Err(DigestError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"))),
            record("SELECT 3", 3),
        ];
        for jobs in [1, 4] {
            let options = IngestOptions { jobs, strict: false };
            let (table, report) = ingest(input_clone(&input), options).unwrap();
            assert!(report.interrupted);
            assert_eq!(report.accepted, 3);
            let digests = table.finalize().unwrap();
            assert_eq!(digests[0].metrics.count, 3);
            assert_eq!(digests[0].metrics.cumulative, 6);
        }
    }

    fn overflowing_workload() -> Vec<Result<Record, DigestError>> {
        let mut input = vec![
            record("SELECT * FROM big WHERE id = 1", u64::MAX),
            record("SELECT * FROM big WHERE id = 2", u64::MAX),
        ];
        input.extend((0..10_000u64).map(|i| record(&format!("SELECT {i}"), 1)));
        input
    }

    #[test]
    fn test_overflowing_duration_is_skipped() {
        for jobs in [1, 2] {
            let options = IngestOptions { jobs, strict: false };
            let (table, report) = ingest(overflowing_workload(), options).unwrap();
            assert_eq!(report.accepted, 10_001);
            assert_eq!(report.skipped, 1);
            let summary = summary(table);
            assert_eq!(summary["select * from big where id = ?"].0, 1);
            assert_eq!(summary["select ?"].0, 10_000);
        }
    }

    #[test]
    fn test_overflowing_duration_fails_strict_run_without_hanging() {
        for jobs in [1, 2] {
            let options = IngestOptions { jobs, strict: true };
            let err = ingest(overflowing_workload(), options).unwrap_err();
            assert!(matches!(err, DigestError::DurationOverflow { .. }));
        }
    }

    #[test]
    fn test_empty_input() {
        let options = IngestOptions { jobs: 2, strict: true };
        let (table, report) = ingest(Vec::<Result<Record, DigestError>>::new(), options).unwrap();
        assert_eq!(report, IngestReport::default());
        assert!(table.finalize().unwrap().is_empty());
    }

    // DigestError is not Clone (io::Error), so rebuild the inputs per run.
    fn input_clone(input: &[Result<Record, DigestError>]) -> Vec<Result<Record, DigestError>> {
        input
            .iter()
            .map(|item| match item {
                Ok(r) => Ok(r.clone()),
                Err(DigestError::Parse { source_name, line, message }) => {
                    Err(DigestError::parse(source_name, *line, message.clone()))
                }
                Err(DigestError::Io(e)) => Err(DigestError::Io(io::Error::new(e.kind(), e.to_string()))),
                Err(DigestError::EmptyAccumulator) => Err(DigestError::EmptyAccumulator),
                Err(DigestError::DurationOverflow { fingerprint }) => {
                    Err(DigestError::DurationOverflow {
                        fingerprint: fingerprint.clone(),
                    })
                }
            })
            .collect()
    }
}
