use crate::table::QueryDigest;
use crate::OutputFormat;
use std::cmp::Ordering;
use std::io::Write;
use std::path::PathBuf;
use tabled::{Table, Tabled};

/// Ranking key for the report.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Cumulative,
    Count,
    Mean,
    P99,
    Max,
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub format: OutputFormat,
    pub sort_by: SortBy,
    /// Number of fingerprints to show; `0` shows all.
    pub limit: usize,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Total Time")]
    total_time: String,
    #[tabled(rename = "Time %")]
    time_percent: String,
    #[tabled(rename = "Mean Time")]
    mean_time: String,
    #[tabled(rename = "P95")]
    p95: String,
    #[tabled(rename = "Query ID")]
    query_id: String,
    #[tabled(rename = "Query")]
    query: String,
}

pub fn print_report(
    digests: Vec<QueryDigest>,
    options: &ReportOptions,
    output_path: Option<&PathBuf>,
) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = if let Some(path) = output_path {
        Box::new(std::fs::File::create(path)?)
    } else {
        Box::new(std::io::stdout().lock())
    };

    write_report(digests, options, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn write_report(
    digests: Vec<QueryDigest>,
    options: &ReportOptions,
    writer: &mut dyn Write,
) -> anyhow::Result<()> {
    let total_queries: u64 = digests.iter().map(|d| d.metrics.count).sum();
    let total_time: u128 = digests
        .iter()
        .map(|d| u128::from(d.metrics.cumulative))
        .sum();
    let fingerprints = digests.len();
    let ranked = rank(digests, options.sort_by, options.limit);

    match options.format {
        OutputFormat::Table => {
            writeln!(
                writer,
                "Overall: {} queries, {} fingerprints, {} total",
                total_queries,
                fingerprints,
                format_duration(total_time)
            )?;

            let rows: Vec<Row> = ranked
                .iter()
                .enumerate()
                .map(|(i, digest)| Row {
                    rank: i + 1,
                    count: digest.metrics.count,
                    total_time: format_duration(digest.metrics.cumulative.into()),
                    time_percent: format!("{:.1}", digest.time_percent),
                    mean_time: format_duration(digest.metrics.mean.into()),
                    p95: format_duration(digest.metrics.p95.into()),
                    query_id: digest.query_id(),
                    query: truncate_chars(&digest.fingerprint, 50),
                })
                .collect();

            print_table(rows, writer)?;
            print_detailed_sections(&ranked, writer)?;
        }
        OutputFormat::Json => {
            for digest in &ranked {
                serde_json::to_writer(&mut *writer, digest)?;
                writeln!(writer)?;
            }
        }
    }
    Ok(())
}

/// Sorts descending by the chosen key (fingerprint breaks ties) and
/// applies the limit.
fn rank(mut digests: Vec<QueryDigest>, sort_by: SortBy, limit: usize) -> Vec<QueryDigest> {
    let key = |d: &QueryDigest| match sort_by {
        SortBy::Cumulative => d.metrics.cumulative,
        SortBy::Count => d.metrics.count,
        SortBy::Mean => d.metrics.mean,
        SortBy::P99 => d.metrics.p99,
        SortBy::Max => d.metrics.max,
    };
    digests.sort_by(|a, b| match key(b).cmp(&key(a)) {
        Ordering::Equal => a.fingerprint.cmp(&b.fingerprint),
        other => other,
    });
    if limit > 0 {
        digests.truncate(limit);
    }
    digests
}

fn print_detailed_sections(items: &[QueryDigest], writer: &mut dyn Write) -> anyhow::Result<()> {
    writeln!(writer, "\nDetailed Report\n===============")?;

    for (i, item) in items.iter().enumerate() {
        let m = &item.metrics;
        writeln!(writer, "\nQuery ID: {}", item.query_id())?;
        writeln!(writer, "Rank: {}", i + 1)?;
        writeln!(writer, "  Execution Stats:")?;
        writeln!(writer, "    Count:      {}", m.count)?;
        writeln!(writer, "    Total Time: {}", format_duration(m.cumulative.into()))?;
        writeln!(writer, "    Time %:     {:.2}", item.time_percent)?;
        writeln!(writer, "    Mean:       {}", format_duration(m.mean.into()))?;
        writeln!(writer, "    HMean:      {}", format_duration(m.hmean.into()))?;
        writeln!(writer, "    Min:        {}", format_duration(m.min.into()))?;
        writeln!(writer, "    Max:        {}", format_duration(m.max.into()))?;
        writeln!(writer, "    Range:      {}", format_duration(m.range.into()))?;
        writeln!(writer, "    StdDev:     {}", format_duration(m.stddev.into()))?;
        writeln!(writer, "    P50:        {}", format_duration(m.p50.into()))?;
        writeln!(writer, "    P75:        {}", format_duration(m.p75.into()))?;
        writeln!(writer, "    P95:        {}", format_duration(m.p95.into()))?;
        writeln!(writer, "    P99:        {}", format_duration(m.p99.into()))?;
        writeln!(writer, "    P99.9:      {}", format_duration(m.p999.into()))?;
        writeln!(writer, "    Long 5%:    {}", format_duration(m.long_5p.into()))?;
        writeln!(writer, "    Short 5%:   {}", format_duration(m.short_5p.into()))?;
        writeln!(writer, "  Unique Queries: {}", item.unique_queries)?;
        writeln!(writer, "  Normalized Query:")?;
        writeln!(writer, "    {}", item.fingerprint)?;
        writeln!(writer, "  Last Example:")?;
        writeln!(writer, "    {}", item.last_query.trim().replace('\n', " "))?;
        writeln!(writer, "--------------------------------------------------------------------------------")?;
    }
    Ok(())
}

/// Renders nanoseconds with the largest unit that keeps the value >= 1.
fn format_duration(nanos: u128) -> String {
    const US: u128 = 1_000;
    const MS: u128 = 1_000_000;
    const S: u128 = 1_000_000_000;

    match nanos {
        n if n >= S => format!("{:.3}s", n as f64 / S as f64),
        n if n >= MS => format!("{:.3}ms", n as f64 / MS as f64),
        n if n >= US => format!("{:.3}µs", n as f64 / US as f64),
        n => format!("{n}ns"),
    }
}

fn truncate_chars(query: &str, max: usize) -> String {
    let q = query.replace('\n', " ");
    if q.chars().count() <= max {
        return q;
    }
    let mut cut: String = q.chars().take(max - 3).collect();
    cut.push_str("...");
    cut
}

fn print_table(rows: Vec<Row>, writer: &mut dyn Write) -> anyhow::Result<()> {
    let table = Table::new(rows).to_string();
    writeln!(writer, "{}", table)?;
    Ok(())
}
