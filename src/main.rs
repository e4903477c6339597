mod accumulator;
mod error;
mod fingerprint;
mod parser;
mod pipeline;
mod report;
mod table;

use anyhow::Context;
use clap::Parser;
use parser::InputFormat;
use pipeline::IngestOptions;
use report::{ReportOptions, SortBy};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the query log file(s); reads stdin when omitted
    #[arg(long = "files", num_args = 1..)]
    files: Vec<PathBuf>,

    /// Input format
    #[arg(long, value_enum, default_value_t = InputFormat::Json)]
    input_format: InputFormat,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of queries to show in the report (0 shows all)
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Ranking key
    #[arg(long, value_enum, default_value_t = SortBy::Cumulative)]
    sort_by: SortBy,

    /// Fingerprint worker threads; 1 processes records inline
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: u16,

    /// Fail on the first undecodable entry or unreadable input
    #[arg(long)]
    strict: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Decodes every source in turn. A source that fails mid-read ends with
/// one error item and the next source picks up.
fn chain_sources(
    sources: Vec<(String, Box<dyn BufRead>)>,
    format: InputFormat,
) -> impl Iterator<Item = Result<parser::Record, error::DigestError>> {
    sources
        .into_iter()
        .flat_map(move |(name, reader)| parser::parse_log(reader, format, name))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let mut sources: Vec<(String, Box<dyn BufRead>)> = Vec::new();
    if args.files.is_empty() {
        sources.push(("<stdin>".to_string(), Box::new(BufReader::new(io::stdin()))));
    } else {
        for path in &args.files {
            match File::open(path) {
                Ok(file) => {
                    sources.push((path.display().to_string(), Box::new(BufReader::new(file))));
                }
                Err(e) if args.strict => {
                    return Err(e).with_context(|| format!("could not open {}", path.display()));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "could not open file, skipping");
                }
            }
        }
    }

    let records = chain_sources(sources, args.input_format);

    let options = IngestOptions {
        jobs: usize::from(args.jobs),
        strict: args.strict,
    };
    let (table, ingest_report) = pipeline::ingest(records, options).context("ingestion failed")?;
    if ingest_report.interrupted {
        warn!(accepted = ingest_report.accepted, "input ended early; report covers partial data");
    }

    if table.is_empty() {
        info!("no records ingested");
    }
    let digests = table.finalize()?;
    info!(fingerprints = digests.len(), "writing report");

    let report_options = ReportOptions {
        format: args.format,
        sort_by: args.sort_by,
        limit: args.limit,
    };
    report::print_report(digests, &report_options, args.output.as_ref())?;

    Ok(())
}
