use crate::error::DigestError;
use regex::Regex;
use serde::Deserialize;
use std::io::BufRead;
use std::sync::OnceLock;

/// One recorded query execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub query: String,
    /// Execution time in nanoseconds.
    pub nanos: u64,
}

/// Supported input layouts.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputFormat {
    /// One `{"query": "...", "time": <nanoseconds>}` object per line
    #[default]
    Json,
    /// MySQL slow query log
    Slowlog,
}

#[derive(Deserialize)]
struct JsonRecord {
    query: String,
    time: u64,
}

static RE_QUERY_TIME: OnceLock<Regex> = OnceLock::new();
static RE_PREAMBLE: OnceLock<Regex> = OnceLock::new();

/// Streams [`Record`]s out of a log, one entry at a time.
///
/// Decode failures are yielded as [`DigestError::Parse`] and iteration
/// continues with the next entry. Bytes that are not valid UTF-8 are
/// replaced with U+FFFD rather than failing the read. A read failure is
/// yielded once and ends the stream.
pub struct LogParser<R> {
    reader: R,
    format: InputFormat,
    source_name: String,
    line_no: usize,
    block_start: usize,
    current_block: String,
    raw_line: Vec<u8>,
    read_buffer: String,
    done: bool,
}

impl<R: BufRead> LogParser<R> {
    /// Creates a new `LogParser`. `source_name` labels parse errors.
    pub fn new(reader: R, format: InputFormat, source_name: impl Into<String>) -> Self {
        Self {
            reader,
            format,
            source_name: source_name.into(),
            line_no: 0,
            block_start: 0,
            current_block: String::new(),
            raw_line: Vec::new(),
            read_buffer: String::new(),
            done: false,
        }
    }

    /// Reads the next line into `read_buffer`; `Ok(false)` at EOF.
    fn read_line(&mut self) -> Result<bool, DigestError> {
        self.raw_line.clear();
        self.read_buffer.clear();
        match self.reader.read_until(b'\n', &mut self.raw_line) {
            Ok(0) => Ok(false),
            Ok(_) => {
                self.line_no += 1;
                self.read_buffer
                    .push_str(&String::from_utf8_lossy(&self.raw_line));
                Ok(true)
            }
            Err(e) => {
                self.done = true;
                Err(e.into())
            }
        }
    }

    fn next_json(&mut self) -> Option<Result<Record, DigestError>> {
        loop {
            match self.read_line() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }

            let line = self.read_buffer.trim();
            if line.is_empty() {
                continue;
            }

            let decoded = serde_json::from_str::<JsonRecord>(line)
                .map(|r| Record {
                    query: r.query,
                    nanos: r.time,
                })
                .map_err(|e| DigestError::parse(&self.source_name, self.line_no, e.to_string()));
            return Some(decoded);
        }
    }

    fn next_slowlog(&mut self) -> Option<Result<Record, DigestError>> {
        loop {
            match self.read_line() {
                Ok(true) => {}
                Ok(false) => return self.take_block(),
                Err(e) => return Some(Err(e)),
            }

            // A new entry starts at `# Time` or `# User@Host` once the
            // current one has SQL in it.
            let trimmed = self.read_buffer.trim();
            let is_header = trimmed.starts_with("# User@Host:") || trimmed.starts_with("# Time:");

            if is_header && has_sql(&self.current_block) {
                let parsed = self.take_block();
                self.block_start = self.line_no;
                self.current_block.push_str(&self.read_buffer);
                if parsed.is_some() {
                    return parsed;
                }
            } else {
                if self.current_block.is_empty() {
                    self.block_start = self.line_no;
                }
                self.current_block.push_str(&self.read_buffer);
            }
        }
    }

    fn take_block(&mut self) -> Option<Result<Record, DigestError>> {
        let block = std::mem::take(&mut self.current_block);
        self.parse_block(&block)
    }

    /// Parses a single slow-log entry. `None` when the block holds no SQL.
    fn parse_block(&self, block: &str) -> Option<Result<Record, DigestError>> {
        let re_query_time = RE_QUERY_TIME.get_or_init(|| {
            Regex::new(r"Query_time:\s*(\S+)").expect("query time pattern must compile")
        });

        let mut query_time = None;
        let mut sql_lines = Vec::new();

        for line in block.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                if let Some(caps) = re_query_time.captures(trimmed) {
                    query_time = Some(caps.get(1).map_or("", |m| m.as_str()));
                }
            } else if !is_noise(trimmed) {
                sql_lines.push(trimmed);
            }
        }

        let sql_text = sql_lines.join("\n");
        if sql_text.is_empty() {
            return None;
        }

        let record = match query_time {
            None => Err(DigestError::parse(
                &self.source_name,
                self.block_start,
                "entry has no Query_time header",
            )),
            Some(raw) => parse_seconds(raw)
                .map(|nanos| Record {
                    query: sql_text,
                    nanos,
                })
                .ok_or_else(|| {
                    DigestError::parse(
                        &self.source_name,
                        self.block_start,
                        format!("invalid Query_time `{raw}`"),
                    )
                }),
        };
        Some(record)
    }
}

impl<R: BufRead> Iterator for LogParser<R> {
    type Item = Result<Record, DigestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.format {
            InputFormat::Json => self.next_json(),
            InputFormat::Slowlog => self.next_slowlog(),
        }
    }
}

/// Convenience function to create a `LogParser`.
pub fn parse_log<R: BufRead>(reader: R, format: InputFormat, source_name: impl Into<String>) -> LogParser<R> {
    LogParser::new(reader, format, source_name)
}

/// Lines of a slow log that are neither headers nor SQL: blank lines,
/// `SET timestamp=`, and the server banner printed at the top of the file.
fn is_noise(trimmed: &str) -> bool {
    let re_preamble = RE_PREAMBLE.get_or_init(|| {
        Regex::new(r"^(?:\S+, Version: .*|Tcp port: .*|Time\s+Id\s+Command\s+Argument)$")
            .expect("preamble pattern must compile")
    });
    trimmed.is_empty() || trimmed.starts_with("SET timestamp=") || re_preamble.is_match(trimmed)
}

/// Checks if a block contains any SQL statements.
fn has_sql(block: &str) -> bool {
    block
        .lines()
        .map(str::trim)
        .any(|line| !line.starts_with('#') && !is_noise(line))
}

/// Converts a decimal seconds string to nanoseconds without going through
/// floating point. Digits past the ninth decimal place are truncated.
fn parse_seconds(raw: &str) -> Option<u64> {
    let (whole, frac) = raw.split_once('.').unwrap_or((raw, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_nanos = 0u64;
    let mut scale = 100_000_000u64;
    for digit in frac.bytes().take(9) {
        frac_nanos += u64::from(digit - b'0') * scale;
        scale /= 10;
    }

    whole.checked_mul(1_000_000_000)?.checked_add(frac_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, BufReader};

    fn collect(input: &str, format: InputFormat) -> Vec<Result<Record, DigestError>> {
        LogParser::new(input.as_bytes(), format, "test.log").collect()
    }

    /// Hands out `data`, then fails every read.
    struct FailingReader {
        data: &'static [u8],
    }

    impl io::Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                return Err(io::Error::new(io::ErrorKind::Other, "device gone"));
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_parse_json_lines() {
        let input = r#"{"query": "SELECT * FROM users WHERE id = 1", "time": 1500000}

{"query":"SELECT 1","time":0}
"#;
        let records: Vec<Record> = collect(input, InputFormat::Json)
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].query, "SELECT * FROM users WHERE id = 1");
        assert_eq!(records[0].nanos, 1_500_000);
        assert_eq!(records[1].query, "SELECT 1");
        assert_eq!(records[1].nanos, 0);
    }

    #[test]
    fn test_parse_json_bad_lines_do_not_stop_the_stream() {
        let input = concat!(
            "{\"query\": \"SELECT 1\", \"time\": 10}\n",
            "not json\n",
            "{\"query\": \"SELECT 2\", \"time\": -5}\n",
            "{\"query\": \"SELECT 3\", \"time\": 30}\n",
        );
        let results = collect(input, InputFormat::Json);

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(DigestError::Parse { source_name, line, .. }) => {
                assert_eq!(source_name, "test.log");
                assert_eq!(*line, 2);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(matches!(results[2], Err(DigestError::Parse { line: 3, .. })));
        assert_eq!(results[3].as_ref().unwrap().nanos, 30);
    }

    #[test]
    fn test_parse_json_invalid_utf8_is_replaced() {
        let input: &[u8] = b"{\"query\": \"SELECT 1\", \"time\": 1}\n\
{\"query\": \"SELECT '\xff\xfe'\", \"time\": 2}\n\
{\"query\": \"SELECT 3\", \"time\": 3}\n";
        let records: Vec<Record> = LogParser::new(input, InputFormat::Json, "test.log")
            .map(Result::unwrap)
            .collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[1].query, "SELECT '\u{fffd}\u{fffd}'");
        assert_eq!(records[2].nanos, 3);
    }

    #[test]
    fn test_parse_slowlog_invalid_utf8_is_replaced() {
        let input: &[u8] = b"# Time: 1\n# Query_time: 0.5\nSELECT * FROM t WHERE b = '\xc3';\n\
# Time: 2\n# Query_time: 1.5\nSELECT 2;\n";
        let records: Vec<Record> = LogParser::new(input, InputFormat::Slowlog, "slow.log")
            .map(Result::unwrap)
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].query, "SELECT * FROM t WHERE b = '\u{fffd}';");
        assert_eq!(records[1].nanos, 1_500_000_000);
    }

    #[test]
    fn test_read_failure_is_yielded_once() {
        let reader = BufReader::new(FailingReader {
            data: b"{\"query\": \"SELECT 1\", \"time\": 1}\n",
        });
        let results: Vec<_> = LogParser::new(reader, InputFormat::Json, "broken.log").collect();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().nanos, 1);
        assert!(matches!(results[1], Err(DigestError::Io(_))));
    }

    #[test]
    fn test_parse_block_standard() {
        let block = r#"# Time: 2023-10-27T10:00:00.123456Z
# User@Host: root[root] @ localhost []
# Query_time: 0.001234  Lock_time: 0.000123 Rows_sent: 10  Rows_examined: 100
SET timestamp=1698400800;
SELECT * FROM users;"#;
        let records = collect(block, InputFormat::Slowlog);

        assert_eq!(records.len(), 1);
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.nanos, 1_234_000);
        assert_eq!(record.query, "SELECT * FROM users;");
    }

    #[test]
    fn test_parse_block_multiline_sql() {
        let block = r#"# User@Host: root @ localhost
# Query_time: 1.0  Lock_time: 0.0 Rows_sent: 1  Rows_examined: 1
SELECT *
FROM users
WHERE id = 1;"#;
        let records = collect(block, InputFormat::Slowlog);
        let record = records[0].as_ref().unwrap();

        assert_eq!(record.query, "SELECT *\nFROM users\nWHERE id = 1;");
        assert_eq!(record.nanos, 1_000_000_000);
    }

    #[test]
    fn test_parse_block_missing_header() {
        let records = collect("SELECT 1;", InputFormat::Slowlog);
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], Err(DigestError::Parse { line: 1, .. })));
    }

    #[test]
    fn test_parse_slowlog_multiple_entries() {
        let log = r#"/usr/sbin/mysqld, Version: 8.0.35 (MySQL Community Server - GPL). started with:
Tcp port: 3306  Unix socket: /var/run/mysqld/mysqld.sock
Time                 Id Command    Argument
# Time: 2023-10-27T10:00:00.000000Z
# User@Host: app[app] @ localhost []
# Query_time: 2.500000  Lock_time: 0.000000 Rows_sent: 1  Rows_examined: 1
SELECT * FROM orders WHERE id = 10;
# Time: 2023-10-27T10:00:01.000000Z
# User@Host: app[app] @ localhost []
# Query_time: 0.000100  Lock_time: 0.000000 Rows_sent: 1  Rows_examined: 1
use shop;
SELECT * FROM orders WHERE id = 11;
"#;
        let records: Vec<Record> = collect(log, InputFormat::Slowlog)
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].query, "SELECT * FROM orders WHERE id = 10;");
        assert_eq!(records[0].nanos, 2_500_000_000);
        assert_eq!(records[1].query, "use shop;\nSELECT * FROM orders WHERE id = 11;");
        assert_eq!(records[1].nanos, 100_000);
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("0.001234"), Some(1_234_000));
        assert_eq!(parse_seconds("12"), Some(12_000_000_000));
        assert_eq!(parse_seconds(".5"), Some(500_000_000));
        assert_eq!(parse_seconds("1.0000000019"), Some(1_000_000_001));
        assert_eq!(parse_seconds(""), None);
        assert_eq!(parse_seconds("."), None);
        assert_eq!(parse_seconds("-1.0"), None);
        assert_eq!(parse_seconds("1e3"), None);
    }
}
