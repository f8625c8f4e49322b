//! Line-oriented fallback parser for delimited text
//!
//! Used when the server-side bulk load rejects a file. Each physical line is
//! one record. The header is sanitized into column names, every column is a
//! nullable string, short rows are padded with nulls and long rows are
//! truncated to the header width.
//!
//! A line is malformed when it is not valid UTF-8, has an odd number of quote
//! characters, or cannot be split by the CSV reader. Malformed lines are
//! skipped and counted; once more than `malformed_min_rows` lines were seen, a
//! malformed share above `malformed_max_ratio` aborts the whole file.

use super::{send_chunk, ParseStats, ParsedChunk};
use crate::config::IngestConfig;
use crate::error::{PipelineError, Result};
use crate::warehouse::{RawColumn, RawRow, RawValue, RAW_TEXT_TYPE};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tabsearch_common::ident::{dedupe_names, sanitize_header};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delimiters tried by [`sniff_delimiter`], in order of preference on ties
pub const CANDIDATE_DELIMITERS: &[u8] = b",;\t|";

const QUOTE: u8 = b'"';
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// When a malformed share becomes fatal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MalformedPolicy {
    pub min_rows: usize,
    pub max_ratio: f64,
}

impl MalformedPolicy {
    pub fn exceeded(&self, malformed: usize, total: usize) -> bool {
        total > self.min_rows && malformed as f64 / total as f64 > self.max_ratio
    }
}

impl From<&IngestConfig> for MalformedPolicy {
    fn from(config: &IngestConfig) -> Self {
        Self {
            min_rows: config.malformed_min_rows,
            max_ratio: config.malformed_max_ratio,
        }
    }
}

/// Count `delimiter` outside double quotes
fn count_unquoted(line: &[u8], delimiter: u8) -> usize {
    let mut quoted = false;
    let mut count = 0;
    for &b in line {
        if b == QUOTE {
            quoted = !quoted;
        } else if b == delimiter && !quoted {
            count += 1;
        }
    }
    count
}

/// Guess the delimiter from the head of a file.
///
/// For each candidate the header's delimiter count is compared with every
/// complete sample line; the candidate that appears in the header and matches
/// the most lines wins. Falls back to `,`.
pub fn sniff_delimiter(sample: &[u8]) -> u8 {
    let sample = sample.strip_prefix(UTF8_BOM).unwrap_or(sample);
    let mut lines: Vec<&[u8]> = sample
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .collect();
    // The last piece is cut off by the sample boundary unless it ended in a newline
    if lines.len() > 1 {
        lines.pop();
    }
    let lines: Vec<&[u8]> = lines.into_iter().filter(|l| !l.is_empty()).collect();
    let Some(header) = lines.first() else {
        return b',';
    };

    let mut best = (b',', 0usize);
    for &candidate in CANDIDATE_DELIMITERS {
        let expected = count_unquoted(header, candidate);
        if expected == 0 {
            continue;
        }
        let consistent = lines
            .iter()
            .filter(|l| count_unquoted(l, candidate) == expected)
            .count();
        if consistent > best.1 {
            best = (candidate, consistent);
        }
    }
    best.0
}

/// Split one line into fields, or `None` if the line is malformed
fn parse_line(line: &[u8], delimiter: u8) -> Option<Vec<String>> {
    let text = std::str::from_utf8(line).ok()?;
    if line.iter().filter(|&&b| b == QUOTE).count() % 2 != 0 {
        return None;
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Some(record.iter().map(str::to_string).collect()),
        Ok(false) => Some(Vec::new()),
        Err(_) => None,
    }
}

/// Pad with nulls or truncate so the row matches the header width
fn fit_row(fields: Vec<String>, width: usize) -> RawRow {
    let mut row: RawRow = fields
        .into_iter()
        .take(width)
        .map(RawValue::Text)
        .collect();
    row.resize(width, RawValue::Null);
    row
}

/// Streaming reader over one delimited file
pub struct DelimitedReader<R> {
    input: R,
    delimiter: u8,
    columns: Vec<String>,
    policy: MalformedPolicy,
    total: usize,
    malformed: usize,
    line: Vec<u8>,
}

impl<R: BufRead> DelimitedReader<R> {
    /// Read the header line. Returns `None` for an input without one.
    pub fn new(mut input: R, delimiter: u8, policy: MalformedPolicy) -> Result<Option<Self>> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                return Ok(None);
            }
            if !trim_line_end(&line).is_empty() {
                break;
            }
        }

        let header = trim_line_end(line.strip_prefix(UTF8_BOM).unwrap_or(&line));
        let lossy = String::from_utf8_lossy(header);
        let fields = parse_line(lossy.as_bytes(), delimiter).unwrap_or_else(|| {
            lossy
                .split(char::from(delimiter))
                .map(str::to_string)
                .collect()
        });
        let columns = dedupe_names(fields.iter().map(|f| sanitize_header(f)).collect());

        Ok(Some(Self {
            input,
            delimiter,
            columns,
            policy,
            total: 0,
            malformed: 0,
            line,
        }))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn stats(&self) -> ParseStats {
        ParseStats {
            rows: (self.total - self.malformed) as u64,
            malformed: self.malformed as u64,
        }
    }

    fn check_policy(&self) -> Result<()> {
        if self.policy.exceeded(self.malformed, self.total) {
            return Err(PipelineError::MalformedThreshold {
                errors: self.malformed,
                total: self.total,
            });
        }
        Ok(())
    }

    /// Up to `max_rows` rows; an empty batch means end of input.
    pub fn next_batch(&mut self, max_rows: usize) -> Result<Vec<RawRow>> {
        let mut rows = Vec::with_capacity(max_rows.min(1024));
        while rows.len() < max_rows {
            self.line.clear();
            if self.input.read_until(b'\n', &mut self.line)? == 0 {
                self.check_policy()?;
                break;
            }
            let line = trim_line_end(&self.line);
            if line.is_empty() {
                continue;
            }

            self.total += 1;
            match parse_line(line, self.delimiter) {
                Some(fields) => rows.push(fit_row(fields, self.columns.len())),
                None => {
                    self.malformed += 1;
                    debug!(line = self.total, "Skipping malformed row");
                    self.check_policy()?;
                },
            }
        }
        Ok(rows)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parse `path` and send its columns and row batches to the inserter.
pub fn parse_file(
    path: &Path,
    config: &IngestConfig,
    tx: mpsc::Sender<ParsedChunk>,
) -> Result<ParseStats> {
    let mut sample = Vec::with_capacity(config.sniff_bytes);
    File::open(path)?
        .take(config.sniff_bytes as u64)
        .read_to_end(&mut sample)?;
    let delimiter = sniff_delimiter(&sample);
    debug!(path = %path.display(), delimiter = %char::from(delimiter).escape_default(), "Sniffed delimiter");

    let input = BufReader::new(File::open(path)?);
    let Some(mut reader) = DelimitedReader::new(input, delimiter, MalformedPolicy::from(config))?
    else {
        return Err(PipelineError::Invalid(format!("{} is empty", path.display())));
    };

    let columns = reader
        .columns()
        .iter()
        .map(|c| RawColumn::new(c.clone(), RAW_TEXT_TYPE))
        .collect();
    send_chunk(&tx, ParsedChunk::Columns(columns))?;

    loop {
        let rows = reader.next_batch(config.batch_size)?;
        if rows.is_empty() {
            break;
        }
        send_chunk(&tx, ParsedChunk::Rows(rows))?;
    }

    let stats = reader.stats();
    if stats.malformed > 0 {
        warn!(
            path = %path.display(),
            malformed = stats.malformed,
            rows = stats.rows,
            "Skipped malformed rows"
        );
    }
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const POLICY: MalformedPolicy = MalformedPolicy {
        min_rows: 200,
        max_ratio: 0.05,
    };

    fn reader(data: &[u8]) -> DelimitedReader<Cursor<Vec<u8>>> {
        let delimiter = sniff_delimiter(data);
        DelimitedReader::new(Cursor::new(data.to_vec()), delimiter, POLICY)
            .unwrap()
            .unwrap()
    }

    fn text(row: &RawRow, i: usize) -> Option<&str> {
        match &row[i] {
            RawValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// `rows` data lines; lines selected by `is_bad` get an unbalanced quote
    fn file_with_bad_lines(rows: usize, is_bad: impl Fn(usize) -> bool) -> Vec<u8> {
        let mut data = b"id,name\n".to_vec();
        for i in 0..rows {
            if is_bad(i) {
                data.extend_from_slice(format!("{},\"broken\n", i).as_bytes());
            } else {
                data.extend_from_slice(format!("{},name {}\n", i, i).as_bytes());
            }
        }
        data
    }

    fn drain(mut reader: DelimitedReader<Cursor<Vec<u8>>>) -> Result<(usize, ParseStats)> {
        let mut rows = 0;
        loop {
            let batch = reader.next_batch(64)?;
            if batch.is_empty() {
                return Ok((rows, reader.stats()));
            }
            rows += batch.len();
        }
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter(b"a,b,c\n1,2,3\n4,5,6\n"), b',');
        assert_eq!(sniff_delimiter(b"a;b;c\n1;2,5;3\n4;5;6\n"), b';');
        assert_eq!(sniff_delimiter(b"a\tb\n1\t2\n"), b'\t');
        assert_eq!(sniff_delimiter(b"a|b\n1|2\n"), b'|');
    }

    #[test]
    fn test_sniff_ignores_quoted_delimiters_and_partial_tail() {
        let sample = b"name;note\n\"Smith, J\";ok\n\"Doe, A\";fine\nX;trunc,at,ed";
        assert_eq!(sniff_delimiter(sample), b';');
    }

    #[test]
    fn test_sniff_defaults_to_comma() {
        assert_eq!(sniff_delimiter(b""), b',');
        assert_eq!(sniff_delimiter(b"single column\nvalue\n"), b',');
    }

    #[test]
    fn test_header_is_sanitized_and_deduplicated() {
        let r = reader(b"\xEF\xBB\xBFFirst Name,2nd,,First Name\nx,y,z,w\n");
        assert_eq!(r.columns(), &["First_Name", "_2nd", "_", "First_Name_2"]);
    }

    #[test]
    fn test_rows_are_padded_and_truncated() {
        let mut r = reader(b"a,b,c\n1,2\n1,2,3,4\n\"q,uoted\",x,y\n");
        let rows = r.next_batch(10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[0][2], RawValue::Null);
        assert_eq!(rows[1].len(), 3);
        assert_eq!(text(&rows[1], 2), Some("3"));
        assert_eq!(text(&rows[2], 0), Some("q,uoted"));
        assert!(r.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_empty_input_has_no_header() {
        let r = DelimitedReader::new(Cursor::new(Vec::new()), b',', POLICY).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn test_blank_lines_and_crlf_are_ignored() {
        let mut r = reader(b"a,b\r\n1,2\r\n\r\n3,4\r\n");
        let rows = r.next_batch(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(text(&rows[1], 1), Some("4"));
    }

    #[test]
    fn test_invalid_utf8_line_is_malformed() {
        let mut r = reader(b"a,b\n1,\xFF\xFE\n2,ok\n");
        let rows = r.next_batch(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(r.stats(), ParseStats { rows: 1, malformed: 1 });
    }

    #[test]
    fn test_four_percent_malformed_is_tolerated() {
        let data = file_with_bad_lines(1000, |i| i % 25 == 0);
        let (rows, stats) = drain(reader(&data)).unwrap();
        assert_eq!(rows, 960);
        assert_eq!(stats, ParseStats { rows: 960, malformed: 40 });
    }

    #[test]
    fn test_six_percent_malformed_aborts() {
        let data = file_with_bad_lines(1000, |i| i % 50 < 3);
        let err = drain(reader(&data)).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedThreshold { .. }));
    }

    #[test]
    fn test_early_errors_within_first_rows_are_checked_at_end() {
        // 20 bad lines up front, then clean: 20 / 250 = 8% at end of input
        let data = file_with_bad_lines(250, |i| i < 20);
        let err = drain(reader(&data)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MalformedThreshold { errors: 20, total: 250 }
        ));
    }

    #[test]
    fn test_small_files_never_abort() {
        let data = file_with_bad_lines(100, |i| i % 2 == 0);
        let (rows, stats) = drain(reader(&data)).unwrap();
        assert_eq!(rows, 50);
        assert_eq!(stats.malformed, 50);
    }

    #[test]
    fn test_policy_boundary() {
        assert!(!POLICY.exceeded(10, 200));
        assert!(!POLICY.exceeded(15, 300));
        assert!(POLICY.exceeded(16, 300));
    }
}
