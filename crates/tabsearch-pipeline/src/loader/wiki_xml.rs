//! Streaming reader for MediaWiki XML exports
//!
//! Pages are read one at a time with a pull parser, so memory stays flat for
//! multi-gigabyte dumps. Only the first revision of each page is kept. Every
//! page becomes one row of a fixed wide schema.

use super::{send_chunk, ParseStats, ParsedChunk};
use crate::error::Result;
use crate::warehouse::{RawColumn, RawRow, RawValue};
use chrono::{DateTime, NaiveDateTime};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::debug;

/// Columns of a wiki raw table, in row order
pub fn wiki_columns() -> Vec<RawColumn> {
    [
        ("title", "String"),
        ("ns", "UInt64"),
        ("id", "UInt64"),
        ("revision_id", "UInt64"),
        ("revision_parent_id", "Nullable(UInt64)"),
        ("revision_timestamp", "Nullable(DateTime)"),
        ("contributor_username", "Nullable(String)"),
        ("contributor_id", "Nullable(UInt64)"),
        ("comment", "Nullable(String)"),
        ("model", "Nullable(String)"),
        ("format", "Nullable(String)"),
        ("text", "String"),
    ]
    .into_iter()
    .map(|(name, sql_type)| RawColumn::new(name, sql_type))
    .collect()
}

/// Fields of one page as found in the document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiPage {
    pub title: Option<String>,
    pub ns: Option<String>,
    pub id: Option<String>,
    pub revision_id: Option<String>,
    pub revision_parent_id: Option<String>,
    pub revision_timestamp: Option<String>,
    pub contributor_username: Option<String>,
    pub contributor_id: Option<String>,
    pub comment: Option<String>,
    pub model: Option<String>,
    pub format: Option<String>,
    pub text: Option<String>,
}

impl WikiPage {
    fn set(&mut self, path: &[String], value: String) {
        let names: Vec<&str> = path.iter().map(String::as_str).collect();
        let slot = match names.as_slice() {
            ["title"] => &mut self.title,
            ["ns"] => &mut self.ns,
            ["id"] => &mut self.id,
            ["revision", "id"] => &mut self.revision_id,
            ["revision", "parentid"] => &mut self.revision_parent_id,
            ["revision", "timestamp"] => &mut self.revision_timestamp,
            ["revision", "contributor", "username"] => &mut self.contributor_username,
            ["revision", "contributor", "id"] => &mut self.contributor_id,
            ["revision", "comment"] => &mut self.comment,
            ["revision", "model"] => &mut self.model,
            ["revision", "format"] => &mut self.format,
            ["revision", "text"] => &mut self.text,
            _ => return,
        };
        // First occurrence wins
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    /// Row in [`wiki_columns`] order. Unparseable numbers become 0 for the
    /// required ids and null for the optional ones.
    pub fn into_row(self) -> RawRow {
        let required = |v: Option<String>| RawValue::UInt(parse_uint(v.as_deref()).unwrap_or(0));
        let optional = |v: Option<String>| {
            parse_uint(v.as_deref())
                .map(RawValue::UInt)
                .unwrap_or(RawValue::Null)
        };
        let text = |v: Option<String>| RawValue::text(v.filter(|s| !s.is_empty()));

        vec![
            RawValue::Text(self.title.unwrap_or_default()),
            required(self.ns),
            required(self.id),
            required(self.revision_id),
            optional(self.revision_parent_id),
            parse_timestamp(self.revision_timestamp.as_deref())
                .map(RawValue::Timestamp)
                .unwrap_or(RawValue::Null),
            text(self.contributor_username),
            optional(self.contributor_id),
            text(self.comment),
            text(self.model),
            text(self.format),
            RawValue::Text(self.text.unwrap_or_default()),
        ]
    }
}

fn parse_uint(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_timestamp(value: Option<&str>) -> Option<NaiveDateTime> {
    let value = value?.trim();
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.naive_utc())
}

/// Pull parser yielding one [`WikiPage`] at a time
pub struct WikiPageReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> WikiPageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            reader: Reader::from_reader(input),
            buf: Vec::new(),
        }
    }

    /// Next page, or `None` at end of document
    pub fn next_page(&mut self) -> Result<Option<WikiPage>> {
        let mut page: Option<WikiPage> = None;
        // Element names below <page>
        let mut path: Vec<String> = Vec::new();
        let mut text = String::new();
        let mut revisions_seen = 0usize;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    text.clear();
                    if page.is_some() {
                        if path.is_empty() && name == "revision" {
                            revisions_seen += 1;
                        }
                        path.push(name);
                    } else if name == "page" {
                        page = Some(WikiPage::default());
                        revisions_seen = 0;
                    }
                },
                Event::Empty(e) => {
                    if let Some(page) = page.as_mut() {
                        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                        if path.is_empty() && name == "revision" {
                            revisions_seen += 1;
                        } else if revisions_seen <= 1 {
                            path.push(name);
                            page.set(&path, String::new());
                            path.pop();
                        }
                    }
                },
                Event::Text(t) => {
                    if page.is_some() {
                        text.push_str(&t.unescape()?);
                    }
                },
                Event::CData(c) => {
                    if page.is_some() {
                        text.push_str(&String::from_utf8_lossy(&c));
                    }
                },
                Event::End(e) => {
                    let Some(current) = page.as_mut() else {
                        continue;
                    };
                    if path.is_empty() {
                        if e.local_name().as_ref() == b"page" {
                            return Ok(page);
                        }
                        continue;
                    }
                    let in_first_revision = path.first().map(String::as_str) != Some("revision")
                        || revisions_seen == 1;
                    if in_first_revision {
                        current.set(&path, std::mem::take(&mut text));
                    }
                    text.clear();
                    path.pop();
                },
                Event::Eof => return Ok(None),
                _ => {},
            }
        }
    }
}

/// Parse a wiki export at `path`, sending the columns and then row batches.
pub fn parse_file(
    path: &Path,
    batch_size: usize,
    tx: mpsc::Sender<ParsedChunk>,
) -> Result<ParseStats> {
    let mut pages = WikiPageReader::new(BufReader::new(File::open(path)?));
    send_chunk(&tx, ParsedChunk::Columns(wiki_columns()))?;

    let batch_size = batch_size.max(1);
    let mut stats = ParseStats::default();
    let mut batch = Vec::with_capacity(batch_size.min(4096));
    while let Some(page) = pages.next_page()? {
        batch.push(page.into_row());
        stats.rows += 1;
        if batch.len() >= batch_size {
            send_chunk(&tx, ParsedChunk::Rows(std::mem::take(&mut batch)))?;
            debug!(path = %path.display(), pages = stats.rows, "Wiki pages parsed");
        }
    }
    if !batch.is_empty() {
        send_chunk(&tx, ParsedChunk::Rows(batch))?;
    }
    Ok(stats)
}
