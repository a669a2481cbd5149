//! Delimited-text reading and writing for spreadsheet sheet exports.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;
use wep_core::{Table, TableError};

/// Reads one sheet export. Leading metadata lines are discarded before the header row.
#[derive(Debug, Clone, Copy)]
pub struct TableReader {
    delimiter: u8,
    skip_lines: usize,
}

impl Default for TableReader {
    fn default() -> Self {
        Self {
            delimiter: b',',
            skip_lines: 0,
        }
    }
}

impl TableReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_skip_lines(mut self, skip_lines: usize) -> Self {
        self.skip_lines = skip_lines;
        self
    }

    pub fn read_path(&self, path: impl AsRef<Path>) -> Result<Table, TableError> {
        let path = path.as_ref();
        let source_name = path.display().to_string();
        let bytes = fs::read(path)
            .map_err(|e| TableError::malformed(&source_name, format!("unreadable: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| TableError::malformed(&source_name, format!("invalid utf-8: {e}")))?;
        self.parse(&text, &source_name)
    }

    pub fn parse(&self, text: &str, source_name: &str) -> Result<Table, TableError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let body = skip_physical_lines(text, self.skip_lines).ok_or_else(|| {
            TableError::malformed(
                source_name,
                format!("expected at least {} lines", self.skip_lines + 1),
            )
        })?;

        if ends_inside_quotes(body, self.delimiter) {
            return Err(TableError::malformed(source_name, "unterminated quoted field"));
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(body.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| TableError::malformed(source_name, format!("unreadable header: {e}")))?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if headers.is_empty() {
            return Err(TableError::malformed(source_name, "missing header row"));
        }
        let width = headers.len();
        let mut table = Table::new(headers).map_err(|e| TableError::malformed(source_name, e.to_string()))?;

        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|e| {
                TableError::malformed(source_name, format!("record {}: {e}", idx + 1))
            })?;
            if record.iter().skip(width).any(|extra| !extra.trim().is_empty()) {
                return Err(TableError::malformed(
                    source_name,
                    format!(
                        "record {} has {} fields, header has {width}",
                        idx + 1,
                        record.len()
                    ),
                ));
            }
            table.push_row(record.iter().take(width).map(ToString::to_string).collect());
        }

        debug!(source = source_name, rows = table.len(), columns = width, "parsed table");
        Ok(table)
    }
}

/// Returns the text after the first `count` lines, or `None` when no header line would remain.
fn skip_physical_lines(text: &str, count: usize) -> Option<&str> {
    let mut rest = text;
    for _ in 0..count {
        let newline = rest.find('\n')?;
        rest = &rest[newline + 1..];
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// True when a field opened with a quote is still open at the end of `body`.
/// A quote only opens a field at its start; `""` inside a quoted field is an escape.
fn ends_inside_quotes(body: &str, delimiter: u8) -> bool {
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut bytes = body.bytes().peekable();
    while let Some(b) = bytes.next() {
        if in_quotes {
            if b == b'"' {
                if bytes.peek() == Some(&b'"') {
                    bytes.next();
                } else {
                    in_quotes = false;
                }
            }
            continue;
        }
        if b == b'"' && at_field_start {
            in_quotes = true;
            at_field_start = false;
        } else {
            at_field_start = b == delimiter || b == b'\n' || b == b'\r';
        }
    }
    in_quotes
}

pub fn read_table(path: impl AsRef<Path>, skip_lines: usize) -> Result<Table, TableError> {
    TableReader::new().with_skip_lines(skip_lines).read_path(path)
}

/// Serialises a table. Fields are quoted whenever they contain the delimiter,
/// a quote or a line break.
#[derive(Debug, Clone, Default)]
pub struct TableWriter {
    delimiter: Option<u8>,
    column_order: Option<Vec<String>>,
}

impl TableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn with_column_order(mut self, columns: Vec<String>) -> Self {
        self.column_order = Some(columns);
        self
    }

    pub fn to_bytes(&self, table: &Table) -> anyhow::Result<Vec<u8>> {
        let columns = match &self.column_order {
            Some(order) => order.clone(),
            None => table.columns().to_vec(),
        };
        let indices = columns
            .iter()
            .map(|c| table.require_column(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter.unwrap_or(b','))
            .quote_style(QuoteStyle::Necessary)
            .from_writer(Vec::new());
        writer
            .write_record(&columns)
            .context("writing header row")?;
        for (row_no, record) in table.records().enumerate() {
            writer
                .write_record(indices.iter().map(|&i| record.at(i)))
                .with_context(|| format!("writing row {}", row_no + 1))?;
        }
        writer.into_inner().context("flushing table writer")
    }

    pub fn write_path(&self, table: &Table, path: impl AsRef<Path>) -> anyhow::Result<WrittenFile> {
        let bytes = self.to_bytes(table)?;
        write_atomic(path, &bytes)
    }
}

pub fn write_table(table: &Table, path: impl AsRef<Path>) -> anyhow::Result<WrittenFile> {
    TableWriter::new().write_path(table, path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to a sibling temp file and renames it into place.
pub fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let write_result = fs::File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.flush()
        })
        .with_context(|| format!("writing temp file {}", temp_path.display()));
    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}
