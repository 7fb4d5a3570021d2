//! Streaming delimited-file reader shared by every import job.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use tracing::warn;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    /// Sniff a byte-order mark (or a NUL high byte) and pick one of the above.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeRule {
    /// `""` inside a quoted field stands for one `"`.
    DoubledQuote,
    /// A prefix byte (usually `\`) escapes the next quote.
    Byte(u8),
}

/// How a particular export tool writes its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: u8,
    pub escape: EscapeRule,
    pub encoding: TextEncoding,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::comma()
    }
}

impl Dialect {
    pub fn comma() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            escape: EscapeRule::DoubledQuote,
            encoding: TextEncoding::Auto,
        }
    }

    /// Tab-separated UTF-16LE, the format of backlink-tool exports.
    pub fn tab_utf16() -> Self {
        Self {
            delimiter: b'\t',
            quote: b'"',
            escape: EscapeRule::DoubledQuote,
            encoding: TextEncoding::Utf16Le,
        }
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("opening {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("reading header row: {0}")]
    Header(#[source] csv::Error),
    #[error("input has no header row")]
    MissingHeader,
}

/// A data row that could not be turned into a record. The run keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct MalformedRowError {
    pub line: u64,
    pub reason: String,
}

/// One data row as header -> raw text, in file column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: u64,
    pub fields: Vec<(String, String)>,
}

impl RawRow {
    /// Case- and whitespace-insensitive header lookup.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| header_eq(name, header))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) fn header_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Lazy iterator of data rows. Not restartable: reopen the file to retry.
pub struct CsvRows {
    reader: csv::Reader<Box<dyn Read>>,
    headers: Vec<String>,
    record: StringRecord,
    finished: bool,
}

impl std::fmt::Debug for CsvRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRows")
            .field("headers", &self.headers)
            .field("finished", &self.finished)
            .finish()
    }
}

pub fn open_csv(path: impl AsRef<Path>, dialect: &Dialect) -> Result<CsvRows, ReadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ReadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    CsvRows::from_reader(file, dialect)
}

impl CsvRows {
    pub fn from_reader<R: Read + 'static>(inner: R, dialect: &Dialect) -> Result<Self, ReadError> {
        let mut buffered = BufReader::with_capacity(1 << 16, inner);
        let head = buffered.fill_buf().map_err(|e| ReadError::Header(e.into()))?;
        let has_utf8_bom = head.starts_with(UTF8_BOM);
        let encoding = match dialect.encoding {
            TextEncoding::Auto => sniff_encoding(head),
            other => other,
        };

        let decoded: Box<dyn Read> = match encoding {
            TextEncoding::Utf16Le => Box::new(Utf16LeReader::new(buffered)),
            _ => {
                if has_utf8_bom {
                    buffered.consume(UTF8_BOM.len());
                }
                Box::new(buffered)
            }
        };

        let mut builder = ReaderBuilder::new();
        builder
            .delimiter(dialect.delimiter)
            .quote(dialect.quote)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::None);
        match dialect.escape {
            EscapeRule::DoubledQuote => {
                builder.double_quote(true);
            }
            EscapeRule::Byte(byte) => {
                builder.double_quote(false).escape(Some(byte));
            }
        }
        let mut reader = builder.from_reader(decoded);

        let headers: Vec<String> = reader
            .headers()
            .map_err(ReadError::Header)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(ReadError::MissingHeader);
        }

        Ok(Self {
            reader,
            headers,
            record: StringRecord::new(),
            finished: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Iterator for CsvRows {
    type Item = Result<RawRow, MalformedRowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            match self.reader.read_record(&mut self.record) {
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Ok(true) => {
                    let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                    if self.record.iter().all(|f| f.trim().is_empty()) {
                        continue;
                    }
                    if self.record.len() != self.headers.len() {
                        warn!(
                            line,
                            expected = self.headers.len(),
                            found = self.record.len(),
                            "field count mismatch"
                        );
                        return Some(Err(MalformedRowError {
                            line,
                            reason: format!(
                                "expected {} fields, found {}",
                                self.headers.len(),
                                self.record.len()
                            ),
                        }));
                    }
                    let fields = self
                        .headers
                        .iter()
                        .cloned()
                        .zip(self.record.iter().map(ToString::to_string))
                        .collect();
                    return Some(Ok(RawRow { line, fields }));
                }
                Err(err) => {
                    let line = err.position().map(|p| p.line()).unwrap_or(0);
                    if matches!(err.kind(), csv::ErrorKind::Io(_)) {
                        self.finished = true;
                    }
                    warn!(line, error = %err, "unreadable row");
                    return Some(Err(MalformedRowError {
                        line,
                        reason: err.to_string(),
                    }));
                }
            }
        }
    }
}

fn sniff_encoding(head: &[u8]) -> TextEncoding {
    if head.starts_with(UTF16LE_BOM) {
        TextEncoding::Utf16Le
    } else if head.len() >= 2 && head[0] != 0 && head[1] == 0 {
        TextEncoding::Utf16Le
    } else {
        TextEncoding::Utf8
    }
}

/// Transcodes a UTF-16LE byte stream to UTF-8 on the fly.
///
/// Surrogate pairs and odd bytes split across read boundaries are carried
/// over; unpaired surrogates decode to U+FFFD.
struct Utf16LeReader<R> {
    inner: R,
    out: Vec<u8>,
    out_pos: usize,
    carry_byte: Option<u8>,
    pending_high: Option<u16>,
    bom_checked: bool,
    eof: bool,
}

impl<R: Read> Utf16LeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            out: Vec::new(),
            out_pos: 0,
            carry_byte: None,
            pending_high: None,
            bom_checked: false,
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut raw = [0u8; 8192];
        let n = self.inner.read(&mut raw)?;
        self.out.clear();
        self.out_pos = 0;

        if n == 0 {
            self.eof = true;
            if self.pending_high.take().is_some() || self.carry_byte.take().is_some() {
                self.out
                    .extend_from_slice(char::REPLACEMENT_CHARACTER.to_string().as_bytes());
            }
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(n + 1);
        if let Some(b) = self.carry_byte.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(&raw[..n]);
        if bytes.len() % 2 == 1 {
            self.carry_byte = bytes.pop();
        }

        let mut units: Vec<u16> = Vec::with_capacity(bytes.len() / 2 + 1);
        if let Some(high) = self.pending_high.take() {
            units.push(high);
        }
        units.extend(bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])));
        if let Some(&last) = units.last() {
            if (0xD800..=0xDBFF).contains(&last) {
                self.pending_high = units.pop();
            }
        }

        let mut text: String = char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        if !self.bom_checked && !text.is_empty() {
            self.bom_checked = true;
            if text.starts_with('\u{FEFF}') {
                text.remove(0);
            }
        }
        self.out.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

impl<R: Read> Read for Utf16LeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.out_pos >= self.out.len() {
            if self.eof {
                return Ok(0);
            }
            self.refill()?;
        }
        let available = &self.out[self.out_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.out_pos += n;
        Ok(n)
    }
}
