use std::io::Cursor;
use std::path::Path;

use chrono::{DateTime, Utc};
use common_types::SellerCreatedEvent;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, Lines};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to read upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line} is not a valid seller row: {source}")]
    InvalidRow {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line} is not a valid seller row: {source}")]
    InvalidCsvRow {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    /// One JSON object per line
    Json,
    /// A header row naming the fields, then one seller per record
    Csv,
}

impl UploadFormat {
    /// `.csv` files are read as CSV, anything else as newline-delimited JSON.
    pub fn from_path(path: &str) -> Self {
        match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => UploadFormat::Csv,
            _ => UploadFormat::Json,
        }
    }
}

/// One row of a seller upload. Field names are accepted in camelCase, as on
/// the wire, or in snake_case. Missing text fields are blank, which the worker
/// rejects during validation; a missing id or creation time is generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SellerImportRow {
    pub id: Option<Uuid>,
    #[serde(alias = "first_name")]
    pub first_name: String,
    #[serde(alias = "last_name")]
    pub last_name: String,
    pub email: String,
    #[serde(alias = "phone_number")]
    pub phone_number: String,
    pub region: String,
    #[serde(alias = "is_active")]
    pub is_active: bool,
    #[serde(alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
}

impl SellerImportRow {
    pub fn has_email(&self) -> bool {
        !self.email.trim().is_empty()
    }

    pub fn into_event(self) -> SellerCreatedEvent {
        SellerCreatedEvent {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone_number: self.phone_number,
            region: self.region,
            is_active: self.is_active,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Reads the rows of an upload, skipping blank lines.
pub struct RowReader<R> {
    source: Source<R>,
}

enum Source<R> {
    Json { lines: Lines<R>, line: usize },
    Csv(csv::DeserializeRecordsIntoIter<Cursor<Vec<u8>>, SellerImportRow>),
}

impl<R: AsyncBufRead + Unpin> RowReader<R> {
    /// Newline-delimited JSON, read one line at a time.
    pub fn new(reader: R) -> Self {
        Self {
            source: Source::Json {
                lines: reader.lines(),
                line: 0,
            },
        }
    }

    /// CSV with a header row. The whole upload is read before the first row
    /// is returned.
    pub async fn csv(mut reader: R) -> Result<Self, ParseError> {
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        let rows = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(Cursor::new(contents))
            .into_deserialize();
        Ok(Self {
            source: Source::Csv(rows),
        })
    }

    pub async fn open(reader: R, format: UploadFormat) -> Result<Self, ParseError> {
        match format {
            UploadFormat::Json => Ok(Self::new(reader)),
            UploadFormat::Csv => Self::csv(reader).await,
        }
    }

    /// The next row, or `None` at the end of the upload.
    pub async fn next_row(&mut self) -> Result<Option<SellerImportRow>, ParseError> {
        match &mut self.source {
            Source::Json { lines, line } => {
                while let Some(text) = lines.next_line().await? {
                    *line += 1;
                    if text.trim().is_empty() {
                        continue;
                    }

                    let row =
                        serde_json::from_str(&text).map_err(|source| ParseError::InvalidRow {
                            line: *line,
                            source,
                        })?;
                    return Ok(Some(row));
                }
                Ok(None)
            }
            Source::Csv(rows) => match rows.next() {
                Some(Ok(row)) => Ok(Some(row)),
                Some(Err(source)) => Err(ParseError::InvalidCsvRow {
                    line: source.position().map_or(0, |position| position.line()),
                    source,
                }),
                None => Ok(None),
            },
        }
    }
}
