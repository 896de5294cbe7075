//! Core domain model for the SheetShelf book catalog.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-core";

/// Field delimiter of the tabular export.
pub const DELIMITER: char = ',';

/// Which export endpoint of the spreadsheet a fetch goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SheetFormat {
    #[default]
    Csv,
    ValuesApi,
    GvizJson,
}

impl SheetFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SheetFormat::Csv => "csv",
            SheetFormat::ValuesApi => "values-api",
            SheetFormat::GvizJson => "gviz-json",
        }
    }
}

impl fmt::Display for SheetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SheetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SheetFormat::Csv),
            "values-api" | "values_api" | "values" => Ok(SheetFormat::ValuesApi),
            "gviz-json" | "gviz_json" | "gviz" => Ok(SheetFormat::GvizJson),
            other => Err(format!(
                "unknown sheet format `{other}` (expected csv, values-api or gviz-json)"
            )),
        }
    }
}

/// One decoded source row. Positions carry no meaning until normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub fields: Vec<String>,
}

impl RawRow {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Field at `index`, or `""` when the row is too short.
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// No fields, or only whitespace ones.
    pub fn is_blank(&self) -> bool {
        self.fields.iter().all(|f| f.trim().is_empty())
    }
}

impl From<Vec<String>> for RawRow {
    fn from(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

impl<'a> From<Vec<&'a str>> for RawRow {
    fn from(fields: Vec<&'a str>) -> Self {
        Self {
            fields: fields.into_iter().map(ToString::to_string).collect(),
        }
    }
}

/// Normalized entry that has not been deduplicated or numbered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    pub author: String,
    pub description: String,
    pub cover_url: String,
    pub rating: f64,
    pub source_url: String,
    pub genre: String,
}

impl CandidateRecord {
    pub fn into_book(self, id: u32) -> BookRecord {
        BookRecord {
            id,
            title: self.title,
            author: self.author,
            description: self.description,
            cover_url: self.cover_url,
            rating: self.rating,
            source_url: self.source_url,
            genre: self.genre,
        }
    }
}

/// Book as handed to rendering consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    pub id: u32,
    pub title: String,
    pub author: String,
    pub description: String,
    pub cover_url: String,
    pub rating: f64,
    pub source_url: String,
    #[serde(default)]
    pub genre: String,
}

/// Per-run counters of the ingestion stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub raw_rows: usize,
    pub rejected_rows: usize,
    pub duplicate_rows: usize,
    pub books: usize,
}

/// Result of one pipeline invocation. Replaced wholesale on the next fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRun {
    pub run_id: Uuid,
    pub sheet_id: String,
    pub format: SheetFormat,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: IngestStats,
    pub books: Vec<BookRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_rows_read_as_empty_fields() {
        let row = RawRow::from(vec!["Dune", "Frank Herbert"]);
        assert_eq!(row.field(0), "Dune");
        assert_eq!(row.field(1), "Frank Herbert");
        assert_eq!(row.field(5), "");
        assert_eq!(row.len(), 2);
        assert!(!row.is_blank());
        assert!(RawRow::default().is_blank());
        assert!(RawRow::from(vec!["", "  "]).is_blank());
    }

    #[test]
    fn book_record_uses_camel_case_keys() {
        let book = CandidateRecord {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            description: String::new(),
            cover_url: "https://example.com/dune.jpg".into(),
            rating: 4.5,
            source_url: "#".into(),
            genre: String::new(),
        }
        .into_book(1);

        let value = serde_json::to_value(&book).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["coverUrl"], "https://example.com/dune.jpg");
        assert_eq!(value["sourceUrl"], "#");
        assert!(value.get("cover_url").is_none());
    }

    #[test]
    fn sheet_format_parses_cli_spellings() {
        assert_eq!("csv".parse::<SheetFormat>().unwrap(), SheetFormat::Csv);
        assert_eq!("Values-API".parse::<SheetFormat>().unwrap(), SheetFormat::ValuesApi);
        assert_eq!("gviz".parse::<SheetFormat>().unwrap(), SheetFormat::GvizJson);
        assert!("xlsx".parse::<SheetFormat>().is_err());
        assert_eq!(SheetFormat::GvizJson.to_string(), "gviz-json");
    }
}
