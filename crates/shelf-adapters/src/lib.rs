//! Sheet source adapters: export-endpoint fetchers + row decoding.

use std::str::Lines;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::ByteRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shelf_core::{RawRow, SheetFormat, DELIMITER};
use shelf_http::{FetchError, HttpFetcher, RetryDisposition};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-adapters";

pub const DEFAULT_EXPORT_BASE_URL: &str = "https://docs.google.com";
pub const DEFAULT_API_BASE_URL: &str = "https://sheets.googleapis.com";
pub const DEFAULT_SHEET_NAME: &str = "Books";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("fetch error: {message}")]
    Fetch {
        message: String,
        status: Option<u16>,
        retryable: bool,
    },
}

impl AdapterError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Fetch { retryable: true, .. })
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        AdapterError::Fetch {
            status: err.status(),
            retryable: err.retry_disposition() == RetryDisposition::Retryable,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// Which spreadsheet and tab to read, and where the export endpoints live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetTarget {
    pub sheet_id: String,
    pub sheet_name: String,
    pub api_key: Option<String>,
    pub export_base_url: String,
    pub api_base_url: String,
}

impl SheetTarget {
    pub fn new(sheet_id: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
            api_key: None,
            export_base_url: DEFAULT_EXPORT_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }

    /// The trimmed sheet id, or a configuration error when it is empty or
    /// not a bare identifier token.
    pub fn validated_sheet_id(&self) -> Result<&str, AdapterError> {
        static TOKEN_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

        let id = self.sheet_id.trim();
        if id.is_empty() {
            return Err(AdapterError::configuration("sheet id is empty"));
        }
        if !TOKEN_RE.is_match(id) {
            return Err(AdapterError::configuration(format!(
                "sheet id `{id}` is not a bare identifier; pass the id or use extract_sheet_id on the sharing URL"
            )));
        }
        Ok(id)
    }

    fn sheet_name_or_default(&self) -> &str {
        let name = self.sheet_name.trim();
        if name.is_empty() {
            DEFAULT_SHEET_NAME
        } else {
            name
        }
    }
}

/// Extracts the sheet id from a sharing URL (`.../spreadsheets/d/<ID>/...`).
pub fn extract_sheet_id(url: &str) -> Option<String> {
    static SHEET_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"/spreadsheets/d/([A-Za-z0-9_-]+)").expect("valid regex")
    });
    SHEET_URL_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedSheet {
    pub format: SheetFormat,
    pub url: String,
    pub content_type: Option<String>,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait SheetAdapter: Send + Sync {
    fn format(&self) -> SheetFormat;

    fn export_url(&self, target: &SheetTarget) -> Result<Url, AdapterError>;

    /// Every decoded row, header included, in source order.
    fn rows<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = RawRow> + 'a>;

    /// Rejects payloads that arrived with a success status but are not sheet
    /// data (login pages, in-band query errors).
    fn check_payload(&self, _content_type: Option<&str>, _text: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Rows after the header.
    fn data_rows<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = RawRow> + 'a> {
        Box::new(self.rows(text).skip(1))
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &SheetTarget,
    ) -> Result<FetchedSheet, AdapterError> {
        let url = self.export_url(target)?;
        info!(
            run_id = %ctx.run_id,
            sheet_id = target.sheet_id.trim(),
            format = %self.format(),
            "fetching sheet export"
        );
        let resp = http
            .fetch_bytes(ctx.run_id, self.format().as_str(), url.as_str())
            .await?;
        let text = resp.text();
        self.check_payload(resp.content_type.as_deref(), &text)?;
        Ok(FetchedSheet {
            format: self.format(),
            url: resp.final_url,
            content_type: resp.content_type,
            text,
            fetched_at: resp.fetched_at,
        })
    }
}

fn append_path(url: &mut Url, segments: &[&str]) -> Result<(), AdapterError> {
    let base = url.to_string();
    url.path_segments_mut()
        .map_err(|()| AdapterError::configuration(format!("base url {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}

fn parse_base_url(base: &str) -> Result<Url, AdapterError> {
    Url::parse(base.trim())
        .map_err(|e| AdapterError::configuration(format!("invalid base url `{base}`: {e}")))
}

fn gviz_url(target: &SheetTarget, tqx: &str) -> Result<Url, AdapterError> {
    let sheet_id = target.validated_sheet_id()?;
    let mut url = parse_base_url(&target.export_base_url)?;
    append_path(&mut url, &["spreadsheets", "d", sheet_id, "gviz", "tq"])?;
    url.query_pairs_mut()
        .append_pair("tqx", tqx)
        .append_pair("sheet", target.sheet_name_or_default());
    Ok(url)
}

// ---------------------------------------------------------------------------
// Row parser
// ---------------------------------------------------------------------------

/// Lazy line-by-line CSV decoder.
///
/// Each line is decoded on its own with `csv`: a quoted span opens when `"`
/// is the first character of a field, `""` inside it is a literal quote and
/// the delimiter is content. A quote left open at the end of a line swallows
/// the rest of that line only: spans never continue onto the next line.
/// Blank lines are skipped.
pub struct CsvRows<'a> {
    lines: Lines<'a>,
    delimiter: u8,
}

impl<'a> CsvRows<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::with_delimiter(text, DELIMITER as u8)
    }

    pub fn with_delimiter(text: &'a str, delimiter: u8) -> Self {
        Self {
            lines: text.lines(),
            delimiter,
        }
    }
}

impl Iterator for CsvRows<'_> {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        let delimiter = self.delimiter;
        self.lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .map(|line| split_line(line, delimiter))
    }
}

pub fn split_line(line: &str, delimiter: u8) -> RawRow {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_reader(line.as_bytes());

    let mut record = ByteRecord::new();
    match reader.read_byte_record(&mut record) {
        Ok(true) => RawRow::new(
            record
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect(),
        ),
        Ok(false) => RawRow::default(),
        Err(err) => {
            debug!(error = %err, "undecodable line kept as one field");
            RawRow::new(vec![line.to_string()])
        }
    }
}

// ---------------------------------------------------------------------------
// JSON row decoding
// ---------------------------------------------------------------------------

fn cell_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

pub fn parse_values_rows(text: &str) -> Vec<RawRow> {
    match serde_json::from_str::<ValuesResponse>(text) {
        Ok(resp) => resp
            .values
            .iter()
            .map(|row| RawRow::new(row.iter().map(cell_to_string).collect()))
            .filter(|row| !row.is_blank())
            .collect(),
        Err(err) => {
            warn!(error = %err, "values payload is not valid JSON; treating as empty sheet");
            Vec::new()
        }
    }
}

#[derive(Debug, Deserialize)]
struct GvizResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    errors: Vec<GvizMessage>,
    table: Option<GvizTable>,
}

#[derive(Debug, Deserialize)]
struct GvizMessage {
    #[serde(default)]
    message: String,
    #[serde(default)]
    detailed_message: String,
}

#[derive(Debug, Deserialize)]
struct GvizTable {
    #[serde(default)]
    cols: Vec<GvizColumn>,
    #[serde(default)]
    rows: Vec<GvizRow>,
}

#[derive(Debug, Deserialize)]
struct GvizColumn {
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct GvizRow {
    #[serde(default)]
    c: Vec<Option<GvizCell>>,
}

#[derive(Debug, Deserialize)]
struct GvizCell {
    #[serde(default)]
    v: JsonValue,
    f: Option<String>,
}

/// Strips the `google.visualization.Query.setResponse(...)` wrapper.
fn gviz_json_body(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn parse_gviz(text: &str) -> Option<GvizResponse> {
    let body = gviz_json_body(text)?;
    match serde_json::from_str(body) {
        Ok(resp) => Some(resp),
        Err(err) => {
            warn!(error = %err, "gviz payload is not valid JSON; treating as empty sheet");
            None
        }
    }
}

/// Column labels become the header row when the export detected one;
/// otherwise the header is the first data row, as in CSV.
pub fn parse_gviz_rows(text: &str) -> Vec<RawRow> {
    let Some(table) = parse_gviz(text).and_then(|resp| resp.table) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(table.rows.len() + 1);
    if table.cols.iter().any(|c| !c.label.trim().is_empty()) {
        out.push(RawRow::new(table.cols.iter().map(|c| c.label.clone()).collect()));
    }
    for row in &table.rows {
        let fields = row
            .c
            .iter()
            .map(|cell| match cell {
                Some(GvizCell { f: Some(formatted), .. }) => formatted.clone(),
                Some(GvizCell { v, .. }) => cell_to_string(v),
                None => String::new(),
            })
            .collect();
        let row = RawRow::new(fields);
        if !row.is_blank() {
            out.push(row);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExportAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct ValuesApiAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct GvizJsonAdapter;

#[async_trait]
impl SheetAdapter for CsvExportAdapter {
    fn format(&self) -> SheetFormat {
        SheetFormat::Csv
    }

    fn export_url(&self, target: &SheetTarget) -> Result<Url, AdapterError> {
        gviz_url(target, "out:csv")
    }

    fn rows<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = RawRow> + 'a> {
        Box::new(CsvRows::new(text))
    }

    fn check_payload(&self, content_type: Option<&str>, _text: &str) -> Result<(), AdapterError> {
        if content_type.is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html")) {
            return Err(AdapterError::Fetch {
                message: "export returned an HTML page instead of CSV; is the sheet shared with anyone who has the link?"
                    .to_string(),
                status: Some(200),
                retryable: false,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SheetAdapter for ValuesApiAdapter {
    fn format(&self) -> SheetFormat {
        SheetFormat::ValuesApi
    }

    fn export_url(&self, target: &SheetTarget) -> Result<Url, AdapterError> {
        let sheet_id = target.validated_sheet_id()?;
        let api_key = target
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AdapterError::configuration("values-api format requires an API key"))?;
        let mut url = parse_base_url(&target.api_base_url)?;
        append_path(
            &mut url,
            &["v4", "spreadsheets", sheet_id, "values", target.sheet_name_or_default()],
        )?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    fn rows<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = RawRow> + 'a> {
        Box::new(parse_values_rows(text).into_iter())
    }
}

#[async_trait]
impl SheetAdapter for GvizJsonAdapter {
    fn format(&self) -> SheetFormat {
        SheetFormat::GvizJson
    }

    fn export_url(&self, target: &SheetTarget) -> Result<Url, AdapterError> {
        gviz_url(target, "out:json")
    }

    fn rows<'a>(&self, text: &'a str) -> Box<dyn Iterator<Item = RawRow> + 'a> {
        Box::new(parse_gviz_rows(text).into_iter())
    }

    fn check_payload(&self, _content_type: Option<&str>, text: &str) -> Result<(), AdapterError> {
        let Some(resp) = parse_gviz(text) else {
            return Ok(());
        };
        if !resp.status.eq_ignore_ascii_case("error") {
            return Ok(());
        }
        let message = resp
            .errors
            .iter()
            .map(|e| {
                if e.detailed_message.trim().is_empty() {
                    e.message.trim()
                } else {
                    e.detailed_message.trim()
                }
            })
            .find(|m| !m.is_empty())
            .unwrap_or("sheet query failed")
            .to_string();
        Err(AdapterError::Fetch {
            message,
            status: Some(200),
            retryable: false,
        })
    }
}

pub fn adapter_for_format(format: SheetFormat) -> Box<dyn SheetAdapter> {
    match format {
        SheetFormat::Csv => Box::new(CsvExportAdapter),
        SheetFormat::ValuesApi => Box::new(ValuesApiAdapter),
        SheetFormat::GvizJson => Box::new(GvizJsonAdapter),
    }
}
