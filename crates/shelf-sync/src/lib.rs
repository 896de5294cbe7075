//! Catalog pipeline: fetch → parse → normalize → dedupe → assemble.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shelf_adapters::{
    adapter_for_format, extract_sheet_id, AdapterContext, AdapterError, SheetTarget,
    DEFAULT_API_BASE_URL, DEFAULT_EXPORT_BASE_URL, DEFAULT_SHEET_NAME,
};
use shelf_core::{
    BookRecord, CandidateRecord, CatalogRun, IngestStats, RawRow, SheetFormat, DELIMITER,
};
use shelf_http::{HttpClientConfig, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-sync";

pub const PLACEHOLDER_COVER_URL: &str = "https://picsum.photos/seed/default/300/450";
pub const FALLBACK_SOURCE_URL: &str = "#";
pub const THUMBNAIL_SIZE: &str = "w1000";
pub const MAX_RATING: f64 = 5.0;

const HEADER_TITLE_LABEL: &str = "title";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Bare sheet id or a full sharing URL.
    pub sheet_id: String,
    pub sheet_name: String,
    pub format: SheetFormat,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub export_base_url: String,
    pub api_base_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            sheet_id: String::new(),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
            format: SheetFormat::Csv,
            api_key: None,
            user_agent: "sheetshelf/0.1".to_string(),
            export_base_url: DEFAULT_EXPORT_BASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

impl CatalogConfig {
    pub fn new(sheet_id: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catalog config yaml")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `SHELF_*` variables on top of `self`; unset or blank ones are ignored.
    pub fn with_env_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SHELF_SHEET_ID") {
            self.sheet_id = v;
        }
        if let Some(v) = var("SHELF_SHEET_NAME") {
            self.sheet_name = v;
        }
        if let Some(v) = var("SHELF_FORMAT") {
            match v.parse() {
                Ok(format) => self.format = format,
                Err(err) => warn!(%err, "ignoring SHELF_FORMAT"),
            }
        }
        if let Some(v) = var("SHELF_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = var("SHELF_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = var("SHELF_EXPORT_BASE_URL") {
            self.export_base_url = v;
        }
        if let Some(v) = var("SHELF_API_BASE_URL") {
            self.api_base_url = v;
        }
        self
    }

    pub fn target(&self) -> SheetTarget {
        let sheet_id =
            extract_sheet_id(&self.sheet_id).unwrap_or_else(|| self.sheet_id.trim().to_string());
        SheetTarget {
            sheet_id,
            sheet_name: self.sheet_name.clone(),
            api_key: self.api_key.clone(),
            export_base_url: self.export_base_url.clone(),
            api_base_url: self.api_base_url.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Field normalizer
// ---------------------------------------------------------------------------

fn looks_like_artifact(value: &str) -> bool {
    value.starts_with(DELIMITER)
}

fn is_rejected_title(title: &str) -> bool {
    title.is_empty() || title.eq_ignore_ascii_case(HEADER_TITLE_LABEL) || looks_like_artifact(title)
}

/// Maps a cover cell to a displayable image URL.
///
/// Drive share links (`/file/d/<ID>/view`, `open?id=<ID>`, `uc?id=<ID>`) become
/// the direct thumbnail form; anything else is assumed to be an image URL.
pub fn resolve_cover_url(raw: &str) -> String {
    static THUMBNAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^https?://drive\.google\.com/thumbnail\?").expect("valid regex")
    });
    static SHARE_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^https?://(?:drive|docs)\.google\.com/").expect("valid regex")
    });
    static FILE_PATH_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("valid regex"));
    static ID_PARAM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("valid regex"));

    let url: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if url.is_empty() {
        return PLACEHOLDER_COVER_URL.to_string();
    }
    if THUMBNAIL_RE.is_match(&url) || !SHARE_HOST_RE.is_match(&url) {
        return url;
    }

    let file_id = FILE_PATH_RE
        .captures(&url)
        .or_else(|| ID_PARAM_RE.captures(&url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    match file_id {
        Some(id) => format!("https://drive.google.com/thumbnail?id={id}&sz={THUMBNAIL_SIZE}"),
        None => url,
    }
}

/// Keeps digits and `.` only; anything unparsable or outside `[0, 5]` is `0`.
pub fn parse_rating(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && (0.0..=MAX_RATING).contains(v))
        .unwrap_or(0.0)
}

pub fn normalize_source_url(raw: &str) -> String {
    let url = raw.trim();
    if url.is_empty() || looks_like_artifact(url) {
        FALLBACK_SOURCE_URL.to_string()
    } else {
        url.to_string()
    }
}

/// Positional columns: title, author, description, coverUrl, rating,
/// sourceUrl, genre. Returns `None` for rows that are not books.
pub fn normalize_row(row: &RawRow) -> Option<CandidateRecord> {
    let title = row.field(0).trim();
    if is_rejected_title(title) {
        return None;
    }
    Some(CandidateRecord {
        title: title.to_string(),
        author: row.field(1).trim().to_string(),
        description: row.field(2).trim().to_string(),
        cover_url: resolve_cover_url(row.field(3).trim()),
        rating: parse_rating(row.field(4).trim()),
        source_url: normalize_source_url(row.field(5)),
        genre: row.field(6).trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Deduplicator + assembler
// ---------------------------------------------------------------------------

/// Keeps the first record per title, in order. Returns the survivors and the
/// number of dropped duplicates.
pub fn dedupe_by_title(candidates: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, usize) {
    let mut seen = HashSet::with_capacity(candidates.len());
    let before = candidates.len();
    let kept: Vec<CandidateRecord> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.title.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

pub fn assemble(candidates: Vec<CandidateRecord>) -> Vec<BookRecord> {
    candidates
        .into_iter()
        .zip(1u32..)
        .map(|(candidate, id)| candidate.into_book(id))
        .collect()
}

/// The total part of the pipeline: never fails once rows are available.
pub fn build_books(rows: impl IntoIterator<Item = RawRow>) -> (Vec<BookRecord>, IngestStats) {
    let mut stats = IngestStats::default();
    let mut candidates = Vec::new();
    for row in rows {
        stats.raw_rows += 1;
        match normalize_row(&row) {
            Some(candidate) => candidates.push(candidate),
            None => stats.rejected_rows += 1,
        }
    }

    let (candidates, duplicates) = dedupe_by_title(candidates);
    stats.duplicate_rows = duplicates;
    let books = assemble(candidates);
    stats.books = books.len();

    debug!(
        raw_rows = stats.raw_rows,
        rejected_rows = stats.rejected_rows,
        duplicate_rows = stats.duplicate_rows,
        books = stats.books,
        "catalog assembled"
    );
    (books, stats)
}

/// Runs parse → normalize → dedupe → assemble over an already-fetched payload.
pub fn build_books_from_text(format: SheetFormat, text: &str) -> (Vec<BookRecord>, IngestStats) {
    let adapter = adapter_for_format(format);
    build_books(adapter.data_rows(text))
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct CatalogPipeline {
    config: CatalogConfig,
    http: HttpFetcher,
}

impl CatalogPipeline {
    pub fn new(config: CatalogConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// One fetch and one fresh catalog. Configuration problems are reported
    /// before any request is made.
    pub async fn run_once(&self) -> Result<CatalogRun, AdapterError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let target = self.config.target();
        let sheet_id = target.validated_sheet_id()?.to_string();
        let adapter = adapter_for_format(self.config.format);

        let fetched = adapter
            .fetch(&self.http, &AdapterContext { run_id }, &target)
            .await?;
        debug!(
            url = %fetched.url,
            content_type = fetched.content_type.as_deref().unwrap_or(""),
            fetched_at = %fetched.fetched_at,
            bytes = fetched.text.len(),
            "sheet payload received"
        );
        let (books, stats) = build_books(adapter.data_rows(&fetched.text));

        info!(
            %run_id,
            sheet_id = %sheet_id,
            format = %self.config.format,
            books = stats.books,
            rejected_rows = stats.rejected_rows,
            duplicate_rows = stats.duplicate_rows,
            "catalog run complete"
        );

        Ok(CatalogRun {
            run_id,
            sheet_id,
            format: self.config.format,
            started_at,
            finished_at: Utc::now(),
            stats,
            books,
        })
    }
}

pub async fn run_once_from_env() -> Result<CatalogRun> {
    let pipeline = CatalogPipeline::new(CatalogConfig::from_env())?;
    Ok(pipeline.run_once().await?)
}
