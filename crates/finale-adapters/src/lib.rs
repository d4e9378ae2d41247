//! Status source adapters: turn a fetched listing into scraped status entries.

use finale_core::{ScrapedStatusEntry, TrailStatus};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "finale-adapters";

pub const FINALEOUTDOOR_SOURCE_ID: &str = "finaleoutdoor";
pub const FINALEOUTDOOR_LISTING_URL: &str = "https://www.finaleoutdoor.com/en/get_include/LIST_TRAILS_AJAX/?passion=PASSION_BIKE_MTB|prefisso_tipo=SPORT_TIPO_BIKE_";
pub const FINALEOUTDOOR_NOTE: &str = "Auto-updated from finaleoutdoor.com";

/// Characters of raw input kept in an extraction diagnostic.
pub const DIAGNOSTIC_SAMPLE_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid block selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("no status/title pairs found in {bytes} bytes of listing markup")]
    NoEntries { bytes: usize, sample: String },
}

impl ExtractionError {
    /// Leading slice of the offending document, if any.
    pub fn sample(&self) -> Option<&str> {
        match self {
            Self::NoEntries { sample, .. } => Some(sample),
            Self::Selector { .. } => None,
        }
    }
}

/// CSS selectors for the two block kinds of the listing. Markup drift on the
/// source site should only ever require touching these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSelectors {
    pub status_block: String,
    pub title_block: String,
}

impl Default for BlockSelectors {
    fn default() -> Self {
        Self {
            status_block: "div.list-data.list-state".to_string(),
            title_block: "div.list-data.trail-title".to_string(),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Two-stage listing parser: select status and title blocks structurally,
/// then pair each status block with the title block right after it.
#[derive(Debug, Clone)]
pub struct StatusExtractor {
    status_block: Selector,
    title_block: Selector,
}

impl StatusExtractor {
    pub fn new(selectors: &BlockSelectors) -> Result<Self, ExtractionError> {
        Ok(Self {
            status_block: parse_selector(&selectors.status_block)?,
            title_block: parse_selector(&selectors.title_block)?,
        })
    }

    pub fn extract(&self, raw_html: &str) -> Result<Vec<ScrapedStatusEntry>, ExtractionError> {
        let document = Html::parse_document(raw_html);
        let mut entries = Vec::new();

        for block in document.select(&self.status_block) {
            let Some(status) = trailing_status(block) else {
                debug!("status block without Open/Closed text");
                continue;
            };
            let Some(title) = next_element_sibling(block) else {
                continue;
            };
            if !self.title_block.matches(&title) {
                continue;
            }
            let Some(name) = block_text(title) else {
                continue;
            };
            entries.push(ScrapedStatusEntry { name, status });
        }

        if entries.is_empty() {
            return Err(ExtractionError::NoEntries {
                bytes: raw_html.len(),
                sample: diagnostic_sample(raw_html),
            });
        }
        Ok(entries)
    }
}

/// Status word closing the block; icons or notice links may precede it.
fn trailing_status(block: ElementRef<'_>) -> Option<TrailStatus> {
    block
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last()?
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}

fn next_element_sibling(block: ElementRef<'_>) -> Option<ElementRef<'_>> {
    block.next_siblings().find_map(ElementRef::wrap)
}

fn block_text(block: ElementRef<'_>) -> Option<String> {
    let text = block.text().collect::<String>();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn diagnostic_sample(raw: &str) -> String {
    raw.chars().take(DIAGNOSTIC_SAMPLE_CHARS).collect()
}

/// A site publishing trail status listings.
pub trait StatusAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    /// Listing fetched when no URL override is configured.
    fn listing_url(&self) -> &'static str;
    /// Provenance note attached to every status row written from this source.
    fn provenance_note(&self) -> &'static str;
    fn extract(&self, raw_html: &str) -> Result<Vec<ScrapedStatusEntry>, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct FinaleOutdoorAdapter {
    extractor: StatusExtractor,
}

impl FinaleOutdoorAdapter {
    pub fn new() -> Result<Self, ExtractionError> {
        Self::with_selectors(&BlockSelectors::default())
    }

    pub fn with_selectors(selectors: &BlockSelectors) -> Result<Self, ExtractionError> {
        Ok(Self {
            extractor: StatusExtractor::new(selectors)?,
        })
    }
}

impl StatusAdapter for FinaleOutdoorAdapter {
    fn source_id(&self) -> &'static str {
        FINALEOUTDOOR_SOURCE_ID
    }

    fn listing_url(&self) -> &'static str {
        FINALEOUTDOOR_LISTING_URL
    }

    fn provenance_note(&self) -> &'static str {
        FINALEOUTDOOR_NOTE
    }

    fn extract(&self, raw_html: &str) -> Result<Vec<ScrapedStatusEntry>, ExtractionError> {
        self.extractor.extract(raw_html)
    }
}

/// Adapter registered under `source_id`, built with `selectors`. `None` for
/// sources this crate does not know.
pub fn adapter_for_source(
    source_id: &str,
    selectors: &BlockSelectors,
) -> Result<Option<Box<dyn StatusAdapter>>, ExtractionError> {
    match source_id {
        FINALEOUTDOOR_SOURCE_ID => Ok(Some(Box::new(FinaleOutdoorAdapter::with_selectors(selectors)?))),
        _ => Ok(None),
    }
}
