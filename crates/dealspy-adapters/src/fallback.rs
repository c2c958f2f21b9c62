//! Generative extraction for pages whose structured parser found nothing.

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealspy_core::{Country, ScrapedListing, Source, DEFAULT_CURRENCY};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::model::{complete_within, TextModel};
use crate::normalize::{generate_source_id, parse_price, truncate_chars};

pub const MAX_CONTENT_CHARS: usize = 80_000;
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";
pub const MAX_TITLE_CHARS: usize = 500;
const MAX_RESPONSE_TOKENS: u32 = 4096;

/// One page handed to the extractor.
#[derive(Debug, Clone, Copy)]
pub struct FallbackRequest<'a> {
    pub source: Source,
    pub country: Country,
    pub base_url: &'a str,
    pub content: &'a str,
}

/// Never fails: any error is logged and yields an empty list.
#[async_trait]
pub trait FallbackExtractor: Send + Sync {
    async fn extract(&self, request: FallbackRequest<'_>) -> Vec<ScrapedListing>;
}

/// Used when fallback extraction is switched off or no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledExtractor;

#[async_trait]
impl FallbackExtractor for DisabledExtractor {
    async fn extract(&self, _request: FallbackRequest<'_>) -> Vec<ScrapedListing> {
        Vec::new()
    }
}

pub struct GenerativeExtractor {
    model: Arc<dyn TextModel>,
    timeout: Duration,
}

impl GenerativeExtractor {
    pub fn new(model: Arc<dyn TextModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }
}

#[async_trait]
impl FallbackExtractor for GenerativeExtractor {
    async fn extract(&self, request: FallbackRequest<'_>) -> Vec<ScrapedListing> {
        if request.content.trim().is_empty() {
            return Vec::new();
        }
        let prompt = build_prompt(request.source, request.base_url, &truncate_content(request.content));
        let text = match complete_within(self.model.as_ref(), &prompt, MAX_RESPONSE_TOKENS, self.timeout).await {
            Ok(text) => text,
            Err(err) => {
                warn!(source = %request.source, error = %err, "fallback extraction call failed");
                return Vec::new();
            }
        };
        match parse_extraction_response(&text, request.source, request.base_url, request.country) {
            Ok(listings) => {
                if !listings.is_empty() {
                    info!(source = %request.source, count = listings.len(), "fallback extraction produced listings");
                }
                listings
            }
            Err(err) => {
                warn!(source = %request.source, error = %err, "fallback extraction response unparseable");
                Vec::new()
            }
        }
    }
}

pub fn truncate_content(content: &str) -> Cow<'_, str> {
    let head = truncate_chars(content, MAX_CONTENT_CHARS);
    if head.len() == content.len() {
        Cow::Borrowed(content)
    } else {
        Cow::Owned(format!("{head}{TRUNCATION_MARKER}"))
    }
}

pub fn build_prompt(source: Source, base_url: &str, content: &str) -> String {
    format!(
        r#"You are extracting auction/listing items from a scraped HTML page. The page is from source "{source}" (base URL: {base_url}).

Extract every listing or auction item you can find. For each item provide:
- title: short title (required)
- url: full URL to the detail page (required). If the HTML has relative URLs, prepend base URL: {base_url}
- price: number only if visible (optional)
- currency: e.g. EUR, HUF (optional)
- deadline: ISO date string YYYY-MM-DD if visible (optional)

Respond with a valid JSON array only, no other text. Example:
[{{"title":"Auction item 1","url":"https://...","price":1000,"currency":"EUR","deadline":"2026-03-01"}},{{"title":"Item 2","url":"https://..."}}]

HTML (may be truncated):
{content}"#
    )
}

/// The bracketed span from the first `[` to the last `]`, or the whole text.
fn json_array_span(text: &str) -> &str {
    match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn absolutize(base_url: &str, url: &str) -> String {
    if url.starts_with("http") {
        return url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

fn json_price(value: Option<&JsonValue>) -> Option<Decimal> {
    match value? {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    }
}

fn json_deadline(value: Option<&JsonValue>) -> Option<chrono::NaiveDate> {
    let text = value?.as_str()?.trim();
    chrono::NaiveDate::parse_from_str(truncate_chars(text, 10), "%Y-%m-%d").ok()
}

/// Turns a model response into listings. Items without a title or url are dropped.
pub fn parse_extraction_response(
    text: &str,
    source: Source,
    base_url: &str,
    country: Country,
) -> Result<Vec<ScrapedListing>, serde_json::Error> {
    let items: Vec<JsonValue> = serde_json::from_str(json_array_span(text))?;
    let mut out = Vec::new();
    for item in &items {
        let title = item.get("title").and_then(JsonValue::as_str).map(str::trim).unwrap_or("");
        let url = item.get("url").and_then(JsonValue::as_str).map(str::trim).unwrap_or("");
        if title.is_empty() || url.is_empty() {
            continue;
        }
        let url = absolutize(base_url, url);
        let currency = item
            .get("currency")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CURRENCY);

        let mut listing = ScrapedListing::new(
            source,
            generate_source_id(&url),
            truncate_chars(title, MAX_TITLE_CHARS),
            url,
            country,
        );
        listing.price = json_price(item.get("price"));
        listing.currency = Some(currency.to_uppercase());
        listing.deadline = json_deadline(item.get("deadline"));
        listing
            .raw
            .insert("extracted_by".into(), JsonValue::String("fallback".into()));
        out.push(listing);
    }
    Ok(out)
}
