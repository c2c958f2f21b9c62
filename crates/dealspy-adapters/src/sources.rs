//! Structured listing parsers for each supported source.

use std::collections::HashSet;
use std::sync::LazyLock;

use dealspy_core::{Country, ScrapedListing, Source};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::normalize::{clean_text, generate_source_id, parse_date, parse_price, resolve_url, truncate_chars};
use crate::AdapterError;

const MIN_LINK_TEXT_CHARS: usize = 3;
const LOOSE_LINK_TEXT_CHARS: std::ops::RangeInclusive<usize> = 5..=200;
const MAX_TITLE_CHARS: usize = 500;

static PRICE_WITH_CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d\s.,]*)\s*(Ft|HUF|EUR|€)").expect("price regex is valid")
});
static LABELLED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[:\s]*(\d{4}[-./]\d{2}[-./]\d{2})").expect("date regex is valid")
});
static DOTTED_DATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}\.\d{2}\.\d{4}").expect("date regex is valid"));
static EDICT_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Versteigerung|Insolvenz|Exekution").expect("edict regex is valid")
});
static BUILD_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year regex is valid"));

/// A fetched listing page.
#[derive(Debug, Clone, Copy)]
pub struct ListingPage<'a> {
    pub url: &'a str,
    pub body: &'a str,
}

/// Structured parser for one source. Constructed once and shared across runs.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;
    fn country(&self) -> Country;
    fn base_url(&self) -> &str;
    fn listing_urls(&self) -> Vec<String>;
    fn parse_listing(&self, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError>;
}

/// Repeating item containers carrying title, link, price, and sometimes deadline or image.
#[derive(Debug, Clone, Copy)]
pub struct CardLayout {
    pub item: &'static str,
    pub title: &'static str,
    pub href_contains: &'static str,
    pub default_currency: &'static str,
    pub deadline_label: Option<&'static str>,
    pub location: Option<&'static str>,
    pub record_year: bool,
}

/// Plain anchors whose href names a lot or auction.
#[derive(Debug, Clone, Copy)]
pub struct LinkLayout {
    pub path_prefixes: &'static [&'static str],
    pub keywords: &'static [&'static str],
    /// Second pass over any href when the first found nothing.
    pub loose_keywords: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub enum PageLayout {
    Cards(CardLayout),
    Links(LinkLayout),
    /// Court edict search results: one `tr.result` row per edict.
    CourtEdicts,
    /// Insolvency announcement table: court, case number, debtor, type, date.
    CaseTable,
}

#[derive(Debug, Clone)]
pub struct ProfileAdapter {
    source: Source,
    country: Country,
    base_url: &'static str,
    listing_urls: Vec<String>,
    layout: PageLayout,
}

impl ProfileAdapter {
    /// Replaces the default listing pages, e.g. from the source registry.
    pub fn with_listing_urls(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.listing_urls = urls;
        }
        self
    }

    fn listing(&self, source_id: String, title: &str, url: String) -> ScrapedListing {
        ScrapedListing::new(
            self.source,
            source_id,
            truncate_chars(title, MAX_TITLE_CHARS),
            url,
            self.country,
        )
    }

    fn parse_cards(&self, layout: &CardLayout, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError> {
        let document = Html::parse_document(page.body);
        let item_sel = selector(layout.item)?;
        let title_sel = selector(layout.title)?;
        let link_sel = selector("a[href]")?;
        let img_sel = selector("img[src]")?;
        let location_sel = layout.location.map(selector).transpose()?;

        let mut out = Vec::new();
        for item in document.select(&item_sel) {
            let Some(title) = item.select(&title_sel).next().map(element_text).filter(|t| !t.is_empty()) else {
                continue;
            };
            let Some(url) = item
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .find(|href| href.contains(layout.href_contains))
                .and_then(|href| resolve_url(self.base_url, href))
            else {
                continue;
            };

            let text = element_text(item);
            let mut listing = self.listing(generate_source_id(&url), &title, url);
            listing.currency = Some(layout.default_currency.to_string());
            if let Some(caps) = PRICE_WITH_CURRENCY.captures(&text) {
                listing.price = parse_price(&caps[1]);
                listing.currency = Some(currency_code(&caps[2]).to_string());
            }
            if let Some(label) = layout.deadline_label {
                listing.deadline = labelled_date(&text, label);
            }
            listing.image_url = item
                .select(&img_sel)
                .filter_map(|img| img.value().attr("src"))
                .find(|src| is_image_path(src))
                .and_then(|src| resolve_url(self.base_url, src));
            if let Some(sel) = &location_sel {
                if let Some(location) = item.select(sel).next().map(element_text).filter(|l| !l.is_empty()) {
                    if let Some(country) = country_from_location(&location) {
                        listing.country = country;
                    }
                    listing.raw.insert("location".into(), JsonValue::String(location));
                }
            }
            if layout.record_year {
                if let Some(year) = BUILD_YEAR.captures(&text).map(|c| c[1].to_string()) {
                    listing.description = Some(format!("Year: {year}"));
                    listing.raw.insert("year".into(), JsonValue::String(year));
                }
            }
            listing
                .raw
                .insert("listing_page".into(), JsonValue::String(page.url.to_string()));
            out.push(listing);
        }
        Ok(out)
    }

    fn parse_links(&self, layout: &LinkLayout, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError> {
        let document = Html::parse_document(page.body);
        let link_sel = selector("a[href]")?;
        let page_key = page.url.trim_end_matches('/');
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for anchor in document.select(&link_sel) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            let on_site = layout.path_prefixes.iter().any(|p| href.starts_with(p)) || href.starts_with(self.base_url);
            if !on_site || !contains_any(href, layout.keywords) {
                continue;
            }
            let Some(url) = resolve_url(self.base_url, href) else {
                continue;
            };
            if url.trim_end_matches('/') == page_key || seen.contains(&url) {
                continue;
            }
            let text = element_text(anchor);
            if text.chars().count() < MIN_LINK_TEXT_CHARS {
                continue;
            }
            seen.insert(url.clone());
            out.push(self.link_listing(&text, url));
        }

        if out.is_empty() {
            for anchor in document.select(&link_sel) {
                let Some(href) = anchor.value().attr("href").map(str::trim) else {
                    continue;
                };
                if !contains_any(href, layout.loose_keywords) {
                    continue;
                }
                let text = element_text(anchor);
                if !LOOSE_LINK_TEXT_CHARS.contains(&text.chars().count()) {
                    continue;
                }
                let Some(url) = resolve_url(self.base_url, href) else {
                    continue;
                };
                if url.trim_end_matches('/') == page_key || !seen.insert(url.clone()) {
                    continue;
                }
                out.push(self.link_listing(&text, url));
            }
        }
        Ok(out)
    }

    fn link_listing(&self, text: &str, url: String) -> ScrapedListing {
        let mut listing = self.listing(generate_source_id(&url), text, url);
        listing.currency = Some("EUR".to_string());
        listing
    }

    fn parse_court_edicts(&self, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError> {
        let document = Html::parse_document(page.body);
        let row_sel = selector(r#"tr[class*="result"]"#)?;
        let link_sel = selector("a[href]")?;

        let mut out = Vec::new();
        for row in document.select(&row_sel) {
            let Some(anchor) = row.select(&link_sel).next() else {
                continue;
            };
            let title = element_text(anchor);
            let Some(url) = anchor
                .value()
                .attr("href")
                .and_then(|href| resolve_url(self.base_url, href))
            else {
                continue;
            };
            if title.is_empty() {
                continue;
            }
            let text = element_text(row);
            let kind = EDICT_TYPE
                .find(&text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "other".to_string());

            let mut listing = self.listing(generate_source_id(&url), &title, url);
            listing.deadline = DOTTED_DATE_TOKEN.find(&text).and_then(|m| parse_date(m.as_str()));
            listing.description = Some(format!("Type: {kind}"));
            listing.raw.insert("type".into(), JsonValue::String(kind));
            out.push(listing);
        }
        Ok(out)
    }

    fn parse_case_table(&self, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError> {
        let document = Html::parse_document(page.body);
        let row_sel = selector("tr")?;
        let header_sel = selector("th")?;
        let cell_sel = selector("td")?;
        let link_sel = selector("a[href]")?;

        let mut out = Vec::new();
        for row in document.select(&row_sel) {
            if row.select(&header_sel).next().is_some() {
                continue;
            }
            let cells: Vec<String> = row.select(&cell_sel).map(element_text).collect();
            if cells.len() < 3 {
                continue;
            }
            let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or("");
            let (court, case_number, name, kind, date) = (cell(0), cell(1), cell(2), cell(3), cell(4));
            if name.is_empty() {
                continue;
            }
            let link = row
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .find(|href| href.to_ascii_lowercase().contains("bekanntmachung"))
                .and_then(|href| resolve_url(self.base_url, href));
            let url = match link {
                Some(url) => url,
                None if !case_number.is_empty() => match case_search_url(self.base_url, case_number) {
                    Some(url) => url,
                    None => continue,
                },
                None => continue,
            };

            let title = if kind.is_empty() {
                name.to_string()
            } else {
                format!("{kind}: {name}")
            };
            let source_id = if case_number.is_empty() {
                generate_source_id(&url)
            } else {
                case_number.to_string()
            };
            let mut listing = self.listing(source_id, &title, url);
            listing.description = Some(format!("Gericht: {court}, Aktenzeichen: {case_number}"));
            listing.deadline = parse_date(date);
            listing.raw.insert("court".into(), JsonValue::String(court.to_string()));
            listing
                .raw
                .insert("case_number".into(), JsonValue::String(case_number.to_string()));
            listing.raw.insert("type".into(), JsonValue::String(kind.to_string()));
            out.push(listing);
        }
        Ok(out)
    }
}

impl SourceAdapter for ProfileAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn country(&self) -> Country {
        self.country
    }

    fn base_url(&self) -> &str {
        self.base_url
    }

    fn listing_urls(&self) -> Vec<String> {
        self.listing_urls.clone()
    }

    fn parse_listing(&self, page: &ListingPage<'_>) -> Result<Vec<ScrapedListing>, AdapterError> {
        match &self.layout {
            PageLayout::Cards(layout) => self.parse_cards(layout, page),
            PageLayout::Links(layout) => self.parse_links(layout, page),
            PageLayout::CourtEdicts => self.parse_court_edicts(page),
            PageLayout::CaseTable => self.parse_case_table(page),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

fn contains_any(href: &str, keywords: &[&str]) -> bool {
    let lower = href.to_ascii_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

fn currency_code(marker: &str) -> &'static str {
    match marker.to_ascii_uppercase().as_str() {
        "FT" | "HUF" => "HUF",
        _ => "EUR",
    }
}

fn labelled_date(text: &str, label: &str) -> Option<chrono::NaiveDate> {
    let lower = text.to_lowercase();
    let start = lower.find(&label.to_lowercase())? + label.to_lowercase().len();
    let caps = LABELLED_DATE.captures(&lower[start..])?;
    parse_date(&caps[1])
}

fn is_image_path(src: &str) -> bool {
    let lower = src.to_ascii_lowercase();
    [".jpg", ".jpeg", ".png", ".webp"].iter().any(|ext| lower.contains(ext))
}

fn country_from_location(location: &str) -> Option<Country> {
    let lower = location.to_lowercase();
    if lower.contains("austria") || lower.contains("österreich") || location.contains("AT") {
        Some(Country::At)
    } else if lower.contains("hungary") || lower.contains("ungarn") || location.contains("HU") {
        Some(Country::Hu)
    } else {
        None
    }
}

fn case_search_url(base_url: &str, case_number: &str) -> Option<String> {
    let search = format!("{}/cgi-bin/bl_suche.pl", base_url.trim_end_matches('/'));
    Url::parse_with_params(&search, &[("aktenzeichen", case_number)])
        .ok()
        .map(|u| u.to_string())
}

const MACHINESEEKER_CATEGORIES: &[&str] = &["server", "cnc", "laser", "forklift", "industrial-robot"];

/// Default adapter for a source, with its built-in listing pages.
pub fn adapter_for_source(source: Source) -> ProfileAdapter {
    let (country, base_url, listing_urls, layout) = match source {
        Source::Eer => (
            Country::Hu,
            "https://eer.sztfh.hu",
            vec!["https://eer.sztfh.hu/palyazat/kereses".to_string()],
            PageLayout::Cards(CardLayout {
                item: r#"div[class*="palyazat-item"]"#,
                title: "h2, h3",
                href_contains: "palyazat",
                default_currency: "HUF",
                deadline_label: Some("határidő"),
                location: None,
                record_year: false,
            }),
        ),
        Source::Netbid => (
            Country::De,
            "https://www.netbid.com",
            vec!["https://www.netbid.com/en/auctions/".to_string()],
            PageLayout::Links(LinkLayout {
                path_prefixes: &["/en/", "/de/"],
                keywords: &["auction", "lot", "item"],
                loose_keywords: &["auction", "lot"],
            }),
        ),
        Source::Ediktsdatei => (
            Country::At,
            "https://edikte.justiz.gv.at",
            vec!["https://edikte.justiz.gv.at/edikte/ex/exedi3.nsf/suchedi?OpenForm".to_string()],
            PageLayout::CourtEdicts,
        ),
        Source::Insolvenz => (
            Country::De,
            "https://www.insolvenzbekanntmachungen.de",
            vec!["https://www.insolvenzbekanntmachungen.de/cgi-bin/bl_suche.pl?neu=1".to_string()],
            PageLayout::CaseTable,
        ),
        Source::Proventura => (
            Country::De,
            "https://www.proventura.de",
            vec!["https://www.proventura.de/de/auktionen".to_string()],
            PageLayout::Links(LinkLayout {
                path_prefixes: &["/"],
                keywords: &["auktion", "lot", "los", "item"],
                loose_keywords: &["auktion", "lot", "los"],
            }),
        ),
        Source::Machineseeker => (
            Country::De,
            "https://www.machineseeker.com",
            MACHINESEEKER_CATEGORIES
                .iter()
                .map(|c| format!("https://www.machineseeker.com/en/{c}/"))
                .collect(),
            PageLayout::Cards(CardLayout {
                item: r#"div[class*="machine-item"]"#,
                title: "h2, h3",
                href_contains: "machine",
                default_currency: "EUR",
                deadline_label: None,
                location: Some(r#"[class*="location"]"#),
                record_year: true,
            }),
        ),
    };
    ProfileAdapter {
        source,
        country,
        base_url,
        listing_urls,
        layout,
    }
}

pub fn all_adapters() -> Vec<ProfileAdapter> {
    Source::ALL.iter().copied().map(adapter_for_source).collect()
}
