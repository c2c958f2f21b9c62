//! Field normalization shared by every source parser and the fallback extractor.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use reqwest::Url;
use rust_decimal::Decimal;

static CURRENCY_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[€$£]|EUR|USD|GBP|HUF|CHF|\bFt\b").expect("currency regex is valid")
});
static DOT_THOUSANDS_COMMA_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{3})*,\d{2}$").expect("price regex is valid"));
static COMMA_THOUSANDS_DOT_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(,\d{3})*\.\d{2}$").expect("price regex is valid"));
static COMMA_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+,\d{2}$").expect("price regex is valid"));
static DOT_THOUSANDS_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(\.\d{3})+$").expect("price regex is valid"));
static COMMA_THOUSANDS_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(,\d{3})+$").expect("price regex is valid"));
static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?(\d+(\.\d+)?|\.\d+)").expect("number regex is valid"));

static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").expect("date regex is valid"));
static DOTTED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})").expect("date regex is valid"));
static SLASHED_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})").expect("date regex is valid"));

static SOURCE_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/(\d+)/?$",
        r"[?&]id=(\d+)",
        r"[?&]lot=(\d+)",
        r"/lot/(\d+)",
        r"/auction/(\d+)",
        r"/item/(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("source id regex is valid"))
    .collect()
});

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag regex is valid"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex is valid"));

/// Parses a price in any of the supported notations. Currency markers and inner
/// whitespace are ignored. Formats are tried in priority order:
/// `1.234,56`, `1,234.56`, `1234,56`, then grouped integers (`1.234`, `1,234`),
/// then the longest leading plain number.
pub fn parse_price(text: &str) -> Option<Decimal> {
    let stripped = CURRENCY_MARKERS.replace_all(text, "");
    let cleaned: String = stripped.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    let canonical = if DOT_THOUSANDS_COMMA_DECIMAL.is_match(&cleaned) {
        cleaned.replace('.', "").replace(',', ".")
    } else if COMMA_THOUSANDS_DOT_DECIMAL.is_match(&cleaned) {
        cleaned.replace(',', "")
    } else if COMMA_DECIMAL.is_match(&cleaned) {
        cleaned.replace(',', ".")
    } else if DOT_THOUSANDS_ONLY.is_match(&cleaned) {
        cleaned.replace('.', "")
    } else if COMMA_THOUSANDS_ONLY.is_match(&cleaned) {
        cleaned.replace(',', "")
    } else {
        LEADING_NUMBER.find(&cleaned)?.as_str().to_string()
    };

    Decimal::from_str(&canonical).ok()
}

/// Parses a calendar date. Tries ISO, `DD.MM.YYYY`, `DD/MM/YYYY`, then a set of
/// common textual layouts. Impossible dates yield `None`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }

    if let Some(caps) = ISO_DATE.captures(cleaned) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = DOTTED_DATE.captures(cleaned) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }
    if let Some(caps) = SLASHED_DATE.captures(cleaned) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }

    parse_date_generic(cleaned)
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn parse_date_generic(text: &str) -> Option<NaiveDate> {
    const LAYOUTS: &[&str] = &[
        "%b %d, %Y",
        "%B %d, %Y",
        "%d %b %Y",
        "%d %B %Y",
        "%Y.%m.%d",
        "%Y. %m. %d.",
        "%Y/%m/%d",
    ];
    for layout in LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(text, layout) {
            return Some(date);
        }
    }
    DateTime::parse_from_rfc2822(text)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|dt| dt.date_naive())
}

/// Stable per-source identifier for a listing URL: the first numeric id matched by a
/// known URL pattern, otherwise a 32-bit rolling hash of the whole URL.
pub fn generate_source_id(url: &str) -> String {
    for pattern in SOURCE_ID_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(url) {
            return caps[1].to_string();
        }
    }
    url_hash(url).to_string()
}

/// `h = h * 31 + unit` over UTF-16 code units with 32-bit wrap-around, absolute value.
fn url_hash(url: &str) -> i64 {
    let mut hash: i32 = 0;
    for unit in url.encode_utf16() {
        hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(i32::from(unit));
    }
    i64::from(hash).abs()
}

/// Strips tags, decodes the common entities and collapses whitespace.
pub fn clean_text(html: &str) -> String {
    let without_tags = HTML_TAG.replace_all(html, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    WHITESPACE_RUN.replace_all(&decoded, " ").trim().to_string()
}

/// Resolves `href` against `base`. Absolute http(s) links pass through unchanged.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Truncates to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn price_notations_agree() {
        assert_eq!(parse_price("1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_price("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_price("1234,56"), Some(dec("1234.56")));
    }

    #[test]
    fn price_ignores_currency_markers_and_spacing() {
        assert_eq!(parse_price("€ 1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_price("EUR 1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_price("1234 EUR"), Some(dec("1234")));
        assert_eq!(parse_price("12 500 000 Ft"), Some(dec("12500000")));
        assert_eq!(parse_price("1.234 €"), Some(dec("1234")));
    }

    #[test]
    fn unparseable_price_is_none() {
        assert_eq!(parse_price("not a number"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("€"), None);
    }

    #[test]
    fn dates_in_each_supported_layout() {
        let expected = NaiveDate::from_ymd_opt(2026, 2, 15);
        assert_eq!(parse_date("2026-02-15"), expected);
        assert_eq!(parse_date("2026-02-15T10:00:00Z"), expected);
        assert_eq!(parse_date("15.02.2026"), expected);
        assert_eq!(parse_date("15/02/2026"), expected);
        assert_eq!(parse_date("Feb 15, 2026"), expected);
        assert_eq!(parse_date("2026.02.15"), expected);
    }

    #[test]
    fn invalid_dates_are_none() {
        assert_eq!(parse_date("31.02.2026"), None);
        assert_eq!(parse_date("2026-13-01"), None);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn source_id_prefers_url_patterns() {
        assert_eq!(generate_source_id("https://www.netbid.com/en/auction/4711"), "4711");
        assert_eq!(generate_source_id("https://x.test/detail?id=99&lang=en"), "99");
        assert_eq!(generate_source_id("https://x.test/a?lot=12"), "12");
        assert_eq!(generate_source_id("https://x.test/items/555/"), "555");
    }

    #[test]
    fn source_id_hash_fallback_is_stable() {
        let url = "https://www.proventura.de/de/auktionen/maschinen-abc";
        let first = generate_source_id(url);
        assert_eq!(first, generate_source_id(url));
        assert!(first.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(first, generate_source_id("https://www.proventura.de/de/auktionen/other"));
        assert_eq!(url_hash("a"), 97);
        assert_eq!(url_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn clean_text_strips_tags_and_entities() {
        assert_eq!(
            clean_text("  <b>Server&nbsp;Rack</b>\n &amp; <i>UPS</i> &quot;HP&quot; &#39;x&#39; "),
            "Server Rack & UPS \"HP\" 'x'"
        );
    }

    #[test]
    fn urls_resolve_against_base() {
        assert_eq!(
            resolve_url("https://www.netbid.com", "/en/lot/1").as_deref(),
            Some("https://www.netbid.com/en/lot/1")
        );
        assert_eq!(
            resolve_url("https://eer.sztfh.hu/palyazat/kereses", "https://other.test/x").as_deref(),
            Some("https://other.test/x")
        );
        assert_eq!(resolve_url("https://eer.sztfh.hu", "#top"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("árvíztűrő", 3), "árv");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
