//! Core domain model for DealSpy: sources, deals, subscribers and their filter preferences.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealspy-core";

/// Currency assumed when a source does not state one.
pub const DEFAULT_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Closed string enumerations shared by storage, configuration and the wire.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// External platform a listing was scraped from.
    Source, "source" {
        Eer => "eer",
        Netbid => "netbid",
        Ediktsdatei => "ediktsdatei",
        Insolvenz => "insolvenz",
        Proventura => "proventura",
        Machineseeker => "machineseeker",
    }
);

string_enum!(
    Country, "country" {
        Hu => "hu",
        At => "at",
        De => "de",
    }
);

string_enum!(
    Category, "category" {
        It => "it",
        Machines => "machines",
        Vehicles => "vehicles",
        Property => "property",
        Other => "other",
    }
);

string_enum!(
    Language, "language" {
        Hu => "hu",
        En => "en",
        De => "de",
    }
);

string_enum!(
    SubscriptionTier, "subscription tier" {
        Trial => "trial",
        Starter => "starter",
        Pro => "pro",
        Enterprise => "enterprise",
        Cancelled => "cancelled",
    }
);

string_enum!(
    SubscriptionStatus, "subscription status" {
        Trialing => "trialing",
        Active => "active",
        PastDue => "past_due",
        Cancelled => "cancelled",
        Unpaid => "unpaid",
    }
);

string_enum!(
    /// Delivery channels and channel-class features gated by subscription tier.
    Channel, "channel" {
        Push => "push",
        Email => "email",
        Telegram => "telegram",
        Api => "api",
        Slack => "slack",
    }
);

/// Membership constraint on one filter dimension.
///
/// A subscriber who selected nothing for a dimension is `Unrestricted` there: every
/// value passes. A non-empty selection admits only its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter<T: Ord> {
    Unrestricted,
    AnyOf(BTreeSet<T>),
}

impl<T: Ord> Filter<T> {
    pub fn unrestricted() -> Self {
        Filter::Unrestricted
    }

    pub fn any_of(values: impl IntoIterator<Item = T>) -> Self {
        values.into_iter().collect()
    }

    pub fn admits(&self, value: &T) -> bool {
        match self {
            Filter::Unrestricted => true,
            Filter::AnyOf(set) => set.contains(value),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Filter::Unrestricted)
    }

    /// Number of selected values; zero when unrestricted.
    pub fn selected(&self) -> usize {
        match self {
            Filter::Unrestricted => 0,
            Filter::AnyOf(set) => set.len(),
        }
    }
}

impl<T: Ord> Default for Filter<T> {
    fn default() -> Self {
        Filter::Unrestricted
    }
}

impl<T: Ord> FromIterator<T> for Filter<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let set: BTreeSet<T> = iter.into_iter().collect();
        if set.is_empty() {
            Filter::Unrestricted
        } else {
            Filter::AnyOf(set)
        }
    }
}

impl<T: Ord + Serialize> Serialize for Filter<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Filter::Unrestricted => serializer.collect_seq(std::iter::empty::<&T>()),
            Filter::AnyOf(set) => serializer.collect_seq(set),
        }
    }
}

impl<'de, T: Ord + Deserialize<'de>> Deserialize<'de> for Filter<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Vec::<T>::deserialize(deserializer)?.into_iter().collect())
    }
}

/// Keyword constraint with OR semantics over case-insensitive substrings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeywordFilter {
    #[default]
    Unrestricted,
    /// Lowercased, trimmed, non-empty keywords.
    AnyOf(Vec<String>),
}

impl KeywordFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for kw in keywords {
            let kw = kw.as_ref().trim().to_lowercase();
            if !kw.is_empty() && !out.contains(&kw) {
                out.push(kw);
            }
        }
        if out.is_empty() {
            KeywordFilter::Unrestricted
        } else {
            KeywordFilter::AnyOf(out)
        }
    }

    /// `haystack` must already be lowercased.
    pub fn admits(&self, haystack: &str) -> bool {
        match self {
            KeywordFilter::Unrestricted => true,
            KeywordFilter::AnyOf(keywords) => keywords.iter().any(|kw| haystack.contains(kw.as_str())),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, KeywordFilter::Unrestricted)
    }

    pub fn selected(&self) -> usize {
        match self {
            KeywordFilter::Unrestricted => 0,
            KeywordFilter::AnyOf(keywords) => keywords.len(),
        }
    }

    pub fn keywords(&self) -> &[String] {
        match self {
            KeywordFilter::Unrestricted => &[],
            KeywordFilter::AnyOf(keywords) => keywords,
        }
    }
}

impl Serialize for KeywordFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.keywords())
    }
}

impl<'de> Deserialize<'de> for KeywordFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(KeywordFilter::new(Vec::<String>::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreferenceError {
    #[error("preference field `{field}` contains {source}")]
    UnknownValue {
        field: &'static str,
        #[source]
        source: UnknownVariant,
    },
}

/// A subscriber's filter set. Owned by the preference store; read-only to matching.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreference {
    pub countries: Filter<Country>,
    pub categories: Filter<Category>,
    pub sources: Filter<Source>,
    pub keywords: KeywordFilter,
}

impl UserPreference {
    /// Builds preferences from stored string columns. A value outside the closed
    /// enumerations is rejected rather than dropped.
    pub fn from_raw(
        countries: &[String],
        categories: &[String],
        sources: &[String],
        keywords: &[String],
    ) -> Result<Self, PreferenceError> {
        Ok(Self {
            countries: parse_filter(countries, "countries")?,
            categories: parse_filter(categories, "categories")?,
            sources: parse_filter(sources, "sources")?,
            keywords: KeywordFilter::new(keywords),
        })
    }
}

fn parse_filter<T>(values: &[String], field: &'static str) -> Result<Filter<T>, PreferenceError>
where
    T: Ord + FromStr<Err = UnknownVariant>,
{
    values
        .iter()
        .map(|v| v.parse::<T>().map_err(|source| PreferenceError::UnknownValue { field, source }))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub push: bool,
    pub email: bool,
    pub telegram: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub language: Language,
    pub preferences: UserPreference,
    pub channels: ChannelSettings,
    pub push_player_id: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub subscription: Subscription,
}

impl User {
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.channels.push,
            Channel::Email => self.channels.email,
            Channel::Telegram => self.channels.telegram,
            Channel::Api | Channel::Slack => false,
        }
    }

    /// Address a channel delivers to, if the user registered one.
    pub fn channel_destination(&self, channel: Channel) -> Option<&str> {
        let dest = match channel {
            Channel::Push => self.push_player_id.as_deref(),
            Channel::Telegram => self.telegram_chat_id.as_deref(),
            Channel::Email => Some(self.email.as_str()),
            Channel::Api | Channel::Slack => None,
        };
        dest.filter(|d| !d.trim().is_empty())
    }
}

/// One listing as produced by a single scrape cycle. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub source: Source,
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub currency: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub url: String,
    pub image_url: Option<String>,
    pub country: Country,
    #[serde(default)]
    pub raw: Map<String, JsonValue>,
}

impl ScrapedListing {
    pub fn new(
        source: Source,
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        country: Country,
    ) -> Self {
        Self {
            source,
            source_id: source_id.into(),
            title: title.into(),
            description: None,
            price: None,
            currency: None,
            deadline: None,
            url: url.into(),
            image_url: None,
            country,
            raw: Map::new(),
        }
    }
}

/// Tags a listing batch with how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "deals", rename_all = "snake_case")]
pub enum ScraperOutcome {
    Structured(Vec<ScrapedListing>),
    /// Structured parsing found nothing and the generative extractor supplied the listings.
    Fallback(Vec<ScrapedListing>),
}

impl ScraperOutcome {
    pub fn deals(&self) -> &[ScrapedListing] {
        match self {
            ScraperOutcome::Structured(deals) | ScraperOutcome::Fallback(deals) => deals,
        }
    }

    pub fn into_deals(self) -> Vec<ScrapedListing> {
        match self {
            ScraperOutcome::Structured(deals) | ScraperOutcome::Fallback(deals) => deals,
        }
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self, ScraperOutcome::Fallback(_))
    }
}

/// Translated title/description variants produced by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Translations {
    pub title_hu: Option<String>,
    pub title_en: Option<String>,
    pub title_de: Option<String>,
    pub description_hu: Option<String>,
    pub description_en: Option<String>,
}

/// Enriched deal ready for insertion; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeal {
    pub source: Source,
    pub source_id: String,
    pub title_original: String,
    pub title_hu: Option<String>,
    pub title_en: Option<String>,
    pub title_de: Option<String>,
    pub description_original: Option<String>,
    pub description_hu: Option<String>,
    pub description_en: Option<String>,
    pub category: Option<Category>,
    pub country: Country,
    pub price: Option<Decimal>,
    pub currency: String,
    pub deadline: Option<NaiveDate>,
    pub url: String,
    pub image_url: Option<String>,
    pub raw: Map<String, JsonValue>,
}

impl NewDeal {
    pub fn from_listing(listing: ScrapedListing) -> Self {
        Self {
            source: listing.source,
            source_id: listing.source_id,
            title_original: listing.title,
            title_hu: None,
            title_en: None,
            title_de: None,
            description_original: listing.description,
            description_hu: None,
            description_en: None,
            category: None,
            country: listing.country,
            price: listing.price,
            currency: listing
                .currency
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            deadline: listing.deadline,
            url: listing.url,
            image_url: listing.image_url,
            raw: listing.raw,
        }
    }

    pub fn with_translations(mut self, t: Translations) -> Self {
        self.title_hu = t.title_hu;
        self.title_en = t.title_en;
        self.title_de = t.title_de;
        self.description_hu = t.description_hu;
        self.description_en = t.description_en;
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn into_deal(self, id: Uuid, created_at: DateTime<Utc>) -> Deal {
        Deal {
            id,
            source: self.source,
            source_id: self.source_id,
            title_original: self.title_original,
            title_hu: self.title_hu,
            title_en: self.title_en,
            title_de: self.title_de,
            description_original: self.description_original,
            description_hu: self.description_hu,
            description_en: self.description_en,
            category: self.category,
            country: self.country,
            price: self.price,
            currency: self.currency,
            deadline: self.deadline,
            url: self.url,
            image_url: self.image_url,
            created_at,
            notified_at: None,
            raw: self.raw,
        }
    }
}

/// Persisted, deduplicated listing. Unique on `(source, source_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub source: Source,
    pub source_id: String,
    pub title_original: String,
    pub title_hu: Option<String>,
    pub title_en: Option<String>,
    pub title_de: Option<String>,
    pub description_original: Option<String>,
    pub description_hu: Option<String>,
    pub description_en: Option<String>,
    pub category: Option<Category>,
    pub country: Country,
    pub price: Option<Decimal>,
    pub currency: String,
    pub deadline: Option<NaiveDate>,
    pub url: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: Map<String, JsonValue>,
}

impl Deal {
    /// Uncategorized deals count as `other` wherever category is compared.
    pub fn effective_category(&self) -> Category {
        self.category.unwrap_or(Category::Other)
    }

    pub fn is_notified(&self) -> bool {
        self.notified_at.is_some()
    }

    /// Lowercased titles and descriptions (original, hu, en) joined by spaces.
    pub fn searchable_text(&self) -> String {
        [
            Some(self.title_original.as_str()),
            self.title_hu.as_deref(),
            self.title_en.as_deref(),
            self.description_original.as_deref(),
            self.description_hu.as_deref(),
            self.description_en.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal() -> Deal {
        NewDeal::from_listing(ScrapedListing::new(
            Source::Netbid,
            "42",
            "Server Rack",
            "https://www.netbid.com/en/lot/42",
            Country::De,
        ))
        .into_deal(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn empty_filter_is_unrestricted() {
        let f: Filter<Country> = Filter::any_of(Vec::new());
        assert!(f.is_unrestricted());
        for c in Country::ALL {
            assert!(f.admits(c));
        }
    }

    #[test]
    fn non_empty_filter_admits_only_members() {
        let f = Filter::any_of([Country::Hu, Country::At]);
        assert!(f.admits(&Country::Hu));
        assert!(!f.admits(&Country::De));
        assert_eq!(f.selected(), 2);
    }

    #[test]
    fn keyword_filter_normalizes_and_drops_blanks() {
        let kw = KeywordFilter::new(["  Server ", "", "server", "FORKLIFT"]);
        assert_eq!(kw.keywords(), ["server".to_string(), "forklift".to_string()]);
        assert!(KeywordFilter::new(["  "]).is_unrestricted());
    }

    #[test]
    fn preferences_from_raw_rejects_unknown_values() {
        let err = UserPreference::from_raw(&["hu".into(), "fr".into()], &[], &[], &[]).unwrap_err();
        let PreferenceError::UnknownValue { field, source } = err;
        assert_eq!(field, "countries");
        assert_eq!(source.value, "fr");

        let ok = UserPreference::from_raw(&[], &["it".into()], &["eer".into()], &["cnc".into()]).unwrap();
        assert!(ok.countries.is_unrestricted());
        assert!(ok.categories.admits(&Category::It));
    }

    #[test]
    fn preference_json_uses_plain_lists() {
        let pref: UserPreference =
            serde_json::from_str(r#"{"countries":["de"],"keywords":["CNC"]}"#).unwrap();
        assert!(pref.countries.admits(&Country::De));
        assert!(pref.sources.is_unrestricted());
        let text = serde_json::to_string(&pref).unwrap();
        assert!(text.contains(r#""categories":[]"#));
        assert!(text.contains(r#""keywords":["cnc"]"#));
    }

    #[test]
    fn searchable_text_joins_present_fields_lowercased() {
        let mut d = deal();
        d.title_en = Some("Rack".into());
        d.description_hu = Some("Szerver".into());
        assert_eq!(d.searchable_text(), "server rack rack szerver");
    }

    #[test]
    fn missing_category_counts_as_other() {
        let d = deal();
        assert_eq!(d.category, None);
        assert_eq!(d.effective_category(), Category::Other);
        assert_eq!(d.currency, DEFAULT_CURRENCY);
    }

    #[test]
    fn string_enums_round_trip_through_text() {
        assert_eq!("past_due".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::PastDue);
        assert_eq!(Source::Machineseeker.to_string(), "machineseeker");
        assert!("xyz".parse::<Channel>().is_err());
    }

    #[test]
    fn outcome_reports_fallback_usage() {
        let listing = deal();
        let scraped = ScrapedListing::new(listing.source, "1", "a", "https://x/1", Country::De);
        assert!(!ScraperOutcome::Structured(vec![scraped.clone()]).used_fallback());
        let fb = ScraperOutcome::Fallback(vec![scraped]);
        assert!(fb.used_fallback());
        assert_eq!(fb.deals().len(), 1);
    }
}
