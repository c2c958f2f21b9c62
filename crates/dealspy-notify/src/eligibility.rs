//! Subscription gates: whether a user may be notified at all, per channel, and how
//! many filter values their plan allows.

use chrono::{DateTime, Utc};
use dealspy_core::{Channel, Language, SubscriptionStatus, SubscriptionTier, User, UserPreference};
use thiserror::Error;

/// `false` for cancelled or unpaid subscriptions, an expired trial, or an elapsed paid period.
pub fn is_subscription_active(user: &User, now: DateTime<Utc>) -> bool {
    let sub = &user.subscription;
    match sub.status {
        SubscriptionStatus::Cancelled | SubscriptionStatus::Unpaid => false,
        SubscriptionStatus::Trialing => sub.trial_ends_at.is_none_or(|ends| ends >= now),
        SubscriptionStatus::Active => sub.subscription_ends_at.is_none_or(|ends| ends >= now),
        SubscriptionStatus::PastDue => true,
    }
}

pub fn tier_allows(tier: SubscriptionTier, channel: Channel) -> bool {
    match channel {
        Channel::Email => tier != SubscriptionTier::Cancelled,
        Channel::Push | Channel::Telegram => matches!(
            tier,
            SubscriptionTier::Trial | SubscriptionTier::Pro | SubscriptionTier::Enterprise
        ),
        Channel::Api | Channel::Slack => tier == SubscriptionTier::Enterprise,
    }
}

pub fn can_access_channel(user: &User, channel: Channel, now: DateTime<Utc>) -> bool {
    is_subscription_active(user, now) && tier_allows(user.subscription.tier, channel)
}

/// Maximum number of selected values per filter dimension; `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub countries: Option<usize>,
    pub platforms: Option<usize>,
    pub categories: Option<usize>,
    pub keywords: Option<usize>,
}

pub fn limits_for(tier: SubscriptionTier) -> TierLimits {
    match tier {
        SubscriptionTier::Trial | SubscriptionTier::Pro => TierLimits {
            countries: Some(3),
            platforms: None,
            categories: None,
            keywords: Some(20),
        },
        SubscriptionTier::Starter => TierLimits {
            countries: Some(1),
            platforms: Some(3),
            categories: Some(2),
            keywords: Some(5),
        },
        SubscriptionTier::Enterprise => TierLimits {
            countries: None,
            platforms: None,
            categories: None,
            keywords: None,
        },
        SubscriptionTier::Cancelled => TierLimits {
            countries: Some(0),
            platforms: Some(0),
            categories: Some(0),
            keywords: Some(0),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedField {
    Countries,
    Platforms,
    Categories,
    Keywords,
}

impl LimitedField {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitedField::Countries => "countries",
            LimitedField::Platforms => "platforms",
            LimitedField::Categories => "categories",
            LimitedField::Keywords => "keywords",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} selected {} values, plan allows {}", field.as_str(), selected, limit)]
pub struct LimitError {
    pub field: LimitedField,
    pub limit: usize,
    pub selected: usize,
}

impl LimitError {
    pub fn localized(&self, lang: Language) -> String {
        let n = self.limit;
        match (self.field, lang) {
            (LimitedField::Countries, Language::Hu) => format!("Maximum {n} ország választható a csomagodban."),
            (LimitedField::Countries, Language::En) => format!("Maximum {n} countries allowed in your plan."),
            (LimitedField::Countries, Language::De) => format!("Maximal {n} Länder in Ihrem Plan erlaubt."),
            (LimitedField::Platforms, Language::Hu) => format!("Maximum {n} platform választható a csomagodban."),
            (LimitedField::Platforms, Language::En) => format!("Maximum {n} platforms allowed in your plan."),
            (LimitedField::Platforms, Language::De) => format!("Maximal {n} Plattformen in Ihrem Plan erlaubt."),
            (LimitedField::Categories, Language::Hu) => format!("Maximum {n} kategória választható a csomagodban."),
            (LimitedField::Categories, Language::En) => format!("Maximum {n} categories allowed in your plan."),
            (LimitedField::Categories, Language::De) => format!("Maximal {n} Kategorien in Ihrem Plan erlaubt."),
            (LimitedField::Keywords, Language::Hu) => format!("Maximum {n} kulcsszó adható meg a csomagodban."),
            (LimitedField::Keywords, Language::En) => format!("Maximum {n} keywords allowed in your plan."),
            (LimitedField::Keywords, Language::De) => format!("Maximal {n} Schlüsselwörter in Ihrem Plan erlaubt."),
        }
    }
}

/// Checks a preference set against the plan limits of `tier`. The first exceeded
/// dimension is reported, in the order countries, platforms, categories, keywords.
pub fn validate_preferences(tier: SubscriptionTier, pref: &UserPreference) -> Result<(), LimitError> {
    let limits = limits_for(tier);
    let checks = [
        (LimitedField::Countries, limits.countries, pref.countries.selected()),
        (LimitedField::Platforms, limits.platforms, pref.sources.selected()),
        (LimitedField::Categories, limits.categories, pref.categories.selected()),
        (LimitedField::Keywords, limits.keywords, pref.keywords.selected()),
    ];
    for (field, limit, selected) in checks {
        if let Some(limit) = limit {
            if selected > limit {
                return Err(LimitError { field, limit, selected });
            }
        }
    }
    Ok(())
}
