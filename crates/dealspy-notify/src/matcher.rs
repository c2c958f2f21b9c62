//! Preference matching between deals and subscribers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dealspy_core::{Category, Deal, User, UserPreference};

use crate::eligibility::is_subscription_active;

/// Every dimension must admit the deal. An unrestricted dimension admits everything,
/// and a deal without a category is compared as `other`.
pub fn matches(pref: &UserPreference, deal: &Deal) -> bool {
    pref.countries.admits(&deal.country)
        && pref.categories.admits(&deal.effective_category())
        && pref.sources.admits(&deal.source)
        && (pref.keywords.is_unrestricted() || pref.keywords.admits(&deal.searchable_text()))
}

/// Users with an active subscription whose preferences admit `deal`.
pub fn find_matching_users<'a>(deal: &Deal, users: &'a [User], now: DateTime<Utc>) -> Vec<&'a User> {
    users
        .iter()
        .filter(|u| is_subscription_active(u, now))
        .filter(|u| matches(&u.preferences, deal))
        .collect()
}

pub fn find_matching_deals<'a>(pref: &UserPreference, deals: &'a [Deal]) -> Vec<&'a Deal> {
    deals.iter().filter(|d| matches(pref, d)).collect()
}

/// Groups deals by effective category, keeping input order inside each group.
pub fn group_by_category<'a>(deals: &[&'a Deal]) -> BTreeMap<Category, Vec<&'a Deal>> {
    let mut grouped: BTreeMap<Category, Vec<&'a Deal>> = BTreeMap::new();
    for &deal in deals {
        grouped.entry(deal.effective_category()).or_default().push(deal);
    }
    grouped
}
