//! Localized rendering of deals for push, Telegram and email.

use chrono::{Datelike, NaiveDate};
use dealspy_core::{Category, Country, Deal, Language};
use rust_decimal::{Decimal, RoundingStrategy};

pub fn localized_title(deal: &Deal, lang: Language) -> &str {
    let translated = match lang {
        Language::Hu => deal.title_hu.as_deref(),
        Language::En => deal.title_en.as_deref(),
        Language::De => deal.title_de.as_deref(),
    };
    translated
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(&deal.title_original)
}

pub fn category_name(category: Category, lang: Language) -> &'static str {
    match (category, lang) {
        (Category::It, Language::Hu) => "IT / Szerverek",
        (Category::It, Language::En) => "IT / Servers",
        (Category::It, Language::De) => "IT / Server",
        (Category::Machines, Language::Hu) => "Gépek",
        (Category::Machines, Language::En) => "Machines",
        (Category::Machines, Language::De) => "Maschinen",
        (Category::Vehicles, Language::Hu) => "Járművek",
        (Category::Vehicles, Language::En) => "Vehicles",
        (Category::Vehicles, Language::De) => "Fahrzeuge",
        (Category::Property, Language::Hu) => "Ingatlan",
        (Category::Property, Language::En) => "Property",
        (Category::Property, Language::De) => "Immobilien",
        (Category::Other, Language::Hu) => "Egyéb",
        (Category::Other, Language::En) => "Other",
        (Category::Other, Language::De) => "Sonstiges",
    }
}

pub fn country_flag(country: Country) -> &'static str {
    match country {
        Country::Hu => "🇭🇺",
        Country::At => "🇦🇹",
        Country::De => "🇩🇪",
    }
}

pub fn country_name(country: Country, lang: Language) -> &'static str {
    match (country, lang) {
        (Country::Hu, Language::Hu) => "Magyarország",
        (Country::Hu, Language::En) => "Hungary",
        (Country::Hu, Language::De) => "Ungarn",
        (Country::At, Language::Hu) => "Ausztria",
        (Country::At, Language::En) => "Austria",
        (Country::At, Language::De) => "Österreich",
        (Country::De, Language::Hu) => "Németország",
        (Country::De, Language::En) => "Germany",
        (Country::De, Language::De) => "Deutschland",
    }
}

/// Whole units with `.` grouping and the currency code, e.g. `1.235 EUR`; `?` when unknown.
pub fn format_price(price: Option<Decimal>, currency: &str) -> String {
    let Some(price) = price else {
        return "?".to_string();
    };
    let rounded = price.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let digits = rounded.abs().trunc().to_string();
    let digits = digits.split('.').next().unwrap_or("0");

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}{grouped} {}", currency.trim().to_uppercase())
}

/// Day and abbreviated month in the reader's convention: `15 Feb`, `15. Feb.`, `febr. 15.`.
pub fn format_short_date(date: NaiveDate, lang: Language) -> String {
    const EN: [&str; 12] = ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];
    const DE: [&str; 12] = [
        "Jan.", "Feb.", "März", "Apr.", "Mai", "Juni", "Juli", "Aug.", "Sept.", "Okt.", "Nov.", "Dez.",
    ];
    const HU: [&str; 12] = [
        "jan.", "febr.", "márc.", "ápr.", "máj.", "jún.", "júl.", "aug.", "szept.", "okt.", "nov.", "dec.",
    ];
    let month = date.month0() as usize;
    let day = date.day();
    match lang {
        Language::En => format!("{day} {}", EN[month]),
        Language::De => format!("{day}. {}", DE[month]),
        Language::Hu => format!("{} {day}.", HU[month]),
    }
}

/// Deadline with the days left as seen from `today`, or an expired marker.
pub fn format_deadline(deadline: Option<NaiveDate>, lang: Language, today: NaiveDate) -> String {
    let Some(deadline) = deadline else {
        return "N/A".to_string();
    };
    let date = format_short_date(deadline, lang);
    let days = (deadline - today).num_days();
    if days <= 0 {
        let expired = match lang {
            Language::Hu => "Lejárt",
            Language::En => "Expired",
            Language::De => "Abgelaufen",
        };
        return format!("{date} ({expired})");
    }
    let unit = match (lang, days) {
        (Language::Hu, _) => "nap",
        (Language::En, 1) => "day",
        (Language::En, _) => "days",
        (Language::De, 1) => "Tag",
        (Language::De, _) => "Tage",
    };
    format!("{date} ({days} {unit})")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn push_heading(lang: Language) -> &'static str {
    match lang {
        Language::Hu => "🔍 DealSpy | Új deal",
        Language::En => "🔍 DealSpy | New deal",
        Language::De => "🔍 DealSpy | Neues Angebot",
    }
}

/// `title | source flag | price`
pub fn push_body(deal: &Deal, lang: Language) -> String {
    format!(
        "{} | {} {} | {}",
        localized_title(deal, lang),
        deal.source,
        country_flag(deal.country),
        format_price(deal.price, &deal.currency)
    )
}

/// Telegram message in `parse_mode=HTML`.
pub fn telegram_message(deal: &Deal, lang: Language, today: NaiveDate) -> String {
    let title = localized_title(deal, lang);
    let category = deal.effective_category();
    let (price_label, deadline_label) = match lang {
        Language::Hu => ("Ár", "Határidő"),
        Language::En => ("Price", "Deadline"),
        Language::De => ("Preis", "Frist"),
    };

    let mut lines = vec![
        format!("🔍 <b>DealSpy</b> | {}", category_name(category, lang)),
        String::new(),
        format!("📦 <b>{}</b>", escape_html(title)),
    ];
    if title != deal.title_original {
        lines.push(format!("   <i>({})</i>", escape_html(&deal.title_original)));
    }
    lines.extend([
        String::new(),
        format!(
            "📍 {} | {} {}",
            deal.source,
            country_flag(deal.country),
            country_name(deal.country, lang)
        ),
        format!("💰 {price_label}: {}", format_price(deal.price, &deal.currency)),
        format!("⏰ {deadline_label}: {}", format_deadline(deal.deadline, lang, today)),
        format!("🏷️ #{category} #{}", deal.source),
        String::new(),
        format!("🔗 {}", escape_html(&deal.url)),
    ]);
    lines.join("\n")
}

pub fn digest_subject(lang: Language, count: usize, today: NaiveDate) -> String {
    let date = format_short_date(today, lang);
    match lang {
        Language::Hu => format!("🔍 DealSpy | {count} új deal - {date}"),
        Language::En => format!("🔍 DealSpy | {count} new deals - {date}"),
        Language::De => format!("🔍 DealSpy | {count} neue Angebote - {date}"),
    }
}
