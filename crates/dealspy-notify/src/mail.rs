//! Outgoing email: the daily digest and operator alerts, delivered through Resend.

use askama::Template;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use dealspy_core::{Deal, Language, User};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::format::{
    category_name, country_flag, digest_subject, escape_html, format_deadline, format_price, localized_title,
};
use crate::matcher::group_by_category;
use crate::senders::SendError;

pub const RESEND_EMAILS_URL: &str = "https://api.resend.com/emails";
pub const DIGEST_ITEMS_PER_CATEGORY: usize = 10;
pub const ALERT_SUBJECT_PREFIX: &str = "[DealSpy] ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub from_name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct ResendMailer {
    http: reqwest::Client,
    api_key: String,
    from_email: String,
    endpoint: String,
}

impl ResendMailer {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, from_email: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            from_email: from_email.into(),
            endpoint: RESEND_EMAILS_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn payload(&self, email: &OutgoingEmail) -> JsonValue {
        serde_json::json!({
            "from": format!("{} <{}>", email.from_name, self.from_email),
            "to": email.to,
            "subject": email.subject,
            "html": email.html,
            "text": email.text,
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.payload(email))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<JsonValue>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(JsonValue::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(SendError::Status { status, body: message })
    }
}

struct DigestItem {
    title: String,
    url: String,
    meta: String,
}

struct DigestSection {
    name: &'static str,
    total: usize,
    items: Vec<DigestItem>,
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate<'a> {
    tagline: &'a str,
    greeting: &'a str,
    intro: String,
    sections: Vec<DigestSection>,
    settings_label: &'a str,
    settings_url: String,
    unsubscribe_label: &'a str,
    unsubscribe_url: String,
    year: i32,
}

struct DigestCopy {
    tagline: &'static str,
    greeting: &'static str,
    intro: String,
    settings: &'static str,
    unsubscribe: &'static str,
}

fn digest_copy(lang: Language, count: usize) -> DigestCopy {
    match lang {
        Language::Hu => DigestCopy {
            tagline: "EU csődvagyon monitoring",
            greeting: "Szia",
            intro: format!("Ma {count} új releváns deal érkezett:"),
            settings: "Beállítások",
            unsubscribe: "Leiratkozás",
        },
        Language::En => DigestCopy {
            tagline: "EU insolvency asset monitoring",
            greeting: "Hello",
            intro: format!("{count} new relevant deals arrived today:"),
            settings: "Settings",
            unsubscribe: "Unsubscribe",
        },
        Language::De => DigestCopy {
            tagline: "EU-Insolvenzmonitoring",
            greeting: "Hallo",
            intro: format!("Heute sind {count} neue relevante Angebote eingetroffen:"),
            settings: "Einstellungen",
            unsubscribe: "Abmelden",
        },
    }
}

/// Builds the daily digest for `user`, or `None` when nothing matched.
/// Deals are grouped by category with at most ten per group.
pub fn render_digest(
    user: &User,
    deals: &[&Deal],
    today: NaiveDate,
    app_url: &str,
) -> Result<Option<OutgoingEmail>, SendError> {
    if deals.is_empty() {
        return Ok(None);
    }
    let lang = user.language;
    let copy = digest_copy(lang, deals.len());
    let subject = digest_subject(lang, deals.len(), today);
    let app_url = app_url.trim_end_matches('/');

    let mut text = format!("{subject}\n\n{}\n", copy.intro);
    let mut sections = Vec::new();
    for (category, group) in group_by_category(deals) {
        let name = category_name(category, lang);
        text.push_str(&format!("\n{name} ({})\n", group.len()));
        let items: Vec<DigestItem> = group
            .iter()
            .take(DIGEST_ITEMS_PER_CATEGORY)
            .map(|deal| {
                let meta = format!(
                    "{} {} | {} | ⏰ {}",
                    deal.source,
                    country_flag(deal.country),
                    format_price(deal.price, &deal.currency),
                    format_deadline(deal.deadline, lang, today)
                );
                let title = localized_title(deal, lang).to_string();
                text.push_str(&format!("- {title}\n  {meta}\n  {}\n", deal.url));
                DigestItem {
                    title,
                    url: escape_html(&deal.url),
                    meta,
                }
            })
            .collect();
        sections.push(DigestSection {
            name,
            total: group.len(),
            items,
        });
    }

    let html = DigestTemplate {
        tagline: copy.tagline,
        greeting: copy.greeting,
        intro: copy.intro,
        sections,
        settings_label: copy.settings,
        settings_url: escape_html(&format!("{app_url}/settings")),
        unsubscribe_label: copy.unsubscribe,
        unsubscribe_url: escape_html(&format!("{app_url}/unsubscribe")),
        year: today.year(),
    }
    .render()?;

    Ok(Some(OutgoingEmail {
        to: vec![user.email.clone()],
        from_name: "DealSpy".to_string(),
        subject,
        html,
        text,
    }))
}

/// Plain operator alert; the body is shown preformatted.
pub fn alert_email(admin: &str, subject: &str, body: &str) -> OutgoingEmail {
    OutgoingEmail {
        to: vec![admin.to_string()],
        from_name: "DealSpy Alert".to_string(),
        subject: format!("{ALERT_SUBJECT_PREFIX}{subject}"),
        html: format!(r#"<pre style="font-family:sans-serif;">{}</pre>"#, escape_html(body)),
        text: body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::tests::user;
    use crate::matcher::tests::deal;
    use dealspy_core::{Category, Country, Source, SubscriptionStatus, SubscriptionTier};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    #[test]
    fn empty_digest_is_skipped() {
        let u = user(SubscriptionTier::Pro, SubscriptionStatus::Active);
        assert!(render_digest(&u, &[], today(), "https://dealspy.eu").unwrap().is_none());
    }

    #[test]
    fn digest_groups_by_category_and_caps_items() {
        let u = user(SubscriptionTier::Pro, SubscriptionStatus::Active);
        let machines: Vec<Deal> = (0..12)
            .map(|i| deal(Source::Netbid, Country::De, &format!("Lathe {i}"), Some(Category::Machines)))
            .collect();
        let flat = deal(Source::Eer, Country::Hu, "Flat in Pest", Some(Category::Property));
        let mut refs: Vec<&Deal> = machines.iter().collect();
        refs.push(&flat);

        let email = render_digest(&u, &refs, today(), "https://dealspy.eu/").unwrap().unwrap();
        assert_eq!(email.to, vec![u.email.clone()]);
        assert_eq!(email.subject, "🔍 DealSpy | 13 new deals - 1 Mar");
        assert!(email.html.contains("Machines (12)"));
        assert!(email.html.contains("Property (1)"));
        assert!(email.html.contains("Lathe 9"));
        assert!(!email.html.contains("Lathe 10"));
        assert!(email.html.contains(r#"href="https://dealspy.eu/settings""#));
        assert!(email.text.contains("13 new relevant deals arrived today:"));
    }

    #[test]
    fn digest_is_localized() {
        let mut u = user(SubscriptionTier::Pro, SubscriptionStatus::Active);
        u.language = Language::De;
        let d = deal(Source::Insolvenz, Country::De, "Bürogebäude", Some(Category::Property));
        let email = render_digest(&u, &[&d], today(), "https://dealspy.eu").unwrap().unwrap();
        assert!(email.html.contains("Hallo!"));
        assert!(email.html.contains("Immobilien (1)"));
        assert!(email.html.contains("Abmelden"));
    }

    #[test]
    fn alert_is_prefixed_and_escaped() {
        let email = alert_email("ops@example.test", "Scraper failures (1 source)", "- netbid: <timeout>");
        assert_eq!(email.subject, "[DealSpy] Scraper failures (1 source)");
        assert!(email.html.contains("&lt;timeout&gt;"));
        assert_eq!(email.text, "- netbid: <timeout>");
    }

    #[test]
    fn resend_payload_names_sender() {
        let mailer = ResendMailer::new(reqwest::Client::new(), "re_key", "alerts@dealspy.eu");
        let email = alert_email("ops@example.test", "x", "y");
        let payload = mailer.payload(&email);
        assert_eq!(payload["from"], "DealSpy Alert <alerts@dealspy.eu>");
        assert_eq!(payload["to"][0], "ops@example.test");
    }
}
