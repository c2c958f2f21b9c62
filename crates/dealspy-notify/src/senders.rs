//! Per-deal delivery channels: OneSignal web push and Telegram bot messages.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use dealspy_core::{Channel, Deal, Language};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::format::{push_body, push_heading, telegram_message};

pub const ONESIGNAL_NOTIFICATIONS_URL: &str = "https://onesignal.com/api/v1/notifications";
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const PUSH_TTL_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("rendering failed: {0}")]
    Render(#[from] askama::Error),
}

/// One delivery channel. `destination` is the channel-specific address
/// (push player id, Telegram chat id).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, destination: &str, deal: &Deal, language: Language) -> Result<(), SendError>;
}

async fn error_body(resp: reqwest::Response) -> SendError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    SendError::Status { status, body }
}

#[derive(Debug, Clone)]
pub struct OneSignalSender {
    http: reqwest::Client,
    app_id: String,
    api_key: String,
    endpoint: String,
}

impl OneSignalSender {
    pub fn new(http: reqwest::Client, app_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            app_id: app_id.into(),
            api_key: api_key.into(),
            endpoint: ONESIGNAL_NOTIFICATIONS_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn payload(&self, player_id: &str, deal: &Deal, language: Language) -> JsonValue {
        json!({
            "app_id": self.app_id,
            "include_player_ids": [player_id],
            "headings": { "en": push_heading(language) },
            "contents": { "en": push_body(deal, language) },
            "url": deal.url,
            "ttl": PUSH_TTL_SECS,
            "priority": 10,
        })
    }
}

/// OneSignal answers 200 with an `errors` list for rejected recipients.
fn onesignal_errors(body: &JsonValue) -> Option<String> {
    let errors = body.get("errors")?;
    let joined = match errors {
        JsonValue::Array(items) if !items.is_empty() => items
            .iter()
            .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(map) if !map.is_empty() => errors.to_string(),
        _ => return None,
    };
    Some(joined)
}

#[async_trait]
impl ChannelSender for OneSignalSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, destination: &str, deal: &Deal, language: Language) -> Result<(), SendError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", self.api_key))
            .json(&self.payload(destination, deal, language))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp).await);
        }
        let body: JsonValue = resp.json().await?;
        match onesignal_errors(&body) {
            Some(errors) => Err(SendError::Rejected(errors)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramSender {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramSender {
    pub fn new(http: reqwest::Client, bot_token: impl Into<String>) -> Self {
        Self {
            http,
            bot_token: bot_token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.bot_token)
    }

    pub fn payload(chat_id: &str, deal: &Deal, language: Language, today: NaiveDate) -> JsonValue {
        json!({
            "chat_id": chat_id,
            "text": telegram_message(deal, language, today),
            "parse_mode": "HTML",
            "disable_web_page_preview": false,
        })
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn send(&self, destination: &str, deal: &Deal, language: Language) -> Result<(), SendError> {
        let today = Local::now().date_naive();
        let resp = self
            .http
            .post(self.send_message_url())
            .json(&Self::payload(destination, deal, language, today))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let description = serde_json::from_str::<JsonValue>(&body)
            .ok()
            .and_then(|v| v.get("description").and_then(JsonValue::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(SendError::Status {
            status,
            body: description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::deal;
    use dealspy_core::{Country, Source};

    #[test]
    fn onesignal_payload_targets_one_player() {
        let sender = OneSignalSender::new(reqwest::Client::new(), "app-1", "key");
        let d = deal(Source::Netbid, Country::De, "Gabelstapler", None);
        let payload = sender.payload("player-9", &d, Language::Hu);
        assert_eq!(payload["app_id"], "app-1");
        assert_eq!(payload["include_player_ids"][0], "player-9");
        assert_eq!(payload["headings"]["en"], "🔍 DealSpy | Új deal");
        assert_eq!(payload["url"], d.url.as_str());
        assert_eq!(payload["ttl"], 86_400);
    }

    #[test]
    fn onesignal_error_lists_are_failures() {
        assert_eq!(
            onesignal_errors(&json!({"errors": ["All included players are not subscribed"]})).as_deref(),
            Some("All included players are not subscribed")
        );
        assert!(onesignal_errors(&json!({"id": "abc", "errors": []})).is_none());
        assert!(onesignal_errors(&json!({"id": "abc"})).is_none());
        assert!(onesignal_errors(&json!({"errors": {"invalid_player_ids": ["x"]}})).is_some());
    }

    #[test]
    fn telegram_payload_uses_html_mode() {
        let d = deal(Source::Eer, Country::Hu, "Szerver", None);
        let today = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let payload = TelegramSender::payload("4242", &d, Language::En, today);
        assert_eq!(payload["chat_id"], "4242");
        assert_eq!(payload["parse_mode"], "HTML");
        assert!(payload["text"].as_str().unwrap().contains("🔗 https://deals.test/"));
    }

    #[test]
    fn telegram_url_embeds_token() {
        let sender = TelegramSender::new(reqwest::Client::new(), "123:abc").with_api_base("http://localhost:9/");
        assert_eq!(sender.send_message_url(), "http://localhost:9/bot123:abc/sendMessage");
    }
}
