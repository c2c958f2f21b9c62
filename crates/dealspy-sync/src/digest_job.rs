use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, Utc};
use dealspy_core::{Channel, Deal, User};
use dealspy_notify::dispatch::DEFAULT_SEND_TIMEOUT;
use dealspy_notify::{can_access_channel, find_matching_deals, render_digest, Mailer, SendError};
use dealspy_storage::{DealStore, UserDirectory};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DigestSummary {
    pub total_deals: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Daily email: each subscriber with email enabled gets one message listing today's
/// deals that match their preferences. Subscribers with no matches are skipped.
pub struct DigestJob {
    store: Arc<dyn DealStore>,
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn Mailer>,
    app_url: String,
    send_timeout: Duration,
}

impl DigestJob {
    pub fn new(
        store: Arc<dyn DealStore>,
        users: Arc<dyn UserDirectory>,
        mailer: Arc<dyn Mailer>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            users,
            mailer,
            app_url: app_url.into(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub async fn run(&self) -> Result<DigestSummary> {
        let run_id = Uuid::new_v4();
        async {
            let deals = self.store.get_created_today().await.context("loading today's deals")?;
            let mut summary = DigestSummary {
                total_deals: deals.len(),
                ..DigestSummary::default()
            };
            if deals.is_empty() {
                info!("no deals today, digest skipped");
                return Ok(summary);
            }

            let now = Utc::now();
            let today = Local::now().date_naive();
            let users = self.users.active_users().await.context("loading active users")?;
            let recipients: Vec<&User> = users
                .iter()
                .filter(|u| u.channel_enabled(Channel::Email) && can_access_channel(u, Channel::Email, now))
                .collect();
            info!(deals = deals.len(), recipients = recipients.len(), "digest started");

            for user in recipients {
                let matching = find_matching_deals(&user.preferences, &deals);
                match self.deliver(user, &matching, today).await {
                    Ok(true) => summary.sent += 1,
                    Ok(false) => {
                        debug!(user_id = %user.id, "no matching deals");
                        summary.skipped += 1;
                    }
                    Err(err) => {
                        warn!(user_id = %user.id, error = %err, "digest send failed");
                        summary.failed += 1;
                    }
                }
            }

            info!(sent = summary.sent, failed = summary.failed, skipped = summary.skipped, "digest finished");
            Ok(summary)
        }
        .instrument(info_span!("digest", %run_id))
        .await
    }

    async fn deliver(&self, user: &User, matching: &[&Deal], today: NaiveDate) -> Result<bool, SendError> {
        let Some(email) = render_digest(user, matching, today, &self.app_url)? else {
            return Ok(false);
        };
        tokio::time::timeout(self.send_timeout, self.mailer.send(&email))
            .await
            .unwrap_or(Err(SendError::Timeout(self.send_timeout)))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::tests::OutboxMailer;
    use dealspy_core::{
        Category, ChannelSettings, Country, Filter, Language, NewDeal, ScrapedListing, Source, Subscription,
        SubscriptionStatus, SubscriptionTier, UserPreference,
    };
    use dealspy_storage::MemoryStore;

    fn subscriber(email: &str, tier: SubscriptionTier, countries: &[Country]) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.into(),
            language: Language::En,
            preferences: UserPreference {
                countries: Filter::any_of(countries.iter().copied()),
                ..UserPreference::default()
            },
            channels: ChannelSettings {
                push: false,
                email: true,
                telegram: false,
            },
            push_player_id: None,
            telegram_chat_id: None,
            subscription: Subscription {
                tier,
                status: SubscriptionStatus::Active,
                trial_ends_at: None,
                subscription_ends_at: None,
            },
        }
    }

    async fn store_with(users: Vec<User>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::with_users(users));
        let listing = ScrapedListing::new(Source::Netbid, "77", "Drehbank", "https://netbid.test/77", Country::De);
        store
            .upsert(NewDeal::from_listing(listing).with_category(Category::Machines))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn matching_users_get_one_digest_and_others_are_skipped() {
        let mut opted_out = subscriber("quiet@example.test", SubscriptionTier::Pro, &[]);
        opted_out.channels.email = false;
        let store = store_with(vec![
            subscriber("de@example.test", SubscriptionTier::Starter, &[Country::De]),
            subscriber("hu@example.test", SubscriptionTier::Pro, &[Country::Hu]),
            opted_out,
        ])
        .await;
        let mailer = Arc::new(OutboxMailer::default());
        let job = DigestJob::new(store.clone(), store.clone(), mailer.clone(), "https://dealspy.eu");

        let summary = job.run().await.unwrap();
        assert_eq!(summary, DigestSummary { total_deals: 1, sent: 1, failed: 0, skipped: 1 });
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["de@example.test".to_string()]);
        assert!(sent[0].html.contains("Drehbank"));
    }

    #[tokio::test]
    async fn mailer_failure_is_counted_per_user() {
        let store = store_with(vec![subscriber("de@example.test", SubscriptionTier::Pro, &[])]).await;
        let mailer = Arc::new(OutboxMailer {
            reject: true,
            ..OutboxMailer::default()
        });
        let summary = DigestJob::new(store.clone(), store.clone(), mailer, "https://dealspy.eu")
            .run()
            .await
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.sent, 0);
    }

    #[tokio::test]
    async fn empty_day_sends_nothing() {
        let store = Arc::new(MemoryStore::with_users(vec![subscriber(
            "de@example.test",
            SubscriptionTier::Pro,
            &[],
        )]));
        let mailer = Arc::new(OutboxMailer::default());
        let summary = DigestJob::new(store.clone(), store.clone(), mailer.clone(), "https://dealspy.eu")
            .run()
            .await
            .unwrap();
        assert_eq!(summary, DigestSummary::default());
        assert!(mailer.sent.lock().unwrap().is_empty());
    }
}
