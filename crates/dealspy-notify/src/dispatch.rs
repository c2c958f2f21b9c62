//! Per-deal fan-out to every matching user over every entitled channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealspy_core::{Channel, Deal, User};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::eligibility::can_access_channel;
use crate::matcher::find_matching_users;
use crate::senders::{ChannelSender, SendError};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelTally {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DispatchTally(BTreeMap<Channel, ChannelTally>);

impl DispatchTally {
    pub fn record(&mut self, channel: Channel, delivered: bool) {
        let entry = self.0.entry(channel).or_default();
        if delivered {
            entry.sent += 1;
        } else {
            entry.failed += 1;
        }
    }

    pub fn get(&self, channel: Channel) -> ChannelTally {
        self.0.get(&channel).copied().unwrap_or_default()
    }

    pub fn merge(&mut self, other: &DispatchTally) {
        for (channel, tally) in &other.0 {
            let entry = self.0.entry(*channel).or_default();
            entry.sent += tally.sent;
            entry.failed += tally.failed;
        }
    }

    pub fn total_sent(&self) -> usize {
        self.0.values().map(|t| t.sent).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.0.values().map(|t| t.failed).sum()
    }
}

/// A send the dispatcher will attempt.
#[derive(Debug, Clone, Copy)]
pub struct PlannedSend<'a> {
    pub user: &'a User,
    pub channel: Channel,
    pub destination: &'a str,
}

/// Matching users crossed with `channels`, keeping only pairs where the user enabled
/// the channel, registered a destination for it, and their tier grants it.
pub fn plan_sends<'a>(
    deal: &Deal,
    users: &'a [User],
    channels: &[Channel],
    now: DateTime<Utc>,
) -> Vec<PlannedSend<'a>> {
    let mut planned = Vec::new();
    for user in find_matching_users(deal, users, now) {
        for &channel in channels {
            if !user.channel_enabled(channel) || !can_access_channel(user, channel, now) {
                continue;
            }
            if let Some(destination) = user.channel_destination(channel) {
                planned.push(PlannedSend {
                    user,
                    channel,
                    destination,
                });
            }
        }
    }
    planned
}

pub struct Dispatcher {
    senders: Vec<Arc<dyn ChannelSender>>,
    send_timeout: Duration,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(senders: Vec<Arc<dyn ChannelSender>>) -> Self {
        Self {
            senders,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.senders.iter().map(|s| s.channel()).collect()
    }

    fn sender_for(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.iter().find(|s| s.channel() == channel)
    }

    /// Attempts every planned send for `deal`. A failed or timed-out send is counted and
    /// logged; it never stops the remaining sends.
    pub async fn dispatch(&self, deal: &Deal, users: &[User], now: DateTime<Utc>) -> DispatchTally {
        let planned = plan_sends(deal, users, &self.channels(), now);
        debug!(deal_id = %deal.id, sends = planned.len(), "dispatching deal");

        let sends: Vec<BoxFuture<'_, (Channel, bool)>> = planned
            .into_iter()
            .filter_map(|send| self.sender_for(send.channel).map(|sender| (sender, send)))
            .map(|(sender, send)| -> BoxFuture<'_, (Channel, bool)> {
                Box::pin(async move {
                    let result = tokio::time::timeout(
                        self.send_timeout,
                        sender.send(send.destination, deal, send.user.language),
                    )
                    .await
                    .unwrap_or(Err(SendError::Timeout(self.send_timeout)));
                    if let Err(err) = &result {
                        warn!(
                            deal_id = %deal.id,
                            user_id = %send.user.id,
                            channel = %send.channel,
                            error = %err,
                            "notification send failed"
                        );
                    }
                    (send.channel, result.is_ok())
                })
            })
            .collect();
        let outcomes: Vec<(Channel, bool)> = stream::iter(sends)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut tally = DispatchTally::default();
        for (channel, delivered) in outcomes {
            tally.record(channel, delivered);
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::tests::user;
    use crate::matcher::tests::deal;
    use async_trait::async_trait;
    use dealspy_core::{Country, Language, Source, SubscriptionStatus, SubscriptionTier};
    use std::sync::Mutex;

    /// Records every attempted destination; fails for destinations listed in `fail_for`.
    struct RecordingSender {
        channel: Channel,
        fail_for: Vec<String>,
        stall: bool,
        attempts: Mutex<Vec<String>>,
    }

    impl RecordingSender {
        fn new(channel: Channel) -> Self {
            Self {
                channel,
                fail_for: Vec::new(),
                stall: false,
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSender for RecordingSender {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(
            &self,
            destination: &str,
            _deal: &Deal,
            _language: Language,
        ) -> Result<(), SendError> {
            self.attempts.lock().unwrap().push(destination.to_string());
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_for.iter().any(|d| d == destination) {
                return Err(SendError::Rejected("unsubscribed".into()));
            }
            Ok(())
        }
    }

    fn subscriber(tier: SubscriptionTier, chat: &str) -> User {
        let mut u = user(tier, SubscriptionStatus::Active);
        u.telegram_chat_id = Some(chat.to_string());
        u.push_player_id = Some(format!("player-{chat}"));
        u
    }

    #[tokio::test]
    async fn starter_gets_no_telegram_but_pro_does() {
        let telegram = Arc::new(RecordingSender::new(Channel::Telegram));
        let dispatcher = Dispatcher::new(vec![telegram.clone()]);
        let d = deal(Source::Netbid, Country::De, "Server", None);
        let users = vec![
            subscriber(SubscriptionTier::Starter, "starter-chat"),
            subscriber(SubscriptionTier::Pro, "pro-chat"),
        ];

        let tally = dispatcher.dispatch(&d, &users, Utc::now()).await;
        assert_eq!(telegram.attempts(), vec!["pro-chat".to_string()]);
        assert_eq!(
            tally.get(Channel::Telegram),
            ChannelTally { sent: 1, failed: 0 }
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_sends() {
        let mut failing = RecordingSender::new(Channel::Push);
        failing.fail_for = vec!["player-a".into()];
        let push = Arc::new(failing);
        let telegram = Arc::new(RecordingSender::new(Channel::Telegram));
        let dispatcher = Dispatcher::new(vec![push.clone(), telegram.clone()]);
        let d = deal(Source::Eer, Country::Hu, "Targonca", None);
        let users = vec![
            subscriber(SubscriptionTier::Pro, "a"),
            subscriber(SubscriptionTier::Trial, "b"),
        ];

        let tally = dispatcher.dispatch(&d, &users, Utc::now()).await;
        assert_eq!(
            tally.get(Channel::Push),
            ChannelTally { sent: 1, failed: 1 }
        );
        assert_eq!(
            tally.get(Channel::Telegram),
            ChannelTally { sent: 2, failed: 0 }
        );
        assert_eq!(push.attempts().len(), 2);
    }

    #[tokio::test]
    async fn disabled_channel_or_missing_destination_is_skipped() {
        let telegram = Arc::new(RecordingSender::new(Channel::Telegram));
        let dispatcher = Dispatcher::new(vec![telegram.clone()]);
        let d = deal(Source::Eer, Country::Hu, "Szerver", None);

        let mut disabled = subscriber(SubscriptionTier::Pro, "x");
        disabled.channels.telegram = false;
        let mut blank = subscriber(SubscriptionTier::Pro, "y");
        blank.telegram_chat_id = Some("  ".into());

        let tally = dispatcher
            .dispatch(&d, &[disabled, blank], Utc::now())
            .await;
        assert!(telegram.attempts().is_empty());
        assert_eq!(tally.total_sent() + tally.total_failed(), 0);
    }

    #[tokio::test]
    async fn hung_send_counts_as_failure() {
        let mut slow = RecordingSender::new(Channel::Telegram);
        slow.stall = true;
        let dispatcher =
            Dispatcher::new(vec![Arc::new(slow)]).with_send_timeout(Duration::from_millis(20));
        let d = deal(Source::Eer, Country::Hu, "Szerver", None);
        let tally = dispatcher
            .dispatch(&d, &[subscriber(SubscriptionTier::Pro, "z")], Utc::now())
            .await;
        assert_eq!(
            tally.get(Channel::Telegram),
            ChannelTally { sent: 0, failed: 1 }
        );
    }

    #[test]
    fn tallies_merge_per_channel() {
        let mut a = DispatchTally::default();
        a.record(Channel::Push, true);
        let mut b = DispatchTally::default();
        b.record(Channel::Push, false);
        b.record(Channel::Telegram, true);
        a.merge(&b);
        assert_eq!(a.get(Channel::Push), ChannelTally { sent: 1, failed: 1 });
        assert_eq!(a.total_sent(), 2);
        assert_eq!(serde_json::to_value(&a).unwrap()["telegram"]["sent"], 1);
    }
}
