//! Subscriber-facing side of DealSpy: subscription gates, preference matching,
//! message formatting and delivery.

pub mod dispatch;
pub mod eligibility;
pub mod format;
pub mod mail;
pub mod matcher;
pub mod senders;

pub use dispatch::{plan_sends, ChannelTally, DispatchTally, Dispatcher, PlannedSend};
pub use eligibility::{
    can_access_channel, is_subscription_active, limits_for, validate_preferences, LimitError, LimitedField,
    TierLimits,
};
pub use mail::{alert_email, render_digest, Mailer, OutgoingEmail, ResendMailer};
pub use matcher::{find_matching_deals, find_matching_users, group_by_category, matches};
pub use senders::{ChannelSender, OneSignalSender, SendError, TelegramSender};

pub const CRATE_NAME: &str = "dealspy-notify";
