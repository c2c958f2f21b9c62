use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dealspy_notify::{DispatchTally, Dispatcher};
use dealspy_storage::{DealStore, UserDirectory};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct NotifySummary {
    pub run_id: Uuid,
    pub deals_processed: usize,
    pub channels: DispatchTally,
}

/// Fans every unnotified deal out to matching users, then marks the whole batch notified.
pub struct NotifyJob {
    store: Arc<dyn DealStore>,
    users: Arc<dyn UserDirectory>,
    dispatcher: Dispatcher,
}

impl NotifyJob {
    pub fn new(store: Arc<dyn DealStore>, users: Arc<dyn UserDirectory>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            users,
            dispatcher,
        }
    }

    pub async fn run(&self) -> Result<NotifySummary> {
        let run_id = Uuid::new_v4();
        async {
            let deals = self.store.get_unnotified().await.context("loading unnotified deals")?;
            if deals.is_empty() {
                info!("no unnotified deals");
                return Ok(NotifySummary {
                    run_id,
                    deals_processed: 0,
                    channels: DispatchTally::default(),
                });
            }
            let users = self.users.active_users().await.context("loading active users")?;
            info!(deals = deals.len(), users = users.len(), "notify started");

            let now = Utc::now();
            let mut channels = DispatchTally::default();
            for deal in &deals {
                let tally = self.dispatcher.dispatch(deal, &users, now).await;
                channels.merge(&tally);
            }

            // Marked only after every deal's fan-out was attempted, whatever the outcomes.
            let ids: Vec<Uuid> = deals.iter().map(|d| d.id).collect();
            self.store.mark_notified(&ids).await.context("marking deals notified")?;

            info!(
                deals = ids.len(),
                sent = channels.total_sent(),
                failed = channels.total_failed(),
                "notify finished"
            );
            Ok(NotifySummary {
                run_id,
                deals_processed: ids.len(),
                channels,
            })
        }
        .instrument(info_span!("notify", %run_id))
        .await
    }
}
