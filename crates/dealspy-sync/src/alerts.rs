use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dealspy_core::Source;
use dealspy_notify::{alert_email, Mailer};
use tracing::{error, warn};

use crate::ingest::SourceFailure;

/// Operator notices raised after an ingestion run. Delivery problems are logged only.
#[async_trait]
pub trait OperatorAlerts: Send + Sync {
    async fn scraper_failures(&self, failures: &[SourceFailure]);
    async fn fallback_used(&self, sources: &[Source]);
}

/// Writes alerts to the log. Used when no admin mailbox is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerts;

#[async_trait]
impl OperatorAlerts for LogAlerts {
    async fn scraper_failures(&self, failures: &[SourceFailure]) {
        for f in failures {
            error!(source = %f.source, error = %f.message, "source failed after retries");
        }
    }

    async fn fallback_used(&self, sources: &[Source]) {
        for source in sources {
            warn!(%source, "fallback extraction used, parser likely needs an update");
        }
    }
}

pub fn failure_alert(failures: &[SourceFailure]) -> (String, String) {
    let subject = format!("Scraper failures ({} {})", failures.len(), plural_source(failures.len()));
    let lines: Vec<String> = failures.iter().map(|f| format!("- {}: {}", f.source, f.message)).collect();
    let body = format!(
        "The following sources failed after all retries:\n\n{}\n\nTime: {}",
        lines.join("\n"),
        Utc::now().to_rfc3339()
    );
    (subject, body)
}

pub fn fallback_alert(sources: &[Source]) -> (String, String) {
    let subject = format!(
        "Fallback extraction used ({} {}), page layout probably changed",
        sources.len(),
        plural_source(sources.len())
    );
    let names: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
    let body = format!(
        "Structured parsing found no listings on these sources and the generative extractor supplied them. \
         The site markup has most likely changed.\n\nSources: {}\n\nThe parser for each source should be updated.\n\nTime: {}",
        names.join(", "),
        Utc::now().to_rfc3339()
    );
    (subject, body)
}

fn plural_source(n: usize) -> &'static str {
    if n == 1 {
        "source"
    } else {
        "sources"
    }
}

pub struct MailAlerts {
    mailer: Arc<dyn Mailer>,
    admin_email: String,
}

impl MailAlerts {
    pub fn new(mailer: Arc<dyn Mailer>, admin_email: impl Into<String>) -> Self {
        Self {
            mailer,
            admin_email: admin_email.into(),
        }
    }

    async fn deliver(&self, kind: &'static str, (subject, body): (String, String)) {
        let email = alert_email(&self.admin_email, &subject, &body);
        if let Err(err) = self.mailer.send(&email).await {
            warn!(kind, error = %err, "operator alert delivery failed");
        }
    }
}

#[async_trait]
impl OperatorAlerts for MailAlerts {
    async fn scraper_failures(&self, failures: &[SourceFailure]) {
        if !failures.is_empty() {
            self.deliver("scraper_failures", failure_alert(failures)).await;
        }
    }

    async fn fallback_used(&self, sources: &[Source]) {
        if !sources.is_empty() {
            self.deliver("fallback_used", fallback_alert(sources)).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dealspy_notify::{OutgoingEmail, SendError};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct OutboxMailer {
        pub(crate) sent: Mutex<Vec<OutgoingEmail>>,
        pub(crate) reject: bool,
    }

    #[async_trait]
    impl Mailer for OutboxMailer {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), SendError> {
            if self.reject {
                return Err(SendError::Rejected("mailbox full".into()));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failure_alert_lists_each_source() {
        let mailer = Arc::new(OutboxMailer::default());
        let alerts = MailAlerts::new(mailer.clone(), "ops@example.test");
        alerts
            .scraper_failures(&[
                SourceFailure::new(Source::Netbid, "HTTP 503"),
                SourceFailure::new(Source::Eer, "timeout"),
            ])
            .await;

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[DealSpy] Scraper failures (2 sources)");
        assert!(sent[0].text.contains("- netbid: HTTP 503"));
        assert!(sent[0].text.contains("- eer: timeout"));
    }

    #[tokio::test]
    async fn empty_lists_send_nothing() {
        let mailer = Arc::new(OutboxMailer::default());
        let alerts = MailAlerts::new(mailer.clone(), "ops@example.test");
        alerts.scraper_failures(&[]).await;
        alerts.fallback_used(&[]).await;
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let mailer = Arc::new(OutboxMailer {
            reject: true,
            ..OutboxMailer::default()
        });
        let alerts = MailAlerts::new(mailer, "ops@example.test");
        alerts.fallback_used(&[Source::Proventura]).await;
    }

    #[test]
    fn fallback_alert_names_sources() {
        let (subject, body) = fallback_alert(&[Source::Proventura]);
        assert!(subject.contains("(1 source)"));
        assert!(body.contains("Sources: proventura"));
    }
}
