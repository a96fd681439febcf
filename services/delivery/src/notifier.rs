use crate::config::MailConfig;
use crate::error::{PipelineError, Result};
use anyhow::Context;
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Outgoing mail capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// SMTP mailer
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> anyhow::Result<Self> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .context("Failed to configure SMTP relay")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        builder = builder.port(config.smtp_port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from: Mailbox = config
            .from_address
            .parse()
            .context("Invalid mail.from_address")?;

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            tls = config.use_tls,
            "SMTP mailer initialized"
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let recipient: Mailbox = to
            .parse()
            .with_context(|| format!("Invalid recipient address '{to}'"))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("Failed to build message")?;

        self.transport
            .send(message)
            .await
            .context("SMTP send failed")?;

        Ok(())
    }
}

/// Human-readable validity window, e.g. "1 hour" or "30 minutes"
pub fn describe_window(window: Duration) -> String {
    let secs = window.as_secs();
    let (amount, unit) = if secs >= 3600 && secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };

    if amount == 1 {
        format!("1 {unit}")
    } else {
        format!("{amount} {unit}s")
    }
}

/// Sends download links to requesters
pub struct DeliveryNotifier {
    mailer: Arc<dyn Mailer>,
    subject: String,
    validity: Duration,
}

impl DeliveryNotifier {
    pub fn new(mailer: Arc<dyn Mailer>, subject: impl Into<String>, validity: Duration) -> Self {
        Self {
            mailer,
            subject: subject.into(),
            validity,
        }
    }

    /// Message body carrying the link and its validity window
    pub fn compose(&self, url: &str) -> String {
        format!(
            "Your matched images are here:\n\n{url}\n\nThis link will expire in {}.",
            describe_window(self.validity)
        )
    }

    /// Send the download link. Failures propagate as `DeliveryFailure`.
    #[instrument(skip(self, url))]
    pub async fn notify(&self, email: &str, url: &str) -> Result<()> {
        let body = self.compose(url);

        self.mailer
            .send(email, &self.subject, &body)
            .await
            .map_err(|e| PipelineError::DeliveryFailure(format!("{e:#}")))?;

        info!(email = %email, "Download link sent");
        metrics::counter!("delivery.mails.sent").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_window() {
        assert_eq!(describe_window(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe_window(Duration::from_secs(7200)), "2 hours");
        assert_eq!(describe_window(Duration::from_secs(1800)), "30 minutes");
        assert_eq!(describe_window(Duration::from_secs(45)), "45 seconds");
    }

    #[test]
    fn test_compose_includes_url_and_window() {
        let notifier = DeliveryNotifier::new(
            Arc::new(MockMailer::new()),
            "Face Match Results",
            Duration::from_secs(3600),
        );

        let body = notifier.compose("https://cdn.example.com/matched_a_b_com_r1.zip");

        assert!(body.contains("https://cdn.example.com/matched_a_b_com_r1.zip"));
        assert!(body.ends_with("This link will expire in 1 hour."));
    }

    #[tokio::test]
    async fn test_notify_sends_once() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .withf(|to, subject, body| {
                to == "a@b.com" && subject == "Face Match Results" && body.contains("https://x/y.zip")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let notifier =
            DeliveryNotifier::new(Arc::new(mailer), "Face Match Results", Duration::from_secs(3600));

        notifier.notify("a@b.com", "https://x/y.zip").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_is_delivery_failure() {
        let mut mailer = MockMailer::new();
        mailer
            .expect_send()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("connection refused")));

        let notifier =
            DeliveryNotifier::new(Arc::new(mailer), "Face Match Results", Duration::from_secs(3600));

        let result = notifier.notify("a@b.com", "https://x/y.zip").await;

        assert!(
            matches!(result, Err(PipelineError::DeliveryFailure(ref msg)) if msg.contains("connection refused"))
        );
    }
}
