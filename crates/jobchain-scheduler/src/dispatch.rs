//! Notification dispatch: delivers failure notices to the subscriber endpoint.
//! Supports: SMTP email (lettre), generic HTTP webhook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobchain_core::config::{EmailNotifyConfig, NotifyConfig, NotifyKind, WebhookNotifyConfig};
use jobchain_core::{FailureNotice, JobchainError, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::notify::{LogNotifier, Notifier};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends each notice as a plain-text email to one subscriber.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailNotifier {
    pub fn new(config: &EmailNotifyConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| JobchainError::Config(format!("notify.email.from: {e}")))?;
        let to: Mailbox = config
            .to
            .parse()
            .map_err(|e| JobchainError::Config(format!("notify.email.to: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| JobchainError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    /// Render the message without sending it.
    pub fn compose(&self, notice: &FailureNotice) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("[jobchain] {} {}", notice.job_id, notice.message))
            .header(ContentType::TEXT_PLAIN)
            .body(serde_json::to_string_pretty(notice)?)
            .map_err(|e| JobchainError::Notify(format!("Email build: {e}")))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        let email = self.compose(notice)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| JobchainError::Notify(format!("SMTP send: {e}")))?;
        tracing::info!("✅ Failure email sent to {} for {}", self.to, notice.job_id);
        Ok(())
    }
}

/// POSTs the notice as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookNotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            headers: config.headers.clone(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        let mut req = self.client.post(&self.url).json(notice).timeout(WEBHOOK_TIMEOUT);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| JobchainError::Notify(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, notice.job_id);
            Ok(())
        } else {
            Err(JobchainError::Notify(format!("Webhook error {}", resp.status())))
        }
    }
}

/// Build the configured notifier. Called once at startup.
pub fn notifier_from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match config.kind {
        NotifyKind::Log => Ok(Arc::new(LogNotifier::new())),
        NotifyKind::Email => {
            let email = config
                .email
                .as_ref()
                .ok_or_else(|| JobchainError::Config("missing [notify.email]".into()))?;
            Ok(Arc::new(EmailNotifier::new(email)?))
        }
        NotifyKind::Webhook => {
            let webhook = config
                .webhook
                .as_ref()
                .ok_or_else(|| JobchainError::Config("missing [notify.webhook]".into()))?;
            Ok(Arc::new(WebhookNotifier::new(webhook)))
        }
    }
}
