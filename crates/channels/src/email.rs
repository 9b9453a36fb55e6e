//! SendGrid email delivery.
//!
//! `SendGridAdapter` posts to the v3 mail-send API and tags each message with
//! a `drip_message_id` custom argument so webhook events can be correlated
//! back to the message. `CaptureAdapter` records sends in memory for tests
//! and dry runs.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use drip_core::collaborators::DeliveryAdapter;
use drip_core::config::SendGridConfig;
use drip_core::types::OutboundEmail;
use drip_core::{DripError, DripResult};

/// SendGrid email delivery adapter.
pub struct SendGridAdapter {
    config: SendGridConfig,
    client: reqwest::Client,
}

impl SendGridAdapter {
    pub fn new(config: SendGridConfig, timeout: Duration) -> DripResult<Self> {
        if config.api_key.is_empty() {
            return Err(DripError::Config("sendgrid.api_key is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DripError::Config(format!("sendgrid client: {e}")))?;
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid adapter initialized"
        );
        Ok(Self { config, client })
    }

    /// Builds the v3 mail-send payload.
    pub fn payload(&self, email: &OutboundEmail) -> serde_json::Value {
        let from_email = if email.sender.from_email.is_empty() {
            &self.config.from_email
        } else {
            &email.sender.from_email
        };
        let from_name = if email.sender.from_name.is_empty() {
            &self.config.from_name
        } else {
            &email.sender.from_name
        };

        let mut content = Vec::new();
        if !email.text.is_empty() {
            content.push(serde_json::json!({"type": "text/plain", "value": email.text}));
        }
        content.push(serde_json::json!({"type": "text/html", "value": email.html}));

        let mut payload = serde_json::json!({
            "personalizations": [{
                "to": [{"email": email.to}],
                "custom_args": {
                    "drip_message_id": email.message_id.to_string()
                }
            }],
            "from": {
                "email": from_email,
                "name": from_name
            },
            "subject": email.subject,
            "content": content,
            "tracking_settings": {
                "click_tracking": {"enable": self.config.click_tracking},
                "open_tracking": {"enable": self.config.open_tracking}
            }
        });

        if let Some(reply_to) = &email.sender.reply_to {
            payload["reply_to"] = serde_json::json!({"email": reply_to});
        }
        if !email.attachments.is_empty() {
            payload["attachments"] = email
                .attachments
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "content": a.content,
                        "type": a.content_type,
                        "filename": a.filename,
                    })
                })
                .collect();
        }
        payload
    }
}

#[async_trait]
impl DeliveryAdapter for SendGridAdapter {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String> {
        let start = std::time::Instant::now();
        debug!(message_id = %email.message_id, to = %email.to, subject = %email.subject, "Sending email via SendGrid");

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(email))
            .send()
            .await
            .map_err(|e| {
                metrics::counter!("sendgrid.transport_errors").increment(1);
                DripError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("sendgrid.rejected", "status" => status.as_u16().to_string()).increment(1);
            warn!(message_id = %email.message_id, status = %status, "SendGrid rejected message");
            return Err(DripError::Transport(format!("sendgrid returned {status}: {body}")));
        }

        let transport_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("sg-{}", email.message_id));

        metrics::counter!("sendgrid.emails_sent").increment(1);
        metrics::histogram!("sendgrid.send_latency_ms").record(start.elapsed().as_millis() as f64);
        Ok(transport_id)
    }
}

/// In-memory adapter that records every send.
#[derive(Default)]
pub struct CaptureAdapter {
    sent: Mutex<Vec<OutboundEmail>>,
    failing_recipients: DashSet<String>,
    fail_all: AtomicBool,
}

impl CaptureAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every send to `email` fail with a transport error.
    pub fn fail_for(&self, email: impl Into<String>) {
        self.failing_recipients.insert(email.into());
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn count_to(&self, email: &str) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.to == email)
            .count()
    }
}

#[async_trait]
impl DeliveryAdapter for CaptureAdapter {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String> {
        if self.fail_all.load(Ordering::SeqCst) || self.failing_recipients.contains(&email.to) {
            return Err(DripError::Transport(format!("delivery to {} refused", email.to)));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email.clone());
        Ok(format!("capture-{}", email.message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::types::{Attachment, SenderConfig};
    use uuid::Uuid;

    fn email() -> OutboundEmail {
        OutboundEmail {
            message_id: Uuid::new_v4(),
            to: "ada@example.com".into(),
            subject: "Hello".into(),
            html: "<p>Hello</p>".into(),
            text: "Hello".into(),
            attachments: vec![Attachment {
                filename: "guide.pdf".into(),
                content_type: "application/pdf".into(),
                content: "SGVsbG8=".into(),
            }],
            sender: SenderConfig {
                from_email: String::new(),
                from_name: "Ada's Shop".into(),
                reply_to: Some("support@example.com".into()),
            },
        }
    }

    #[test]
    fn test_adapter_requires_api_key() {
        assert!(SendGridAdapter::new(SendGridConfig::default(), Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_payload_carries_message_id_and_sender_overrides() {
        let config = SendGridConfig {
            api_key: "SG.test".into(),
            ..SendGridConfig::default()
        };
        let adapter = SendGridAdapter::new(config.clone(), Duration::from_secs(5)).unwrap();
        let email = email();
        let payload = adapter.payload(&email);

        assert_eq!(
            payload["personalizations"][0]["custom_args"]["drip_message_id"],
            email.message_id.to_string()
        );
        assert_eq!(payload["from"]["email"], config.from_email);
        assert_eq!(payload["from"]["name"], "Ada's Shop");
        assert_eq!(payload["reply_to"]["email"], "support@example.com");
        assert_eq!(payload["content"][0]["type"], "text/plain");
        assert_eq!(payload["attachments"][0]["filename"], "guide.pdf");
    }

    #[tokio::test]
    async fn test_capture_adapter_records_and_fails_on_demand() {
        let adapter = CaptureAdapter::new();
        let email = email();
        let id = adapter.send(&email).await.unwrap();
        assert!(id.starts_with("capture-"));
        assert_eq!(adapter.count_to("ada@example.com"), 1);

        adapter.fail_for("ada@example.com");
        assert!(matches!(adapter.send(&email).await, Err(DripError::Transport(_))));
        assert_eq!(adapter.count(), 1);
    }
}
