//! Notifier implementations.

use std::time::Duration;

use async_trait::async_trait;
use pociv_core::{Notification, Notifier, NotifyError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Writes notifications to the log. Used when no delivery endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            run = %notification.run_id,
            recipient = %notification.recipient,
            kind = notification.kind_name(),
            message = %notification.message(),
            "notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookNotifierConfig {
    pub url: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    #[serde(flatten)]
    notification: &'a Notification,
    message: String,
}

/// POSTs each notification as JSON to a bot relay endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: WebhookNotifierConfig) -> Result<Self, NotifyError> {
        if config.url.trim().is_empty() {
            return Err(NotifyError::Transport("webhook url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = WebhookBody {
            notification,
            message: notification.message(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(run = %notification.run_id, kind = notification.kind_name(), "notification delivered");
        Ok(())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> NotifyError {
    if err.is_timeout() {
        NotifyError::Timeout
    } else {
        NotifyError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pociv_core::{ChannelId, MessageId, NotificationKind, RunId, UserId};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification() -> Notification {
        Notification {
            run_id: RunId::derive(ChannelId(1), MessageId(2)),
            recipient: UserId(42),
            kind: NotificationKind::NoWallet { score: 4.2 },
        }
    }

    fn notifier(server: &MockServer, timeout_ms: u64) -> WebhookNotifier {
        WebhookNotifier::new(WebhookNotifierConfig {
            url: format!("{}/notify", server.uri()),
            timeout_ms,
        })
        .expect("notifier")
    }

    #[tokio::test]
    async fn posts_flat_json_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .and(body_partial_json(serde_json::json!({
                "kind": "no_wallet",
                "recipient": 42,
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server, 1_000)
            .deliver(&notification())
            .await
            .expect("deliver");
    }

    #[tokio::test]
    async fn non_success_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = notifier(&server, 1_000)
            .deliver(&notification())
            .await
            .expect_err("rejected");
        assert_eq!(err, NotifyError::Rejected { status: 502 });
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = notifier(&server, 50)
            .deliver(&notification())
            .await
            .expect_err("timeout");
        assert_eq!(err, NotifyError::Timeout);
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = WebhookNotifier::new(WebhookNotifierConfig {
            url: " ".to_string(),
            timeout_ms: 10,
        })
        .expect_err("empty");
        assert!(matches!(err, NotifyError::Transport(_)));
    }

    #[tokio::test]
    async fn logging_notifier_always_succeeds() {
        LoggingNotifier.deliver(&notification()).await.expect("log");
    }
}
