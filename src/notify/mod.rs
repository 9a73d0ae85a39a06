//! Outbound notifications fired after a check run.
//!
//! Notifier kinds form a closed set. Dispatch is fire-and-forget: every
//! notification is sent on its own task and a failure is only logged.

pub mod webhook;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::Status;

pub use self::webhook::WebhookNotification;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint answered with HTTP {status}")]
    Status { status: u16 },
}

/// Context handed to every notifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationContext {
    pub service: String,
    pub check_name: String,
    pub status: Status,
    pub output: String,
}

/// A configured notification, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationSpec {
    Webhook(WebhookNotification),
}

impl NotificationSpec {
    /// Validate and fill in defaults.
    pub fn normalize(&mut self) -> Result<(), NotifyError> {
        match self {
            NotificationSpec::Webhook(hook) => hook.normalize(),
        }
    }

    pub async fn send(&self, client: &reqwest::Client, ctx: &NotificationContext) -> Result<(), NotifyError> {
        match self {
            NotificationSpec::Webhook(hook) => hook.send(client, ctx).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NotificationSpec::Webhook(_) => "webhook",
        }
    }
}

/// Sends notification lists in the background.
#[derive(Clone, Default)]
pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Spawn one send per notification and return immediately.
    pub fn dispatch(&self, notifications: &[NotificationSpec], ctx: &NotificationContext) {
        for notification in notifications {
            let client = self.client.clone();
            let notification = notification.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                match notification.send(&client, &ctx).await {
                    Ok(()) => debug!(
                        service = %ctx.service,
                        check = %ctx.check_name,
                        kind = notification.kind(),
                        "Notification sent"
                    ),
                    Err(e) => warn!(
                        service = %ctx.service,
                        check = %ctx.check_name,
                        kind = notification.kind(),
                        error = %e,
                        "Notification failed"
                    ),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_is_tagged_by_type() {
        let spec: NotificationSpec = toml::from_str(
            r#"
type = "webhook"
url = "https://hooks.example.com/x"
"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), "webhook");

        let unknown: Result<NotificationSpec, _> = toml::from_str(
            r#"
type = "carrier-pigeon"
url = "https://hooks.example.com/x"
"#,
        );
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_request_error() {
        let mut spec = NotificationSpec::Webhook(WebhookNotification::new("http://127.0.0.1:9/unreachable"));
        spec.normalize().unwrap();
        let ctx = NotificationContext {
            service: "web".into(),
            check_name: "home".into(),
            status: Status::Unhealthy,
            output: "boom".into(),
        };

        let err = spec.send(&reqwest::Client::new(), &ctx).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)), "{err}");

        // Dispatching the same hook returns at once; the failure is only logged.
        Dispatcher::default().dispatch(&[spec], &ctx);
    }
}
