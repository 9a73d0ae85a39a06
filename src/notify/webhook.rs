//! HTTP webhook notifier.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use super::{NotificationContext, NotifyError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body; `{service}`, `{check}`, `{status}` and `{output}` are
    /// substituted before sending.
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl WebhookNotification {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn normalize(&mut self) -> Result<(), NotifyError> {
        let url = Url::parse(&self.url).map_err(|e| NotifyError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(NotifyError::InvalidUrl {
                url: self.url.clone(),
                reason: "a hostname is required".to_string(),
            });
        }

        self.method = if self.method.trim().is_empty() {
            default_method()
        } else {
            self.method.trim().to_uppercase()
        };
        self.method()?;
        self.header_map()?;
        Ok(())
    }

    fn method(&self) -> Result<Method, NotifyError> {
        Method::from_bytes(self.method.as_bytes())
            .map_err(|_| NotifyError::InvalidMethod(self.method.clone()))
    }

    fn header_map(&self) -> Result<HeaderMap, NotifyError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NotifyError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| NotifyError::InvalidHeader(name.clone()))?;
            map.insert(header, value);
        }
        Ok(map)
    }

    pub async fn send(&self, client: &reqwest::Client, ctx: &NotificationContext) -> Result<(), NotifyError> {
        let url = Url::parse(&self.url).map_err(|e| NotifyError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        let mut request = client
            .request(self.method()?, url)
            .headers(self.header_map()?)
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = &self.body {
            request = request.body(render(body, ctx));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Substitute check details into a body template in one pass; substituted
/// values are never scanned for placeholders again.
pub fn render(template: &str, ctx: &NotificationContext) -> String {
    let fields = [
        ("{service}", ctx.service.as_str()),
        ("{check}", ctx.check_name.as_str()),
        ("{status}", ctx.status.as_str()),
        ("{output}", ctx.output.as_str()),
    ];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match fields.iter().find(|(placeholder, _)| tail.starts_with(*placeholder)) {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
