//! Generic HTTP webhook connector.
//!
//! POSTs the message + target as JSON. When a signing secret is
//! configured, requests carry HMAC-SHA256 headers computed over
//! `timestamp + body`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, warn};

use nh_common::{ErrorCode, Message, MessageFormat, NotifyError, Result, Target, TargetType};
use nh_dispatch::{Capabilities, PlatformConnector};

pub const SIGNATURE_HEADER: &str = "X-NOTIFYHUB-SIGNATURE";
pub const TIMESTAMP_HEADER: &str = "X-NOTIFYHUB-TIMESTAMP";

type HmacSha256 = Hmac<Sha256>;

/// Signature payload is `timestamp + body`; hex-encoded HMAC-SHA256.
fn sign_payload(payload: &str, secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{timestamp}{payload}");

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

#[derive(Debug)]
pub struct WebhookConnector {
    name: String,
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookConnector {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| {
            NotifyError::new(ErrorCode::InvalidUrl, format!("invalid webhook url: {e}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                NotifyError::new(ErrorCode::InvalidConfig, "failed to build HTTP client")
                    .with_source(e)
            })?;
        Ok(Self {
            name: "webhook".to_string(),
            url,
            secret: None,
            client,
        })
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn classify_status(&self, status: reqwest::StatusCode) -> Option<NotifyError> {
        let code = status.as_u16();
        let error = if status.is_success() {
            return None;
        } else if code == 401 || code == 403 {
            NotifyError::new(ErrorCode::PlatformAuthFailed, format!("HTTP {code}: auth rejected"))
        } else if code == 404 {
            NotifyError::new(ErrorCode::InvalidUrl, "HTTP 404: endpoint not found")
        } else if code == 413 {
            NotifyError::new(ErrorCode::MessageTooLarge, "HTTP 413: payload too large")
        } else if code == 429 {
            NotifyError::new(ErrorCode::PlatformRateLimited, "HTTP 429: too many requests")
        } else if status.is_client_error() {
            NotifyError::new(ErrorCode::InvalidMessage, format!("HTTP {code}: rejected"))
        } else {
            NotifyError::new(
                ErrorCode::PlatformInternalError,
                format!("HTTP {code}: server error"),
            )
        };
        Some(error.with_platform(self.name.clone()))
    }

    fn classify_transport(&self, error: reqwest::Error) -> NotifyError {
        let mapped = if error.is_timeout() {
            NotifyError::new(ErrorCode::RequestTimeout, "request timed out")
        } else if error.is_connect() {
            NotifyError::new(ErrorCode::ConnectionFailed, "connection failed")
        } else {
            NotifyError::new(ErrorCode::PlatformSendFailed, "request failed")
        };
        mapped.with_platform(self.name.clone()).with_source(error)
    }

    /// Target-specific URL when the target is a webhook, else the
    /// configured endpoint.
    fn endpoint<'a>(&'a self, target: &'a Target) -> &'a str {
        if target.kind == TargetType::Webhook && !target.value.is_empty() {
            &target.value
        } else {
            &self.url
        }
    }
}

#[async_trait]
impl PlatformConnector for WebhookConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: vec![MessageFormat::Text, MessageFormat::Markdown, MessageFormat::Html],
            max_message_size: 256 * 1024,
            supports_attachments: false,
        }
    }

    async fn send(&self, message: &Message, target: &Target) -> Result<()> {
        let payload = json!({
            "message": message,
            "target": target,
        });
        let body = serde_json::to_string(&payload).map_err(|e| {
            NotifyError::new(ErrorCode::InvalidMessage, "failed to serialize payload")
                .with_platform(self.name.clone())
                .with_source(e)
        })?;

        let mut request = self
            .client
            .post(self.endpoint(target))
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            let (signature, timestamp) = sign_payload(&body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        if let Some(error) = self.classify_status(response.status()) {
            warn!(
                platform = %self.name,
                message_id = %message.id,
                status = response.status().as_u16(),
                "webhook delivery rejected"
            );
            return Err(error);
        }

        debug!(platform = %self.name, message_id = %message.id, "webhook delivered");
        Ok(())
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        if target.kind == TargetType::Webhook && !target.value.is_empty() {
            reqwest::Url::parse(&target.value).map_err(|e| {
                NotifyError::new(ErrorCode::InvalidUrl, format!("invalid target url: {e}"))
                    .with_platform(self.name.clone())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nh_common::Target;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> Message {
        Message::builder().title("hi").body("there").build()
    }

    #[tokio::test]
    async fn posts_message_json_and_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let connector = WebhookConnector::new(format!("{}/hook", server.uri())).unwrap();
        let target = Target::webhook(format!("{}/hook", server.uri()));
        connector.send(&message(), &target).await.unwrap();
    }

    #[tokio::test]
    async fn signs_requests_when_secret_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists(SIGNATURE_HEADER))
            .and(header_exists(TIMESTAMP_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let connector = WebhookConnector::new(server.uri())
            .unwrap()
            .with_secret("s3cret");
        let target = Target::webhook(server.uri());
        connector.send(&message(), &target).await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_map_to_retryable_plt007() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let connector = WebhookConnector::new(server.uri()).unwrap();
        let error = connector
            .send(&message(), &Target::webhook(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::PlatformInternalError);
        assert!(error.is_retryable());
        assert_eq!(error.platform.as_deref(), Some("webhook"));
    }

    #[tokio::test]
    async fn auth_failures_are_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let connector = WebhookConnector::new(server.uri()).unwrap();
        let error = connector
            .send(&message(), &Target::webhook(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::PlatformAuthFailed);
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn rate_limiting_maps_to_plt004() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let connector = WebhookConnector::new(server.uri()).unwrap();
        let error = connector
            .send(&message(), &Target::webhook(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::PlatformRateLimited);
    }

    #[test]
    fn rejects_malformed_urls_at_construction() {
        let error = WebhookConnector::new("not a url").unwrap_err();
        assert_eq!(error.code, ErrorCode::InvalidUrl);
    }

    #[test]
    fn signature_is_stable_for_fixed_inputs() {
        let (sig_a, _) = sign_payload("body", "secret");
        assert_eq!(sig_a.len(), 64, "hex-encoded sha256");
    }
}
