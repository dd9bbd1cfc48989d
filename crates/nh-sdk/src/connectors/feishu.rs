//! Feishu (Lark) bot webhook connector.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use nh_common::{ErrorCode, Message, MessageFormat, NotifyError, Result, Target, TargetType};
use nh_dispatch::{Capabilities, PlatformConnector};

/// Feishu's bot signature: HMAC-SHA256 keyed on `"{timestamp}\n{secret}"`
/// over an empty input, base64-encoded.
fn sign(secret: &str, timestamp: i64) -> String {
    let key = format!("{timestamp}\n{secret}");
    let mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .expect("HMAC accepts any key length");
    BASE64.encode(mac.finalize().into_bytes())
}

#[derive(Debug, Deserialize)]
struct FeishuResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

pub struct FeishuConnector {
    name: String,
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl FeishuConnector {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| {
            NotifyError::new(ErrorCode::InvalidUrl, format!("invalid feishu webhook url: {e}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                NotifyError::new(ErrorCode::InvalidConfig, "failed to build HTTP client")
                    .with_source(e)
            })?;
        Ok(Self {
            name: "feishu".to_string(),
            url,
            secret,
            client,
        })
    }

    fn payload(&self, message: &Message) -> Value {
        let mut payload = match message.format {
            MessageFormat::Markdown => json!({
                "msg_type": "interactive",
                "card": {
                    "header": { "title": { "tag": "plain_text", "content": message.title } },
                    "elements": [
                        { "tag": "markdown", "content": message.body }
                    ]
                }
            }),
            _ => json!({
                "msg_type": "text",
                "content": { "text": format!("{}\n{}", message.title, message.body) }
            }),
        };
        if let Some(secret) = &self.secret {
            let timestamp = Utc::now().timestamp();
            payload["timestamp"] = json!(timestamp.to_string());
            payload["sign"] = json!(sign(secret, timestamp));
        }
        payload
    }
}

#[async_trait]
impl PlatformConnector for FeishuConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: vec![MessageFormat::Text, MessageFormat::Markdown],
            max_message_size: 30 * 1024,
            supports_attachments: false,
        }
    }

    async fn send(&self, message: &Message, _target: &Target) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|e| {
                let mapped = if e.is_timeout() {
                    NotifyError::new(ErrorCode::RequestTimeout, "feishu request timed out")
                } else if e.is_connect() {
                    NotifyError::new(ErrorCode::ConnectionFailed, "feishu connection failed")
                } else {
                    NotifyError::new(ErrorCode::PlatformSendFailed, "feishu request failed")
                };
                mapped.with_platform(self.name.clone()).with_source(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let code = if status.as_u16() == 429 {
                ErrorCode::PlatformRateLimited
            } else if status.is_server_error() {
                ErrorCode::PlatformInternalError
            } else {
                ErrorCode::PlatformSendFailed
            };
            return Err(NotifyError::new(code, format!("feishu returned HTTP {status}"))
                .with_platform(self.name.clone()));
        }

        // Feishu reports failures in the body with HTTP 200.
        let body: FeishuResponse = response.json().await.unwrap_or(FeishuResponse {
            code: 0,
            msg: String::new(),
        });
        if body.code != 0 {
            warn!(platform = %self.name, feishu_code = body.code, msg = %body.msg, "feishu rejected message");
            let code = if body.msg.to_ascii_lowercase().contains("sign") {
                ErrorCode::PlatformAuthFailed
            } else {
                ErrorCode::PlatformSendFailed
            };
            return Err(
                NotifyError::new(code, format!("feishu error {}: {}", body.code, body.msg))
                    .with_platform(self.name.clone())
                    .with_context("feishu_code", body.code),
            );
        }

        debug!(platform = %self.name, message_id = %message.id, "feishu message delivered");
        Ok(())
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        match target.kind {
            TargetType::User | TargetType::Group | TargetType::Channel | TargetType::Webhook => {
                Ok(())
            }
            _ => Err(NotifyError::new(
                ErrorCode::NoValidTarget,
                format!("feishu cannot address {:?} targets", target.kind),
            )
            .with_platform(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn signature_is_deterministic_per_timestamp() {
        let a = sign("secret", 1700000000);
        let b = sign("secret", 1700000000);
        let c = sign("secret", 1700000001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn sends_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "msg_type": "text" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 0 })))
            .expect(1)
            .mount(&server)
            .await;

        let connector = FeishuConnector::new(server.uri(), None).unwrap();
        let message = Message::builder().title("t").body("b").build();
        connector
            .send(&message, &Target::group("g", "feishu"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn markdown_uses_interactive_card() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "msg_type": "interactive" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 0 })))
            .expect(1)
            .mount(&server)
            .await;

        let connector = FeishuConnector::new(server.uri(), None).unwrap();
        let message = Message::builder()
            .title("t")
            .body("**bold**")
            .format(MessageFormat::Markdown)
            .build();
        connector
            .send(&message, &Target::group("g", "feishu"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn body_level_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 19021,
                "msg": "sign match fail"
            })))
            .mount(&server)
            .await;

        let connector = FeishuConnector::new(server.uri(), Some("bad".into())).unwrap();
        let message = Message::builder().title("t").body("b").build();
        let error = connector
            .send(&message, &Target::group("g", "feishu"))
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::PlatformAuthFailed);
    }

    #[test]
    fn rejects_email_targets() {
        let connector = FeishuConnector::new("https://open.feishu.cn/hook", None).unwrap();
        let error = connector
            .validate_target(&Target::email("a@x", "feishu"))
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::NoValidTarget);
    }
}
