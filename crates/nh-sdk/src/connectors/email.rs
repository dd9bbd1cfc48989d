//! SMTP email connector built on lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, warn};

use nh_common::{ErrorCode, Message, MessageFormat, NotifyError, Result, Target, TargetType};
use nh_dispatch::{Capabilities, PlatformConnector};

#[derive(Debug)]
pub struct EmailConnector {
    name: String,
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailConnector {
    /// STARTTLS relay with password auth. No connection is made until
    /// the first send.
    pub fn new(
        host: &str,
        port: u16,
        user: impl Into<String>,
        pass: impl Into<String>,
        from: &str,
    ) -> Result<Self> {
        let from: Mailbox = from.parse().map_err(|e| {
            NotifyError::new(
                ErrorCode::MalformedAddress,
                format!("invalid from address '{from}': {e}"),
            )
        })?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| {
                NotifyError::new(
                    ErrorCode::InvalidConfig,
                    format!("invalid SMTP relay '{host}'"),
                )
                .with_source(e)
            })?
            .port(port)
            .credentials(Credentials::new(user.into(), pass.into()))
            .build();

        Ok(Self {
            name: "email".to_string(),
            from,
            transport,
        })
    }

    fn content_type(format: MessageFormat) -> ContentType {
        match format {
            MessageFormat::Html => ContentType::TEXT_HTML,
            _ => ContentType::TEXT_PLAIN,
        }
    }
}

#[async_trait]
impl PlatformConnector for EmailConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: vec![MessageFormat::Text, MessageFormat::Html],
            max_message_size: 10 * 1024 * 1024,
            supports_attachments: false,
        }
    }

    async fn send(&self, message: &Message, target: &Target) -> Result<()> {
        let to: Mailbox = target.value.parse().map_err(|e| {
            NotifyError::new(
                ErrorCode::MalformedAddress,
                format!("invalid recipient '{}': {e}", target.value),
            )
            .with_platform(self.name.clone())
        })?;

        let email = lettre::Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&message.title)
            .header(Self::content_type(message.format))
            .body(message.body.clone())
            .map_err(|e| {
                NotifyError::new(ErrorCode::InvalidMessage, "failed to build email")
                    .with_platform(self.name.clone())
                    .with_source(e)
            })?;

        match self.transport.send(email).await {
            Ok(_) => {
                debug!(platform = %self.name, message_id = %message.id, to = %target.value, "email accepted by relay");
                Ok(())
            }
            Err(e) => {
                warn!(platform = %self.name, message_id = %message.id, error = %e, "smtp send failed");
                let mapped = if e.is_permanent() {
                    NotifyError::new(
                        ErrorCode::InvalidMessage,
                        "relay permanently rejected the message",
                    )
                } else if e.is_transient() {
                    NotifyError::new(
                        ErrorCode::PlatformUnavailable,
                        "relay temporarily rejected the message",
                    )
                } else {
                    NotifyError::new(ErrorCode::ConnectionFailed, "smtp connection failed")
                };
                Err(mapped.with_platform(self.name.clone()).with_source(e))
            }
        }
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        if target.kind != TargetType::Email {
            return Err(NotifyError::new(
                ErrorCode::NoValidTarget,
                format!("email cannot address {:?} targets", target.kind),
            )
            .with_platform(self.name.clone()));
        }
        target.value.parse::<Mailbox>().map_err(|e| {
            NotifyError::new(
                ErrorCode::MalformedAddress,
                format!("invalid email address '{}': {e}", target.value),
            )
            .with_platform(self.name.clone())
        })?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::new(
                ErrorCode::PlatformUnavailable,
                "smtp relay refused the connection test",
            )
            .with_platform(self.name.clone())),
            Err(e) => Err(NotifyError::new(
                ErrorCode::ConnectionFailed,
                "smtp connection test failed",
            )
            .with_platform(self.name.clone())
            .with_source(e)),
        }
    }
}
