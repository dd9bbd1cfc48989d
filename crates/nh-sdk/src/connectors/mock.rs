//! Scriptable in-memory connector for tests and smoke runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nh_common::{ErrorCode, Message, MessageFormat, NotifyError, Result, Target};
use nh_dispatch::{Capabilities, PlatformConnector};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    AlwaysSucceed,
    /// Fail the first N sends with the code, then succeed.
    FailFirst { remaining: u32, code: ErrorCode },
    AlwaysFail { code: ErrorCode },
}

/// Records every send and follows a scripted outcome.
pub struct MockConnector {
    name: String,
    behavior: Mutex<Behavior>,
    latency: Duration,
    calls: AtomicU32,
    sent: Mutex<Vec<(String, Target)>>,
}

impl MockConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Mutex::new(Behavior::AlwaysSucceed),
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` sends with `code`, then succeed.
    pub fn fail_first(name: impl Into<String>, n: u32, code: ErrorCode) -> Self {
        let mock = Self::new(name);
        *mock.behavior.lock() = Behavior::FailFirst { remaining: n, code };
        mock
    }

    pub fn always_fail(name: impl Into<String>, code: ErrorCode) -> Self {
        let mock = Self::new(name);
        *mock.behavior.lock() = Behavior::AlwaysFail { code };
        mock
    }

    /// Simulated per-send latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(message_id, target)` pairs of every *successful* send.
    pub fn sent(&self) -> Vec<(String, Target)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PlatformConnector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: vec![MessageFormat::Text, MessageFormat::Markdown, MessageFormat::Html],
            max_message_size: usize::MAX,
            supports_attachments: true,
        }
    }

    async fn send(&self, message: &Message, target: &Target) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = {
            let mut behavior = self.behavior.lock();
            match *behavior {
                Behavior::AlwaysSucceed => Ok(()),
                Behavior::FailFirst { remaining, code } => {
                    if remaining > 0 {
                        *behavior = Behavior::FailFirst {
                            remaining: remaining - 1,
                            code,
                        };
                        Err(code)
                    } else {
                        Ok(())
                    }
                }
                Behavior::AlwaysFail { code } => Err(code),
            }
        };

        match outcome {
            Ok(()) => {
                self.sent
                    .lock()
                    .push((message.id.clone(), target.clone()));
                Ok(())
            }
            Err(code) => {
                Err(NotifyError::from_code(code).with_platform(self.name.clone()))
            }
        }
    }

    fn validate_target(&self, _target: &Target) -> Result<()> {
        Ok(())
    }
}
