use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bot api rejected the call: {0}")]
    Api(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One inbound chat event the driver dispatches on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Transport-level cursor; the driver resumes from the highest seen + 1.
    pub update_id: i64,
    pub user_id: i64,
    pub text: String,
}

/// Seam to the chat transport. The lifecycle core only ever talks to this
/// trait; the concrete Bot API client below is one implementation, test
/// mocks are another.
#[async_trait]
pub trait MessagingGateway {
    async fn send_text(&self, recipient: i64, text: &str) -> Result<(), TransportError>;

    async fn send_file(
        &self,
        recipient: i64,
        path: &Path,
        caption: &str,
    ) -> Result<(), TransportError>;

    /// Long-poll for inbound events at `offset`. Returns in at most the
    /// configured poll timeout, possibly empty.
    async fn fetch_updates(&self, offset: i64) -> Result<Vec<InboundMessage>, TransportError>;
}

/// Telegram Bot API client over plain HTTPS.
pub struct TelegramGateway {
    client: reqwest::Client,
    base: String,
    poll_timeout: Duration,
}

impl TelegramGateway {
    pub fn new(token: &str, poll_timeout: Duration) -> Result<Self, TransportError> {
        // The HTTP timeout must outlast the server-side long-poll window.
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: format!("https://api.telegram.org/bot{token}"),
            poll_timeout,
        })
    }

    async fn check_ok(resp: reqwest::Response) -> Result<Value, TransportError> {
        let body: Value = resp.json().await?;
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let description = body
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("no description");
            return Err(TransportError::Api(description.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send_text(&self, recipient: i64, text: &str) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base))
            .json(&json!({ "chat_id": recipient, "text": text }))
            .send()
            .await?;
        Self::check_ok(resp).await?;
        Ok(())
    }

    async fn send_file(
        &self,
        recipient: i64,
        path: &Path,
        caption: &str,
    ) -> Result<(), TransportError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "media.mp4".to_string());

        let form = reqwest::multipart::Form::new()
            .text("chat_id", recipient.to_string())
            .text("caption", caption.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let resp = self
            .client
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await?;
        Self::check_ok(resp).await?;
        Ok(())
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<InboundMessage>, TransportError> {
        let resp = self
            .client
            .post(format!("{}/getUpdates", self.base))
            .json(&json!({
                "offset": offset,
                "timeout": self.poll_timeout.as_secs(),
                "allowed_updates": ["message"],
            }))
            .send()
            .await?;
        let body = Self::check_ok(resp).await?;

        let messages = parse_updates(&body);
        if !messages.is_empty() {
            debug!("fetched {} inbound message(s)", messages.len());
        }
        Ok(messages)
    }
}

/// Pull text messages out of a `getUpdates` response body.
///
/// Non-text updates (stickers, joins, edits) still advance the cursor but
/// produce no inbound message.
fn parse_updates(body: &Value) -> Vec<InboundMessage> {
    let Some(results) = body.get("result").and_then(|v| v.as_array()) else {
        warn!("getUpdates response had no result array");
        return Vec::new();
    };

    let mut messages = Vec::new();
    for update in results {
        let Some(update_id) = update.get("update_id").and_then(|v| v.as_i64()) else {
            continue;
        };

        let message = update.get("message");
        let user_id = message
            .and_then(|m| m.get("from"))
            .and_then(|f| f.get("id"))
            .and_then(|v| v.as_i64())
            .or_else(|| {
                message
                    .and_then(|m| m.get("chat"))
                    .and_then(|c| c.get("id"))
                    .and_then(|v| v.as_i64())
            });
        let text = message
            .and_then(|m| m.get("text"))
            .and_then(|v| v.as_str());

        match (user_id, text) {
            (Some(user_id), Some(text)) => messages.push(InboundMessage {
                update_id,
                user_id,
                text: text.to_string(),
            }),
            // Keep the cursor moving past updates we don't handle.
            _ => messages.push(InboundMessage {
                update_id,
                user_id: 0,
                text: String::new(),
            }),
        }
    }
    messages
}

/// Recording gateway used by lifecycle and driver tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{InboundMessage, MessagingGateway, TransportError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Delivery {
        Text {
            to: i64,
            text: String,
        },
        File {
            to: i64,
            path: PathBuf,
            caption: String,
        },
    }

    #[derive(Default)]
    pub struct MockGateway {
        pub deliveries: Mutex<Vec<Delivery>>,
        /// Queued inbound batches; each `fetch_updates` call pops one.
        pub inbound: Mutex<Vec<Vec<InboundMessage>>>,
        /// When set, every send reports a transport failure (but still records).
        pub fail_sends: bool,
    }

    impl MockGateway {
        pub fn with_inbound(batches: Vec<Vec<InboundMessage>>) -> Self {
            Self {
                inbound: Mutex::new(batches),
                ..Self::default()
            }
        }

        pub fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingGateway for MockGateway {
        async fn send_text(&self, recipient: i64, text: &str) -> Result<(), TransportError> {
            self.deliveries.lock().unwrap().push(Delivery::Text {
                to: recipient,
                text: text.to_string(),
            });
            if self.fail_sends {
                return Err(TransportError::Api("mock send failure".to_string()));
            }
            Ok(())
        }

        async fn send_file(
            &self,
            recipient: i64,
            path: &Path,
            caption: &str,
        ) -> Result<(), TransportError> {
            self.deliveries.lock().unwrap().push(Delivery::File {
                to: recipient,
                path: path.to_path_buf(),
                caption: caption.to_string(),
            });
            if self.fail_sends {
                return Err(TransportError::Api("mock send failure".to_string()));
            }
            Ok(())
        }

        async fn fetch_updates(
            &self,
            _offset: i64,
        ) -> Result<Vec<InboundMessage>, TransportError> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(inbound.remove(0))
            }
        }
    }
}
