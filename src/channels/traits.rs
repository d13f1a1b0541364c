use async_trait::async_trait;

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChannelMessage {
    /// Platform message id
    pub id: String,
    /// Chat the message arrived in; replies go back here
    pub chat_id: String,
    /// Sender open_id (empty when the platform omits it)
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub channel: String,
    /// Unix seconds
    pub timestamp: u64,
    /// Sent by this app itself
    pub is_from_me: bool,
}

/// An outbound message addressed to a chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
}

impl SendMessage {
    pub fn new(content: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient: recipient.into(),
        }
    }
}

/// Core channel trait, implemented once per messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send a single message through this channel, as-is
    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }

    /// Signal that the bot is processing a response (e.g. "typing" indicator).
    async fn start_typing(&self, _recipient: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop any active typing indicator.
    async fn stop_typing(&self, _recipient: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
