use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message received from a channel, normalized into the common shape.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    /// Platform-prefixed chat identifier (`discord:<channelId>`, `web:main`).
    pub jid: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_self: bool,
    pub is_bot: bool,
}

/// One inbound callback from a channel: the message plus whatever chat
/// metadata the platform knows.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub message: InboundMessage,
    /// Display name of the chat, when the platform provides one.
    pub chat_name: Option<String>,
}

/// Core channel trait — implement for any messaging platform.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name (also the JID prefix it owns).
    fn name(&self) -> &str;

    async fn connect(&self) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether this channel is responsible for the given JID.
    fn owns_jid(&self, jid: &str) -> bool;

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()>;

    /// Send a voice note if the platform supports it; the default falls
    /// back to a text reference.
    async fn send_voice(&self, jid: &str, audio_path: &str) -> anyhow::Result<()> {
        self.send_message(jid, &format!("[voice note] {audio_path}"))
            .await
    }

    async fn set_typing(&self, _jid: &str, _on: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether this JID is the owner's main chat on this channel.
    fn is_main_channel(&self, _jid: &str) -> bool {
        false
    }

    /// Start delivering inbound events (long-running).
    async fn listen(
        &self,
        tx: tokio::sync::mpsc::Sender<InboundEvent>,
    ) -> anyhow::Result<()>;
}
