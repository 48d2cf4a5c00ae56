//! Channel router.
//!
//! Inbound: normalize platform events, keep chat metadata fresh, apply
//! trigger gating, and feed the per-chat queues. Outbound: route by JID
//! prefix to the channel that owns it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::RegexBuilder;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::{Channel, InboundEvent};
use crate::config::Config;
use crate::db::{ChatStore, RegisteredChat};
use crate::events::{Event, EventBus};
use crate::plugins::MessagesApi;
use crate::queue::ChatQueues;

// ── Outbound delivery ─────────────────────────────────────────────

/// Routes outbound traffic to the owning channel. This is the live
/// `messages` service handed to plugins, the queues, and the task engine.
pub struct Outbound {
    channels: Vec<Arc<dyn Channel>>,
}

impl Outbound {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    fn channel_for(&self, jid: &str) -> Result<&Arc<dyn Channel>> {
        self.channels
            .iter()
            .find(|c| c.owns_jid(jid))
            .ok_or_else(|| anyhow::anyhow!("no channel owns jid '{jid}'"))
    }
}

#[async_trait]
impl MessagesApi for Outbound {
    async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
        self.channel_for(jid)?
            .send_message(jid, text)
            .await
            .with_context(|| format!("send to {jid} failed"))
    }

    async fn send_voice(&self, jid: &str, audio_path: &str) -> Result<()> {
        self.channel_for(jid)?
            .send_voice(jid, audio_path)
            .await
            .with_context(|| format!("voice send to {jid} failed"))
    }

    async fn set_typing(&self, jid: &str, on: bool) -> Result<()> {
        match self.channel_for(jid) {
            Ok(channel) => channel.set_typing(jid, on).await,
            // typing is best-effort; an unroutable jid is not an error here
            Err(_) => Ok(()),
        }
    }
}

// ── Inbound routing ───────────────────────────────────────────────

pub struct ChannelRouter {
    config: Config,
    channels: Vec<Arc<dyn Channel>>,
    chats: ChatStore,
    queues: Arc<ChatQueues>,
    bus: EventBus,
}

impl ChannelRouter {
    pub fn new(
        config: Config,
        channels: Vec<Arc<dyn Channel>>,
        chats: ChatStore,
        queues: Arc<ChatQueues>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            channels,
            chats,
            queues,
            bus,
        }
    }

    /// Register (or refresh) a chat and create its working folder.
    pub fn register_chat(
        &self,
        jid: &str,
        name: &str,
        folder: &str,
        trigger: Option<&str>,
    ) -> Result<RegisteredChat> {
        let chat = RegisteredChat {
            jid: jid.to_string(),
            display_name: name.to_string(),
            folder: folder.to_string(),
            trigger_pattern: trigger.map(ToString::to_string),
            requires_trigger: trigger.is_some(),
            added_at: Utc::now(),
        };
        self.chats.upsert_chat(&chat)?;
        std::fs::create_dir_all(self.config.group_dir(folder))
            .with_context(|| format!("Failed to create chat folder '{folder}'"))?;
        info!(jid = %jid, folder = %folder, "chat registered");
        Ok(chat)
    }

    /// One inbound event from any channel.
    pub async fn handle_inbound(&self, event: InboundEvent) {
        let msg = event.message;
        if msg.is_from_self {
            return;
        }

        self.bus
            .emit(Event::MessageInbound {
                jid: msg.jid.clone(),
                content: msg.content.clone(),
            })
            .await;

        let chat = match self.chats.get_by_jid(&msg.jid) {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                debug!(jid = %msg.jid, "message from unregistered chat ignored");
                return;
            }
            Err(e) => {
                warn!(jid = %msg.jid, error = %e, "chat lookup failed");
                return;
            }
        };

        // Keep the display name fresh when the platform sends one.
        if let Some(name) = &event.chat_name {
            if *name != chat.display_name {
                let mut updated = chat.clone();
                updated.display_name = name.clone();
                if let Err(e) = self.chats.upsert_chat(&updated) {
                    warn!(jid = %msg.jid, error = %e, "failed to refresh chat name");
                }
            }
        }

        // A live agent receives everything; trigger gating only decides
        // whether a new agent starts.
        if !self.queues.has_live_agent(&msg.jid)
            && chat.requires_trigger
            && !trigger_matches(chat.trigger_pattern.as_deref(), &msg.content)
        {
            debug!(jid = %msg.jid, "message without trigger ignored");
            return;
        }

        if let Err(e) = self.queues.enqueue_message(
            &msg.jid,
            &chat.folder,
            &msg.content,
            Some(msg.sender_id.clone()),
        ) {
            warn!(jid = %msg.jid, error = %e, "failed to enqueue inbound message");
        }
    }

    /// Connect every channel and pump inbound events until shutdown.
    /// Channel failures are logged; they never terminate the router.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<InboundEvent>(256);

        for channel in &self.channels {
            if let Err(e) = channel.connect().await {
                warn!(channel = channel.name(), error = %e, "channel connect failed");
                continue;
            }
            info!(channel = channel.name(), "channel connected");
            let channel = channel.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.listen(tx).await {
                    warn!(channel = channel.name(), error = %e, "channel listener exited");
                }
            });
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            self.handle_inbound(event).await;
        }
        Ok(())
    }
}

fn trigger_matches(pattern: Option<&str>, content: &str) -> bool {
    let Some(pattern) = pattern else {
        // requires_trigger without a pattern would brick the chat
        return true;
    };
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(content),
        Err(_) => content.to_lowercase().contains(&pattern.to_lowercase()),
    }
}
