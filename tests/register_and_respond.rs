//! End-to-end: inbound message → router → queue → agent subprocess →
//! outbound reply, with session persistence and mid-turn piping.
//!
//! The agent is a shell script speaking the real stdin/stdout framing and
//! draining the real IPC inbox.

use async_trait::async_trait;
use chrono::Utc;
use nanoclaw::agent::AgentRunner;
use nanoclaw::channels::{Channel, ChannelRouter, InboundEvent, InboundMessage, Outbound};
use nanoclaw::config::Config;
use nanoclaw::db::ChatStore;
use nanoclaw::events::EventBus;
use nanoclaw::queue::{ChatQueues, QueueDeps};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "discord"
    }
    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with("discord:")
    }
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }
    async fn listen(&self, _tx: mpsc::Sender<InboundEvent>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn write_script(dir: &Path, body: &str) -> String {
    let path = dir.join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_str().unwrap().to_string()
}

struct Harness {
    router: Arc<ChannelRouter>,
    channel: Arc<RecordingChannel>,
    chats: ChatStore,
    _tmp: TempDir,
}

fn harness(agent_body: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.state_dir = tmp.path().join("state");
    config.agent.command = write_script(tmp.path(), agent_body);
    config.agent.kill_grace_secs = 1;
    std::fs::create_dir_all(config.ipc_root()).unwrap();

    let channel = Arc::new(RecordingChannel {
        sent: Mutex::new(Vec::new()),
    });
    let channels: Vec<Arc<dyn Channel>> = vec![channel.clone()];
    let chats = ChatStore::open(&config.db_path()).unwrap();
    let queues = ChatQueues::new(QueueDeps {
        config: config.clone(),
        runner: AgentRunner::new(&config.agent),
        chats: chats.clone(),
        outbound: Arc::new(Outbound::new(channels.clone())),
        bus: EventBus::new(),
    });
    let router = Arc::new(ChannelRouter::new(
        config,
        channels,
        chats.clone(),
        queues,
        EventBus::new(),
    ));
    Harness {
        router,
        channel,
        chats,
        _tmp: tmp,
    }
}

fn inbound(jid: &str, content: &str) -> InboundEvent {
    InboundEvent {
        message: InboundMessage {
            id: format!("m-{}", Utc::now().timestamp_micros()),
            jid: jid.into(),
            sender_id: "owner".into(),
            sender_name: "Owner".into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_from_self: false,
            is_bot: false,
        },
        chat_name: None,
    }
}

async fn wait_for_sent(channel: &RecordingChannel, count: usize) -> Vec<(String, String)> {
    for _ in 0..200 {
        {
            let sent = channel.sent.lock().unwrap();
            if sent.len() >= count {
                return sent.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    channel.sent.lock().unwrap().clone()
}

#[tokio::test]
async fn register_and_respond_persists_the_session() {
    let harness = harness(
        r#"cat > /dev/null
echo spawned >> spawns.log
echo '---NANOCLAW_OUTPUT_START---'
echo '{"status":"success","result":"hello from the agent","newSessionId":"sess-owner-1"}'
echo '---NANOCLAW_OUTPUT_END---'"#,
    );

    // DM auto-registration, then the actual message
    harness
        .router
        .register_chat("discord:100", "Owner DM", "owner-dm", None)
        .unwrap();
    harness.router.handle_inbound(inbound("discord:100", "hi")).await;

    let sent = wait_for_sent(&harness.channel, 1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "discord:100");
    assert_eq!(sent[0].1, "hello from the agent");

    // exactly one agent spawned, session persisted under the folder
    tokio::time::sleep(Duration::from_millis(200)).await;
    let spawns =
        std::fs::read_to_string(harness._tmp.path().join("state/groups/owner-dm/spawns.log"))
            .unwrap();
    assert_eq!(spawns.lines().count(), 1);
    assert_eq!(
        harness.chats.get_session("owner-dm").unwrap().as_deref(),
        Some("sess-owner-1")
    );
}

#[tokio::test]
async fn interleaved_turn_is_folded_into_the_running_agent() {
    let harness = harness(
        r#"cat > /dev/null
echo spawned >> spawns.log
inbox="$NANOCLAW_IPC_DIR/inbox"
echo '---NANOCLAW_OUTPUT_START---'
echo '{"status":"success","result":"working on turn A"}'
echo '---NANOCLAW_OUTPUT_END---'
i=0
while [ $i -lt 100 ]; do
  if [ -f "$inbox/_close" ]; then rm -f "$inbox/_close"; exit 0; fi
  for f in "$inbox"/*.json; do
    [ -e "$f" ] || continue
    text=$(grep -o '"text":"[^"]*"' "$f" | head -1 | cut -d'"' -f4)
    rm -f "$f"
    echo '---NANOCLAW_OUTPUT_START---'
    printf '{"status":"success","result":"folded in: %s"}\n' "$text"
    echo '---NANOCLAW_OUTPUT_END---'
  done
  i=$((i+1))
  sleep 0.1
done"#,
    );

    harness
        .router
        .register_chat("discord:100", "Owner DM", "owner-dm", None)
        .unwrap();
    harness
        .router
        .handle_inbound(inbound("discord:100", "turn A"))
        .await;
    wait_for_sent(&harness.channel, 1).await;

    harness
        .router
        .handle_inbound(inbound("discord:100", "wait, also this"))
        .await;
    let sent = wait_for_sent(&harness.channel, 2).await;
    assert_eq!(sent[1].1, "folded in: wait, also this");

    // still a single process
    let spawns =
        std::fs::read_to_string(harness._tmp.path().join("state/groups/owner-dm/spawns.log"))
            .unwrap();
    assert_eq!(spawns.lines().count(), 1, "no second agent may spawn");
}
