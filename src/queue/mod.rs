//! Per-chat work queues.
//!
//! One queue per JID, strict FIFO within a JID, full parallelism across
//! JIDs. The queue exclusively owns the chat's agent subprocess and its IPC
//! inbox: an inbound message that arrives while the agent is live is piped
//! into the running process as an IPC file instead of waiting behind the
//! turn in progress.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::agent::{AgentInput, AgentOutput, AgentRunner, AgentSpawnSpec};
use crate::config::Config;
use crate::db::ChatStore;
use crate::events::{Event, EventBus};
use crate::ipc::{self, IpcMessage};
use crate::plugins::MessagesApi;

/// A scheduled run submitted by the task engine. It receives the queue's
/// kill signal for this JID so `kill` reaches task agents too.
pub type TaskRun = Box<dyn FnOnce(Arc<Notify>) -> BoxFuture<'static, ()> + Send>;

enum WorkItem {
    Message { text: String, sender: Option<String> },
    Task { task_id: String, run: TaskRun },
}

struct ChatState {
    /// The live interactive agent's inbox, while one is running.
    live_inbox: Mutex<Option<PathBuf>>,
    kill: Arc<Notify>,
    killed: AtomicBool,
}

struct ChatQueueHandle {
    tx: mpsc::UnboundedSender<WorkItem>,
    state: Arc<ChatState>,
}

/// Shared dependencies of every chat worker.
pub struct QueueDeps {
    pub config: Config,
    pub runner: AgentRunner,
    pub chats: ChatStore,
    pub outbound: Arc<dyn MessagesApi>,
    pub bus: EventBus,
}

pub struct ChatQueues {
    deps: Arc<QueueDeps>,
    inner: Mutex<HashMap<String, ChatQueueHandle>>,
}

impl ChatQueues {
    pub fn new(deps: QueueDeps) -> Arc<Self> {
        Arc::new(Self {
            deps: Arc::new(deps),
            inner: Mutex::new(HashMap::new()),
        })
    }

    fn handle_for(&self, jid: &str, folder: &str) -> ChatQueueHandleRef {
        let mut map = self.inner.lock().expect("queue map lock poisoned");
        let handle = map.entry(jid.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let state = Arc::new(ChatState {
                live_inbox: Mutex::new(None),
                kill: Arc::new(Notify::new()),
                killed: AtomicBool::new(false),
            });
            tokio::spawn(chat_worker(
                jid.to_string(),
                folder.to_string(),
                rx,
                state.clone(),
                self.deps.clone(),
            ));
            ChatQueueHandle { tx, state }
        });
        ChatQueueHandleRef {
            tx: handle.tx.clone(),
            state: handle.state.clone(),
        }
    }

    /// Interactive inbound. Piped into the live agent when one is running;
    /// queued otherwise.
    pub fn enqueue_message(
        &self,
        jid: &str,
        folder: &str,
        text: &str,
        sender: Option<String>,
    ) -> anyhow::Result<()> {
        let handle = self.handle_for(jid, folder);

        let live = handle.state.live_inbox.lock().expect("state lock").clone();
        if let Some(inbox) = live {
            // Live interrupt/augment: the agent drains this mid-turn.
            ipc::write_message(
                &self.deps.config.ipc_root(),
                &inbox,
                &IpcMessage::Message {
                    chat_jid: jid.to_string(),
                    text: text.to_string(),
                    sender,
                    group_folder: folder.to_string(),
                    timestamp: chrono::Utc::now(),
                },
            )?;
            info!(jid = %jid, "piped message into running agent");
            return Ok(());
        }

        handle
            .tx
            .send(WorkItem::Message {
                text: text.to_string(),
                sender,
            })
            .map_err(|_| anyhow::anyhow!("queue for {jid} is shut down"))?;
        Ok(())
    }

    /// Scheduled work. Always queued; task runs get exclusive use of the
    /// agent.
    pub fn enqueue_task(&self, jid: &str, folder: &str, task_id: &str, run: TaskRun) -> anyhow::Result<()> {
        let handle = self.handle_for(jid, folder);
        handle
            .tx
            .send(WorkItem::Task {
                task_id: task_id.to_string(),
                run,
            })
            .map_err(|_| anyhow::anyhow!("queue for {jid} is shut down"))?;
        Ok(())
    }

    /// True while an interactive agent is live for this JID.
    pub fn has_live_agent(&self, jid: &str) -> bool {
        let map = self.inner.lock().expect("queue map lock poisoned");
        map.get(jid)
            .is_some_and(|h| h.state.live_inbox.lock().expect("state lock").is_some())
    }

    /// Graceful idle close: ask the live agent to finish its turn and exit.
    pub fn close_stdin(&self, jid: &str) -> anyhow::Result<()> {
        let map = self.inner.lock().expect("queue map lock poisoned");
        if let Some(handle) = map.get(jid) {
            let live = handle.state.live_inbox.lock().expect("state lock").clone();
            if let Some(inbox) = live {
                ipc::write_close_sentinel(&self.deps.config.ipc_root(), &inbox)?;
            }
        }
        Ok(())
    }

    /// Hard abort: close sentinel plus termination after grace, and drop
    /// every queued-but-unstarted item for this JID.
    pub fn kill(&self, jid: &str) {
        let removed = {
            let mut map = self.inner.lock().expect("queue map lock poisoned");
            map.remove(jid)
        };
        if let Some(handle) = removed {
            handle.state.killed.store(true, Ordering::SeqCst);
            handle.state.kill.notify_waiters();
            // Dropping the sender lets the worker drain (and discard) the
            // remaining items, then exit.
            drop(handle.tx);
            info!(jid = %jid, "chat queue killed");
        }
    }
}

struct ChatQueueHandleRef {
    tx: mpsc::UnboundedSender<WorkItem>,
    state: Arc<ChatState>,
}

async fn chat_worker(
    jid: String,
    folder: String,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    state: Arc<ChatState>,
    deps: Arc<QueueDeps>,
) {
    while let Some(item) = rx.recv().await {
        if state.killed.load(Ordering::SeqCst) {
            match item {
                WorkItem::Message { text, .. } => {
                    warn!(jid = %jid, text = %crate::util::truncate_with_ellipsis(&text, 40), "dropping queued message: chat killed");
                }
                WorkItem::Task { task_id, .. } => {
                    warn!(jid = %jid, task_id = %task_id, "dropping queued task run: chat killed");
                }
            }
            continue;
        }
        match item {
            WorkItem::Message { text, sender } => {
                run_interactive(&jid, &folder, &state, &deps, text, sender).await;
            }
            WorkItem::Task { task_id, run } => {
                info!(jid = %jid, task_id = %task_id, "running scheduled task");
                run(state.kill.clone()).await;
            }
        }
    }
}

async fn run_interactive(
    jid: &str,
    folder: &str,
    state: &Arc<ChatState>,
    deps: &Arc<QueueDeps>,
    text: String,
    sender: Option<String>,
) {
    let inbox = deps.config.ipc_inbox(folder);
    let session_id = deps.chats.get_session(folder).unwrap_or_else(|e| {
        warn!(folder = %folder, error = %e, "failed to read session, starting fresh");
        None
    });

    let input = AgentInput {
        prompt: text,
        session_id,
        group_folder: folder.to_string(),
        chat_jid: jid.to_string(),
        is_main: folder == deps.config.channels.main_folder,
        is_scheduled_task: None,
        secrets: None,
        sender_ids: sender.map(|s| vec![s]),
        trust_config: None,
    };
    let spec = AgentSpawnSpec {
        input,
        working_dir: deps.config.group_dir(folder),
        ipc_root: deps.config.ipc_root(),
        inbox: inbox.clone(),
    };

    *state.live_inbox.lock().expect("state lock") = Some(inbox.clone());
    deps.bus
        .emit(Event::AgentStart { jid: jid.to_string() })
        .await;
    if let Err(e) = deps.outbound.set_typing(jid, true).await {
        warn!(jid = %jid, error = %e, "typing indicator failed");
    }

    let idle_timeout = Duration::from_secs(deps.config.agent.idle_timeout_secs);
    let deadline = Arc::new(Mutex::new(tokio::time::Instant::now() + idle_timeout));

    // Watchdog: on idle expiry, write the close sentinel. The agent finishes
    // its turn and exits; this is never a kill.
    let watchdog = {
        let deadline = deadline.clone();
        let ipc_root = deps.config.ipc_root();
        let inbox = inbox.clone();
        tokio::spawn(async move {
            loop {
                let at = *deadline.lock().expect("deadline lock");
                if tokio::time::Instant::now() >= at {
                    if let Err(e) = ipc::write_close_sentinel(&ipc_root, &inbox) {
                        warn!(error = %e, "idle close failed");
                    }
                    break;
                }
                tokio::time::sleep_until(at).await;
            }
        })
    };

    // Forwarder: every streamed result resets the idle timer and goes out
    // through the owning channel; session ids are persisted as they arrive.
    let (tx, mut rx) = mpsc::channel::<AgentOutput>(32);
    let forwarder = {
        let deadline = deadline.clone();
        let deps = deps.clone();
        let jid = jid.to_string();
        let folder = folder.to_string();
        tokio::spawn(async move {
            while let Some(output) = rx.recv().await {
                *deadline.lock().expect("deadline lock") =
                    tokio::time::Instant::now() + idle_timeout;
                if let Some(session) = &output.new_session_id {
                    if let Err(e) = deps.chats.set_session(&folder, session) {
                        warn!(folder = %folder, error = %e, "failed to persist session");
                    }
                }
                if let Some(result) = output.result {
                    if let Err(e) = deps.outbound.send_message(&jid, &result).await {
                        warn!(jid = %jid, error = %e, "outbound send failed");
                    }
                    deps.bus
                        .emit(Event::MessageOutbound {
                            jid: jid.clone(),
                            content: result,
                        })
                        .await;
                }
            }
        })
    };

    let result = deps
        .runner
        .run(spec, tx, state.kill.clone())
        .await;
    watchdog.abort();
    let _ = forwarder.await;

    *state.live_inbox.lock().expect("state lock") = None;
    if let Err(e) = deps.outbound.set_typing(jid, false).await {
        warn!(jid = %jid, error = %e, "typing indicator failed");
    }
    deps.bus
        .emit(Event::AgentStop { jid: jid.to_string() })
        .await;

    match result {
        Ok(run) => {
            if let Some(error) = run.error {
                warn!(jid = %jid, error = %error, "agent turn ended with error");
            }
        }
        Err(e) => warn!(jid = %jid, error = %e, "agent run failed"),
    }
}
