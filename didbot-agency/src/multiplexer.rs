//! Notification multiplexer.
//!
//! The multiplexer reads the single inbound notification stream of an agency
//! connection and fans it out to one [`Conversation`] per connection id.
//! Conversations are created lazily on the first notification of a
//! connection and evicted when they finish. The connection table is owned by
//! the multiplexer task alone.

use crate::client::ProtocolClient;
use crate::config::Config;
use crate::conversation::Conversation;
use crate::error::AgencyError;
use chrono::{DateTime, Utc};
use didbot_core::notification::{HookData, Notification};
use didbot_core::MachineDefinition;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Multiplexer statistics.
#[derive(Debug, Default)]
pub struct MultiplexerStats {
    pub notifications_total: AtomicU64,
    pub keep_alives_dropped: AtomicU64,
    pub conversations_started: AtomicU64,
    pub conversations_completed: AtomicU64,
    pub conversations_active: AtomicU64,
    pub routing_errors: AtomicU64,
    pub transitions_total: AtomicU64,
    pub unmatched_total: AtomicU64,
    pub sends_total: AtomicU64,
    pub send_errors: AtomicU64,
}

impl MultiplexerStats {
    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: Utc::now(),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            keep_alives_dropped: self.keep_alives_dropped.load(Ordering::Relaxed),
            conversations_started: self.conversations_started.load(Ordering::Relaxed),
            conversations_completed: self.conversations_completed.load(Ordering::Relaxed),
            conversations_active: self.conversations_active.load(Ordering::Relaxed),
            routing_errors: self.routing_errors.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            unmatched_total: self.unmatched_total.load(Ordering::Relaxed),
            sends_total: self.sends_total.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`MultiplexerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub notifications_total: u64,
    pub keep_alives_dropped: u64,
    pub conversations_started: u64,
    pub conversations_completed: u64,
    pub conversations_active: u64,
    pub routing_errors: u64,
    pub transitions_total: u64,
    pub unmatched_total: u64,
    pub sends_total: u64,
    pub send_errors: u64,
}

/// A live conversation as seen from the multiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationInfo {
    pub conn_id: String,
    pub started_at: DateTime<Utc>,
}

enum Control {
    Hook(HookData),
    Conversations(oneshot::Sender<Vec<ConversationInfo>>),
}

/// Handle for talking to a running multiplexer.
#[derive(Clone)]
pub struct MultiplexerHandle {
    control: mpsc::Sender<Control>,
    stats: Arc<MultiplexerStats>,
}

impl MultiplexerHandle {
    /// Delivers user hook data to the conversation of its connection.
    pub async fn hook(&self, data: HookData) -> Result<(), AgencyError> {
        self.control
            .send(Control::Hook(data))
            .await
            .map_err(|_| AgencyError::ShuttingDown)
    }

    /// Lists live conversations.
    pub async fn conversations(&self) -> Result<Vec<ConversationInfo>, AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Conversations(tx))
            .await
            .map_err(|_| AgencyError::ShuttingDown)?;
        rx.await.map_err(|_| AgencyError::ShuttingDown)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Routes notifications to per-connection conversations.
pub struct Multiplexer {
    definition: Arc<MachineDefinition>,
    client: Arc<dyn ProtocolClient>,
    buffer: usize,
    scripts: bool,
    stats: Arc<MultiplexerStats>,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
}

impl Multiplexer {
    /// Creates a multiplexer running `definition` for every connection.
    pub fn new(
        definition: Arc<MachineDefinition>,
        client: Arc<dyn ProtocolClient>,
        config: &Config,
    ) -> Result<Self, AgencyError> {
        if definition.needs_evaluator() && !config.machine.scripts {
            return Err(AgencyError::ScriptsDisabled(definition.name.clone()));
        }

        let (control_tx, control_rx) = mpsc::channel(config.multiplexer.conversation_buffer);
        Ok(Self {
            definition,
            client,
            buffer: config.multiplexer.conversation_buffer,
            scripts: config.machine.scripts,
            stats: Arc::new(MultiplexerStats::default()),
            control_tx,
            control_rx,
        })
    }

    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            control: self.control_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn stats(&self) -> &Arc<MultiplexerStats> {
        &self.stats
    }

    /// Runs until `inbound` closes or `cancel` fires, then waits for every
    /// conversation to stop.
    ///
    /// When the inbound stream closes, conversations finish the items already
    /// queued for them. Cancellation stops them right away.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
    ) -> Result<(), AgencyError> {
        tracing::info!(
            machine = %self.definition.name,
            checksum = %self.definition.checksum,
            "Multiplexer running"
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut router = Router {
            definition: Arc::clone(&self.definition),
            client: Arc::clone(&self.client),
            buffer: self.buffer,
            scripts: self.scripts,
            stats: Arc::clone(&self.stats),
            conversations: HashMap::new(),
            tasks: JoinSet::new(),
            done_tx,
            stop: cancel.child_token(),
            next_generation: 0,
        };

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Multiplexer cancelled");
                    break;
                }

                Some(done) = done_rx.recv() => router.evict(done),

                item = inbound.recv() => match item {
                    Some(notification) => router.route(notification).await,
                    None => {
                        tracing::info!("Inbound stream closed");
                        break;
                    }
                },

                Some(control) = self.control_rx.recv() => match control {
                    Control::Hook(data) => router.route(Notification::Hook(data)).await,
                    Control::Conversations(reply) => {
                        let _ = reply.send(router.list());
                    }
                },
            }
        }

        router.shutdown(done_rx).await;
        Ok(())
    }
}

struct Entry {
    notifications: mpsc::Sender<Notification>,
    hooks: mpsc::Sender<HookData>,
    generation: u64,
    started_at: DateTime<Utc>,
}

impl Entry {
    /// Hands an item to the conversation, or gives it back if the
    /// conversation is gone.
    async fn deliver(&self, item: Notification) -> Result<(), Notification> {
        match item {
            Notification::Hook(data) => self
                .hooks
                .send(data)
                .await
                .map_err(|e| Notification::Hook(e.0)),
            other => self.notifications.send(other).await.map_err(|e| e.0),
        }
    }
}

/// Statuses of protocols we started only make sense to the conversation
/// that started them.
fn starts_conversation(notification: &Notification) -> bool {
    !matches!(notification, Notification::Status(s) if s.initiated_by_us)
}

struct Completed {
    conn_id: String,
    generation: u64,
}

/// State owned by the multiplexer task while it runs.
struct Router {
    definition: Arc<MachineDefinition>,
    client: Arc<dyn ProtocolClient>,
    buffer: usize,
    scripts: bool,
    stats: Arc<MultiplexerStats>,
    conversations: HashMap<String, Entry>,
    tasks: JoinSet<()>,
    done_tx: mpsc::UnboundedSender<Completed>,
    stop: CancellationToken,
    next_generation: u64,
}

impl Router {
    async fn route(&mut self, notification: Notification) {
        if notification.is_keep_alive() {
            self.stats.keep_alives_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.notifications_total.fetch_add(1, Ordering::Relaxed);

        let Some(conn_id) = notification.conn_id().map(str::to_string) else {
            return;
        };
        tracing::debug!(conn_id = %conn_id, kind = notification.kind(), "Routing");

        let mut item = notification;
        // A conversation that just finished may still be in the table; the
        // second attempt goes to a fresh one.
        for _ in 0..2 {
            if !self.conversations.contains_key(&conn_id) {
                if !starts_conversation(&item) {
                    tracing::debug!(conn_id = %conn_id, "echo for a finished conversation, dropping");
                    self.stats.unmatched_total.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if let Err(e) = self.spawn(&conn_id) {
                    tracing::error!(conn_id = %conn_id, "failed to start conversation: {}", e);
                    self.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            let Some(entry) = self.conversations.get(&conn_id) else {
                return;
            };
            match entry.deliver(item).await {
                Ok(()) => return,
                Err(returned) => {
                    tracing::debug!(conn_id = %conn_id, "conversation gone, starting a fresh one");
                    self.conversations.remove(&conn_id);
                    item = returned;
                }
            }
        }

        tracing::warn!(conn_id = %conn_id, "dropping notification, no conversation accepted it");
        self.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn(&mut self, conn_id: &str) -> Result<(), AgencyError> {
        let conversation = Conversation::new(
            conn_id,
            Arc::clone(&self.definition),
            Arc::clone(&self.client),
            Arc::clone(&self.stats),
            self.scripts,
        )?;

        let (notifications, notifications_rx) = mpsc::channel(self.buffer);
        let (hooks, hooks_rx) = mpsc::channel(self.buffer);
        let generation = self.next_generation;
        self.next_generation += 1;

        let done_tx = self.done_tx.clone();
        let token = self.stop.child_token();
        let done = Completed {
            conn_id: conn_id.to_string(),
            generation,
        };
        self.tasks.spawn(async move {
            conversation.run(notifications_rx, hooks_rx, token).await;
            let _ = done_tx.send(done);
        });

        self.conversations.insert(
            conn_id.to_string(),
            Entry {
                notifications,
                hooks,
                generation,
                started_at: Utc::now(),
            },
        );
        self.stats.conversations_started.fetch_add(1, Ordering::Relaxed);
        self.stats.conversations_active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn_id = %conn_id, generation, "Conversation spawned");
        Ok(())
    }

    fn evict(&mut self, done: Completed) {
        self.stats.conversations_completed.fetch_add(1, Ordering::Relaxed);
        self.stats.conversations_active.fetch_sub(1, Ordering::Relaxed);

        let current = self
            .conversations
            .get(&done.conn_id)
            .map(|e| e.generation == done.generation)
            .unwrap_or(false);
        if current {
            self.conversations.remove(&done.conn_id);
            tracing::debug!(conn_id = %done.conn_id, "Conversation evicted");
        }
    }

    fn list(&self) -> Vec<ConversationInfo> {
        let mut list: Vec<_> = self
            .conversations
            .iter()
            .map(|(conn_id, entry)| ConversationInfo {
                conn_id: conn_id.clone(),
                started_at: entry.started_at,
            })
            .collect();
        list.sort_by(|a, b| a.conn_id.cmp(&b.conn_id));
        list
    }

    async fn shutdown(mut self, mut done_rx: mpsc::UnboundedReceiver<Completed>) {
        // Closing the channels lets conversations drain what they have queued.
        self.conversations.clear();

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("conversation task failed: {}", e);
                self.stats.conversations_completed.fetch_add(1, Ordering::Relaxed);
                self.stats.conversations_active.fetch_sub(1, Ordering::Relaxed);
            }
        }
        while let Ok(done) = done_rx.try_recv() {
            self.evict(done);
        }

        self.stop.cancel();
        tracing::info!(
            started = self.stats.conversations_started.load(Ordering::Relaxed),
            "Multiplexer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Call, RecordingClient};
    use didbot_core::notification::ProtocolStatus;
    use didbot_core::ProtocolType;
    use std::time::Duration;

    const ECHO: &str = r#"
initial:
  target: IDLE
  sends: [{ protocol: basic_message, data: "Hello!" }]
states:
  IDLE:
    transitions:
      - trigger: { protocol: basic_message, rule: INPUT_EQUAL, data: bye }
        sends: [{ protocol: basic_message, data: "Bye!" }]
        target: DONE
      - trigger: { protocol: hook, rule: INPUT }
        sends: [{ protocol: basic_message, data: "hooked" }]
        target: IDLE
      - trigger: { protocol: basic_message, rule: INPUT_SAVE, data: LINE }
        sends: [{ protocol: basic_message, rule: FORMAT_MEM, data: "echo {{.LINE}}" }]
        target: IDLE
  DONE:
    terminate: true
"#;

    fn multiplexer(client: Arc<RecordingClient>) -> Multiplexer {
        let definition = Arc::new(MachineDefinition::from_yaml(ECHO).unwrap());
        Multiplexer::new(definition, client, &Config::default()).unwrap()
    }

    fn message(conn_id: &str, content: &str) -> Notification {
        Notification::Status(ProtocolStatus::basic_message(conn_id, content))
    }

    fn messages_to(calls: &[Call], conn: &str) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::BasicMessage { conn_id, content } if conn_id == conn => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_routes_per_connection() {
        let client = Arc::new(RecordingClient::new());
        let mux = multiplexer(client.clone());
        let stats = Arc::clone(mux.stats());
        let (tx, rx) = mpsc::channel(16);

        tx.send(message("a", "one")).await.unwrap();
        tx.send(Notification::KeepAlive).await.unwrap();
        tx.send(message("b", "two")).await.unwrap();
        tx.send(message("a", "three")).await.unwrap();
        drop(tx);

        mux.run(rx, CancellationToken::new()).await.unwrap();

        let calls = client.calls();
        assert_eq!(messages_to(&calls, "a"), vec!["Hello!", "echo one", "echo three"]);
        assert_eq!(messages_to(&calls, "b"), vec!["Hello!", "echo two"]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.keep_alives_dropped, 1);
        assert_eq!(snapshot.notifications_total, 3);
        assert_eq!(snapshot.conversations_started, 2);
        // both ended when the inbound stream closed
        assert_eq!(snapshot.conversations_completed, 2);
        assert_eq!(snapshot.conversations_active, 0);
    }

    #[tokio::test]
    async fn test_finished_conversation_is_replaced() {
        let client = Arc::new(RecordingClient::new());
        let mux = multiplexer(client.clone());
        let stats = Arc::clone(mux.stats());
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(mux.run(rx, CancellationToken::new()));

        tx.send(message("a", "bye")).await.unwrap();
        wait_for(|| stats.conversations_completed.load(Ordering::Relaxed) == 1).await;

        tx.send(message("a", "again")).await.unwrap();
        drop(tx);
        run.await.unwrap().unwrap();

        assert_eq!(
            messages_to(&client.calls(), "a"),
            vec!["Hello!", "Bye!", "Hello!", "echo again"]
        );
        assert_eq!(stats.conversations_started.load(Ordering::Relaxed), 2);
        assert_eq!(stats.conversations_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_late_echo_does_not_restart() {
        let client = Arc::new(RecordingClient::new());
        let mux = multiplexer(client.clone());
        let stats = Arc::clone(mux.stats());
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(mux.run(rx, CancellationToken::new()));

        tx.send(message("a", "bye")).await.unwrap();
        wait_for(|| stats.conversations_completed.load(Ordering::Relaxed) == 1).await;

        let echo = ProtocolStatus::completed("a", "p1", ProtocolType::BasicMessage);
        tx.send(Notification::Status(echo)).await.unwrap();
        drop(tx);
        run.await.unwrap().unwrap();

        assert_eq!(messages_to(&client.calls(), "a"), vec!["Hello!", "Bye!"]);
        assert_eq!(stats.conversations_started.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_conversations() {
        let client = Arc::new(RecordingClient::new());
        let mux = multiplexer(client.clone());
        let handle = mux.handle();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(mux.run(rx, cancel.clone()));

        tx.send(message("a", "one")).await.unwrap();
        wait_for(|| messages_to(&client.calls(), "a").len() == 2).await;
        assert_eq!(handle.conversations().await.unwrap().len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // the sender is still open, but nothing is listening any more
        assert!(handle.conversations().await.is_err());
    }

    #[tokio::test]
    async fn test_hook_through_handle() {
        let client = Arc::new(RecordingClient::new());
        let mux = multiplexer(client.clone());
        let handle = mux.handle();
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(mux.run(rx, CancellationToken::new()));

        handle
            .hook(HookData {
                conn_id: "h".into(),
                data: Default::default(),
            })
            .await
            .unwrap();
        wait_for(|| messages_to(&client.calls(), "h").len() == 2).await;
        drop(tx);
        run.await.unwrap().unwrap();

        assert_eq!(messages_to(&client.calls(), "h"), vec!["Hello!", "hooked"]);
        assert_eq!(handle.stats().conversations_started, 1);
    }

    #[test]
    fn test_scripts_disabled() {
        let yaml = r#"
initial: { target: IDLE }
states:
  IDLE:
    transitions:
      - trigger: { protocol: basic_message, rule: LUA, data: 'OUTPUT = "OK"' }
        target: IDLE
"#;
        let definition = Arc::new(MachineDefinition::from_yaml(yaml).unwrap());
        let mut config = Config::default();
        config.machine.scripts = false;

        let result = Multiplexer::new(definition, Arc::new(RecordingClient::new()), &config);
        assert!(matches!(result, Err(AgencyError::ScriptsDisabled(_))));
    }
}
