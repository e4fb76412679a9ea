//! Per-connection conversations.
//!
//! A conversation is one task that exclusively owns one [`Machine`]. It
//! receives the notifications of its connection in arrival order, resolves
//! them through the machine, dispatches the resulting sends and commits the
//! transition once every send went out.

use crate::client::{ClientError, ProtocolClient, ProtocolId};
use crate::error::AgencyError;
use crate::multiplexer::MultiplexerStats;
use didbot_core::definition::{MachineDefinition, ProtocolType, Rule, Transition};
use didbot_core::notification::{
    BackendData, HookData, Notification, ProtocolStatus, Question, StatusState,
};
use didbot_core::send::{SendEvent, SendPayload};
use didbot_core::{LuaEvaluator, Machine};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Transient sends fed back per external notification before the rest are
/// dropped.
const MAX_TRANSIENT_HOPS: usize = 32;

/// A conversation with one connection.
pub struct Conversation {
    conn_id: String,
    machine: Machine,
    client: Arc<dyn ProtocolClient>,
    stats: Arc<MultiplexerStats>,
    /// Contents of transient sends waiting to be fed back to the machine.
    transient: VecDeque<String>,
    terminate_rx: oneshot::Receiver<bool>,
    finished: bool,
}

impl Conversation {
    /// Creates a conversation with a fresh machine instance.
    ///
    /// A Lua evaluator is attached when the definition uses `LUA` rules.
    pub fn new(
        conn_id: impl Into<String>,
        definition: Arc<MachineDefinition>,
        client: Arc<dyn ProtocolClient>,
        stats: Arc<MultiplexerStats>,
        scripts: bool,
    ) -> Result<Self, AgencyError> {
        let (terminate_tx, terminate_rx) = oneshot::channel();

        let mut machine = Machine::new(Arc::clone(&definition)).with_terminate(terminate_tx);
        if definition.needs_evaluator() {
            if !scripts {
                return Err(AgencyError::ScriptsDisabled(definition.name.clone()));
            }
            machine = machine.with_evaluator(Box::new(LuaEvaluator::new()?));
        }

        Ok(Self {
            conn_id: conn_id.into(),
            machine,
            client,
            stats,
            transient: VecDeque::new(),
            terminate_rx,
            finished: false,
        })
    }

    /// Name of the machine's current state.
    pub fn current(&self) -> &str {
        self.machine.current()
    }

    /// Runs the conversation until it terminates, its channels close or it
    /// is cancelled.
    pub async fn run(
        mut self,
        mut notifications: mpsc::Receiver<Notification>,
        mut hooks: mpsc::Receiver<HookData>,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            conn_id = %self.conn_id,
            machine = %self.machine.definition().name,
            "Conversation started"
        );

        self.start().await;
        self.drain_transient().await;

        while !self.is_finished() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(conn_id = %self.conn_id, "Conversation cancelled");
                    break;
                }
                item = notifications.recv() => match item {
                    Some(notification) => self.handle_notification(notification).await,
                    None => break,
                },
                Some(hook) = hooks.recv() => self.handle_hook(hook).await,
            }
            self.drain_transient().await;
        }

        tracing::info!(
            conn_id = %self.conn_id,
            state = %self.machine.current(),
            terminated = self.machine.is_terminated(),
            "Conversation ended"
        );
    }

    /// Returns true once the machine signalled termination.
    fn is_finished(&mut self) -> bool {
        if !self.finished {
            self.finished = matches!(self.terminate_rx.try_recv(), Ok(true))
                || self.machine.current_state().terminal;
        }
        self.finished
    }

    async fn start(&mut self) {
        let sends = match self.machine.start() {
            Ok(sends) => sends,
            Err(e) => {
                tracing::error!(conn_id = %self.conn_id, "failed to build initial sends: {}", e);
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = self.dispatch_all(&sends, None, &mut false).await {
            tracing::error!(conn_id = %self.conn_id, "failed to send initial messages: {}", e);
        }
    }

    /// Handles one notification routed to this conversation.
    pub async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::Status(status) => self.handle_status(status).await,
            Notification::Question(question) => self.handle_question(question).await,
            Notification::Hook(hook) => self.handle_hook(hook).await,
            Notification::Backend(data) => self.handle_backend(data).await,
            Notification::KeepAlive => {}
        }
    }

    async fn handle_status(&mut self, status: ProtocolStatus) {
        if matches!(status.state, StatusState::Nack | StatusState::Error) {
            tracing::warn!(
                conn_id = %self.conn_id,
                protocol = %status.protocol,
                protocol_id = %status.protocol_id,
                state = ?status.state,
                "protocol did not complete"
            );
            return;
        }

        let transition = self.machine.triggers(&status);

        // A protocol the other party started waits for our decision.
        if status.state == StatusState::Waiting && !status.initiated_by_us {
            let accept = transition.is_some();
            if let Err(e) = self
                .client
                .resume(&self.conn_id, &status.protocol_id, accept)
                .await
            {
                self.send_failed(&e);
                if accept {
                    self.machine.rollback();
                }
                return;
            }
        }

        match transition {
            Some(t) => self.fire(t, status.content(), None).await,
            None => self.unmatched("status"),
        }
    }

    async fn handle_question(&mut self, question: Question) {
        match self.machine.answers(&question) {
            Some(t) => self.fire(t, question.content(), Some(&question)).await,
            None => {
                self.unmatched("question");
                if let Err(e) = self.client.answer_question(&question.id, false, "").await {
                    self.send_failed(&e);
                }
            }
        }
    }

    async fn handle_hook(&mut self, hook: HookData) {
        match self.machine.triggers_by_hook(&hook) {
            Some(t) => self.fire(t, hook.content(), None).await,
            None => self.unmatched("hook"),
        }
    }

    async fn handle_backend(&mut self, data: BackendData) {
        match self.machine.triggers_by_backend_data(&data) {
            Some(t) => self.fire(t, data.content, None).await,
            None => self.unmatched("backend"),
        }
    }

    /// Builds and dispatches the sends of a transition, then commits it.
    ///
    /// A transition that cannot be sent is abandoned: the machine stays in
    /// its state with the memory it had before the trigger, and a question
    /// that was not answered yet is declined.
    async fn fire(&mut self, transition: Transition, input: String, question: Option<&Question>) {
        let queued = self.transient.len();
        let mut answered = false;

        let sends = match self.machine.build_sends(&transition, &input) {
            Ok(sends) => sends,
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, "failed to build sends: {}", e);
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                self.abandon(queued, question, answered).await;
                return;
            }
        };

        if let Err(e) = self.dispatch_all(&sends, question, &mut answered).await {
            tracing::warn!(
                conn_id = %self.conn_id,
                state = %self.machine.current(),
                "staying in state after send failure: {}",
                e
            );
            self.abandon(queued, question, answered).await;
            return;
        }

        if let (Some(question), false) = (question, answered) {
            let ack = transition.trigger.rule != Rule::NotAcceptValues;
            if let Err(e) = self.client.answer_question(&question.id, ack, "").await {
                self.send_failed(&e);
                self.abandon(queued, None, true).await;
                return;
            }
        }

        match self.machine.step(&transition) {
            Ok(()) => {
                self.stats.transitions_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(conn_id = %self.conn_id, "step failed: {}", e),
        }
    }

    /// Undoes a transition that will not be committed.
    async fn abandon(&mut self, queued: usize, question: Option<&Question>, answered: bool) {
        self.machine.rollback();
        self.transient.truncate(queued);

        if let (Some(question), false) = (question, answered) {
            if let Err(e) = self.client.answer_question(&question.id, false, "").await {
                self.send_failed(&e);
            }
        }
    }

    /// Dispatches sends in order, stopping at the first failure.
    ///
    /// Sets `answered` once one of the sends answered `question`.
    async fn dispatch_all(
        &mut self,
        sends: &[SendEvent],
        question: Option<&Question>,
        answered: &mut bool,
    ) -> Result<(), ClientError> {
        for send in sends {
            match (&send.payload, send.protocol) {
                (_, ProtocolType::Transient) => {
                    self.transient.push_back(send.content.clone());
                }
                (SendPayload::Answer { ack }, _) => match question {
                    Some(question) => {
                        let result = self
                            .client
                            .answer_question(&question.id, *ack, &send.content)
                            .await;
                        if let Err(e) = result {
                            self.send_failed(&e);
                            return Err(e);
                        }
                        *answered = true;
                    }
                    None => tracing::warn!(
                        conn_id = %self.conn_id,
                        "answer send without a question, skipping"
                    ),
                },
                _ => {
                    let id = match dispatch(self.client.as_ref(), &self.conn_id, send).await {
                        Ok(id) => id,
                        Err(e) => {
                            self.send_failed(&e);
                            return Err(e);
                        }
                    };
                    if let Some(id) = id {
                        tracing::debug!(
                            conn_id = %self.conn_id,
                            protocol = %send.protocol,
                            protocol_id = %id,
                            want_status = send.want_status,
                            "Started protocol"
                        );
                    }
                }
            }
            self.stats.sends_total.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Feeds queued transient sends back to the machine.
    async fn drain_transient(&mut self) {
        let mut hops = 0;
        while let Some(content) = self.transient.pop_front() {
            if self.is_finished() {
                self.transient.clear();
                break;
            }
            if hops == MAX_TRANSIENT_HOPS {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    state = %self.machine.current(),
                    dropped = self.transient.len() + 1,
                    "transient hop limit reached, dropping"
                );
                self.transient.clear();
                break;
            }
            hops += 1;
            match self.machine.triggers_transient(&content) {
                Some(t) => self.fire(t, content, None).await,
                None => self.unmatched("transient"),
            }
        }
    }

    fn send_failed(&self, e: &ClientError) {
        tracing::error!(conn_id = %self.conn_id, retryable = e.is_retryable(), "send failed: {}", e);
        self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn unmatched(&self, kind: &str) {
        tracing::debug!(
            conn_id = %self.conn_id,
            state = %self.machine.current(),
            kind,
            "no transition, dropping"
        );
        self.stats.unmatched_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sends one event through the client.
async fn dispatch(
    client: &dyn ProtocolClient,
    conn_id: &str,
    send: &SendEvent,
) -> Result<Option<ProtocolId>, ClientError> {
    let content = send.content.as_str();

    match &send.payload {
        SendPayload::Issuing { cred_def_id, attrs } => client
            .issue_credential(conn_id, cred_def_id, attrs)
            .await
            .map(Some),
        SendPayload::Proof { attributes } => {
            client.request_proof(conn_id, attributes).await.map(Some)
        }
        SendPayload::Email { to, from, subject } => client
            .send_email(to, from, subject, content)
            .await
            .map(|_| None),
        SendPayload::Hook { data } => client
            .send_hook(conn_id, data, content)
            .await
            .map(|_| None),
        SendPayload::Backend { subject } => client
            .send_backend(conn_id, subject, content)
            .await
            .map(|_| None),
        SendPayload::Answer { .. } => Ok(None),
        SendPayload::None => match send.protocol {
            ProtocolType::TrustPing => client.trust_ping(conn_id).await.map(Some),
            _ => client.send_basic_message(conn_id, content).await.map(Some),
        },
    }
}
