//! Conversation actors.
//!
//! Each conversation is owned by one tokio task that processes its commands in
//! arrival order, so turns for the same conversation never interleave. Every
//! history change is saved before it becomes visible in memory.

use crate::emitter::{StreamEmitter, TurnOutcome};
use crate::error::{StoreError, TurnError};
use crate::message::{InvocationState, Message, Role, ToolInvocation, to_prompt};
use crate::prompt::PromptComposer;
use crate::resolver::ToolCallResolver;
use crate::scheduler::ScheduledTaskSink;
use crate::store::ConversationStore;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parley_llm::{ChatCompletion, LlmError};
use parley_tools::{ToolSet, ToolSource};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_tool_rounds: usize,
    /// Tool names that wait for confirmation in addition to those whose spec asks for it.
    pub confirmation_required: Vec<String>,
    pub mailbox_capacity: usize,
    pub idle_timeout: Duration,
}

/// Collaborators shared by every actor.
pub struct ActorDeps {
    pub completion: Arc<dyn ChatCompletion>,
    pub store: Arc<dyn ConversationStore>,
    pub tool_sources: Vec<Arc<dyn ToolSource>>,
    pub composer: PromptComposer,
    pub settings: TurnSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    ResolvingTools,
    Composing,
    AwaitingCompletion,
    Emitting,
    PersistedSuccess,
    PersistedError,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub state: TurnState,
    /// Messages added to the history by this turn.
    pub appended: usize,
}

enum ActorCommand {
    ChatTurn {
        content: String,
        emitter: StreamEmitter,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<TurnReport, TurnError>>,
    },
    ScheduledFire {
        description: String,
        reply: oneshot::Sender<Result<Message, TurnError>>,
    },
    AppendAndSave {
        messages: Vec<Message>,
        reply: oneshot::Sender<Result<(), TurnError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<Vec<Message>, TurnError>>,
    },
}

#[derive(Clone)]
pub struct ConversationHandle {
    id: String,
    /// Distinguishes an actor from a later one spawned for the same id.
    generation: u64,
    tx: mpsc::Sender<ActorCommand>,
}

impl ConversationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Run one chat turn. The emitter is finished on every path.
    pub async fn chat_turn(
        &self,
        content: impl Into<String>,
        emitter: StreamEmitter,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::ChatTurn {
            content: content.into(),
            emitter,
            cancel,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TurnError::ActorClosed)?
    }

    /// Record that a scheduled task fired. Does not call the provider.
    pub async fn handle_scheduled_fire(
        &self,
        description: impl Into<String>,
    ) -> Result<Message, TurnError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::ScheduledFire {
            description: description.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TurnError::ActorClosed)?
    }

    pub async fn append_and_save(&self, messages: Vec<Message>) -> Result<(), TurnError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::AppendAndSave { messages, reply })
            .await?;
        rx.await.map_err(|_| TurnError::ActorClosed)?
    }

    pub async fn snapshot(&self) -> Result<Vec<Message>, TurnError> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| TurnError::ActorClosed)?
    }

    async fn send(&self, cmd: ActorCommand) -> Result<(), TurnError> {
        self.tx.send(cmd).await.map_err(|_| TurnError::ActorClosed)
    }
}

struct ConversationActor {
    id: String,
    history: Vec<Message>,
    /// Set when the stored history could not be loaded; every command fails.
    unavailable: Option<String>,
    deps: Arc<ActorDeps>,
    resolver: ToolCallResolver,
}

impl ConversationActor {
    async fn start(
        id: String,
        generation: u64,
        deps: Arc<ActorDeps>,
        actors: Arc<DashMap<String, ConversationHandle>>,
        mut rx: mpsc::Receiver<ActorCommand>,
    ) {
        let (history, unavailable) = match deps.store.load(&id).await {
            Ok(history) => (history, None),
            Err(e) => {
                tracing::error!(conversation_id = %id, error = %e, "failed to load conversation history");
                (Vec::new(), Some(e.to_string()))
            }
        };
        tracing::debug!(conversation_id = %id, history_len = history.len(), "conversation actor started");

        let mut actor = Self {
            id,
            history,
            unavailable,
            deps,
            resolver: ToolCallResolver::default(),
        };
        let idle_timeout = actor.deps.settings.idle_timeout;
        loop {
            let next = tokio::time::timeout(idle_timeout, rx.recv()).await;
            match next {
                Ok(Some(cmd)) => actor.handle(cmd).await,
                Ok(None) => break,
                Err(_) => {
                    // Deregister under the map lock so `handle()` cannot hand out
                    // this actor while it is closing.
                    let mut busy = false;
                    actors.remove_if(&actor.id, |_, handle| {
                        if handle.generation != generation {
                            return false;
                        }
                        if !rx.is_empty() {
                            busy = true;
                            return false;
                        }
                        rx.close();
                        true
                    });
                    if busy {
                        continue;
                    }
                    rx.close();
                    let mut dropped = 0usize;
                    while rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        tracing::warn!(conversation_id = %actor.id, dropped, "commands arrived while idle actor was stopping");
                    }
                    tracing::debug!(
                        conversation_id = %actor.id,
                        idle_seconds = idle_timeout.as_secs(),
                        "conversation actor idle; stopping"
                    );
                    break;
                }
            }
        }
        tracing::debug!(conversation_id = %actor.id, "conversation actor stopped");
    }

    async fn handle(&mut self, cmd: ActorCommand) {
        match cmd {
            ActorCommand::ChatTurn {
                content,
                emitter,
                cancel,
                reply,
            } => {
                let out = self.chat_turn(content, emitter, cancel).await;
                let _ = reply.send(out);
            }
            ActorCommand::ScheduledFire { description, reply } => {
                let _ = reply.send(self.handle_scheduled_fire(description).await);
            }
            ActorCommand::AppendAndSave { messages, reply } => {
                let out = match self.ensure_available() {
                    Ok(()) => self.append_and_save(messages).await.map_err(TurnError::from),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(out);
            }
            ActorCommand::Snapshot { reply } => {
                let out = self
                    .ensure_available()
                    .map(|()| self.history.clone())
                    .map_err(TurnError::from);
                let _ = reply.send(out);
            }
        }
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    /// Save `next` as the full history, then make it the in-memory history.
    async fn commit(&mut self, next: Vec<Message>) -> Result<(), StoreError> {
        self.deps.store.save(&self.id, &next).await?;
        self.history = next;
        Ok(())
    }

    async fn append_and_save(&mut self, messages: Vec<Message>) -> Result<(), StoreError> {
        let mut next = self.history.clone();
        next.extend(messages);
        self.commit(next).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %self.id))]
    async fn handle_scheduled_fire(&mut self, description: String) -> Result<Message, TurnError> {
        self.ensure_available()?;
        let message = Message::user(format!("Running scheduled task: {description}"));
        self.append_and_save(vec![message.clone()]).await?;
        tracing::info!(message_id = %message.id, "scheduled task recorded in conversation");
        Ok(message)
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %self.id))]
    async fn chat_turn(
        &mut self,
        content: String,
        mut emitter: StreamEmitter,
        cancel: CancellationToken,
    ) -> Result<TurnReport, TurnError> {
        let started = Instant::now();
        let mut state = TurnState::Idle;

        if let Err(e) = self.ensure_available() {
            emitter.finish(TurnOutcome::PersistenceFailed {
                message: e.to_string(),
            });
            return Err(e.into());
        }
        if cancel.is_cancelled() {
            tracing::info!("turn cancelled before it started");
            emitter.finish(TurnOutcome::Cancelled);
            return Err(TurnError::Cancelled);
        }

        let mut candidate = self.history.clone();
        candidate.push(Message::user(content));

        advance(&mut state, TurnState::ResolvingTools);
        let tools = ToolSet::from_sources(&self.deps.tool_sources, &self.id);
        let confirmation = tools.confirmation_required(&self.deps.settings.confirmation_required);
        let resolution = self.resolver.resolve(candidate, &tools, &confirmation).await;
        for invocation in &resolution.still_pending {
            emitter.present_pending(invocation);
        }
        let base = resolution.messages;

        advance(&mut state, TurnState::Composing);
        let system_prompt = self.deps.composer.compose(Utc::now());

        advance(&mut state, TurnState::AwaitingCompletion);
        let completion = tokio::select! {
            _ = cancel.cancelled() => None,
            out = self.run_completion(&system_prompt, &base, &tools, &confirmation) => Some(out),
        };

        let produced = match completion {
            None => {
                tracing::info!(
                    latency_ms = started.elapsed().as_millis() as u64,
                    "turn cancelled while awaiting completion"
                );
                if let Err(e) = self.commit(base).await {
                    advance(&mut state, TurnState::PersistedError);
                    tracing::error!(error = %e, "failed to persist cancelled turn");
                    emitter.finish(TurnOutcome::PersistenceFailed {
                        message: e.to_string(),
                    });
                    return Err(TurnError::Persistence(e));
                }
                emitter.finish(TurnOutcome::Cancelled);
                return Err(TurnError::Cancelled);
            }
            Some(Err(e)) => {
                tracing::error!(
                    error = %e,
                    status = ?e.status(),
                    malformed = e.is_malformed(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "completion request failed"
                );
                let saved = self.commit(base).await;
                advance(&mut state, TurnState::PersistedError);
                return match saved {
                    Ok(()) => {
                        emitter.finish(TurnOutcome::ProviderError {
                            message: e.to_string(),
                        });
                        Err(TurnError::Provider(e))
                    }
                    Err(store_err) => {
                        tracing::error!(error = %store_err, "failed to persist failed turn");
                        emitter.finish(TurnOutcome::PersistenceFailed {
                            message: store_err.to_string(),
                        });
                        Err(TurnError::Persistence(store_err))
                    }
                };
            }
            Some(Ok(produced)) => produced,
        };

        advance(&mut state, TurnState::Emitting);
        for invocation in produced
            .iter()
            .flat_map(|m| m.tool_invocations.iter())
            .filter(|inv| inv.is_pending())
        {
            emitter.present_pending(invocation);
        }
        let reply_text = produced
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if !reply_text.is_empty() {
            emitter.emit(reply_text.clone());
        }

        let before = self.history.len();
        let mut next = base;
        next.extend(produced);
        let appended = next.len().saturating_sub(before);

        match self.commit(next).await {
            Ok(()) => {
                advance(&mut state, TurnState::PersistedSuccess);
                emitter.finish(TurnOutcome::Completed {
                    message: reply_text,
                });
                tracing::info!(
                    appended,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "turn completed"
                );
                Ok(TurnReport { state, appended })
            }
            Err(e) => {
                advance(&mut state, TurnState::PersistedError);
                tracing::error!(error = %e, "failed to persist turn; history unchanged");
                emitter.finish(TurnOutcome::PersistenceFailed {
                    message: e.to_string(),
                });
                Err(TurnError::Persistence(e))
            }
        }
    }

    /// Call the provider until it answers without tool calls, a tool call is
    /// held for confirmation, or the round limit is hit. Returns the messages
    /// this produced, in history order.
    async fn run_completion(
        &self,
        system_prompt: &str,
        base: &[Message],
        tools: &ToolSet,
        confirmation: &HashSet<String>,
    ) -> Result<Vec<Message>, LlmError> {
        let definitions = tools.definitions();
        let model = self.deps.completion.model();
        let max_rounds = self.deps.settings.max_tool_rounds.max(1);
        let mut produced: Vec<Message> = Vec::new();

        for round in 1..=max_rounds {
            let mut prompt = to_prompt(system_prompt, base);
            prompt.extend(produced.iter().map(Message::to_chat_message));

            let completion = self
                .deps
                .completion
                .complete(&prompt, &definitions, model)
                .await?;
            tracing::info!(
                round,
                tool_calls = completion.tool_calls.len(),
                finish_reason = %completion.finish_reason,
                prompt_tokens = completion.usage.prompt_tokens,
                completion_tokens = completion.usage.completion_tokens,
                "completion received"
            );

            if completion.tool_calls.is_empty() {
                produced.push(Message::assistant(completion.content));
                return Ok(produced);
            }

            let mut invocations = Vec::with_capacity(completion.tool_calls.len());
            let mut results = Vec::new();
            for call in completion.tool_calls {
                let arguments = match parse_arguments(&call.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(tool_call_id = %call.id, tool_name = %call.name, error = %e, "tool call arguments are not valid JSON");
                        let result = json!({ "error": format!("invalid tool arguments: {e}") });
                        results.push(Message::tool_result(&call.id, &result));
                        invocations.push(ToolInvocation::new(
                            call.id,
                            call.name,
                            serde_json::Value::String(call.arguments),
                            InvocationState::Executed { result },
                        ));
                        continue;
                    }
                };

                if confirmation.contains(&call.name) {
                    tracing::info!(tool_call_id = %call.id, tool_name = %call.name, "tool call awaiting confirmation");
                    invocations.push(ToolInvocation::new(
                        call.id,
                        call.name,
                        arguments,
                        InvocationState::PendingConfirmation,
                    ));
                } else {
                    let mut invocation =
                        ToolInvocation::new(call.id, call.name, arguments, InvocationState::Approved);
                    let result = self.resolver.run_tool(&invocation, tools).await;
                    results.push(Message::tool_result(&invocation.tool_call_id, &result));
                    invocation.state = InvocationState::Executed { result };
                    invocations.push(invocation);
                }
            }

            let pending = invocations.iter().any(ToolInvocation::is_pending);
            produced.push(Message::assistant(completion.content).with_invocations(invocations));
            produced.extend(results);
            if pending {
                return Ok(produced);
            }
            if round == max_rounds {
                tracing::warn!(max_rounds, "tool round limit reached");
            }
        }
        Ok(produced)
    }
}

fn parse_arguments(raw: &str) -> serde_json::Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

fn advance(state: &mut TurnState, next: TurnState) {
    tracing::debug!(from = ?*state, to = ?next, "turn state transition");
    *state = next;
}

/// Maps conversation ids to their actors, spawning them on first use. Idle
/// actors deregister themselves.
#[derive(Clone)]
pub struct ConversationRegistry {
    actors: Arc<DashMap<String, ConversationHandle>>,
    deps: Arc<ActorDeps>,
    generations: Arc<AtomicU64>,
}

impl ConversationRegistry {
    pub fn new(deps: ActorDeps) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            deps: Arc::new(deps),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self, conversation_id: &str) -> ConversationHandle {
        let mut entry = self
            .actors
            .entry(conversation_id.to_string())
            .or_insert_with(|| self.spawn_actor(conversation_id));
        if entry.is_closed() {
            tracing::warn!(conversation_id, "conversation actor stopped; respawning");
            *entry = self.spawn_actor(conversation_id);
        }
        entry.value().clone()
    }

    /// Current history. Reads through a live actor when there is one, else
    /// straight from the store without starting an actor.
    pub async fn snapshot(&self, conversation_id: &str) -> Result<Vec<Message>, TurnError> {
        let live = self
            .actors
            .get(conversation_id)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed());
        if let Some(handle) = live {
            match handle.snapshot().await {
                Err(TurnError::ActorClosed) => {}
                other => return other,
            }
        }
        Ok(self.deps.store.load(conversation_id).await?)
    }

    /// Number of live conversation actors.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    fn spawn_actor(&self, conversation_id: &str) -> ConversationHandle {
        let (tx, rx) = mpsc::channel(self.deps.settings.mailbox_capacity.max(1));
        let id = conversation_id.to_string();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(ConversationActor::start(
            id.clone(),
            generation,
            self.deps.clone(),
            self.actors.clone(),
            rx,
        ));
        ConversationHandle { id, generation, tx }
    }
}

#[async_trait]
impl ScheduledTaskSink for ConversationRegistry {
    async fn deliver(&self, conversation_id: &str, description: &str) -> Result<(), TurnError> {
        self.handle(conversation_id)
            .handle_scheduled_fire(description)
            .await
            .map(|_| ())
    }
}
