//! In-process task scheduler. Fired tasks are delivered to a
//! [`ScheduledTaskSink`] as scheduled-task notifications for their conversation.

use crate::error::TurnError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use parley_tools::{Tool, ToolError, ToolSource, ToolSpec, require_string};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleWhen {
    At { at: DateTime<Utc> },
    Delay { seconds: u64 },
    Cron { expression: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub conversation_id: String,
    pub description: String,
    pub when: ScheduleWhen,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Receives fired tasks.
#[async_trait]
pub trait ScheduledTaskSink: Send + Sync {
    async fn deliver(&self, conversation_id: &str, description: &str)
    -> std::result::Result<(), TurnError>;
}

#[derive(Clone)]
pub struct TaskScheduler {
    tasks: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    tick: Duration,
    shutdown: CancellationToken,
    background_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            tick: tick.max(Duration::from_millis(1)),
            shutdown: CancellationToken::new(),
            background_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tracing::instrument(level = "info", skip(self, description))]
    pub async fn schedule(
        &self,
        conversation_id: &str,
        description: &str,
        when: ScheduleWhen,
    ) -> Result<ScheduledTask> {
        let description = description.trim();
        if description.is_empty() {
            return Err(anyhow::anyhow!("task description must not be empty"));
        }
        let when = normalize_when(when)?;
        let now = Utc::now();
        let next_fire_at = compute_next_fire_at(&when, now)?
            .ok_or_else(|| anyhow::anyhow!("schedule never fires"))?;
        let task = ScheduledTask {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            description: description.to_string(),
            when,
            next_fire_at,
            created_at: now,
        };
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        tracing::info!(
            task_id = %task.id,
            conversation_id,
            next_fire_at = %task.next_fire_at,
            "scheduled task registered"
        );
        Ok(task)
    }

    pub async fn list(&self, conversation_id: &str) -> Vec<ScheduledTask> {
        let mut out: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.next_fire_at);
        out
    }

    /// Remove a task owned by `conversation_id`. Returns whether one was removed.
    pub async fn cancel(&self, conversation_id: &str, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get(task_id) {
            Some(t) if t.conversation_id == conversation_id => {
                tasks.remove(task_id);
                tracing::info!(task_id, conversation_id, "scheduled task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Deliver every task due at `now`. One-shot tasks are removed, cron
    /// tasks move to their next fire time.
    pub async fn fire_due(&self, now: DateTime<Utc>, sink: &dyn ScheduledTaskSink) -> usize {
        let due: Vec<ScheduledTask> = {
            let mut tasks = self.tasks.write().await;
            let due_ids: Vec<String> = tasks
                .values()
                .filter(|t| t.next_fire_at <= now)
                .map(|t| t.id.clone())
                .collect();
            let mut due = Vec::with_capacity(due_ids.len());
            for id in due_ids {
                let Some(task) = tasks.remove(&id) else {
                    continue;
                };
                if let ScheduleWhen::Cron { .. } = task.when {
                    match compute_next_fire_at(&task.when, now) {
                        Ok(Some(next)) => {
                            let mut next_task = task.clone();
                            next_task.next_fire_at = next;
                            tasks.insert(id, next_task);
                        }
                        Ok(None) => {
                            tracing::info!(task_id = %task.id, "cron schedule exhausted");
                        }
                        Err(e) => {
                            tracing::error!(task_id = %task.id, error = %e, "failed to reschedule cron task");
                        }
                    }
                }
                due.push(task);
            }
            due
        };

        let fired = due.len();
        for task in due {
            match sink.deliver(&task.conversation_id, &task.description).await {
                Ok(()) => tracing::info!(
                    task_id = %task.id,
                    conversation_id = %task.conversation_id,
                    "scheduled task fired"
                ),
                Err(e) => tracing::error!(
                    task_id = %task.id,
                    conversation_id = %task.conversation_id,
                    error = %e,
                    "failed to deliver scheduled task"
                ),
            }
        }
        fired
    }

    pub async fn start(&self, sink: Arc<dyn ScheduledTaskSink>) {
        let scheduler = self.clone();
        let shutdown = self.shutdown.child_token();
        let tick = self.tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("scheduler loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {}
                }
                scheduler.fire_due(Utc::now(), sink.as_ref()).await;
            }
        });
        self.background_tasks.lock().await.push(task);
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.background_tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "scheduler task join failed"),
                Err(_) => tracing::warn!("timed out waiting for scheduler shutdown"),
            }
        }
    }
}

fn normalize_when(when: ScheduleWhen) -> Result<ScheduleWhen> {
    match when {
        ScheduleWhen::Delay { seconds: 0 } => Err(anyhow::anyhow!("delay seconds must be > 0")),
        ScheduleWhen::Cron { expression } => {
            let expression = expression.trim();
            if expression.is_empty() {
                return Err(anyhow::anyhow!("cron expression must not be empty"));
            }
            // The cron crate wants a leading seconds field.
            let expression = if expression.split_whitespace().count() == 5 {
                format!("0 {expression}")
            } else {
                expression.to_string()
            };
            Schedule::from_str(&expression)
                .map_err(|e| anyhow::anyhow!("invalid cron expression: {e}"))?;
            Ok(ScheduleWhen::Cron { expression })
        }
        other => Ok(other),
    }
}

fn compute_next_fire_at(when: &ScheduleWhen, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match when {
        ScheduleWhen::At { at } => Ok(Some(*at)),
        ScheduleWhen::Delay { seconds } => {
            let seconds = i64::try_from(*seconds)
                .map_err(|_| anyhow::anyhow!("delay seconds out of range"))?;
            Ok(Some(from + ChronoDuration::seconds(seconds)))
        }
        ScheduleWhen::Cron { expression } => {
            let schedule = Schedule::from_str(expression)
                .map_err(|e| anyhow::anyhow!("invalid cron expression: {e}"))?;
            Ok(schedule.after(&from).next())
        }
    }
}

impl ToolSource for TaskScheduler {
    fn source_name(&self) -> &str {
        "scheduler"
    }

    fn tools_for(&self, conversation_id: &str) -> Vec<Arc<dyn Tool>> {
        let bound = |kind| -> Arc<dyn Tool> {
            Arc::new(SchedulerTool {
                kind,
                scheduler: self.clone(),
                conversation_id: conversation_id.to_string(),
            })
        };
        vec![
            bound(SchedulerToolKind::Schedule),
            bound(SchedulerToolKind::List),
            bound(SchedulerToolKind::Cancel),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
enum SchedulerToolKind {
    Schedule,
    List,
    Cancel,
}

/// Scheduler operations exposed to the model, bound to one conversation.
struct SchedulerTool {
    kind: SchedulerToolKind,
    scheduler: TaskScheduler,
    conversation_id: String,
}

#[async_trait]
impl Tool for SchedulerTool {
    fn spec(&self) -> ToolSpec {
        let (name, description, parameters_schema) = match self.kind {
            SchedulerToolKind::Schedule => (
                "schedule_task",
                "Schedule a task to run later in this conversation.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "when": {
                            "type": "object",
                            "properties": {
                                "type": { "type": "string", "enum": ["at", "delay", "cron"] },
                                "at": { "type": "string", "description": "RFC 3339 timestamp" },
                                "seconds": { "type": "integer", "minimum": 1 },
                                "expression": { "type": "string" }
                            },
                            "required": ["type"]
                        }
                    },
                    "required": ["description", "when"]
                }),
            ),
            SchedulerToolKind::List => (
                "list_scheduled_tasks",
                "List tasks scheduled for this conversation.",
                serde_json::json!({ "type": "object", "properties": {} }),
            ),
            SchedulerToolKind::Cancel => (
                "cancel_scheduled_task",
                "Cancel a scheduled task by id.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "task_id": { "type": "string" } },
                    "required": ["task_id"]
                }),
            ),
        };
        ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            parameters_schema,
            requires_confirmation: false,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> parley_tools::Result<serde_json::Value> {
        match self.kind {
            SchedulerToolKind::Schedule => {
                let description = require_string(&arguments, "description")?;
                let when: ScheduleWhen = arguments
                    .get("when")
                    .cloned()
                    .ok_or_else(|| ToolError::InvalidArguments("missing when".to_string()))
                    .and_then(|v| {
                        serde_json::from_value(v)
                            .map_err(|e| ToolError::InvalidArguments(format!("invalid when: {e}")))
                    })?;
                let task = self
                    .scheduler
                    .schedule(&self.conversation_id, &description, when)
                    .await
                    .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
                Ok(serde_json::json!({
                    "task_id": task.id,
                    "next_fire_at": task.next_fire_at,
                }))
            }
            SchedulerToolKind::List => {
                let tasks = self.scheduler.list(&self.conversation_id).await;
                Ok(serde_json::json!({ "tasks": tasks }))
            }
            SchedulerToolKind::Cancel => {
                let task_id = require_string(&arguments, "task_id")?;
                let cancelled = self.scheduler.cancel(&self.conversation_id, &task_id).await;
                Ok(serde_json::json!({ "task_id": task_id, "cancelled": cancelled }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ScheduledTaskSink for RecordingSink {
        async fn deliver(
            &self,
            conversation_id: &str,
            description: &str,
        ) -> std::result::Result<(), TurnError> {
            self.delivered
                .lock()
                .expect("sink lock")
                .push((conversation_id.to_string(), description.to_string()));
            Ok(())
        }
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.delivered.lock().expect("sink lock").len()
        }
    }

    #[tokio::test]
    async fn delayed_task_fires_once_and_is_removed() {
        let scheduler = TaskScheduler::new(Duration::from_secs(1));
        let sink = RecordingSink::default();
        let task = scheduler
            .schedule("conv-1", "send weekly report", ScheduleWhen::Delay { seconds: 60 })
            .await
            .expect("schedule");

        assert_eq!(scheduler.fire_due(Utc::now(), &sink).await, 0);
        let later = task.next_fire_at + ChronoDuration::seconds(1);
        assert_eq!(scheduler.fire_due(later, &sink).await, 1);
        assert_eq!(scheduler.fire_due(later, &sink).await, 0);
        assert!(scheduler.list("conv-1").await.is_empty());
        assert_eq!(
            sink.delivered.lock().expect("sink lock")[0],
            ("conv-1".to_string(), "send weekly report".to_string())
        );
    }

    #[tokio::test]
    async fn cron_task_is_rescheduled_after_firing() {
        let scheduler = TaskScheduler::new(Duration::from_secs(1));
        let sink = RecordingSink::default();
        let task = scheduler
            .schedule(
                "conv-1",
                "standup",
                ScheduleWhen::Cron {
                    expression: "*/5 * * * *".to_string(),
                },
            )
            .await
            .expect("schedule cron");
        assert_eq!(
            task.when,
            ScheduleWhen::Cron {
                expression: "0 */5 * * * *".to_string()
            }
        );

        assert_eq!(scheduler.fire_due(task.next_fire_at, &sink).await, 1);
        let remaining = scheduler.list("conv-1").await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].next_fire_at > task.next_fire_at);
    }

    #[tokio::test]
    async fn invalid_schedules_are_rejected() {
        let scheduler = TaskScheduler::new(Duration::from_secs(1));
        assert!(scheduler
            .schedule("c", "x", ScheduleWhen::Delay { seconds: 0 })
            .await
            .is_err());
        assert!(scheduler
            .schedule("c", "x", ScheduleWhen::Cron { expression: "every day".to_string() })
            .await
            .is_err());
        assert!(scheduler
            .schedule("c", "  ", ScheduleWhen::Delay { seconds: 5 })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn tools_are_bound_to_their_conversation() {
        let scheduler = TaskScheduler::new(Duration::from_secs(1));
        let tools = scheduler.tools_for("conv-1");
        let names: Vec<String> = tools.iter().map(|t| t.spec().name).collect();
        assert_eq!(
            names,
            vec!["schedule_task", "list_scheduled_tasks", "cancel_scheduled_task"]
        );
        assert!(tools.iter().all(|t| !t.spec().requires_confirmation));

        let out = tools[0]
            .execute(json!({
                "description": "water the plants",
                "when": { "type": "delay", "seconds": 3600 }
            }))
            .await
            .expect("schedule via tool");
        let task_id = out["task_id"].as_str().expect("task id").to_string();

        let listed = tools[1].execute(json!({})).await.expect("list");
        assert_eq!(listed["tasks"][0]["description"], "water the plants");
        assert!(scheduler.list("conv-2").await.is_empty());

        let other = scheduler.tools_for("conv-2");
        let denied = other[2]
            .execute(json!({ "task_id": task_id }))
            .await
            .expect("cancel from other conversation");
        assert_eq!(denied["cancelled"], false);

        let cancelled = tools[2]
            .execute(json!({ "task_id": task_id }))
            .await
            .expect("cancel");
        assert_eq!(cancelled["cancelled"], true);
    }

    #[tokio::test]
    async fn schedule_tool_rejects_malformed_when() {
        let scheduler = TaskScheduler::new(Duration::from_secs(1));
        let tools = scheduler.tools_for("conv-1");
        let err = tools[0]
            .execute(json!({ "description": "x", "when": { "type": "sometime" } }))
            .await
            .expect_err("bad when");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn background_loop_delivers_and_stops_on_shutdown() {
        let scheduler = TaskScheduler::new(Duration::from_millis(10));
        let sink = Arc::new(RecordingSink::default());
        scheduler
            .schedule("conv-1", "ping", ScheduleWhen::At { at: Utc::now() })
            .await
            .expect("schedule");
        scheduler.start(sink.clone()).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task delivered");
        scheduler.shutdown().await;
        assert_eq!(sink.count(), 1);
    }
}
