//! Per-turn output channel.
//!
//! Events arrive in the order `tool_pending*`, `text?`, `finish`. The finish
//! event is sent exactly once: either through [`StreamEmitter::finish`] or, if
//! the emitter is dropped first, as [`TurnOutcome::Aborted`].

use crate::message::ToolInvocation;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed { message: String },
    ProviderError { message: String },
    Cancelled,
    PersistenceFailed { message: String },
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        content: String,
    },
    ToolPending {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    Finish(TurnOutcome),
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolPending { .. } => "tool_pending",
            Self::Finish(_) => "finish",
        }
    }
}

pub struct StreamEmitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
    finished: bool,
    text_sent: bool,
}

impl StreamEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                finished: false,
                text_sent: false,
            },
            rx,
        )
    }

    /// Deliver the turn's text. Only the first call sends anything.
    pub fn emit(&mut self, content: impl Into<String>) -> bool {
        if self.text_sent {
            tracing::debug!("text already emitted for this turn; ignoring");
            return false;
        }
        self.text_sent = true;
        self.send(StreamEvent::Text {
            content: content.into(),
        })
    }

    pub fn present_pending(&mut self, invocation: &ToolInvocation) -> bool {
        self.send(StreamEvent::ToolPending {
            tool_call_id: invocation.tool_call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            arguments: invocation.arguments.clone(),
        })
    }

    pub fn finish(mut self, outcome: TurnOutcome) {
        self.finished = true;
        self.send(StreamEvent::Finish(outcome));
    }

    fn send(&self, event: StreamEvent) -> bool {
        let kind = event.name();
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(event = kind, "stream receiver gone; dropping event");
                false
            }
        }
    }
}

impl Drop for StreamEmitter {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            tracing::warn!("stream emitter dropped without finish; sending aborted");
            self.send(StreamEvent::Finish(TurnOutcome::Aborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InvocationState;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn finish_is_sent_exactly_once() {
        let (mut emitter, mut rx) = StreamEmitter::channel();
        assert!(emitter.emit("4"));
        assert!(!emitter.emit("again"));
        emitter.finish(TurnOutcome::Completed {
            message: "4".to_string(),
        });

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "text");
        assert!(matches!(
            &events[1],
            StreamEvent::Finish(TurnOutcome::Completed { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_without_finish_sends_aborted() {
        let (emitter, mut rx) = StreamEmitter::channel();
        drop(emitter);
        assert_eq!(drain(&mut rx), vec![StreamEvent::Finish(TurnOutcome::Aborted)]);
    }

    #[test]
    fn sending_after_receiver_dropped_reports_false() {
        let (mut emitter, rx) = StreamEmitter::channel();
        drop(rx);
        assert!(!emitter.emit("lost"));
        emitter.finish(TurnOutcome::Cancelled);
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let (mut emitter, mut rx) = StreamEmitter::channel();
        emitter.present_pending(&ToolInvocation::new(
            "call_1",
            "http_post",
            json!({ "url": "x" }),
            InvocationState::PendingConfirmation,
        ));
        emitter.finish(TurnOutcome::ProviderError {
            message: "status 500".to_string(),
        });

        let events = drain(&mut rx);
        let pending = serde_json::to_value(&events[0]).expect("serialize pending");
        assert_eq!(pending["type"], "tool_pending");
        assert_eq!(pending["tool_name"], "http_post");
        let finish = serde_json::to_value(&events[1]).expect("serialize finish");
        assert_eq!(finish["type"], "finish");
        assert_eq!(finish["outcome"], "provider_error");
        assert_eq!(finish["message"], "status 500");
    }
}
