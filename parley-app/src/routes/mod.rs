pub mod conversations;
pub mod health;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(conversations::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::conversation::{ActorDeps, ConversationRegistry, TurnSettings};
    use crate::prompt::PromptComposer;
    use crate::server::AppState;
    use crate::store::MemoryConversationStore;
    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use parley_llm::{ChatCompletion, ChatMessage, Completion, LlmError, ToolDefinition, Usage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) enum Reply {
        Text(String),
        MissingCredential,
        Hang,
    }

    pub(crate) struct StaticCompletion {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl StaticCompletion {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatCompletion for StaticCompletion {
        fn model(&self) -> &str {
            "static"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
            _model: &str,
        ) -> parley_llm::Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Text(content) => Ok(Completion {
                    content: content.clone(),
                    tool_calls: Vec::new(),
                    usage: Usage::default(),
                    finish_reason: "stop".to_string(),
                }),
                Reply::MissingCredential => Err(LlmError::MissingCredential),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    pub(crate) fn state_with(
        reply: Reply,
        credential_configured: bool,
    ) -> (Arc<AppState>, Arc<StaticCompletion>) {
        let completion = Arc::new(StaticCompletion {
            reply,
            calls: AtomicUsize::new(0),
        });
        let registry = ConversationRegistry::new(ActorDeps {
            completion: completion.clone(),
            store: Arc::new(MemoryConversationStore::new()),
            tool_sources: Vec::new(),
            composer: PromptComposer::default(),
            settings: TurnSettings {
                max_tool_rounds: 4,
                confirmation_required: Vec::new(),
                mailbox_capacity: 8,
                idle_timeout: Duration::from_secs(60),
            },
        });
        let state = Arc::new(AppState {
            registry,
            credential_configured,
        });
        (state, completion)
    }

    /// Replies with a fixed text, or fails when `reply` is `None`.
    pub(crate) fn state(reply: Option<&str>, credential_configured: bool) -> Arc<AppState> {
        let reply = match reply {
            Some(text) => Reply::Text(text.to_string()),
            None => Reply::MissingCredential,
        };
        state_with(reply, credential_configured).0
    }

    pub(crate) async fn call(app: Router, request: Request<Body>) -> (u16, String) {
        let response = app.oneshot(request).await.expect("infallible router");
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }
}
