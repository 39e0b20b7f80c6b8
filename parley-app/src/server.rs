//! Parley server: wires config, provider client, store, scheduler and the
//! conversation registry behind the HTTP routes.

use crate::config::{ParleyConfig, StoreBackend};
use crate::conversation::{ActorDeps, ConversationRegistry, TurnSettings};
use crate::prompt::PromptComposer;
use crate::routes;
use crate::scheduler::TaskScheduler;
use crate::store::{ConversationStore, MemoryConversationStore, SqliteConversationStore};
use anyhow::Result;
use axum::Extension;
use axum::Router;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use parley_llm::{ChatCompletion, CompletionClient, validate_tool_name};
use parley_tools::{CurrentTimeTool, HttpPostTool, StaticToolSource, Tool, ToolSource};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub registry: ConversationRegistry,
    pub credential_configured: bool,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ParleyConfig::load(config_path).await?;
    let credential_configured = cfg.has_credential();
    let builtin = build_builtin_tools(&cfg)?;
    preflight_validate_tool_names(&builtin)?;
    tracing::info!(
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        store_backend = ?cfg.store.backend,
        store_path = %cfg.store.path.display(),
        scheduler_enabled = cfg.scheduler.enabled,
        builtin_tools = builtin.len(),
        credential_configured,
        "config ok"
    );
    if !credential_configured {
        tracing::warn!("OPENROUTER_API_KEY is not set; completion requests will fail");
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ParleyConfig::load(config_path).await?;
    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", cfg.server.bind_addr))?;

    let completion_cfg = cfg.completion_config();
    let credential_configured = completion_cfg.has_credential();
    if !credential_configured {
        tracing::warn!("OPENROUTER_API_KEY is not set; completion requests will fail until it is configured");
    }
    tracing::info!(
        bind_addr = %addr,
        model = %completion_cfg.model,
        base_url = %completion_cfg.base_url,
        store_backend = ?cfg.store.backend,
        scheduler_enabled = cfg.scheduler.enabled,
        max_tool_rounds = cfg.context.max_tool_rounds,
        "starting parley"
    );

    let completion: Arc<dyn ChatCompletion> = Arc::new(CompletionClient::new(completion_cfg));
    let store = build_store(&cfg)?;
    let scheduler = TaskScheduler::new(Duration::from_millis(cfg.scheduler.tick_millis));
    let tool_sources = build_tool_sources(&cfg, &scheduler)?;

    let registry = ConversationRegistry::new(ActorDeps {
        completion,
        store,
        tool_sources,
        composer: PromptComposer::new(cfg.general.system_prompt.clone()),
        settings: TurnSettings {
            max_tool_rounds: cfg.context.max_tool_rounds,
            confirmation_required: cfg.tools.confirmation_required.clone(),
            mailbox_capacity: cfg.context.mailbox_capacity,
            idle_timeout: Duration::from_secs(cfg.context.actor_idle_seconds),
        },
    });
    if cfg.scheduler.enabled {
        scheduler.start(Arc::new(registry.clone())).await;
    }

    let state = Arc::new(AppState {
        registry,
        credential_configured,
    });

    let listener = preflight_bind_listener(addr).await?;
    let shutdown = CancellationToken::new();

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router(state)
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "parley serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    scheduler.shutdown().await;
    Ok(())
}

/// Routes with shared state attached, without the outer middleware stack.
pub fn router(state: Arc<AppState>) -> Router {
    routes::router().layer(Extension(state))
}

fn build_store(cfg: &ParleyConfig) -> Result<Arc<dyn ConversationStore>> {
    match cfg.store.backend {
        StoreBackend::Sqlite => {
            let store = SqliteConversationStore::open(&cfg.store.path).map_err(|e| {
                anyhow::anyhow!("open conversation store {}: {e}", cfg.store.path.display())
            })?;
            tracing::info!(path = %cfg.store.path.display(), "sqlite conversation store opened");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("memory conversation store configured; history is lost on restart");
            Ok(Arc::new(MemoryConversationStore::new()))
        }
    }
}

fn build_builtin_tools(cfg: &ParleyConfig) -> Result<Vec<Arc<dyn Tool>>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![Arc::new(CurrentTimeTool::new())];
    if !cfg.tools.http_post_allowed_urls.is_empty() {
        let timeout = Duration::from_secs(cfg.tools.http_post_timeout_seconds.unwrap_or(15));
        tools.push(Arc::new(HttpPostTool::new(
            cfg.tools.http_post_allowed_urls.clone(),
            timeout,
        )?));
    }
    Ok(tools)
}

fn build_tool_sources(
    cfg: &ParleyConfig,
    scheduler: &TaskScheduler,
) -> Result<Vec<Arc<dyn ToolSource>>> {
    let builtin = build_builtin_tools(cfg)?;
    preflight_validate_tool_names(&builtin)?;
    let mut sources: Vec<Arc<dyn ToolSource>> =
        vec![Arc::new(StaticToolSource::new("builtin", builtin))];
    if cfg.scheduler.enabled {
        sources.push(Arc::new(scheduler.clone()));
    }
    Ok(sources)
}

fn preflight_validate_tool_names(tools: &[Arc<dyn Tool>]) -> Result<()> {
    for tool in tools {
        let spec = tool.spec();
        validate_tool_name(&spec.name).map_err(|e| {
            anyhow::anyhow!("preflight tool name validation failed for '{}': {e}", spec.name)
        })?;
    }
    tracing::info!(tool_count = tools.len(), "preflight tool name validation passed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
