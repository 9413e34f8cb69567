use std::net::SocketAddr;
use std::sync::Arc;

use herald_config::{Config, McpTransport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod artifacts;
pub mod auth;
pub mod bridge;
pub mod error;
pub mod mcp;
pub mod notifier;
pub mod prompts;
pub mod registry;
pub mod router;
pub mod tasks;
pub mod telegram;

pub use artifacts::ArtifactWatcher;
pub use auth::Authorization;
pub use bridge::{Bridge, BridgeSettings, ToolOutcome};
pub use error::{BridgeError, TransportError};
pub use mcp::{build_app, serve_lines, McpHandler};
pub use notifier::{ChatTransport, Notifier, RetryPolicy};
pub use prompts::PromptQueue;
pub use registry::Registry;
pub use router::{ResponseRouter, RouteOutcome};
pub use tasks::TaskFileWatcher;
pub use telegram::TelegramTransport;

/// Wires registry, prompt queue, notifier and router around `transport`.
pub fn build_bridge(
    cfg: &Config,
    transport: Arc<dyn ChatTransport>,
) -> Result<(Bridge, ResponseRouter), BridgeError> {
    let auth = Authorization::new(cfg.telegram.authorized_chat_ids.iter().copied());
    if auth.is_empty() {
        return Err(BridgeError::Startup(
            "telegram.authorized_chat_ids must not be empty".to_string(),
        ));
    }
    let registry = Registry::new(auth.clone());
    let prompts = match cfg.prompts.store.kind.as_str() {
        "sqlite" => {
            let path = cfg.sqlite_path().ok_or_else(|| {
                BridgeError::Startup("prompts.store.sqlite_path is required".to_string())
            })?;
            PromptQueue::sqlite(&path, auth.clone())?
        }
        _ => PromptQueue::memory(auth.clone()),
    };
    let notifier = Notifier::new(
        transport,
        RetryPolicy::from_config(&cfg.outbound),
        registry.clone(),
    );
    let bridge = Bridge::new(
        registry,
        prompts,
        notifier,
        auth.clone(),
        BridgeSettings::from_config(cfg),
    );
    let router = ResponseRouter::new(bridge.clone(), auth, cfg.approvals.untagged_reply_policy);
    Ok((bridge, router))
}

pub async fn serve(cfg: Config) -> Result<(), BridgeError> {
    let token = cfg
        .bot_token()
        .map_err(|e| BridgeError::Startup(e.to_string()))?;
    let bot = telegram::connect(token).await?;
    let (bridge, router) = build_bridge(&cfg, Arc::new(TelegramTransport::new(bot.clone())))?;
    let shutdown = bridge.shutdown_token();

    let (dispatcher, dispatcher_task) = telegram::spawn_dispatcher(bot, router);
    let artifacts = ArtifactWatcher::start(
        &cfg.artifacts,
        cfg.artifacts_dir(),
        bridge.notifier().clone(),
        bridge.primary_conversation(),
        shutdown.clone(),
    )?;
    let task_file = TaskFileWatcher::start(
        &cfg.tasks,
        cfg.task_file(),
        bridge.prompts().clone(),
        bridge.primary_conversation(),
        shutdown.clone(),
    )?;

    let handler = McpHandler::new(bridge.clone(), cfg.mcp.server_name.clone());
    let mut transport_task: JoinHandle<Result<(), BridgeError>> = match cfg.mcp.transport {
        McpTransport::Stdio => tokio::spawn(mcp::serve_stdio(handler, shutdown.clone())),
        McpTransport::Http => {
            let addr: SocketAddr = cfg
                .mcp
                .listen_addr
                .parse()
                .map_err(|e| BridgeError::Startup(format!("invalid mcp.listen_addr: {e}")))?;
            tokio::spawn(mcp::serve_http(handler, addr, shutdown.clone()))
        }
    };
    info!(
        transport = ?cfg.mcp.transport,
        primary = %bridge.primary_conversation(),
        "bridge running"
    );

    let finished_early = tokio::select! {
        _ = shutdown_signal() => None,
        _ = shutdown.cancelled() => None,
        joined = &mut transport_task => Some(joined),
    };

    info!("shutting down");
    bridge.shutdown().await;
    telegram::stop_dispatcher(&dispatcher).await;
    let _ = dispatcher_task.await;
    if let Some(watcher) = artifacts {
        watcher.stop().await;
    }
    if let Some(watcher) = task_file {
        watcher.stop().await;
    }

    let joined = match finished_early {
        Some(joined) => joined,
        None => transport_task.await,
    };
    joined.map_err(|e| BridgeError::Startup(format!("mcp transport task failed: {e}")))?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
