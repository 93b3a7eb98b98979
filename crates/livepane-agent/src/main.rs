use std::{path::Path, sync::Arc};

use anyhow::Context;
use livepane_agent::{
    chat::{self, ChatService},
    config::AgentConfig,
    controller::{Controller, NoticeLevel},
    environment::{HostEnvironment, Severity, diagnose},
    local_sandbox::LocalPlatform,
    logs::RunLog,
    preview::PreviewBridge,
    project_client::{ProjectClient, TreePersister, TreeStore},
    runtime_handle::RuntimeHandle,
    ui_server::{self, AppState},
};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer());

    let Some(dir) = log_dir else {
        registry
            .try_init()
            .context("initialize tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "livepane-agent.log"));
    registry
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("initialize tracing subscriber")?;
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env()?;
    let _guard = init_tracing(cfg.log_dir.as_deref())?;

    let env = HostEnvironment::from_config(&cfg);
    let diagnosis = diagnose(&env);
    for issue in &diagnosis.issues {
        match issue.severity {
            Severity::Error => tracing::error!(kind = ?issue.kind, "{}", issue.message),
            Severity::Warning => tracing::warn!(kind = ?issue.kind, "{}", issue.message),
            Severity::Info => tracing::info!(kind = ?issue.kind, "{}", issue.message),
        }
    }

    let platform = Arc::new(LocalPlatform::from_config(&cfg));
    let runtime = Arc::new(RuntimeHandle::new(platform, env));

    let client = match (&cfg.api_url, &cfg.project_id) {
        (Some(api), Some(project)) => Some(Arc::new(ProjectClient::new(
            api.clone(),
            project.clone(),
            cfg.token.clone(),
        )?)),
        _ => None,
    };
    let persister = client
        .clone()
        .map(|c| TreePersister::spawn(c as Arc<dyn TreeStore>));

    let controller = Arc::new(Controller::new(
        runtime.clone(),
        PreviewBridge::new(),
        RunLog::new(cfg.log_max_lines),
        cfg.install.clone(),
        cfg.start.clone(),
        persister,
    ));

    {
        let controller = controller.clone();
        tokio::spawn(async move {
            match controller.runtime().boot().await {
                Ok(_) => tracing::info!("sandbox runtime ready"),
                Err(e) => {
                    tracing::error!(kind = ?e.kind, error = %e.message, "sandbox boot failed");
                    controller.notify(NoticeLevel::Error, e.message).await;
                }
            }
        });
    }

    if let Some(client) = &client {
        match client.fetch_project().await {
            Ok(project) => {
                tracing::info!(project = %project.id, name = %project.name, "project loaded");
                if let Some(tree) = project.file_tree
                    && let Err(e) = controller.replace_tree(tree).await
                {
                    tracing::warn!(error = %e, "project file tree rejected");
                }
            }
            Err(e) => {
                tracing::warn!(project = client.project_id(), error = %e, "fetch project failed")
            }
        }
    }

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let tunnel_url = cfg
        .chat_ws_url
        .as_deref()
        .and_then(|raw| chat::parse_ws_url(raw, cfg.project_id.as_deref()));
    let chat = Arc::new(ChatService::new(
        controller.clone(),
        tunnel_url.as_ref().map(|_| outbound_tx),
    ));
    match tunnel_url {
        Some(url) => chat::spawn_tunnel(chat.clone(), url, cfg.token.clone(), outbound_rx),
        None => tracing::info!("no chat server configured; chat stays local"),
    }

    let app = ui_server::router(
        AppState {
            controller: controller.clone(),
            chat,
        },
        cfg.isolation_headers,
    );

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    tracing::info!(
        addr = %cfg.listen_addr,
        origin = %cfg.public_origin,
        "livepane-agent listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    controller.stop().await;
    Ok(())
}
