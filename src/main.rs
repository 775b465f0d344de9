mod bridge;
mod config;
mod control;
mod control_server;
mod domain;
mod keyed_queue;
mod opencode;
mod ports;
mod relay;
mod session_link;
mod storage;
mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::BridgeService;
use crate::config::Config;
use crate::control::ControlService;
use crate::control_server::{control_router, webhook_router, ControlState};
use crate::domain::BotTransport;
use crate::opencode::OpenCodeClient;
use crate::ports::{
    AuthzRepository, InteractiveTelegram, SessionLinkRepository, SessionModelRepository,
    TelegramSender,
};
use crate::relay::RelayService;
use crate::session_link::SessionLinkService;
use crate::storage::SqliteStore;
use crate::telegram::TelegramApi;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Telegram front-end bridge for an OpenCode assistant server"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the bridge (default).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => run_serve().await,
    }
}

async fn run_serve() -> Result<()> {
    let cfg = Config::from_env()?;
    init_logging(&cfg.log_level);

    let store = SqliteStore::open(cfg.database_path.clone()).await?;
    store
        .seed_from_config(&cfg.admin_user_ids, &cfg.allowed_user_ids)
        .await
        .context("seed access tables from config")?;

    let opencode = Arc::new(OpenCodeClient::new(&cfg));
    let telegram = Arc::new(TelegramApi::new(
        &cfg.bot_token,
        cfg.opencode_timeout,
        cfg.polling_interval,
    ));
    let sessions = Arc::new(SessionLinkService::new(
        Arc::clone(&store) as Arc<dyn SessionLinkRepository>,
        &cfg.default_session_id,
    ));
    let bridge = Arc::new(BridgeService::new(
        Arc::clone(&opencode),
        Arc::clone(&telegram) as Arc<dyn InteractiveTelegram>,
        Arc::clone(&store) as Arc<dyn AuthzRepository>,
        Arc::clone(&store) as Arc<dyn SessionModelRepository>,
        Arc::clone(&sessions),
        cfg.sessions_list_limit,
        cfg.sessions_source,
        cfg.sessions_show_id_list,
        !cfg.relay_sse_enabled,
    ));
    let control = Arc::new(ControlService::new(
        Arc::clone(&store) as Arc<dyn AuthzRepository>,
        Arc::clone(&sessions),
        Arc::clone(&store) as Arc<dyn SessionModelRepository>,
        Arc::clone(&opencode),
        cfg.sessions_list_limit,
        cfg.sessions_source,
    ));

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    {
        let state = ControlState::new(
            &cfg,
            control,
            Arc::clone(&opencode),
            Arc::clone(&telegram),
        );
        let addr = format!("0.0.0.0:{}", cfg.health_port);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            control_server::serve(&addr, control_router(state), cancel).await
        });
    }

    if cfg.relay_sse_enabled {
        let relay = RelayService::new(
            Arc::clone(&opencode),
            Arc::clone(&store) as Arc<dyn SessionLinkRepository>,
            Arc::clone(&telegram) as Arc<dyn TelegramSender>,
            cfg.relay_mode,
            cfg.relay_fallback,
            cfg.relay_fallback_delay,
        );
        let cancel = cancel.clone();
        tasks.spawn(async move { relay.run(cancel).await });
    } else {
        info!("sse relay disabled; using sync wait mode");
    }

    match cfg.bot_transport {
        BotTransport::Polling => {
            if let Err(err) = telegram.delete_webhook().await {
                warn!("delete webhook failed before polling: {err}");
            }
            let telegram = Arc::clone(&telegram);
            let poll_cancel = cancel.clone();
            let handler_bridge = Arc::clone(&bridge);
            let handler_cancel = cancel.clone();
            tasks.spawn(async move {
                telegram
                    .poll_updates(poll_cancel, move |update| {
                        let bridge = Arc::clone(&handler_bridge);
                        let cancel = handler_cancel.clone();
                        async move {
                            bridge.handle_update(&cancel, update).await;
                        }
                    })
                    .await
            });
        }
        BotTransport::Webhook => {
            telegram
                .setup_webhook(&cfg.webhook_url)
                .await
                .context("register webhook")?;
            let path = telegram::webhook_path(&cfg.webhook_url);
            let router = webhook_router(&path, Arc::clone(&bridge), cancel.clone());
            let addr = listen_addr(&cfg.webhook_listen_addr);
            let cancel = cancel.clone();
            tasks.spawn(async move { control_server::serve(&addr, router, cancel).await });
        }
    }

    info!(
        "bridge serving (transport={:?}, relay_mode={}, health_port={})",
        cfg.bot_transport, cfg.relay_mode, cfg.health_port
    );

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down bridge");
            cancel.cancel();
            let drain = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
                warn!("shutdown grace period elapsed with tasks still running");
            }
            Ok(())
        }
        joined = tasks.join_next() => {
            cancel.cancel();
            match joined {
                Some(Ok(Ok(()))) | None => Ok(()),
                Some(Ok(Err(err))) => Err(err),
                Some(Err(join_err)) => Err(anyhow::anyhow!("task panicked: {join_err}")),
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Accepts Go-style ":8090" listen addresses by prefixing the wildcard host.
fn listen_addr(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_owned()
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["opencode-bridge-rs"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["opencode-bridge-rs", "serve"]);
        assert!(matches!(cli.command, Some(CliCommand::Serve)));
    }

    #[test]
    fn listen_addr_fills_wildcard_host() {
        assert_eq!(listen_addr(":8090"), "0.0.0.0:8090");
        assert_eq!(listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
        assert_eq!(listen_addr(" :8090 "), "0.0.0.0:8090");
    }
}
