// Nearby Linux daemon: joins the local group, logs group events, broadcasts stdin lines.

use anyhow::Context;
use nearby_core::{Message, BROADCAST};
use nearby_linux::{config, GroupEvent, GroupHandle, GroupRuntime, LanDiscovery};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nearby-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    rt.block_on(async {
        let (disc_tx, disc_rx) = mpsc::unbounded_channel();
        let discovery = LanDiscovery::spawn(cfg.discovery_port, disc_tx)
            .await
            .with_context(|| format!("binding discovery port {}", cfg.discovery_port))?;
        info!(identifier = %cfg.identifier, relay_port = cfg.relay_port, "nearby-linux {} starting", VERSION);
        let (group, events) = GroupRuntime::start(cfg, discovery, disc_rx);

        tokio::spawn(log_events(events));
        tokio::spawn(broadcast_stdin(group.clone()));

        shutdown_signal().await?;
        info!("shutting down");
        group.stop().await;
        Ok(())
    })
}

async fn log_events(mut events: mpsc::UnboundedReceiver<GroupEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            GroupEvent::InstanceFound(id) => info!(peer = %id, "instance found"),
            GroupEvent::InstanceLost(id) => info!(peer = %id, "instance lost"),
            GroupEvent::MessageReceived(message) => {
                let text = message.arg("text").unwrap_or_default();
                info!(from = %message.sender_id, to = %message.receiver_id, text, "message");
            }
            GroupEvent::Request { message, reply } => {
                info!(from = %message.sender_id, args = ?message.args, "request");
                reply.respond(Message::data("").with_arg("status", "ok"));
            }
            GroupEvent::Error => warn!("group link error; rediscovering"),
        }
    }
}

/// Each non-empty stdin line is broadcast as a data message with `text` set.
async fn broadcast_stdin(group: GroupHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if let Err(e) = group.send(Message::data(BROADCAST).with_arg("text", text)).await {
            warn!(error = %e, "not sent");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
