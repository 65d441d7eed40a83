// Huddle LAN daemon: host a table or join one on the local network.

mod config;
mod discovery;
mod transport;
mod wire;

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use huddle_core::{
    payload, AcceptDelegate, BrowserDelegate, CommsService, ConnectionState, DataDelegate,
    Delegates, PeerInfo, Payload, Role, StateDelegate, WeakCommsService,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: huddle-lan (--host | --client) [--name <player>] [--email <id>]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Host,
    Client,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    mode: Mode,
    player_name: Option<String>,
    player_email: Option<String>,
}

/// `Ok(None)` means `--version` was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Args>, String> {
    let mut mode = None;
    let mut player_name = None;
    let mut player_email = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(None),
            "--host" => mode = Some(Mode::Host),
            "--client" => mode = Some(Mode::Client),
            "--name" => player_name = Some(args.next().ok_or("--name needs a value")?),
            "--email" => player_email = Some(args.next().ok_or("--email needs a value")?),
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    let mode = mode.ok_or("one of --host or --client is required")?;
    Ok(Some(Args {
        mode,
        player_name,
        player_email,
    }))
}

/// Logs every engine event. A client joins the first host it finds and keeps the link.
struct Daemon {
    args: Args,
    device_name: String,
    service: OnceLock<WeakCommsService>,
    joined: Mutex<Option<String>>,
}

impl Daemon {
    fn service(&self) -> Option<CommsService> {
        self.service.get().and_then(WeakCommsService::upgrade)
    }

    fn joined(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrowserDelegate for Daemon {
    fn peer_found(&self, peer: &PeerInfo) {
        info!(peer = %peer.device_name, "found");
        let Some(svc) = self.service() else {
            return;
        };
        let mut joined = self.joined();
        if joined.is_none() {
            *joined = Some(peer.device_name.clone());
            svc.connect(
                peer.device_name.as_str(),
                self.args.player_email.as_deref(),
                self.args.player_name.as_deref(),
                true,
            );
        }
    }

    fn peer_lost(&self, peer: &PeerInfo) {
        info!(peer = %peer.device_name, "lost");
    }

    fn error(&self, message: &str) {
        warn!(message, "engine error");
    }
}

impl StateDelegate for Daemon {
    fn state_changed(&self, peer: &PeerInfo) {
        info!(
            peer = %peer.device_name,
            player = ?peer.player_name,
            state = ?peer.state,
            reason = ?peer.reason,
            "state changed"
        );
        match peer.state {
            ConnectionState::Connected if self.args.mode == Mode::Host => {
                if let Some(svc) = self.service() {
                    svc.send(
                        "welcome",
                        Some(payload([("host", self.device_name.as_str())])),
                        Some(peer.device_name.as_str()),
                        None,
                    );
                }
            }
            ConnectionState::NotConnected => {
                let mut joined = self.joined();
                if joined.as_deref() == Some(peer.device_name.as_str()) {
                    *joined = None;
                }
            }
            _ => {}
        }
    }
}

impl DataDelegate for Daemon {
    fn data_received(&self, descriptor: &str, payload: Option<&Payload>, from: &PeerInfo) {
        info!(peer = %from.device_name, descriptor, ?payload, "message");
    }
}

impl AcceptDelegate for Daemon {
    fn should_accept(&self, peer: &PeerInfo) -> bool {
        info!(peer = %peer.device_name, player = ?peer.player_name, "accepting");
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            println!("huddle-lan {}", VERSION);
            return Ok(());
        }
        Err(msg) => anyhow::bail!("{msg}\n{USAGE}"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("huddle=info".parse()?))
        .init();

    let cfg = config::load();
    info!(device = %cfg.device_name, service = %cfg.service, mode = ?args.mode, "starting");

    let daemon = Arc::new(Daemon {
        args,
        device_name: cfg.device_name.clone(),
        service: OnceLock::new(),
        joined: Mutex::new(None),
    });
    let role = match daemon.args.mode {
        Mode::Host => Role::host_with(daemon.clone()),
        Mode::Client => Role::Client,
    };
    let delegates = Delegates {
        browser: Some(daemon.clone()),
        state: Some(daemon.clone()),
        data: Some(daemon.clone()),
    };
    let svc = CommsService::spawn(
        role,
        cfg.service.clone(),
        Box::new(transport::LanTransport::new(&cfg)),
        delegates,
    );
    let _ = daemon.service.set(svc.downgrade());
    svc.start().await?;

    shutdown_signal().await?;
    info!("shutting down");
    svc.stop().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
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
