//! Control-plane listener: backend nodes authenticate with the shared key
//! and stay connected to route chat through the relay.

use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::ControlFrame;
use crate::proxy::ProxyCore;
use crate::security::{AuthVerdict, Refusal, is_ip_allowed};
use crate::stream;
use crate::transport::TransportError;

/// How long a fresh connection has to present its key.
pub const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An authenticated control-plane peer. Only built after the key checked
/// out, so every node has an id.
pub struct ControlNode {
    id: Uuid,
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
}

impl ControlNode {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        stream::write_frame(&mut *writer, frame).await
    }
}

pub async fn serve(core: Arc<ProxyCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(core, stream, peer).await {
                        warn!(peer = %peer, error = %e, "Control connection failed");
                    }
                });
            }
            Err(e) => error!(error = %e, "Failed to accept control connection"),
        }
    }
}

/// Periodically forgets peers that are neither cooling down nor recently
/// failed.
pub async fn sweep_rate_limits(core: Arc<ProxyCore>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        core.rate_limit().sweep();
    }
}

#[tracing::instrument(skip(core, stream), fields(peer = %peer))]
async fn handle_connection(core: Arc<ProxyCore>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let settings = &core.config().control_plane;
    if !is_ip_allowed(peer.ip(), settings.allowed_ips.as_deref()) {
        warn!("Control connection from peer outside the allowlist");
        return Ok(());
    }

    let (mut reader, mut writer) = stream.into_split();
    let guard = core.rate_limit();

    // The attempt is paid for before the key is read, so connections
    // opened side by side cannot outspend the budget.
    let attempt = match guard.begin_attempt(peer.ip()) {
        Ok(attempt) => attempt,
        Err(refusal) => {
            info!(?refusal, "Refusing control connection");
            reject(&mut writer, refusal_message(refusal)).await;
            return Ok(());
        }
    };

    let read = timeout(
        AUTH_READ_TIMEOUT,
        stream::read_frame::<_, ControlFrame>(&mut reader),
    )
    .await;
    let authenticated = matches!(
        &read,
        Ok(Ok(ControlFrame::Auth { key })) if *key == settings.key
    );
    if authenticated {
        attempt.succeed();
        return serve_node(core.clone(), reader, writer, peer).await;
    }

    match &read {
        Ok(Ok(frame)) => debug!(?frame, "Rejected control frame"),
        Ok(Err(e)) => debug!(error = %e, "Unreadable control frame"),
        Err(_) => debug!("No control frame before the deadline"),
    }
    let message = match attempt.fail() {
        AuthVerdict::Cooldown { remaining } => cooldown_message(remaining),
        AuthVerdict::Retry { remaining } => format!(
            "Invalid authorization key, {remaining} attempts remain before a {} second cooldown!",
            guard.window().as_secs()
        ),
    };
    warn!("Control plane authentication failed");
    reject(&mut writer, message).await;
    Ok(())
}

async fn serve_node(
    core: Arc<ProxyCore>,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
) -> Result<()> {
    let node = Arc::new(ControlNode {
        id: Uuid::new_v4(),
        peer,
        writer: Mutex::new(writer),
    });
    core.register_node(node.clone());
    info!(node_id = %node.id(), nodes = core.node_count(), "Control node registered");

    let result = async {
        node.send(&ControlFrame::Registered { id: node.id() })
            .await
            .context("Failed to acknowledge registration")?;
        node_loop(&core, &mut reader).await
    }
    .await;

    core.remove_node(node.id());
    info!(node_id = %node.id(), "Control node disconnected");
    result
}

async fn node_loop(core: &ProxyCore, reader: &mut OwnedReadHalf) -> Result<()> {
    loop {
        match stream::read_frame::<_, ControlFrame>(reader).await {
            Ok(ControlFrame::TextRoute(route)) => {
                let delivered = core.broadcaster().route(&route).await;
                debug!(delivered, "Routed text from control node");
            }
            Ok(frame) => debug!(?frame, "Ignoring control frame"),
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e).context("Control node connection broke"),
        }
    }
}

fn refusal_message(refusal: Refusal) -> String {
    match refusal {
        Refusal::Cooldown { remaining } => cooldown_message(remaining),
        Refusal::Busy => "Too many authentication attempts in progress, try again later!".to_string(),
    }
}

fn cooldown_message(remaining: Duration) -> String {
    format!(
        "You are on cooldown for {} seconds!",
        remaining.as_secs().max(1)
    )
}

async fn reject(writer: &mut OwnedWriteHalf, message: String) {
    if let Err(e) = stream::write_frame(writer, &ControlFrame::Disconnect { message }).await {
        debug!(error = %e, "Could not deliver disconnect");
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Could not shut down control connection");
    }
}
