use anyhow::{Context, Result};
use dashmap::DashMap;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::broadcast::Broadcaster;
use crate::config::{Config, DuplicateLogin};
use crate::control::{self, ControlNode};
use crate::frame::Identity;
use crate::relay;
use crate::security::RateLimitGuard;
use crate::session::{Backend, Session, SessionTable};
use crate::status::{StatusProvider, StatusSnapshot};
use crate::translate::{RuntimeIdTranslator, Translator};
use crate::transport::{Accepted, Connection, Dialer, TransportError, accept_client};

pub const DISCONNECT_MESSAGE: &str = "You have been disconnected!";

/// Owns every live session and control node, and admits new players.
pub struct ProxyCore {
    config: Config,
    dialer: Arc<dyn Dialer>,
    translator: Arc<dyn Translator>,
    sessions: Arc<SessionTable>,
    nodes: DashMap<Uuid, Arc<ControlNode>>,
    broadcaster: Broadcaster,
    status: StatusProvider,
    rate_limit: RateLimitGuard,
}

impl ProxyCore {
    pub fn new(config: Config, dialer: Arc<dyn Dialer>) -> Arc<Self> {
        Self::with_translator(config, dialer, Arc::new(RuntimeIdTranslator))
    }

    pub fn with_translator(
        config: Config,
        dialer: Arc<dyn Dialer>,
        translator: Arc<dyn Translator>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionTable::new());
        let rate_limit = RateLimitGuard::new(
            config.control_plane.max_attempts,
            std::time::Duration::from_secs(config.control_plane.cooldown_secs),
        );
        Arc::new(Self {
            status: StatusProvider::new(&config.status),
            broadcaster: Broadcaster::new(sessions.clone()),
            sessions,
            nodes: DashMap::new(),
            rate_limit,
            dialer,
            translator,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn translator(&self) -> &dyn Translator {
        self.translator.as_ref()
    }

    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    #[must_use]
    pub fn rate_limit(&self) -> &RateLimitGuard {
        &self.rate_limit
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    #[must_use]
    pub fn session(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn register_node(&self, node: Arc<ControlNode>) {
        self.nodes.insert(node.id(), node);
    }

    pub fn remove_node(&self, id: Uuid) {
        self.nodes.remove(&id);
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Binds the configured listeners and serves until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;
        info!(listen_addr = %addr, hub = %self.config.hub_address(), "Relay listening");

        if self.config.control_plane.enabled {
            let control_addr = self.config.control_address();
            let control_listener = TcpListener::bind(&control_addr)
                .await
                .with_context(|| format!("Failed to bind control plane to {control_addr}"))?;
            info!(listen_addr = %control_addr, "Control plane listening");
            tokio::spawn(control::serve(self.clone(), control_listener));
            tokio::spawn(control::sweep_rate_limits(self.clone()));
        }

        self.serve(listener).await;
        Ok(())
    }

    /// Client accept loop. A failing connection never stops the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let core = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = core.handle_connection(stream, addr).await {
                            error!(client_addr = %addr, error = %e, "Connection failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Failed to accept client"),
            }
        }
    }

    #[tracing::instrument(skip(self, stream), fields(client_addr = %addr))]
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let accepted = timeout(
            self.config.handshake_timeout(),
            accept_client(stream, addr, self.status.snapshot()),
        )
        .await
        .context("Client did not log in in time")?
        .context("Client handshake failed")?;

        let client: Arc<dyn Connection> = match accepted {
            Accepted::StatusQuery => {
                debug!("Answered status query");
                return Ok(());
            }
            Accepted::Player(conn) => Arc::new(conn),
        };
        let identity = client.identity().clone();

        if self.config.proxy.xbox_authentication && identity.credential.is_none() {
            warn!(player = %identity.display_name, "Refusing unauthenticated login");
            client
                .disconnect("You need to be authenticated to join this server.")
                .await;
            return Ok(());
        }

        let hub = self.config.hub_address();
        let backend = match self.dial(&hub, identity).await {
            Ok(backend) => backend,
            Err(e) => {
                client.disconnect(DISCONNECT_MESSAGE).await;
                return Err(e).with_context(|| format!("Failed to reach hub {hub}"));
            }
        };

        self.make_session(client, backend).await
    }

    /// Dials `addr` as `identity` and completes the login handshake.
    pub async fn dial(&self, addr: &Address, identity: Identity) -> Result<Backend, TransportError> {
        let limit = self.config.handshake_timeout();
        let conn = timeout(limit, self.dialer.dial(addr, identity))
            .await
            .map_err(|_| TransportError::Timeout(limit))??;
        Backend::new(conn, addr.clone())
    }

    /// Spawns the player into the backend's world on both ends, registers
    /// the session and starts relaying.
    async fn make_session(self: &Arc<Self>, client: Arc<dyn Connection>, backend: Backend) -> Result<()> {
        let limit = self.config.handshake_timeout();
        let (started, spawned) = tokio::join!(
            timeout(limit, client.start_game(&backend.game)),
            backend.conn.do_spawn_with_timeout(limit),
        );
        let started = started.unwrap_or(Err(TransportError::Timeout(limit)));
        if let Err(e) = started.and(spawned) {
            client.disconnect(DISCONNECT_MESSAGE).await;
            backend.conn.close().await;
            return Err(e).context("Failed to spawn player");
        }

        let session = Arc::new(Session::new(client, backend));
        self.status.player_joined();
        if let Some(previous) = self.sessions.insert(session.clone()) {
            match self.config.proxy.duplicate_login {
                DuplicateLogin::Replace => {
                    warn!(session = session.key(), "Identity logged in twice, replacing table entry");
                }
                DuplicateLogin::DisconnectPrevious => {
                    warn!(session = session.key(), "Identity logged in twice, disconnecting the older session");
                    self.break_session(&previous, "You logged in from another location.")
                        .await;
                }
            }
        }

        let backend = session.active_address().await;
        info!(
            session = session.key(),
            backend = %backend,
            players = self.status.player_count(),
            "Session started"
        );
        relay::start(self.clone(), session);
        Ok(())
    }

    /// Tears a session down. Safe to call from several tasks at once; only
    /// the first call has any effect.
    pub async fn break_session(&self, session: &Arc<Session>, reason: &str) {
        if !session.mark_closed() {
            return;
        }
        self.sessions.remove(session);
        self.status.player_left();
        session.client().disconnect(reason).await;
        session.close_backends().await;
        info!(
            session = session.key(),
            reason,
            players = self.status.player_count(),
            "Session closed"
        );
    }
}
