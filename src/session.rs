//! A player's relayed connection ("ray") and the table of live sessions.

use dashmap::DashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{Mutex, MutexGuard};

use crate::address::Address;
use crate::frame::{GameData, Vec3};
use crate::transport::{Connection, TransportError};
use crate::translate::SessionContext;

/// A backend connection together with where it points and the world it
/// put the player in.
#[derive(Clone)]
pub struct Backend {
    pub conn: Arc<dyn Connection>,
    pub addr: Address,
    pub game: GameData,
}

impl Backend {
    /// Fails if the connection never completed a dial handshake.
    pub fn new(conn: Arc<dyn Connection>, addr: Address) -> Result<Self, TransportError> {
        let game = conn
            .game_data()
            .cloned()
            .ok_or(TransportError::Handshake {
                expected: "start_game",
                got: "nothing",
            })?;
        Ok(Self { conn, addr, game })
    }
}

/// Everything a transfer may change. Only ever touched through
/// [`Session::remote`].
pub struct RemoteState {
    pub active: Backend,
    pub pending: Option<Backend>,
    pub transferring: bool,
    /// Bumped on every swap so a pump can tell that the backend it was
    /// reading from has been replaced.
    pub generation: u64,
    pub context: SessionContext,
    pub position: Vec3,
    pub dimension: i32,
}

pub struct Session {
    key: String,
    client: Arc<dyn Connection>,
    remote: Mutex<RemoteState>,
    closed: AtomicBool,
}

impl Session {
    /// `initial` is the backend whose world the client was started in.
    #[must_use]
    pub fn new(client: Arc<dyn Connection>, initial: Backend) -> Self {
        let runtime_id = initial.game.entity_runtime_id;
        let remote = RemoteState {
            position: initial.game.player_position,
            dimension: initial.game.dimension,
            context: SessionContext {
                client_runtime_id: runtime_id,
                backend_runtime_id: runtime_id,
            },
            active: initial,
            pending: None,
            transferring: false,
            generation: 0,
        };
        Self {
            key: client.identity().identity.clone(),
            client,
            remote: Mutex::new(remote),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn Connection> {
        &self.client
    }

    /// The remote-mutation lock. Hold it only for reads and swaps, never
    /// across network I/O.
    pub async fn remote(&self) -> MutexGuard<'_, RemoteState> {
        self.remote.lock().await
    }

    pub async fn active_address(&self) -> Address {
        self.remote.lock().await.active.addr.clone()
    }

    pub async fn is_transferring(&self) -> bool {
        self.remote.lock().await.transferring
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true for exactly one caller: the one that gets to tear the
    /// session down.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub async fn close_backends(&self) {
        let (active, pending) = {
            let mut remote = self.remote.lock().await;
            (remote.active.conn.clone(), remote.pending.take())
        };
        active.close().await;
        if let Some(pending) = pending {
            pending.conn.close().await;
        }
    }
}

/// Live sessions keyed by identity. Guards returned by the map never leave
/// this type, so no shard lock is held across an `.await`.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session`, returning whichever session previously held its
    /// identity.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions.insert(session.key().to_string(), session)
    }

    /// Removes `session` only if it is still the entry for its identity.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.key(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
