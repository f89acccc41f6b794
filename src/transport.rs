//! Connection seam between the relay and the game transport.
//!
//! The relay only needs to read, write and close frames, plus the two
//! handshake steps that bring a player into a world. [`FramedConnection`]
//! implements that over any byte stream using [`crate::stream`]; a real
//! game transport can be plugged in by implementing [`Connection`] and
//! [`Dialer`].

use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, trace};

use crate::address::Address;
use crate::frame::{Frame, GameData, Identity, PlayStatus};
use crate::status::StatusSnapshot;
use crate::stream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: expected {expected}, got {got}")]
    Handshake {
        expected: &'static str,
        got: &'static str,
    },
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn read_frame(&self) -> Result<Frame, TransportError>;

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Closes the connection. Any read blocked on it returns
    /// [`TransportError::Closed`].
    async fn close(&self);

    fn identity(&self) -> &Identity;

    /// World parameters received during the dial handshake. Only backend
    /// connections have them.
    fn game_data(&self) -> Option<&GameData>;

    fn peer(&self) -> String;

    /// Best-effort: tells the peer why, then closes.
    async fn disconnect(&self, message: &str) {
        let frame = Frame::Disconnect {
            message: message.to_string(),
        };
        if let Err(e) = self.write_frame(&frame).await {
            debug!(peer = %self.peer(), error = %e, "Could not deliver disconnect");
        }
        self.close().await;
    }

    /// Client side of spawning: hand over the world, wait for the client
    /// to ask to spawn, then confirm.
    async fn start_game(&self, game: &GameData) -> Result<(), TransportError> {
        self.write_frame(&Frame::StartGame { game: game.clone() })
            .await?;
        loop {
            match self.read_frame().await? {
                Frame::RequestSpawn => break,
                other => trace!(frame = other.name(), "Ignoring frame before spawn request"),
            }
        }
        self.write_frame(&Frame::PlayStatus {
            status: PlayStatus::Spawned,
        })
        .await
    }

    /// Backend side of spawning: ask to spawn and wait until the backend
    /// confirms.
    async fn do_spawn(&self) -> Result<(), TransportError> {
        self.write_frame(&Frame::RequestSpawn).await?;
        loop {
            match self.read_frame().await? {
                Frame::PlayStatus {
                    status: PlayStatus::Spawned,
                } => return Ok(()),
                Frame::Disconnect { .. } => return Err(TransportError::Closed),
                other => trace!(frame = other.name(), "Ignoring frame before spawn"),
            }
        }
    }

    async fn do_spawn_with_timeout(&self, limit: Duration) -> Result<(), TransportError> {
        timeout(limit, self.do_spawn())
            .await
            .map_err(|_| TransportError::Timeout(limit))?
    }
}

/// Opens backend connections on behalf of a player.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        address: &Address,
        identity: Identity,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct FramedConnection {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
    identity: Identity,
    game: Option<GameData>,
    peer: String,
}

impl FramedConnection {
    pub fn new<R, W>(
        reader: R,
        writer: W,
        identity: Identity,
        game: Option<GameData>,
        peer: impl Into<String>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed: watch::Sender::new(false),
            identity,
            game,
            peer: peer.into(),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Connection for FramedConnection {
    async fn read_frame(&self) -> Result<Frame, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = stream::read_frame(&mut *reader) => frame,
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        stream::write_frame(&mut *writer, frame).await
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // A writer stuck on a full socket keeps the lock; the half is shut
        // down when the connection is dropped instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.peer, error = %e, "Could not shut down connection");
            }
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn game_data(&self) -> Option<&GameData> {
        self.game.as_ref()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Dials backends over TCP and runs the login handshake: send `Login`,
/// expect `StartGame`.
pub struct TcpDialer {
    handshake_timeout: Duration,
}

impl TcpDialer {
    #[must_use]
    pub const fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn login(
        address: &Address,
        identity: Identity,
    ) -> Result<FramedConnection, TransportError> {
        let tcp = TcpStream::connect((address.host(), address.port())).await?;
        tcp.set_nodelay(true)?;
        let (mut reader, mut writer) = tcp.into_split();

        stream::write_frame(
            &mut writer,
            &Frame::Login {
                identity: identity.clone(),
            },
        )
        .await?;
        let game = match stream::read_frame::<_, Frame>(&mut reader).await? {
            Frame::StartGame { game } => game,
            other => {
                return Err(TransportError::Handshake {
                    expected: "start_game",
                    got: other.name(),
                });
            }
        };

        Ok(FramedConnection::new(
            reader,
            writer,
            identity,
            Some(game),
            address.canonical(),
        ))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        address: &Address,
        identity: Identity,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let conn = timeout(self.handshake_timeout, Self::login(address, identity))
            .await
            .map_err(|_| TransportError::Timeout(self.handshake_timeout))??;
        debug!(target_addr = %address, "Backend handshake complete");
        Ok(Arc::new(conn))
    }
}

/// Outcome of reading the first frame from a freshly accepted client.
pub enum Accepted {
    Player(FramedConnection),
    /// The peer only wanted the status and has been answered.
    StatusQuery,
}

/// Reads the opening frame of a client connection. Status queries are
/// answered on the spot; logins become a [`FramedConnection`].
pub async fn accept_client(
    tcp: TcpStream,
    peer: SocketAddr,
    status: StatusSnapshot,
) -> Result<Accepted, TransportError> {
    tcp.set_nodelay(true)?;
    let (mut reader, mut writer) = tcp.into_split();

    match stream::read_frame::<_, Frame>(&mut reader).await? {
        Frame::Login { identity } => Ok(Accepted::Player(FramedConnection::new(
            reader,
            writer,
            identity,
            None,
            peer.to_string(),
        ))),
        Frame::StatusRequest => {
            stream::write_frame(&mut writer, &Frame::Status(status)).await?;
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %peer, error = %e, "Could not shut down after status reply");
            }
            Ok(Accepted::StatusQuery)
        }
        other => Err(TransportError::Handshake {
            expected: "login",
            got: other.name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Vec3;
    use tokio::io::duplex;

    fn identity() -> Identity {
        Identity {
            display_name: "Steve".to_string(),
            identity: "steve-id".to_string(),
            xuid: None,
            credential: Some("proof".to_string()),
        }
    }

    fn pair() -> (FramedConnection, FramedConnection) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            FramedConnection::new(ar, aw, identity(), None, "a"),
            FramedConnection::new(br, bw, identity(), None, "b"),
        )
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (a, _b) = pair();
        let a = Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read_frame().await })
        };
        tokio::task::yield_now().await;
        a.close().await;

        let result = timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            a.write_frame(&Frame::text("late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn spawn_handshake_completes_between_peers() {
        let (client_side, proxy_side) = pair();
        let game = GameData {
            entity_runtime_id: 7,
            player_position: Vec3::new(1.0, 64.0, 1.0),
            dimension: 0,
            world_name: "hub".to_string(),
        };

        let (started, spawned) = tokio::join!(proxy_side.start_game(&game), async {
            // Stand-in for a game client.
            let Frame::StartGame { game: received } = client_side.read_frame().await? else {
                panic!("expected start_game");
            };
            assert_eq!(received.entity_runtime_id, 7);
            client_side.do_spawn().await
        });
        tokio_test::assert_ok!(started);
        tokio_test::assert_ok!(spawned);
    }

    #[tokio::test]
    async fn spawn_times_out_when_backend_is_silent() {
        let (a, _b) = pair();
        let result = a.do_spawn_with_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[test]
    fn clearing_the_credential_keeps_the_identity() {
        let cleared = identity().without_credential();
        assert_eq!(cleared.identity, "steve-id");
        assert!(cleared.credential.is_none());
    }
}
