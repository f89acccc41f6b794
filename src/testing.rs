//! Loopback fixtures shared by the async tests: scripted backends, game
//! clients and a relay bound to a free port.

use anyhow::{Context, Result, bail};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::{Instant, sleep, timeout},
};

use crate::address::Address;
use crate::config::Config;
use crate::frame::{Frame, GameData, Identity, PlayStatus, Vec3};
use crate::proxy::ProxyCore;
use crate::session::Session;
use crate::stream::{read_frame, write_frame};
use crate::transport::TcpDialer;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn identity(name: &str) -> Identity {
    Identity {
        display_name: name.to_string(),
        identity: format!("{name}-identity"),
        xuid: None,
        credential: Some(format!("{name}-credential")),
    }
}

pub fn test_config(hub: &Address) -> Config {
    let mut config = Config::default();
    config.hub.host = hub.host().to_string();
    config.hub.port = hub.port();
    config.proxy.handshake_timeout_secs = 2;
    config.control_plane.enabled = true;
    config.control_plane.key = "secret".to_string();
    config
}

/// Starts a relay for `config` on a free port, returns it with the port.
pub async fn start_proxy(config: Config) -> Result<(Arc<ProxyCore>, u16)> {
    let dialer = Arc::new(TcpDialer::new(config.handshake_timeout()));
    let core = ProxyCore::new(config, dialer);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind relay")?;
    let port = listener.local_addr()?.port();
    tokio::spawn(core.clone().serve(listener));
    Ok((core, port))
}

/// Starts the control-plane listener for `core` on a free port.
pub async fn start_control(core: &Arc<ProxyCore>) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind control plane")?;
    let port = listener.local_addr()?.port();
    tokio::spawn(crate::control::serve(core.clone(), listener));
    Ok(port)
}

/// Finds an unused port by binding to port 0
pub async fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

pub async fn wait_for_session(core: &ProxyCore, key: &str) -> Result<Arc<Session>> {
    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        if let Some(session) = core.session(key) {
            return Ok(session);
        }
        if Instant::now() > deadline {
            bail!("session {key} never appeared");
        }
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// A backend that logs players in, spawns them, records what they send
/// and lets the test push frames to the newest connection.
pub struct FakeBackend {
    pub addr: Address,
    pub game: GameData,
    logins: Arc<Mutex<Vec<Identity>>>,
    outbound: Arc<Mutex<Vec<mpsc::UnboundedSender<Frame>>>>,
    received: mpsc::UnboundedReceiver<Frame>,
}

impl FakeBackend {
    pub async fn start(runtime_id: u64, position: Vec3) -> Result<Self> {
        Self::start_with(runtime_id, position, true).await
    }

    /// A backend that logs players in but never confirms their spawn.
    pub async fn start_unresponsive(runtime_id: u64) -> Result<Self> {
        Self::start_with(runtime_id, Vec3::default(), false).await
    }

    async fn start_with(runtime_id: u64, position: Vec3, spawns: bool) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind fake backend")?;
        let addr = Address::new("127.0.0.1", listener.local_addr()?.port());
        let game = GameData {
            entity_runtime_id: runtime_id,
            player_position: position,
            dimension: crate::frame::DIMENSION_OVERWORLD,
            world_name: format!("world-{runtime_id}"),
        };
        let logins = Arc::new(Mutex::new(Vec::new()));
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let (received_tx, received) = mpsc::unbounded_channel();

        {
            let game = game.clone();
            let logins = logins.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (tx, rx) = mpsc::unbounded_channel();
                    outbound.lock().unwrap().push(tx);
                    tokio::spawn(serve_player(
                        stream,
                        game.clone(),
                        spawns,
                        logins.clone(),
                        received_tx.clone(),
                        rx,
                    ));
                }
            });
        }

        Ok(Self {
            addr,
            game,
            logins,
            outbound,
            received,
        })
    }

    pub fn logins(&self) -> Vec<Identity> {
        self.logins.lock().unwrap().clone()
    }

    /// Sends `frame` to the most recently connected player.
    pub fn send(&self, frame: Frame) {
        let outbound = self.outbound.lock().unwrap();
        outbound
            .last()
            .expect("no player connected to fake backend")
            .send(frame)
            .expect("fake backend connection gone");
    }

    /// Hangs up on the most recently connected player.
    pub fn kick(&self) {
        let kicked = self.outbound.lock().unwrap().pop();
        assert!(kicked.is_some(), "no player connected to fake backend");
    }

    /// Next received frame matching `wanted`, skipping everything else.
    pub async fn expect(&mut self, wanted: impl Fn(&Frame) -> bool) -> Result<Frame> {
        timeout(TEST_TIMEOUT, async {
            while let Some(frame) = self.received.recv().await {
                if wanted(&frame) {
                    return Ok(frame);
                }
            }
            bail!("fake backend stopped")
        })
        .await
        .context("Timeout waiting for backend frame")?
    }
}

async fn serve_player(
    stream: TcpStream,
    game: GameData,
    spawns: bool,
    logins: Arc<Mutex<Vec<Identity>>>,
    received: mpsc::UnboundedSender<Frame>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let Ok(Frame::Login { identity }) = read_frame::<_, Frame>(&mut reader).await else {
        return;
    };
    logins.lock().unwrap().push(identity);
    if write_frame(&mut writer, &Frame::StartGame { game }).await.is_err() {
        return;
    }
    if spawns {
        loop {
            match read_frame::<_, Frame>(&mut reader).await {
                Ok(Frame::RequestSpawn) => break,
                Ok(_) => {}
                Err(_) => return,
            }
        }
        let spawned = Frame::PlayStatus {
            status: PlayStatus::Spawned,
        };
        if write_frame(&mut writer, &spawned).await.is_err() {
            return;
        }
    }

    // Either side ending drops both halves, which closes the socket.
    let push = async move {
        while let Some(frame) = outbound.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    };
    let pull = async move {
        while let Ok(frame) = read_frame::<_, Frame>(&mut reader).await {
            let _ = received.send(frame);
        }
    };
    tokio::select! {
        () = push => {}
        () = pull => {}
    }
}

/// A game client talking to the relay.
pub struct FakeClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    pub game: GameData,
}

impl FakeClient {
    /// Logs in through the relay and waits until spawned.
    pub async fn join(port: u16, identity: Identity) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Login { identity }).await?;

        let game = match timeout(TEST_TIMEOUT, read_frame::<_, Frame>(&mut reader)).await?? {
            Frame::StartGame { game } => game,
            other => bail!("expected start_game, got {other:?}"),
        };
        write_frame(&mut writer, &Frame::RequestSpawn).await?;
        match timeout(TEST_TIMEOUT, read_frame::<_, Frame>(&mut reader)).await?? {
            Frame::PlayStatus {
                status: PlayStatus::Spawned,
            } => {}
            other => bail!("expected spawn confirmation, got {other:?}"),
        }

        Ok(Self {
            reader,
            writer,
            game,
        })
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Frame> {
        Ok(timeout(TEST_TIMEOUT, read_frame::<_, Frame>(&mut self.reader)).await??)
    }

    /// Next frame matching `wanted`, skipping everything else.
    pub async fn expect(&mut self, wanted: impl Fn(&Frame) -> bool) -> Result<Frame> {
        timeout(TEST_TIMEOUT, async {
            loop {
                let frame = read_frame::<_, Frame>(&mut self.reader).await?;
                if wanted(&frame) {
                    return Ok::<_, anyhow::Error>(frame);
                }
            }
        })
        .await
        .context("Timeout waiting for client frame")?
    }

    /// Next text message, if one arrives within `QUIET_PERIOD`.
    pub async fn next_text(&mut self) -> Option<String> {
        let wait = timeout(QUIET_PERIOD, async {
            loop {
                match read_frame::<_, Frame>(&mut self.reader).await {
                    Ok(Frame::Text { message }) => return Some(message),
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
        });
        wait.await.ok().flatten()
    }
}
