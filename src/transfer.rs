//! Moving a live session from one backend to another.
//!
//! `begin` dials and spawns on the target, parks it as the pending
//! backend and sends the client through a dimension change. When the
//! client acknowledges the change the relay calls `commit`, which swaps
//! the pending backend in under the session's remote lock.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::frame::{DIMENSION_NETHER, DIMENSION_OVERWORLD, Frame, Vec3};
use crate::proxy::ProxyCore;
use crate::session::Session;
use crate::transport::{Connection, TransportError};

/// Placeholder chunks are sent in a square of this radius around the player.
pub const PLACEHOLDER_RADIUS: i32 = 2;
const EMPTY_CHUNK_LEN: usize = 257;

pub async fn begin(core: &Arc<ProxyCore>, session: &Arc<Session>, target: Address) {
    let from = {
        let mut remote = session.remote().await;
        if remote.transferring {
            warn!(session = session.key(), target = %target, "Transfer already in progress, ignoring request");
            return;
        }
        if remote.active.addr == target {
            drop(remote);
            notify(session, format!("You are already connected to {target}")).await;
            return;
        }
        remote.transferring = true;
        remote.active.addr.clone()
    };
    info!(session = session.key(), from = %from, target = %target, "Starting transfer");

    let identity = session.client().identity().without_credential();
    let backend = match core.dial(&target, identity).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(session = session.key(), target = %target, error = %e, "Transfer target unreachable");
            session.remote().await.transferring = false;
            notify(session, format!("Could not connect to {target}")).await;
            return;
        }
    };

    let limit = core.config().handshake_timeout();
    if let Err(e) = backend.conn.do_spawn_with_timeout(limit).await {
        warn!(session = session.key(), target = %target, error = %e, "Transfer target failed to spawn player");
        backend.conn.close().await;
        session.remote().await.transferring = false;
        core.break_session(session, "Transfer failed, please reconnect.")
            .await;
        return;
    }

    let (leave, centre) = {
        let mut remote = session.remote().await;
        if session.is_closed() {
            drop(remote);
            backend.conn.close().await;
            return;
        }
        let leave = Frame::ChangeDimension {
            dimension: transit_dimension(remote.dimension),
            position: remote.position,
        };
        let centre = remote.position;
        remote.pending = Some(backend);
        (leave, centre)
    };

    if let Err(e) = send_leave(session.client().as_ref(), &leave, centre).await {
        warn!(session = session.key(), error = %e, "Client lost during transfer");
        core.break_session(session, "Transfer failed, please reconnect.")
            .await;
        return;
    }
    debug!(session = session.key(), target = %target, "Waiting for dimension change acknowledgement");
}

/// Swaps the pending backend in. Called by the relay when the client
/// acknowledges a dimension change mid-transfer. Returns false, touching
/// nothing, while the target is still being dialed or spawned: that
/// acknowledgement belongs to the current backend.
pub async fn commit(session: &Session) -> Result<bool, TransportError> {
    let (old, restore) = {
        let mut remote = session.remote().await;
        let Some(next) = remote.pending.take() else {
            debug!(session = session.key(), "Dimension change acknowledged before the target was ready");
            return Ok(false);
        };
        let restore = Frame::ChangeDimension {
            dimension: next.game.dimension,
            position: next.game.player_position,
        };
        remote.dimension = next.game.dimension;
        remote.position = next.game.player_position;
        remote.context.backend_runtime_id = next.game.entity_runtime_id;
        let old = std::mem::replace(&mut remote.active, next);
        remote.transferring = false;
        remote.generation += 1;
        (old, restore)
    };

    old.conn.close().await;
    info!(session = session.key(), from = %old.addr, "Transfer committed");
    session.client().write_frame(&restore).await?;
    Ok(true)
}

const fn transit_dimension(current: i32) -> i32 {
    if current == DIMENSION_OVERWORLD {
        DIMENSION_NETHER
    } else {
        DIMENSION_OVERWORLD
    }
}

/// Empty chunks covering the square around `centre`, so the client does
/// not keep rendering the world it is leaving.
pub fn placeholder_chunks(centre: Vec3) -> impl Iterator<Item = Frame> {
    let (cx, cz) = centre.chunk();
    (-PLACEHOLDER_RADIUS..=PLACEHOLDER_RADIUS).flat_map(move |dx| {
        (-PLACEHOLDER_RADIUS..=PLACEHOLDER_RADIUS).map(move |dz| Frame::LevelChunk {
            x: cx + dx,
            z: cz + dz,
            sub_chunk_count: 0,
            payload: vec![0; EMPTY_CHUNK_LEN],
        })
    })
}

async fn send_leave(
    client: &dyn Connection,
    leave: &Frame,
    centre: Vec3,
) -> Result<(), TransportError> {
    client.write_frame(leave).await?;
    for chunk in placeholder_chunks(centre) {
        client.write_frame(&chunk).await?;
    }
    Ok(())
}

async fn notify(session: &Session, message: String) {
    if let Err(e) = session.client().write_frame(&Frame::text(message)).await {
        debug!(session = session.key(), error = %e, "Could not notify client");
    }
}
