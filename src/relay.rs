//! The two pumps that move frames between a player and its backend.

use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::address::Address;
use crate::frame::{CommandEntry, Frame, PlayerActionKind};
use crate::proxy::{DISCONNECT_MESSAGE, ProxyCore};
use crate::session::Session;
use crate::transfer;
use crate::translate::Direction;
use crate::transport::TransportError;

pub const MIGRATE_COMMAND: &str = "migrate";
pub const MIGRATE_USAGE: &str = "/migrate <host> [port]";
const DEFAULT_PORT: u16 = 19132;

/// Starts both pumps. Whichever stops first tears the session down, which
/// closes the connections and ends the other one.
pub fn start(core: Arc<ProxyCore>, session: Arc<Session>) {
    tokio::spawn(run_pump(core.clone(), session.clone(), Direction::Serverbound));
    tokio::spawn(run_pump(core, session, Direction::Clientbound));
}

async fn run_pump(core: Arc<ProxyCore>, session: Arc<Session>, direction: Direction) {
    let result = match direction {
        Direction::Serverbound => pump_client(&core, &session).await,
        Direction::Clientbound => pump_backend(&core, &session).await,
    };
    match result {
        Err(TransportError::Closed) | Ok(()) => {
            debug!(session = session.key(), ?direction, "Relay leg closed");
        }
        Err(e) => info!(session = session.key(), ?direction, error = %e, "Relay leg failed"),
    }
    core.break_session(&session, DISCONNECT_MESSAGE).await;
}

async fn pump_client(core: &Arc<ProxyCore>, session: &Arc<Session>) -> Result<(), TransportError> {
    loop {
        let frame = session.client().read_frame().await?;

        if is_dimension_ack(&frame)
            && session.is_transferring().await
            && transfer::commit(session).await?
        {
            continue;
        }

        if let Frame::CommandRequest { command_line } = &frame {
            if let Some(parsed) = parse_migrate_command(command_line) {
                match parsed {
                    Ok(target) => spawn_transfer(core, session, target),
                    Err(message) => session.client().write_frame(&Frame::text(message)).await?,
                }
                continue;
            }
        }

        forward_to_backend(core, session, frame).await?;
    }
}

async fn pump_backend(core: &Arc<ProxyCore>, session: &Arc<Session>) -> Result<(), TransportError> {
    loop {
        let (conn, generation) = {
            let remote = session.remote().await;
            (remote.active.conn.clone(), remote.generation)
        };

        let frame = match conn.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                if session.remote().await.generation != generation {
                    trace!(session = session.key(), "Backend swapped, reading from the new one");
                    continue;
                }
                return Err(e);
            }
        };

        match frame {
            Frame::AvailableCommands { mut commands } => {
                advertise_migrate(&mut commands);
                forward_to_client(core, session, Frame::AvailableCommands { commands }).await?;
            }
            Frame::TransferRequest(request) => {
                spawn_transfer(core, session, Address::new(request.address, request.port));
            }
            Frame::TextRoute(route) => {
                core.broadcaster().route(&route).await;
            }
            frame => forward_to_client(core, session, frame).await?,
        }
    }
}

/// Writes to whichever backend is active right now. A write that fails
/// because a transfer just closed the old backend is dropped, not fatal.
async fn forward_to_backend(
    core: &ProxyCore,
    session: &Session,
    frame: Frame,
) -> Result<(), TransportError> {
    let (conn, generation, frame) = {
        let mut remote = session.remote().await;
        if let Frame::MovePlayer { position, .. } = &frame {
            remote.position = *position;
        }
        let frame = core
            .translator()
            .translate(frame, Direction::Serverbound, &remote.context);
        (remote.active.conn.clone(), remote.generation, frame)
    };

    if let Err(e) = conn.write_frame(&frame).await {
        if session.remote().await.generation == generation {
            return Err(e);
        }
        trace!(session = session.key(), frame = frame.name(), "Dropped frame for replaced backend");
    }
    Ok(())
}

async fn forward_to_client(
    core: &ProxyCore,
    session: &Session,
    frame: Frame,
) -> Result<(), TransportError> {
    let frame = {
        let mut remote = session.remote().await;
        if let Frame::ChangeDimension {
            dimension,
            position,
        } = &frame
        {
            remote.dimension = *dimension;
            remote.position = *position;
        }
        core.translator()
            .translate(frame, Direction::Clientbound, &remote.context)
    };
    session.client().write_frame(&frame).await
}

fn spawn_transfer(core: &Arc<ProxyCore>, session: &Arc<Session>, target: Address) {
    let core = core.clone();
    let session = session.clone();
    tokio::spawn(async move { transfer::begin(&core, &session, target).await });
}

const fn is_dimension_ack(frame: &Frame) -> bool {
    matches!(
        frame,
        Frame::PlayerAction {
            action: PlayerActionKind::DimensionChangeDone,
            ..
        }
    )
}

/// `None` if the line is not a migrate command at all, otherwise the
/// target or a message explaining what was wrong with it.
fn parse_migrate_command(command_line: &str) -> Option<Result<Address, String>> {
    let mut tokens = command_line.trim().trim_start_matches('/').split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case(MIGRATE_COMMAND) {
        return None;
    }

    let target = match (tokens.next(), tokens.next()) {
        (Some(host), Some(port)) => port
            .parse::<u16>()
            .map(|port| Address::new(host, port))
            .map_err(|_| format!("Invalid port `{port}`. Usage: {MIGRATE_USAGE}")),
        (Some(target), None) if target.contains(':') => target
            .parse::<Address>()
            .map_err(|e| format!("{e}. Usage: {MIGRATE_USAGE}")),
        (Some(host), None) => Ok(Address::new(host, DEFAULT_PORT)),
        (None, _) => Err(format!("Usage: {MIGRATE_USAGE}")),
    };
    Some(target)
}

fn advertise_migrate(commands: &mut Vec<CommandEntry>) {
    if commands.iter().any(|command| command.name == MIGRATE_COMMAND) {
        return;
    }
    commands.push(CommandEntry {
        name: MIGRATE_COMMAND.to_string(),
        description: "Move to another server".to_string(),
        usage: MIGRATE_USAGE.to_string(),
    });
}
