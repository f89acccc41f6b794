use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Serverbound,
    /// Backend to client.
    Clientbound,
}

/// Per-session facts a translator needs. Lives under the session's remote
/// lock and is refreshed whenever the active backend changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Runtime id the client was given by the first backend it joined.
    pub client_runtime_id: u64,
    /// Runtime id the current backend assigned to the player.
    pub backend_runtime_id: u64,
}

pub trait Translator: Send + Sync {
    fn translate(&self, frame: Frame, direction: Direction, ctx: &SessionContext) -> Frame;
}

/// Keeps the client's own entity id stable across transfers: the client
/// keeps the id from its first backend, every later backend sees its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeIdTranslator;

impl RuntimeIdTranslator {
    const fn map(id: u64, direction: Direction, ctx: &SessionContext) -> u64 {
        match direction {
            Direction::Serverbound if id == ctx.client_runtime_id => ctx.backend_runtime_id,
            Direction::Clientbound if id == ctx.backend_runtime_id => ctx.client_runtime_id,
            _ => id,
        }
    }
}

impl Translator for RuntimeIdTranslator {
    fn translate(&self, frame: Frame, direction: Direction, ctx: &SessionContext) -> Frame {
        if ctx.client_runtime_id == ctx.backend_runtime_id {
            return frame;
        }
        match frame {
            Frame::MovePlayer {
                runtime_id,
                position,
            } => Frame::MovePlayer {
                runtime_id: Self::map(runtime_id, direction, ctx),
                position,
            },
            Frame::PlayerAction { runtime_id, action } => Frame::PlayerAction {
                runtime_id: Self::map(runtime_id, direction, ctx),
                action,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PlayerActionKind, Vec3};

    const CTX: SessionContext = SessionContext {
        client_runtime_id: 1,
        backend_runtime_id: 42,
    };

    #[test]
    fn serverbound_ids_point_at_the_current_backend() {
        let frame = Frame::MovePlayer {
            runtime_id: 1,
            position: Vec3::default(),
        };
        let translated = RuntimeIdTranslator.translate(frame, Direction::Serverbound, &CTX);
        assert!(matches!(translated, Frame::MovePlayer { runtime_id: 42, .. }));
    }

    #[test]
    fn clientbound_ids_point_at_the_original_entity() {
        let frame = Frame::PlayerAction {
            runtime_id: 42,
            action: PlayerActionKind::Jump,
        };
        let translated = RuntimeIdTranslator.translate(frame, Direction::Clientbound, &CTX);
        assert!(matches!(translated, Frame::PlayerAction { runtime_id: 1, .. }));
    }

    #[test]
    fn other_entities_and_frames_pass_through() {
        let other_entity = Frame::MovePlayer {
            runtime_id: 9,
            position: Vec3::default(),
        };
        assert_eq!(
            RuntimeIdTranslator.translate(other_entity.clone(), Direction::Clientbound, &CTX),
            other_entity
        );
        assert_eq!(
            RuntimeIdTranslator.translate(Frame::text("hi"), Direction::Serverbound, &CTX),
            Frame::text("hi")
        );
    }
}
