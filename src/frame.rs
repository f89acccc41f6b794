//! Frame shapes understood by the relay.
//!
//! Game frames cross the client and backend connections. Control frames
//! only travel over the control-plane listener. Both are encoded by
//! [`crate::stream`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::StatusSnapshot;

pub const DIMENSION_OVERWORLD: i32 = 0;
pub const DIMENSION_NETHER: i32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Chunk column containing this position.
    #[must_use]
    pub fn chunk(self) -> (i32, i32) {
        ((self.x.floor() as i32) >> 4, (self.z.floor() as i32) >> 4)
    }
}

/// Who the player is, as presented at login.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    /// Stable identity used as the session table key.
    pub identity: String,
    #[serde(default)]
    pub xuid: Option<String>,
    /// Signed login proof. Cleared when dialing a transfer target so the
    /// new backend runs its own handshake.
    #[serde(default)]
    pub credential: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn without_credential(&self) -> Self {
        Self {
            credential: None,
            ..self.clone()
        }
    }
}

/// World parameters a backend hands out when a player joins it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    pub entity_runtime_id: u64,
    pub player_position: Vec3,
    pub dimension: i32,
    #[serde(default)]
    pub world_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayStatus {
    LoginSuccess,
    Spawned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerActionKind {
    Jump,
    StartSneak,
    StopSneak,
    Respawn,
    DimensionChangeDone,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub usage: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRoute {
    pub message: String,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Login {
        identity: Identity,
    },
    StatusRequest,
    Status(StatusSnapshot),
    StartGame {
        game: GameData,
    },
    RequestSpawn,
    PlayStatus {
        status: PlayStatus,
    },
    MovePlayer {
        runtime_id: u64,
        position: Vec3,
    },
    PlayerAction {
        runtime_id: u64,
        action: PlayerActionKind,
    },
    ChangeDimension {
        dimension: i32,
        position: Vec3,
    },
    LevelChunk {
        x: i32,
        z: i32,
        sub_chunk_count: u32,
        payload: Vec<u8>,
    },
    Text {
        message: String,
    },
    CommandRequest {
        command_line: String,
    },
    AvailableCommands {
        commands: Vec<CommandEntry>,
    },
    TransferRequest(TransferRequest),
    TextRoute(TextRoute),
    Disconnect {
        message: String,
    },
    /// Anything the relay has no reason to look inside.
    Opaque {
        id: u32,
        payload: Vec<u8>,
    },
}

impl Frame {
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self::Text {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::StatusRequest => "status_request",
            Self::Status(_) => "status",
            Self::StartGame { .. } => "start_game",
            Self::RequestSpawn => "request_spawn",
            Self::PlayStatus { .. } => "play_status",
            Self::MovePlayer { .. } => "move_player",
            Self::PlayerAction { .. } => "player_action",
            Self::ChangeDimension { .. } => "change_dimension",
            Self::LevelChunk { .. } => "level_chunk",
            Self::Text { .. } => "text",
            Self::CommandRequest { .. } => "command_request",
            Self::AvailableCommands { .. } => "available_commands",
            Self::TransferRequest(_) => "transfer_request",
            Self::TextRoute(_) => "text_route",
            Self::Disconnect { .. } => "disconnect",
            Self::Opaque { .. } => "opaque",
        }
    }
}

/// Frames spoken on the control-plane listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Auth { key: String },
    Registered { id: Uuid },
    Disconnect { message: String },
    TransferRequest(TransferRequest),
    TextRoute(TextRoute),
}
