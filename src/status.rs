use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::StatusConfig;

/// What the relay reports to clients that only query its status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub server_name: String,
    pub max_players: u32,
    pub player_count: i64,
}

pub struct StatusProvider {
    server_name: String,
    max_players: u32,
    players: AtomicI64,
}

impl StatusProvider {
    #[must_use]
    pub fn new(config: &StatusConfig) -> Self {
        Self {
            server_name: config.server_name.clone(),
            max_players: config.max_players,
            players: AtomicI64::new(0),
        }
    }

    pub fn player_joined(&self) {
        self.players.fetch_add(1, Ordering::Relaxed);
    }

    pub fn player_left(&self) {
        self.players.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn player_count(&self) -> i64 {
        self.players.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            server_name: self.server_name.clone(),
            max_players: self.max_players,
            player_count: self.player_count(),
        }
    }
}
