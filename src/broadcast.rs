use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::frame::{Frame, TextRoute};
use crate::session::{Session, SessionTable};

/// Delivers raw chat to connected players. Delivery is best-effort: a
/// failed write is logged and the session's own pump deals with the
/// broken connection.
pub struct Broadcaster {
    sessions: Arc<SessionTable>,
}

impl Broadcaster {
    #[must_use]
    pub const fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }

    /// Sends `message` to every session. Returns how many were reached.
    pub async fn send_all(&self, message: &str) -> usize {
        deliver(self.sessions.snapshot(), message).await
    }

    /// Sends `message` to sessions whose active backend is one of
    /// `servers` (canonical `host:port` form). Pending backends of a
    /// transfer in flight do not count.
    pub async fn send_filtered(&self, message: &str, servers: &[String]) -> usize {
        let mut targets = Vec::new();
        for session in self.sessions.snapshot() {
            let addr = session.active_address().await.canonical();
            if servers.iter().any(|server| *server == addr) {
                targets.push(session);
            }
        }
        deliver(targets, message).await
    }

    /// An empty server list means everyone.
    pub async fn route(&self, route: &TextRoute) -> usize {
        if route.servers.is_empty() {
            self.send_all(&route.message).await
        } else {
            self.send_filtered(&route.message, &route.servers).await
        }
    }
}

async fn deliver(targets: Vec<Arc<Session>>, message: &str) -> usize {
    let frame = Frame::text(message);
    let results = join_all(targets.iter().map(|session| async {
        let result = session.client().write_frame(&frame).await;
        if let Err(e) = &result {
            warn!(session = session.key(), error = %e, "Failed to deliver broadcast");
        }
        result.is_ok()
    }))
    .await;

    let delivered = results.into_iter().filter(|ok| *ok).count();
    debug!(delivered, "Broadcast delivered");
    delivered
}
