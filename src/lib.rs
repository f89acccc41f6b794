//! Game Relay
//!
//! A protocol-aware relay between game clients and a pool of backend servers.
//! Frames are forwarded untouched except for a few that drive live transfers
//! between backends and chat routing across them. A separate control-plane
//! listener lets backend nodes register with a shared key.

pub mod address;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod frame;
pub mod proxy;
pub mod relay;
pub mod security;
pub mod session;
pub mod status;
pub mod stream;
pub mod transfer;
pub mod translate;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types and functions
pub use address::Address;
pub use broadcast::Broadcaster;
pub use config::{CONFIG_FILE, Config, DuplicateLogin, generate_key, load_config};
pub use control::ControlNode;
pub use frame::{ControlFrame, Frame, GameData, Identity};
pub use proxy::ProxyCore;
pub use security::{AuthAttempt, AuthVerdict, RateLimitGuard, Refusal, is_ip_allowed, parse_allowlist};
pub use session::{Session, SessionTable};
pub use status::StatusSnapshot;
pub use translate::{RuntimeIdTranslator, Translator};
pub use transport::{Connection, Dialer, FramedConnection, TcpDialer, TransportError};
