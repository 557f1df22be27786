//! Unified error type for the Tavern facade.

use tavern_protocol::ProtocolError;
use tavern_room::RoomError;

use crate::config::ConfigError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TavernError {
    /// A persisted blob could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A room-level error (full, closed, rejected by a plugin).
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The configuration file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The tracing subscriber could not be installed.
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}
