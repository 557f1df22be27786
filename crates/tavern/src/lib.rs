//! # Tavern
//!
//! Room/session engine for real-time multiplayer relay servers.
//!
//! Peers join short-lived rooms, exchange addressed events, and leave or
//! disconnect. Rooms handle rejoin, master election, cached events for late
//! joiners and persistence across room recreation. Each room runs on its own
//! Tokio task, so operations on one room never interleave.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tavern::prelude::*;
//!
//! # async fn run() -> Result<(), TavernError> {
//! let config = ServerConfig::load("tavern.toml").await?;
//! init_tracing(&config.logging)?;
//!
//! let registry = RoomRegistry::new(config.rooms, Arc::new(NoopHook));
//! let service = RoomService::new(registry);
//! // For each parsed operation of a peer:
//! // let response = service.handle(&peer, op).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod service;
pub mod telemetry;

pub use error::TavernError;

/// Everything needed to embed the engine.
pub mod prelude {
    pub use crate::TavernError;
    pub use crate::config::{ConfigError, LoggingSettings, ServerConfig};
    pub use crate::service::{OperationResponse, ResponseData, RoomService};
    pub use crate::telemetry::init_tracing;
    pub use tavern_protocol::{
        ActorNr, ErrorCode, EventCaching, JoinMode, JoinRequest, LeaveRequest, Operation,
        PeerId, PropertyMap, RaiseEventRequest, ReceiverGroup, RoomEvent,
        SetPropertiesRequest, Value, WellKnownKey,
    };
    pub use tavern_room::{
        HookContext, HookDecision, NoopHook, PeerHandle, RoomDirectory, RoomHandle, RoomHook,
        RoomLimits, RoomRegistry, SerializableGameState,
    };
}
