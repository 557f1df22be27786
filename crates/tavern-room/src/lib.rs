//! Room engine for Tavern.
//!
//! Each room runs as an isolated Tokio task (actor model) that owns its
//! game state: actors, properties, event caches and interest groups.
//!
//! # Key types
//!
//! - [`RoomRegistry`]: starts rooms on demand and evicts idle ones
//! - [`RoomHandle`]: send operations to a running room
//! - [`RoomHook`]: the plugin extension point, with deferred decisions
//! - [`GameState`] / [`SerializableGameState`]: live and persisted room state
//! - [`RoomLimits`]: operator limits (cache sizes, quotas, timeouts)

#![allow(async_fn_in_trait)]

mod actor_cache;
mod actors;
mod config;
mod engine;
mod error;
mod event_cache;
mod groups;
mod hook;
mod join;
mod persist;
mod properties;
mod registry;
mod room;
mod state;

pub use actor_cache::{ActorCacheEntry, ActorEventCache};
pub use actors::{
    Actor, ActorRegistry, AdmitPlan, AdmitRequest, ExcludedUser, PeerHandle, PeerSender,
};
pub use config::{JoinStage, RoomLimits};
pub use engine::{ActorDebugInfo, RoomDebugInfo, RoomInfo};
pub use error::RoomError;
pub use event_cache::{CacheOutcome, CachedEvent, RoomCacheSnapshot, RoomEventCache};
pub use groups::GroupTable;
pub use hook::{
    CallState, Continuation, HookContext, HookDecision, HookOutcome, LobbySnapshot, NoopHook,
    PendingCall, RoomHook,
};
pub use persist::{SerializableActor, SerializableGameState};
pub use properties::{PropertyStore, strip_keys, validate_well_known};
pub use registry::{RoomDirectory, RoomRegistry};
pub use room::RoomHandle;
pub use state::GameState;
