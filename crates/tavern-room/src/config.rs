//! Room limits and the join stage machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RoomLimits
// ---------------------------------------------------------------------------

/// Operator limits applied to every room.
///
/// Loaded from the `[rooms]` section of the server configuration. Every field
/// has a default, so a partial table is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomLimits {
    /// Events the room cache may hold before it is discarded.
    pub max_cached_events: usize,

    /// Slices the room cache may hold before the room is flagged.
    pub max_cache_slices: usize,

    /// Total per-actor cache entries before the actor cache is discarded.
    pub max_actor_cache_events: usize,

    /// Per-actor cache entries for a single actor before it is flagged.
    pub max_actor_cache_events_per_actor: usize,

    /// Quota for the approximate size of all properties of a room
    /// (room properties plus every actor's properties), in bytes.
    pub max_properties_size: usize,

    /// Upper bound for a requested empty-room TTL, in milliseconds.
    pub max_empty_room_ttl_ms: u64,

    /// Empty-room TTL used when the creator asks for none, in milliseconds.
    pub default_empty_room_ttl_ms: u64,

    /// How long a deferred hook call may keep the room waiting.
    pub plugin_timeout_ms: u64,

    /// Capacity of the room command channel.
    pub channel_size: usize,

    /// Minimum gap between two internal-error reports of the same room.
    pub error_log_interval_ms: u64,
}

impl Default for RoomLimits {
    fn default() -> Self {
        Self {
            max_cached_events: 10_000,
            max_cache_slices: 1_000,
            max_actor_cache_events: 10_000,
            max_actor_cache_events_per_actor: 1_000,
            max_properties_size: 512 * 1024,
            max_empty_room_ttl_ms: 300_000,
            default_empty_room_ttl_ms: 0,
            plugin_timeout_ms: 10_000,
            channel_size: 64,
            error_log_interval_ms: 10_000,
        }
    }
}

impl RoomLimits {
    pub fn max_empty_room_ttl(&self) -> Duration {
        Duration::from_millis(self.max_empty_room_ttl_ms)
    }

    pub fn default_empty_room_ttl(&self) -> Duration {
        Duration::from_millis(self.default_empty_room_ttl_ms)
    }

    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    pub fn error_log_interval(&self) -> Duration {
        Duration::from_millis(self.error_log_interval_ms)
    }

    /// Clamps values that would make a room unusable.
    ///
    /// Zero capacities become 1, a default TTL above the maximum is lowered
    /// to the maximum. Each correction is logged.
    pub fn validated(mut self) -> Self {
        fn at_least_one(name: &str, value: &mut usize) {
            if *value == 0 {
                tracing::warn!(limit = name, "limit of 0 is unusable, clamping to 1");
                *value = 1;
            }
        }

        at_least_one("max_cached_events", &mut self.max_cached_events);
        at_least_one("max_cache_slices", &mut self.max_cache_slices);
        at_least_one("max_actor_cache_events", &mut self.max_actor_cache_events);
        at_least_one(
            "max_actor_cache_events_per_actor",
            &mut self.max_actor_cache_events_per_actor,
        );
        at_least_one("channel_size", &mut self.channel_size);

        if self.default_empty_room_ttl_ms > self.max_empty_room_ttl_ms {
            tracing::warn!(
                default_ms = self.default_empty_room_ttl_ms,
                max_ms = self.max_empty_room_ttl_ms,
                "default empty-room TTL above maximum, clamping"
            );
            self.default_empty_room_ttl_ms = self.max_empty_room_ttl_ms;
        }
        if self.plugin_timeout_ms == 0 {
            tracing::warn!("plugin timeout of 0 would fail every deferred call, using 1ms");
            self.plugin_timeout_ms = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// JoinStage
// ---------------------------------------------------------------------------

/// Progress of a single join through the room.
///
/// Stages are strictly ordered, no skipping:
///
/// ```text
/// Connected → CreatingOrLoadingGame → ConvertingParams → CheckingCacheSlice
///   → AddingActor → CheckAfterJoinParams → ApplyActorProperties
///   → BeforeJoinComplete → GettingUserResponse → SendingUserResponse
///   → PublishingEvents → EventsPublished → Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JoinStage {
    Connected,
    CreatingOrLoadingGame,
    ConvertingParams,
    CheckingCacheSlice,
    AddingActor,
    CheckAfterJoinParams,
    ApplyActorProperties,
    BeforeJoinComplete,
    GettingUserResponse,
    SendingUserResponse,
    PublishingEvents,
    EventsPublished,
    Complete,
}

impl JoinStage {
    /// Returns the stage after this one, or `None` at the end.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Connected => Some(Self::CreatingOrLoadingGame),
            Self::CreatingOrLoadingGame => Some(Self::ConvertingParams),
            Self::ConvertingParams => Some(Self::CheckingCacheSlice),
            Self::CheckingCacheSlice => Some(Self::AddingActor),
            Self::AddingActor => Some(Self::CheckAfterJoinParams),
            Self::CheckAfterJoinParams => Some(Self::ApplyActorProperties),
            Self::ApplyActorProperties => Some(Self::BeforeJoinComplete),
            Self::BeforeJoinComplete => Some(Self::GettingUserResponse),
            Self::GettingUserResponse => Some(Self::SendingUserResponse),
            Self::SendingUserResponse => Some(Self::PublishingEvents),
            Self::PublishingEvents => Some(Self::EventsPublished),
            Self::EventsPublished => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Returns `true` if moving to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == Some(target)
    }

    /// Returns `true` once the actor has been committed to the room.
    pub fn is_admitted(self) -> bool {
        self > Self::AddingActor
    }
}

impl std::fmt::Display for JoinStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
