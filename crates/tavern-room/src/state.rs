//! The aggregate state of one room.

use std::time::{SystemTime, UNIX_EPOCH};

use tavern_protocol::{LobbyInfo, PropertyKey, PropertyMap, RoomFlags};

use crate::{ActorEventCache, ActorRegistry, GroupTable, PropertyStore, RoomEventCache, RoomLimits};

/// Everything a room owns: properties, actors, caches and groups.
///
/// Only the room task touches a `GameState`, so nothing here is
/// synchronised.
#[derive(Debug)]
pub struct GameState {
    pub(crate) name: String,
    pub(crate) properties: PropertyStore,
    pub(crate) actors: ActorRegistry,
    pub(crate) room_cache: RoomEventCache,
    pub(crate) actor_cache: ActorEventCache,
    pub(crate) groups: GroupTable,
    pub(crate) flags: RoomFlags,
    pub(crate) lobby: LobbyInfo,
    pub(crate) loaded: bool,
}

impl GameState {
    pub fn new(name: impl Into<String>, limits: &RoomLimits) -> Self {
        Self {
            name: name.into(),
            properties: PropertyStore::new(),
            actors: ActorRegistry::new(),
            room_cache: RoomEventCache::new(limits.max_cached_events, limits.max_cache_slices),
            actor_cache: ActorEventCache::new(
                limits.max_actor_cache_events,
                limits.max_actor_cache_events_per_actor,
            ),
            groups: GroupTable::new(),
            flags: RoomFlags::default(),
            lobby: LobbyInfo::default(),
            loaded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    pub fn actors(&self) -> &ActorRegistry {
        &self.actors
    }

    pub fn room_cache(&self) -> &RoomEventCache {
        &self.room_cache
    }

    pub fn actor_cache(&self) -> &ActorEventCache {
        &self.actor_cache
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn flags(&self) -> RoomFlags {
        self.flags
    }

    pub fn lobby(&self) -> &LobbyInfo {
        &self.lobby
    }

    /// `true` once a join created the room or a persisted state was loaded.
    pub fn exists(&self) -> bool {
        self.actors.counter() > 0 || self.loaded
    }

    /// `true` if either event cache overflowed.
    pub fn cache_discarded(&self) -> bool {
        self.room_cache.is_discarded() || self.actor_cache.is_discarded()
    }

    /// Room properties plus the properties of every actor.
    pub fn total_properties_size(&self) -> usize {
        self.properties.total_size()
            + self
                .actors
                .all_actors()
                .map(|a| a.properties.total_size())
                .sum::<usize>()
    }

    /// Custom room properties listed in `LobbyProperties`.
    pub fn lobby_visible_properties(&self) -> PropertyMap {
        let keys: Vec<PropertyKey> = self
            .properties
            .lobby_properties()
            .into_iter()
            .map(PropertyKey::Custom)
            .collect();
        self.properties.filtered(Some(&keys))
    }
}

/// Wall-clock milliseconds since the Unix epoch, for persisted timestamps.
pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
