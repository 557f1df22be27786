//! Persisted room state.
//!
//! A room can be frozen into a [`SerializableGameState`] and thawed into a
//! fresh room later (possibly on another server). Older deployments wrote a
//! loosely typed string-keyed record instead; [`SerializableGameState::from_legacy`]
//! converts it so both formats go through the same validation and restore.

use std::collections::{BTreeMap, BTreeSet};

use base64::{Engine as _, engine::general_purpose};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use tavern_protocol::{
    ActorNr, Codec, JsonCodec, LobbyInfo, PropertyKey, PropertyMap, RoomFlags, Value,
    WellKnownKey,
};

use crate::actor_cache::ActorCacheEntry;
use crate::event_cache::RoomCacheSnapshot;
use crate::{Actor, ExcludedUser, GameState, PropertyStore, RoomError};

/// Binary blob holding the full room property map.
pub const GAME_PROPERTIES_BLOB: &str = "18";
/// Binary blob holding the room and actor event caches.
pub const EVENT_CACHES_BLOB: &str = "19";
/// Binary blob holding group membership per actor.
pub const GROUPS_BLOB: &str = "20";

/// One actor of a persisted room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerializableActor {
    pub actor_nr: ActorNr,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    /// Whether the actor was connected when the state was taken.
    pub is_active: bool,
    /// Base64 blob of the actor's property map.
    pub properties: String,
    pub join_time_ms: u64,
    pub deactivation_time_ms: Option<u64>,
    pub deactivation_reason: Option<String>,
}

/// A frozen room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializableGameState {
    pub actor_counter: i32,
    pub actors: Vec<SerializableActor>,
    pub flags: RoomFlags,
    /// Base64 blob of the lobby-visible custom properties.
    pub custom_properties: String,
    pub empty_room_ttl: i32,
    pub player_ttl: i32,
    pub is_open: bool,
    pub is_visible: bool,
    pub lobby_id: Option<String>,
    pub lobby_type: u8,
    pub lobby_properties: Vec<String>,
    pub max_players: u8,
    pub current_slice: u32,
    pub excluded: Vec<ExcludedUser>,
    pub expected_users: Vec<String>,
    /// Base64 blobs keyed by [`GAME_PROPERTIES_BLOB`], [`EVENT_CACHES_BLOB`]
    /// and [`GROUPS_BLOB`].
    pub binary: BTreeMap<String, String>,
}

impl Default for SerializableGameState {
    fn default() -> Self {
        Self {
            actor_counter: 0,
            actors: Vec::new(),
            flags: RoomFlags::default(),
            custom_properties: String::new(),
            empty_room_ttl: 0,
            player_ttl: 0,
            is_open: true,
            is_visible: true,
            lobby_id: None,
            lobby_type: 0,
            lobby_properties: Vec::new(),
            max_players: 0,
            current_slice: 0,
            excluded: Vec::new(),
            expected_users: Vec::new(),
            binary: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CachesBlob {
    room: RoomCacheSnapshot,
    actors: Vec<ActorCacheEntry>,
    actors_discarded: bool,
}

fn encode_blob<T: Serialize>(value: &T) -> Result<String, RoomError> {
    let bytes = JsonCodec.encode(value)?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

fn decode_blob<T: DeserializeOwned>(name: &str, text: &str) -> Result<T, RoomError> {
    let bytes = general_purpose::STANDARD
        .decode(text)
        .map_err(|e| RoomError::InvalidState(format!("blob {name} is not base64: {e}")))?;
    Ok(JsonCodec.decode(&bytes)?)
}

fn decode_optional<T: DeserializeOwned + Default>(name: &str, text: &str) -> Result<T, RoomError> {
    if text.is_empty() {
        Ok(T::default())
    } else {
        decode_blob(name, text)
    }
}

/// Everything a record decodes to, built before any room state changes.
struct Decoded {
    properties: PropertyMap,
    actors: Vec<Actor>,
    caches: CachesBlob,
}

impl SerializableGameState {
    /// Checks actor numbers and decodes every blob.
    pub fn validate(&self) -> Result<(), RoomError> {
        self.decode(0).map(|_| ())
    }

    fn decode(&self, now_ms: u64) -> Result<Decoded, RoomError> {
        if self.actor_counter < 0 {
            return Err(RoomError::InvalidState(format!(
                "negative actor counter {}",
                self.actor_counter
            )));
        }
        let mut seen = BTreeSet::new();
        for actor in &self.actors {
            let nr = actor.actor_nr;
            if nr.0 <= 0 || nr.0 > self.actor_counter {
                return Err(RoomError::InvalidState(format!(
                    "actor number {} outside 1..={}",
                    nr.0, self.actor_counter
                )));
            }
            if !seen.insert(nr) {
                return Err(RoomError::InvalidState(format!("duplicate actor {nr}")));
            }
        }

        let properties = match self.binary.get(GAME_PROPERTIES_BLOB) {
            Some(blob) => decode_blob::<PropertyMap>(GAME_PROPERTIES_BLOB, blob)?,
            None => self.properties_from_fields()?,
        };
        let caches = match self.binary.get(EVENT_CACHES_BLOB) {
            Some(blob) => decode_blob::<CachesBlob>(EVENT_CACHES_BLOB, blob)?,
            None => CachesBlob {
                room: RoomCacheSnapshot {
                    current_slice: self.current_slice,
                    ..RoomCacheSnapshot::default()
                },
                ..CachesBlob::default()
            },
        };
        let groups: Vec<(ActorNr, Vec<u8>)> = match self.binary.get(GROUPS_BLOB) {
            Some(blob) => decode_blob(GROUPS_BLOB, blob)?,
            None => Vec::new(),
        };
        let groups: BTreeMap<ActorNr, Vec<u8>> = groups.into_iter().collect();

        let mut actors = Vec::with_capacity(self.actors.len());
        for record in &self.actors {
            let props: PropertyMap = decode_optional("actor properties", &record.properties)?;
            let mut actor = Actor::new(
                record.actor_nr,
                record.user_id.as_deref(),
                record.nickname.as_deref(),
                record.join_time_ms,
            );
            let mut store = PropertyStore::from_map(props);
            if let Some(user_id) = &record.user_id {
                store.set(WellKnownKey::UserId, user_id.as_str());
            }
            if let Some(nickname) = &record.nickname {
                store.set(WellKnownKey::Nickname, nickname.as_str());
            }
            actor.properties = store;
            actor.deactivation_time_ms = Some(record.deactivation_time_ms.unwrap_or(now_ms));
            actor.deactivation_reason = Some(
                record
                    .deactivation_reason
                    .clone()
                    .unwrap_or_else(|| "restored".to_string()),
            );
            if let Some(ids) = groups.get(&record.actor_nr) {
                actor.groups_mut().extend(ids.iter().copied().filter(|g| *g != 0));
            }
            actors.push(actor);
        }

        Ok(Decoded {
            properties,
            actors,
            caches,
        })
    }

    /// Rebuilds the room property map from the typed fields, for records
    /// that carry no property blob.
    fn properties_from_fields(&self) -> Result<PropertyMap, RoomError> {
        let mut props: PropertyMap =
            decode_optional("custom properties", &self.custom_properties)?;
        props.insert(WellKnownKey::IsOpen, self.is_open);
        props.insert(WellKnownKey::IsVisible, self.is_visible);
        props.insert(WellKnownKey::MaxPlayers, self.max_players);
        props.insert(WellKnownKey::PlayerTtl, self.player_ttl);
        props.insert(WellKnownKey::EmptyRoomTtl, self.empty_room_ttl);
        if !self.lobby_properties.is_empty() {
            props.insert(WellKnownKey::LobbyProperties, string_array(&self.lobby_properties));
        }
        if !self.expected_users.is_empty() {
            props.insert(WellKnownKey::ExpectedUsers, string_array(&self.expected_users));
        }
        Ok(props)
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| Value::from(s.as_str())).collect())
}

// ---------------------------------------------------------------------------
// GameState <-> SerializableGameState
// ---------------------------------------------------------------------------

impl GameState {
    /// Freezes the room.
    pub fn to_serializable(&self) -> Result<SerializableGameState, RoomError> {
        let props = &self.properties;
        let mut actors = Vec::new();
        let mut groups = Vec::new();
        for actor in self.actors.all_actors() {
            actors.push(SerializableActor {
                actor_nr: actor.actor_nr(),
                user_id: actor.user_id().map(str::to_string),
                nickname: actor.nickname().map(str::to_string),
                is_active: self.actors.is_active(actor.actor_nr()),
                properties: encode_blob(actor.properties.as_map())?,
                join_time_ms: actor.join_time_ms,
                deactivation_time_ms: actor.deactivation_time_ms,
                deactivation_reason: actor.deactivation_reason.clone(),
            });
            if !actor.groups().is_empty() {
                groups.push((actor.actor_nr(), actor.groups().iter().copied().collect::<Vec<u8>>()));
            }
        }
        actors.sort_by_key(|a| a.actor_nr);

        let caches = CachesBlob {
            room: self.room_cache.snapshot(),
            actors: self.actor_cache.snapshot(),
            actors_discarded: self.actor_cache.is_discarded(),
        };

        let mut binary = BTreeMap::new();
        binary.insert(GAME_PROPERTIES_BLOB.to_string(), encode_blob(props.as_map())?);
        binary.insert(EVENT_CACHES_BLOB.to_string(), encode_blob(&caches)?);
        binary.insert(GROUPS_BLOB.to_string(), encode_blob(&groups)?);

        Ok(SerializableGameState {
            actor_counter: self.actors.counter(),
            actors,
            flags: self.flags,
            custom_properties: encode_blob(&self.lobby_visible_properties())?,
            empty_room_ttl: props.empty_room_ttl(),
            player_ttl: props.player_ttl(),
            is_open: props.is_open(),
            is_visible: props.is_visible(),
            lobby_id: self.lobby.id.clone(),
            lobby_type: self.lobby.lobby_type,
            lobby_properties: props.lobby_properties(),
            max_players: props.max_players(),
            current_slice: self.room_cache.current_slice(),
            excluded: self.actors.excluded().to_vec(),
            expected_users: props.expected_users(),
            binary,
        })
    }

    /// Thaws a record into this room. The room must have no actors.
    ///
    /// Every restored actor is inactive; the master is reset until someone
    /// joins. Nothing changes if the record fails validation.
    pub(crate) fn restore(
        &mut self,
        record: SerializableGameState,
        now_ms: u64,
    ) -> Result<(), RoomError> {
        if !self.actors.is_empty() {
            return Err(RoomError::InvalidState(
                "state can only be set on a room without actors".into(),
            ));
        }
        let decoded = record.decode(now_ms)?;

        let mut properties = PropertyStore::from_map(decoded.properties);
        properties.remove(&PropertyKey::WellKnown(WellKnownKey::MasterClientId));
        self.properties = properties;
        self.flags = record.flags;
        self.lobby = LobbyInfo {
            id: record.lobby_id,
            lobby_type: record.lobby_type,
        };
        self.actors
            .restore(record.actor_counter, decoded.actors, record.excluded);
        self.room_cache.restore(decoded.caches.room);
        self.actor_cache
            .restore(decoded.caches.actors, decoded.caches.actors_discarded);
        self.groups = crate::GroupTable::new();
        self.loaded = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Legacy string-keyed records
// ---------------------------------------------------------------------------

fn json_i32(v: &JsonValue) -> Option<i32> {
    v.as_i64().and_then(|n| i32::try_from(n).ok())
}

fn json_u8(v: &JsonValue) -> Option<u8> {
    v.as_u64().and_then(|n| u8::try_from(n).ok())
}

fn json_strings(v: &JsonValue) -> Option<Vec<String>> {
    v.as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn json_opt_string(v: &JsonValue) -> Option<Option<String>> {
    match v {
        JsonValue::Null => Some(None),
        JsonValue::String(s) => Some(Some(s.clone())),
        _ => None,
    }
}

fn legacy_actor(v: &JsonValue) -> Option<SerializableActor> {
    let obj = v.as_object()?;
    let field = |name: &str| obj.get(name).filter(|v| !v.is_null());
    Some(SerializableActor {
        actor_nr: ActorNr(field("ActorNr").and_then(json_i32)?),
        user_id: field("UserId").and_then(|v| v.as_str()).map(str::to_string),
        nickname: field("Nickname").and_then(|v| v.as_str()).map(str::to_string),
        is_active: field("IsActive").and_then(JsonValue::as_bool).unwrap_or(false),
        properties: field("Binary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        join_time_ms: field("JoinTime").and_then(JsonValue::as_u64).unwrap_or(0),
        deactivation_time_ms: field("DeactivationTime").and_then(JsonValue::as_u64),
        deactivation_reason: field("DeactivationReason")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn legacy_excluded(v: &JsonValue) -> Option<ExcludedUser> {
    match v {
        JsonValue::String(user_id) => Some(ExcludedUser {
            user_id: user_id.clone(),
            reason: String::new(),
        }),
        JsonValue::Object(obj) => Some(ExcludedUser {
            user_id: obj.get("UserId")?.as_str()?.to_string(),
            reason: obj
                .get("Reason")
                .and_then(|r| r.as_str())
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

/// Parses every element of a list, skipping (and logging) the bad ones.
fn legacy_list<T>(key: &str, v: &JsonValue, parse: impl Fn(&JsonValue) -> Option<T>) -> Option<Vec<T>> {
    let items = v.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match parse(item) {
            Some(parsed) => out.push(parsed),
            None => tracing::warn!(key, index, "unparsable entry in legacy room state, skipping"),
        }
    }
    Some(out)
}

impl SerializableGameState {
    /// Converts a legacy string-keyed record.
    ///
    /// Each key is parsed on its own; a key that is unknown or does not
    /// parse is logged and skipped, the rest of the record still loads.
    pub fn from_legacy(map: &Map<String, JsonValue>) -> Self {
        let mut record = Self::default();
        for (key, value) in map {
            let parsed = match key.as_str() {
                "ActorCounter" => json_i32(value).map(|v| record.actor_counter = v),
                "ActorList" => legacy_list(key, value, legacy_actor).map(|v| record.actors = v),
                "CheckUserOnJoin" => value.as_bool().map(|v| record.flags.check_user_on_join = v),
                "DeleteCacheOnLeave" => {
                    value.as_bool().map(|v| record.flags.delete_cache_on_leave = v)
                }
                "SuppressRoomEvents" => {
                    value.as_bool().map(|v| record.flags.suppress_room_events = v)
                }
                "SuppressPlayerInfo" => {
                    value.as_bool().map(|v| record.flags.suppress_player_info = v)
                }
                "PublishUserId" => value.as_bool().map(|v| record.flags.publish_user_id = v),
                "DeleteNullProperties" => {
                    value.as_bool().map(|v| record.flags.delete_null_properties = v)
                }
                "BroadcastPropsChangeToAll" => value
                    .as_bool()
                    .map(|v| record.flags.broadcast_props_change_to_all = v),
                "CustomProperties" => value
                    .as_str()
                    .map(|v| record.custom_properties = v.to_string()),
                "EmptyRoomTTL" => json_i32(value).map(|v| record.empty_room_ttl = v),
                "PlayerTTL" => json_i32(value).map(|v| record.player_ttl = v),
                "IsOpen" => value.as_bool().map(|v| record.is_open = v),
                "IsVisible" => value.as_bool().map(|v| record.is_visible = v),
                "LobbyId" => json_opt_string(value).map(|v| record.lobby_id = v),
                "LobbyType" => json_u8(value).map(|v| record.lobby_type = v),
                "LobbyProperties" => json_strings(value).map(|v| record.lobby_properties = v),
                "MaxPlayers" => json_u8(value).map(|v| record.max_players = v),
                "CacheSlice" => value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(|v| record.current_slice = v),
                "ExcludedUsers" => {
                    legacy_list(key, value, legacy_excluded).map(|v| record.excluded = v)
                }
                "ExpectedUsers" => json_strings(value).map(|v| record.expected_users = v),
                "Binary" => value.as_object().map(|obj| {
                    for (blob, text) in obj {
                        match text.as_str() {
                            Some(text) => {
                                record.binary.insert(blob.clone(), text.to_string());
                            }
                            None => tracing::warn!(
                                blob = %blob,
                                "non-string binary blob in legacy room state, skipping"
                            ),
                        }
                    }
                }),
                _ => {
                    tracing::warn!(key = %key, "unknown key in legacy room state, skipping");
                    continue;
                }
            };
            if parsed.is_none() {
                tracing::warn!(key = %key, "unparsable value in legacy room state, skipping");
            }
        }
        record
    }

    /// Writes the record in the legacy string-keyed layout, for deployments
    /// that still read it.
    pub fn to_legacy(&self) -> Map<String, JsonValue> {
        let actors: Vec<JsonValue> = self
            .actors
            .iter()
            .map(|a| {
                json!({
                    "ActorNr": a.actor_nr.0,
                    "UserId": a.user_id,
                    "Nickname": a.nickname,
                    "IsActive": a.is_active,
                    "Binary": a.properties,
                    "JoinTime": a.join_time_ms,
                    "DeactivationTime": a.deactivation_time_ms,
                    "DeactivationReason": a.deactivation_reason,
                })
            })
            .collect();
        let excluded: Vec<JsonValue> = self
            .excluded
            .iter()
            .map(|e| json!({ "UserId": e.user_id, "Reason": e.reason }))
            .collect();
        let flags = &self.flags;

        let value = json!({
            "ActorCounter": self.actor_counter,
            "ActorList": actors,
            "CheckUserOnJoin": flags.check_user_on_join,
            "DeleteCacheOnLeave": flags.delete_cache_on_leave,
            "SuppressRoomEvents": flags.suppress_room_events,
            "SuppressPlayerInfo": flags.suppress_player_info,
            "PublishUserId": flags.publish_user_id,
            "DeleteNullProperties": flags.delete_null_properties,
            "BroadcastPropsChangeToAll": flags.broadcast_props_change_to_all,
            "CustomProperties": self.custom_properties,
            "EmptyRoomTTL": self.empty_room_ttl,
            "PlayerTTL": self.player_ttl,
            "IsOpen": self.is_open,
            "IsVisible": self.is_visible,
            "LobbyId": self.lobby_id,
            "LobbyType": self.lobby_type,
            "LobbyProperties": self.lobby_properties,
            "MaxPlayers": self.max_players,
            "CacheSlice": self.current_slice,
            "ExcludedUsers": excluded,
            "ExpectedUsers": self.expected_users,
            "Binary": self.binary,
        });
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }
}
