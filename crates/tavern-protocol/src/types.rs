//! Core protocol types for the Tavern room engine.
//!
//! Everything in this module is already parsed: the byte-level wire codec
//! lives outside the engine. These are the structures that operation
//! handlers consume and that rooms emit back to peers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The number of an actor inside one room.
///
/// Actor numbers are handed out monotonically starting at 1 and are never
/// reused for the lifetime of a room. `ActorNr(0)` means "nobody" (no master,
/// room-level property target, global cache owner).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ActorNr(pub i32);

impl ActorNr {
    /// The "nobody" actor number.
    pub const NONE: ActorNr = ActorNr(0);

    /// Returns `true` for `ActorNr(0)`.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ActorNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A-{}", self.0)
    }
}

/// Identifies one connected peer (one client connection).
///
/// A peer owns at most one actor per room. The id is assigned by the
/// connection layer; the engine only compares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A key inside an event payload or nested hashtable.
///
/// Clients use small integers for compact payloads and strings for
/// anything else, so both are first-class.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    fn approx_size(&self) -> usize {
        match self {
            Self::Int(_) => 8,
            Self::Str(s) => s.len() + 2,
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u8> for Key {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A dynamically typed value stored in properties and event payloads.
///
/// `Null` is meaningful: in a property update it deletes the key (when the
/// room runs in delete-null mode), in a cache merge it removes the key, and
/// in a CAS expectation it means "the key must be absent".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Table(Hashtable),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Rough encoded size in bytes, used for per-room property quotas.
    ///
    /// This is not the exact wire size (the engine never sees the wire) but
    /// it grows with the payload the same way, which is what a quota needs.
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::Str(s) => s.len() + 2,
            Self::Bytes(b) => b.len() + 4,
            Self::Array(items) => {
                4 + items.iter().map(Value::approx_size).sum::<usize>()
            }
            Self::Table(table) => table.approx_size(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<Hashtable> for Value {
    fn from(v: Hashtable) -> Self {
        Self::Table(v)
    }
}

// ---------------------------------------------------------------------------
// KeyedMap: ordered value maps with non-string keys
// ---------------------------------------------------------------------------

/// An ordered map from `K` to [`Value`].
///
/// JSON object keys must be strings, but our keys are enums (`Key`,
/// `PropertyKey`). So the map serializes as a list of `[key, value]` pairs,
/// which round-trips through any serde format without losing key types.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedMap<K: Ord>(BTreeMap<K, Value>);

/// Payload of custom events and nested tables.
pub type Hashtable = KeyedMap<Key>;

/// Room or actor properties.
pub type PropertyMap = KeyedMap<PropertyKey>;

impl<K: Ord> Default for KeyedMap<K> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord> KeyedMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<K>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &K) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Value)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps only the entries for which `f` returns `true`.
    pub fn retain(&mut self, mut f: impl FnMut(&K, &Value) -> bool) {
        self.0.retain(|k, v| f(k, v));
    }

    /// Builder-style insert, handy for literals in tests and hooks.
    pub fn with(mut self, key: impl Into<K>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }
}

impl KeyedMap<Key> {
    /// Rough encoded size in bytes, see [`Value::approx_size`].
    pub fn approx_size(&self) -> usize {
        4 + self
            .0
            .iter()
            .map(|(k, v)| k.approx_size() + v.approx_size())
            .sum::<usize>()
    }
}

impl KeyedMap<PropertyKey> {
    /// Rough encoded size in bytes, see [`Value::approx_size`].
    pub fn approx_size(&self) -> usize {
        4 + self
            .0
            .iter()
            .map(|(k, v)| k.approx_size() + v.approx_size())
            .sum::<usize>()
    }
}

impl<K: Ord> FromIterator<(K, Value)> for KeyedMap<K> {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<K: Ord> IntoIterator for KeyedMap<K> {
    type Item = (K, Value);
    type IntoIter = std::collections::btree_map::IntoIter<K, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a, K: Ord> IntoIterator for &'a KeyedMap<K> {
    type Item = (&'a K, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, K, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Ord + Serialize> Serialize for KeyedMap<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

impl<'de, K: Ord + Deserialize<'de>> Deserialize<'de> for KeyedMap<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(K, Value)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Property keys
// ---------------------------------------------------------------------------

/// Which property store a well-known key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyScope {
    Game,
    Actor,
}

/// Property keys the server understands and type-checks.
///
/// Each has a small numeric code (per scope) used by clients and by legacy
/// persisted state. Game and actor codes overlap, so decoding needs the
/// [`PropertyScope`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum WellKnownKey {
    // -- game scope --
    MaxPlayers,
    IsOpen,
    IsVisible,
    LobbyProperties,
    MasterClientId,
    ExpectedUsers,
    PlayerTtl,
    EmptyRoomTtl,
    // -- actor scope --
    Nickname,
    IsInactive,
    UserId,
}

impl WellKnownKey {
    /// The numeric code of this key.
    pub fn code(self) -> u8 {
        match self {
            Self::MaxPlayers => 255,
            Self::IsOpen => 254,
            Self::IsVisible => 253,
            Self::LobbyProperties => 250,
            Self::MasterClientId => 248,
            Self::ExpectedUsers => 247,
            Self::PlayerTtl => 246,
            Self::EmptyRoomTtl => 245,
            Self::Nickname => 255,
            Self::IsInactive => 254,
            Self::UserId => 253,
        }
    }

    /// The store this key lives in.
    pub fn scope(self) -> PropertyScope {
        match self {
            Self::Nickname | Self::IsInactive | Self::UserId => PropertyScope::Actor,
            _ => PropertyScope::Game,
        }
    }

    /// Decodes a numeric code within a scope.
    pub fn from_code(scope: PropertyScope, code: u8) -> Option<Self> {
        let all = [
            Self::MaxPlayers,
            Self::IsOpen,
            Self::IsVisible,
            Self::LobbyProperties,
            Self::MasterClientId,
            Self::ExpectedUsers,
            Self::PlayerTtl,
            Self::EmptyRoomTtl,
            Self::Nickname,
            Self::IsInactive,
            Self::UserId,
        ];
        all.into_iter()
            .find(|k| k.scope() == scope && k.code() == code)
    }
}

/// A property key: either well-known (typed, server-validated) or custom.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PropertyKey {
    WellKnown(WellKnownKey),
    Custom(String),
}

impl PropertyKey {
    fn approx_size(&self) -> usize {
        match self {
            Self::WellKnown(_) => 1,
            Self::Custom(s) => s.len() + 2,
        }
    }

    /// Returns the well-known key, if this is one.
    pub fn well_known(&self) -> Option<WellKnownKey> {
        match self {
            Self::WellKnown(k) => Some(*k),
            Self::Custom(_) => None,
        }
    }
}

impl From<WellKnownKey> for PropertyKey {
    fn from(k: WellKnownKey) -> Self {
        Self::WellKnown(k)
    }
}

impl From<&str> for PropertyKey {
    fn from(k: &str) -> Self {
        Self::Custom(k.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(k: String) -> Self {
        Self::Custom(k)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WellKnown(k) => write!(f, "{k:?}"),
            Self::Custom(s) => write!(f, "{s:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Join policy
// ---------------------------------------------------------------------------

/// How a join treats an existing (possibly inactive) actor for this user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinMode {
    /// Join an existing room as a new actor.
    #[default]
    Default,
    /// Join, creating the room when it does not exist yet.
    CreateIfNotExists,
    /// Only re-attach to an inactive actor; fail otherwise.
    RejoinOnly,
    /// Re-attach when an inactive actor matches, join fresh otherwise.
    RejoinOrJoin,
}

impl JoinMode {
    /// Returns `true` if this mode allows matching an inactive actor.
    pub fn allows_rejoin(self) -> bool {
        matches!(self, Self::RejoinOnly | Self::RejoinOrJoin)
    }
}

/// Per-room behaviour flags, fixed at creation and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomFlags {
    /// Reject a join when another actor already uses the same user id, and
    /// allow rejoin lookup by user id.
    pub check_user_on_join: bool,
    /// Purge a departing actor's cached events.
    pub delete_cache_on_leave: bool,
    /// Do not send Join/Leave events.
    pub suppress_room_events: bool,
    /// Do not send other actors' properties in join responses/events.
    pub suppress_player_info: bool,
    /// Expose each actor's user id to the other actors.
    pub publish_user_id: bool,
    /// A `Null` property value deletes the key instead of storing null.
    pub delete_null_properties: bool,
    /// Send PropertiesChanged to the sender as well.
    pub broadcast_props_change_to_all: bool,
}

/// The lobby a room is listed in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub id: Option<String>,
    pub lobby_type: u8,
}

// ---------------------------------------------------------------------------
// Addressing and caching
// ---------------------------------------------------------------------------

/// Receiver selection for a custom event when no explicit target list and no
/// interest group is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceiverGroup {
    /// Everyone except the sender.
    #[default]
    Others,
    /// Everyone including the sender.
    All,
    /// Only the current master actor.
    MasterClient,
}

/// What a RaiseEvent does with the event caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventCaching {
    #[default]
    DoNotCache,
    /// Shallow-merge into the sender's cached entry for this code.
    MergeCache,
    /// Overwrite the sender's cached entry for this code.
    ReplaceCache,
    /// Drop the sender's cached entry for this code.
    RemoveCache,
    /// Append to the current room cache slice, owned by the sender.
    AddToRoomCache,
    /// Append to the current room cache slice, owned by nobody (survives the
    /// sender leaving).
    AddToRoomCacheGlobal,
    /// Remove matching events from the room cache.
    RemoveFromRoomCache,
    /// Remove room cache events of actors no longer in the room.
    RemoveFromRoomCacheForActorsLeft,
    SliceIncreaseIndex,
    SliceSetIndex,
    SlicePurgeIndex,
    SlicePurgeUpToIndex,
}

impl EventCaching {
    /// Slice and removal operations manipulate the caches only; the event
    /// itself is not dispatched.
    pub fn is_cache_only(self) -> bool {
        matches!(
            self,
            Self::RemoveCache
                | Self::RemoveFromRoomCache
                | Self::RemoveFromRoomCacheForActorsLeft
                | Self::SliceIncreaseIndex
                | Self::SliceSetIndex
                | Self::SlicePurgeIndex
                | Self::SlicePurgeUpToIndex
        )
    }
}

// ---------------------------------------------------------------------------
// Operation requests
// ---------------------------------------------------------------------------

/// CreateGame / JoinGame parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room_name: String,
    /// `ActorNr::NONE` allocates a new number; anything else asks to rejoin.
    #[serde(default)]
    pub actor_nr: ActorNr,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub join_mode: JoinMode,
    /// Seeds the room on creation; only compared on later joins.
    #[serde(default)]
    pub game_properties: PropertyMap,
    #[serde(default)]
    pub actor_properties: PropertyMap,
    /// Only honoured when the join creates the room.
    #[serde(default)]
    pub flags: RoomFlags,
    /// Milliseconds an actor stays inactive after disconnect. `< 0` keeps it
    /// forever, `0` removes it immediately.
    #[serde(default)]
    pub player_ttl: Option<i32>,
    /// Milliseconds an unreferenced room lingers before eviction.
    #[serde(default)]
    pub empty_room_ttl: Option<i32>,
    /// First room-cache slice to replay to this joiner.
    #[serde(default)]
    pub cache_slice: Option<u32>,
    #[serde(default)]
    pub lobby: Option<LobbyInfo>,
}

impl JoinRequest {
    pub fn new(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            ..Self::default()
        }
    }
}

/// Leave parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// Deactivate instead of removing (as if the peer disconnected).
    pub will_come_back: bool,
}

/// RaiseEvent parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RaiseEventRequest {
    pub code: u8,
    #[serde(default)]
    pub data: Hashtable,
    /// Explicit recipients. Duplicates are delivered once per entry.
    #[serde(default)]
    pub target_actors: Option<Vec<ActorNr>>,
    /// Interest group; 0 means "no group".
    #[serde(default)]
    pub interest_group: u8,
    #[serde(default)]
    pub receiver_group: ReceiverGroup,
    #[serde(default)]
    pub cache: EventCaching,
    /// Argument of `SliceSetIndex` / `SlicePurgeIndex` / `SlicePurgeUpToIndex`.
    #[serde(default)]
    pub cache_slice: Option<u32>,
}

/// SetProperties parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SetPropertiesRequest {
    /// `ActorNr::NONE` targets the room, anything else an actor.
    #[serde(default)]
    pub target_actor: ActorNr,
    pub properties: PropertyMap,
    /// CAS expectations; `Null` means "must be absent".
    #[serde(default)]
    pub expected: Option<PropertyMap>,
}

/// Which stores a GetProperties reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyTarget {
    Game,
    Actors,
    #[default]
    Both,
}

/// GetProperties parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetPropertiesRequest {
    #[serde(default)]
    pub target: PropertyTarget,
    /// Restrict actor properties to these actors (all when `None`).
    #[serde(default)]
    pub actor_numbers: Option<Vec<ActorNr>>,
    /// Restrict game properties to these keys (all when `None`).
    #[serde(default)]
    pub game_keys: Option<Vec<PropertyKey>>,
    /// Restrict actor properties to these keys (all when `None`).
    #[serde(default)]
    pub actor_keys: Option<Vec<PropertyKey>>,
}

/// ChangeGroups parameters.
///
/// `remove: Some(vec![])` leaves every group, `add: Some(vec![])` joins every
/// existing group. Group 0 is reserved and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeGroupsRequest {
    #[serde(default)]
    pub remove: Option<Vec<u8>>,
    #[serde(default)]
    pub add: Option<Vec<u8>>,
}

/// Identifies an operation in logs and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCode {
    CreateGame,
    JoinGame,
    Leave,
    RaiseEvent,
    SetProperties,
    GetProperties,
    ChangeGroups,
    DebugGame,
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A parsed client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum Operation {
    CreateGame(JoinRequest),
    JoinGame(JoinRequest),
    Leave(LeaveRequest),
    RaiseEvent(RaiseEventRequest),
    SetProperties(SetPropertiesRequest),
    GetProperties(GetPropertiesRequest),
    ChangeGroups(ChangeGroupsRequest),
    DebugGame,
}

impl Operation {
    pub fn code(&self) -> OperationCode {
        match self {
            Self::CreateGame(_) => OperationCode::CreateGame,
            Self::JoinGame(_) => OperationCode::JoinGame,
            Self::Leave(_) => OperationCode::Leave,
            Self::RaiseEvent(_) => OperationCode::RaiseEvent,
            Self::SetProperties(_) => OperationCode::SetProperties,
            Self::GetProperties(_) => OperationCode::GetProperties,
            Self::ChangeGroups(_) => OperationCode::ChangeGroups,
            Self::DebugGame => OperationCode::DebugGame,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Sent to a joiner once it has been admitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    pub actor_nr: ActorNr,
    pub game_properties: PropertyMap,
    /// Properties of every actor (active and inactive), unless the room
    /// suppresses player info.
    pub actor_properties: BTreeMap<ActorNr, PropertyMap>,
    /// Active actor numbers, ascending.
    pub actor_list: Vec<ActorNr>,
    /// `true` if this join re-attached an inactive actor.
    pub rejoined: bool,
}

/// Result of a GetProperties operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertiesResponse {
    pub game_properties: Option<PropertyMap>,
    pub actor_properties: BTreeMap<ActorNr, PropertyMap>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event delivered to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    /// An actor joined (or rejoined).
    Join {
        actor_nr: ActorNr,
        actor_list: Vec<ActorNr>,
        actor_properties: Option<PropertyMap>,
    },
    /// An actor left or became inactive.
    Leave {
        actor_nr: ActorNr,
        actor_list: Vec<ActorNr>,
        is_inactive: bool,
        /// Set when the departing actor was master.
        master_client_id: Option<ActorNr>,
    },
    /// Properties of the room (`target_actor_nr == 0`) or an actor changed.
    PropertiesChanged {
        target_actor_nr: ActorNr,
        sender_actor_nr: ActorNr,
        properties: PropertyMap,
    },
    /// The room cache moved to another slice.
    CacheSliceChanged { slice: u32 },
    /// A room-level error every peer should know about.
    ErrorInfo { message: String },
    /// A custom event raised by an actor (or replayed from a cache).
    Custom {
        code: u8,
        data: Hashtable,
        sender: ActorNr,
    },
}

impl RoomEvent {
    /// The numeric event code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Join { .. } => 255,
            Self::Leave { .. } => 254,
            Self::PropertiesChanged { .. } => 253,
            Self::ErrorInfo { .. } => 251,
            Self::CacheSliceChanged { .. } => 250,
            Self::Custom { code, .. } => *code,
        }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Caller-facing result code of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    InternalServerError,
    OperationInvalid,
    NotJoined,
    GameIdAlreadyExists,
    GameFull,
    GameClosed,
    GameDoesNotExist,
    PluginReportedError,
    PluginTimeout,
    JoinFailedPeerAlreadyJoined,
    JoinFailedFoundInactiveJoiner,
    JoinFailedWithRejoinerNotFound,
    JoinFailedFoundExcludedUserId,
    JoinFailedFoundActiveJoiner,
    CasMismatch,
    PropertiesTooLarge,
    SliceDoesNotExist,
}

impl ErrorCode {
    /// The numeric value sent to clients.
    pub fn value(self) -> i16 {
        match self {
            Self::Ok => 0,
            Self::InternalServerError => -1,
            Self::OperationInvalid => -2,
            Self::NotJoined => -3,
            Self::GameIdAlreadyExists => 32766,
            Self::GameFull => 32765,
            Self::GameClosed => 32764,
            Self::GameDoesNotExist => 32758,
            Self::PluginReportedError => 32752,
            Self::PluginTimeout => 32751,
            Self::JoinFailedPeerAlreadyJoined => 32750,
            Self::JoinFailedFoundInactiveJoiner => 32749,
            Self::JoinFailedWithRejoinerNotFound => 32748,
            Self::JoinFailedFoundExcludedUserId => 32747,
            Self::JoinFailedFoundActiveJoiner => 32746,
            Self::CasMismatch => 32745,
            Self::PropertiesTooLarge => 32744,
            Self::SliceDoesNotExist => 32743,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_nr_serializes_as_plain_number() {
        let json = serde_json::to_string(&ActorNr(7)).unwrap();
        assert_eq!(json, "7");
    }

    #[test]
    fn test_actor_nr_display_and_none() {
        assert_eq!(ActorNr(3).to_string(), "A-3");
        assert!(ActorNr::NONE.is_none());
        assert!(!ActorNr(1).is_none());
    }

    #[test]
    fn test_hashtable_keeps_key_types_through_json() {
        // Int(1) and Str("1") are different keys and must stay different.
        let table = Hashtable::new().with(1i64, "int").with("1", "str");
        let json = serde_json::to_string(&table).unwrap();
        let decoded: Hashtable = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get(&Key::Int(1)), Some(&Value::from("int")));
        assert_eq!(decoded.get(&Key::from("1")), Some(&Value::from("str")));
    }

    #[test]
    fn test_property_map_with_well_known_keys_survives_json() {
        let props = PropertyMap::new()
            .with(WellKnownKey::MaxPlayers, 4)
            .with("map", "forest");
        let bytes = serde_json::to_vec(&props).unwrap();
        let decoded: PropertyMap = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_well_known_codes_are_scoped() {
        assert_eq!(
            WellKnownKey::from_code(PropertyScope::Game, 255),
            Some(WellKnownKey::MaxPlayers)
        );
        assert_eq!(
            WellKnownKey::from_code(PropertyScope::Actor, 255),
            Some(WellKnownKey::Nickname)
        );
        assert_eq!(WellKnownKey::from_code(PropertyScope::Actor, 248), None);
    }

    #[test]
    fn test_value_approx_size_grows_with_content() {
        let small = Value::from("a");
        let large = Value::from("a".repeat(100));
        assert!(large.approx_size() > small.approx_size());

        let nested = Value::Table(Hashtable::new().with(1i64, large.clone()));
        assert!(nested.approx_size() > large.approx_size());
    }

    #[test]
    fn test_event_caching_cache_only_ops() {
        assert!(EventCaching::SliceIncreaseIndex.is_cache_only());
        assert!(EventCaching::RemoveFromRoomCache.is_cache_only());
        assert!(EventCaching::RemoveCache.is_cache_only());
        assert!(!EventCaching::AddToRoomCache.is_cache_only());
        assert!(!EventCaching::MergeCache.is_cache_only());
    }

    #[test]
    fn test_join_mode_allows_rejoin() {
        assert!(JoinMode::RejoinOnly.allows_rejoin());
        assert!(JoinMode::RejoinOrJoin.allows_rejoin());
        assert!(!JoinMode::Default.allows_rejoin());
        assert!(!JoinMode::CreateIfNotExists.allows_rejoin());
    }

    #[test]
    fn test_operation_json_is_adjacently_tagged() {
        let op = Operation::Leave(LeaveRequest { will_come_back: true });
        let json: serde_json::Value = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "Leave");
        assert_eq!(json["params"]["will_come_back"], true);
        assert_eq!(op.code(), OperationCode::Leave);
    }

    #[test]
    fn test_room_event_codes() {
        let leave = RoomEvent::Leave {
            actor_nr: ActorNr(1),
            actor_list: vec![],
            is_inactive: false,
            master_client_id: None,
        };
        assert_eq!(leave.code(), 254);
        let custom = RoomEvent::Custom {
            code: 7,
            data: Hashtable::new(),
            sender: ActorNr(1),
        };
        assert_eq!(custom.code(), 7);
    }

    #[test]
    fn test_error_code_values_are_distinct() {
        let all = [
            ErrorCode::Ok,
            ErrorCode::InternalServerError,
            ErrorCode::OperationInvalid,
            ErrorCode::NotJoined,
            ErrorCode::GameIdAlreadyExists,
            ErrorCode::GameFull,
            ErrorCode::GameClosed,
            ErrorCode::GameDoesNotExist,
            ErrorCode::PluginReportedError,
            ErrorCode::PluginTimeout,
            ErrorCode::JoinFailedPeerAlreadyJoined,
            ErrorCode::JoinFailedFoundInactiveJoiner,
            ErrorCode::JoinFailedWithRejoinerNotFound,
            ErrorCode::JoinFailedFoundExcludedUserId,
            ErrorCode::JoinFailedFoundActiveJoiner,
            ErrorCode::CasMismatch,
            ErrorCode::PropertiesTooLarge,
            ErrorCode::SliceDoesNotExist,
        ];
        let mut values: Vec<i16> = all.iter().map(|c| c.value()).collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), all.len());
        assert!(ErrorCode::Ok.is_ok());
        assert!(!ErrorCode::GameFull.is_ok());
    }
}
