//! Room engine: the synchronous operations of one room.
//!
//! Everything here runs on the room task, one operation at a time, and
//! never awaits. Hook consultation and timers live in [`crate::room`]; the
//! engine only asks for a timer through [`ActorTimers`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tavern_protocol::{
    ActorNr, ChangeGroupsRequest, EventCaching, GetPropertiesRequest, LeaveRequest, PeerId,
    PropertyKey, PropertyMap, PropertyScope, PropertyTarget, PropertiesResponse,
    RaiseEventRequest, ReceiverGroup, RoomEvent, RoomFlags, SetPropertiesRequest, Value,
    WellKnownKey,
};
use tokio::task::AbortHandle;

use crate::event_cache::{CacheOutcome, CachedEvent};
use crate::properties::{strip_keys, validate_well_known};
use crate::state::unix_time_ms;
use crate::{
    ExcludedUser, GameState, HookContext, LobbySnapshot, PropertyStore, RoomError, RoomHook,
    RoomLimits, SerializableGameState,
};

/// Schedules inactivity timers for a room.
pub(crate) trait ActorTimers: Send + Sync {
    /// Arranges for `ExpireActor { actor_nr, generation }` to reach the room
    /// after `after`. Returns a handle that cancels it.
    fn schedule_expiry(&self, actor_nr: ActorNr, generation: u64, after: Duration)
    -> Option<AbortHandle>;
}

/// A snapshot of room metadata (not the full state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub name: String,
    pub active_actors: usize,
    pub inactive_actors: usize,
    pub max_players: u8,
    pub is_open: bool,
    pub is_visible: bool,
    pub master_client_id: ActorNr,
    /// How long the room lingers once nobody references it.
    pub empty_room_ttl: Duration,
}

/// One actor in a [`RoomDebugInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorDebugInfo {
    pub actor_nr: ActorNr,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    pub groups: Vec<u8>,
    pub join_time_ms: u64,
    pub deactivation_time_ms: Option<u64>,
    pub deactivation_reason: Option<String>,
}

/// Answer to DebugGame: the room's bookkeeping, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomDebugInfo {
    pub room_name: String,
    pub active_actors: Vec<ActorDebugInfo>,
    pub inactive_actors: Vec<ActorDebugInfo>,
    pub master_client_id: ActorNr,
    pub flags: RoomFlags,
    pub is_open: bool,
    pub current_slice: u32,
    pub cache_slices: Vec<u32>,
    pub cached_events: usize,
    pub actor_cache_entries: usize,
    pub cache_discarded: bool,
    pub excluded: Vec<ExcludedUser>,
}

/// The state of one room plus the operations on it.
pub(crate) struct Room {
    pub(crate) state: GameState,
    pub(crate) limits: RoomLimits,
    pub(crate) hook: Arc<dyn RoomHook>,
    timers: Box<dyn ActorTimers>,
}

impl Room {
    pub(crate) fn new(
        name: impl Into<String>,
        limits: RoomLimits,
        hook: Arc<dyn RoomHook>,
        timers: Box<dyn ActorTimers>,
    ) -> Self {
        Self {
            state: GameState::new(name, &limits),
            limits,
            hook,
            timers,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.state.name()
    }

    pub(crate) fn context(&self, actor_nr: ActorNr) -> HookContext<'_> {
        HookContext {
            room_name: self.state.name(),
            actor_nr,
            active_actors: self.state.actors.active_count(),
        }
    }

    /// The actor owned by `peer_id`.
    pub(crate) fn actor_of(&self, peer_id: PeerId) -> Result<ActorNr, RoomError> {
        self.state
            .actors
            .by_peer(peer_id)
            .ok_or(RoomError::NotJoined(peer_id))
    }

    // -----------------------------------------------------------------------
    // Leave / disconnect / expiry
    // -----------------------------------------------------------------------

    pub(crate) fn leave(&mut self, peer_id: PeerId, request: LeaveRequest) -> Result<(), RoomError> {
        let actor_nr = self.actor_of(peer_id)?;
        if request.will_come_back && self.state.properties.player_ttl() != 0 {
            self.deactivate_actor(actor_nr, "left, will come back");
        } else {
            self.remove_actor(actor_nr, "left");
        }
        Ok(())
    }

    /// The peer's connection is gone. Returns `false` if it had no actor.
    pub(crate) fn disconnect(&mut self, peer_id: PeerId) -> bool {
        match self.state.actors.by_peer(peer_id) {
            Some(actor_nr) => {
                self.deactivate_actor(actor_nr, "disconnected");
                true
            }
            None => false,
        }
    }

    /// Makes an actor inactive, or removes it when player TTL is 0.
    pub(crate) fn deactivate_actor(&mut self, actor_nr: ActorNr, reason: &str) {
        let ttl = self.state.properties.player_ttl();
        if ttl == 0 {
            self.remove_actor(actor_nr, reason);
            return;
        }
        if !self.state.actors.deactivate(actor_nr, reason, unix_time_ms()) {
            return;
        }
        self.state.groups.remove_actor(actor_nr);
        if let Ok(ms) = u64::try_from(ttl) {
            self.schedule_cleanup(actor_nr, Duration::from_millis(ms));
        }

        let master = self.update_master(Some(actor_nr));
        self.publish_leave(actor_nr, true, master);
        self.hook.on_leave(self.state.name(), actor_nr, true);
        tracing::info!(
            room = %self.state.name(),
            actor = %actor_nr,
            reason,
            player_ttl_ms = ttl,
            "actor deactivated"
        );
    }

    /// Removes an actor for good. Returns `false` if it was unknown.
    pub(crate) fn remove_actor(&mut self, actor_nr: ActorNr, reason: &str) -> bool {
        let Some(actor) = self.state.actors.remove(actor_nr) else {
            tracing::warn!(
                room = %self.state.name(),
                actor = %actor_nr,
                "remove of unknown actor ignored"
            );
            return false;
        };
        self.state.groups.remove_actor(actor_nr);
        if self.state.flags.delete_cache_on_leave {
            self.state.actor_cache.remove_actor(actor_nr);
            self.state.room_cache.remove_actor_events(actor_nr);
        }
        drop(actor);

        let master = self.update_master(Some(actor_nr));
        self.publish_leave(actor_nr, false, master);
        self.hook.on_leave(self.state.name(), actor_nr, false);
        tracing::info!(
            room = %self.state.name(),
            actor = %actor_nr,
            reason,
            remaining = self.state.actors.active_count(),
            "actor removed"
        );
        true
    }

    fn schedule_cleanup(&mut self, actor_nr: ActorNr, after: Duration) {
        let generation = self.state.actors.next_timer_generation();
        let handle = self.timers.schedule_expiry(actor_nr, generation, after);
        self.state.actors.set_cleanup(actor_nr, generation, handle);
    }

    /// An inactivity timer fired.
    pub(crate) fn expire_actor(&mut self, actor_nr: ActorNr, generation: u64) {
        if !self.state.actors.is_current_timer(actor_nr, generation) {
            tracing::debug!(
                room = %self.state.name(),
                actor = %actor_nr,
                generation,
                "stale inactivity timer ignored"
            );
            return;
        }
        self.remove_actor(actor_nr, "player TTL expired");
    }

    /// Bans a user id and removes its actor if it has one.
    pub(crate) fn exclude(&mut self, user_id: &str, reason: &str) -> Result<Option<ActorNr>, RoomError> {
        if user_id.is_empty() {
            return Err(RoomError::InvalidOperation("cannot exclude an empty user id".into()));
        }
        if self.state.actors.exclude(user_id, reason) {
            tracing::info!(room = %self.state.name(), user_id, reason, "user excluded");
        }
        let Some(actor_nr) = self.state.actors.find_by_user(user_id) else {
            return Ok(None);
        };
        if let Some(actor) = self.state.actors.active(actor_nr) {
            actor.send(RoomEvent::ErrorInfo {
                message: format!("excluded from room: {reason}"),
            });
        }
        self.remove_actor(actor_nr, "excluded");
        Ok(Some(actor_nr))
    }

    // -----------------------------------------------------------------------
    // Master election
    // -----------------------------------------------------------------------

    /// Re-elects the master if it departed or none is set. Returns the new
    /// master when it changed.
    pub(crate) fn update_master(&mut self, departed: Option<ActorNr>) -> Option<ActorNr> {
        let current = self.state.properties.master_client_id();
        let needs_election = current.is_none()
            || departed == Some(current)
            || !self.state.actors.is_active(current);
        if !needs_election {
            return None;
        }
        let next = self.state.actors.lowest_active();
        if next == current {
            return None;
        }
        self.state.properties.set_master_client_id(next);
        tracing::debug!(
            room = %self.state.name(),
            from = %current,
            to = %next,
            "master client changed"
        );
        Some(next)
    }

    // -----------------------------------------------------------------------
    // RaiseEvent
    // -----------------------------------------------------------------------

    pub(crate) fn raise_event(
        &mut self,
        peer_id: PeerId,
        request: &RaiseEventRequest,
    ) -> Result<(), RoomError> {
        let sender = self.actor_of(peer_id)?;
        let code = request.code;

        match request.cache {
            EventCaching::DoNotCache => {}
            EventCaching::MergeCache => {
                let outcome = self.state.actor_cache.merge(sender, code, &request.data);
                self.after_cache(outcome);
            }
            EventCaching::ReplaceCache => {
                let outcome = self.state.actor_cache.replace(sender, code, &request.data);
                self.after_cache(outcome);
            }
            EventCaching::RemoveCache => {
                self.state.actor_cache.remove_cache(sender, code);
            }
            EventCaching::AddToRoomCache | EventCaching::AddToRoomCacheGlobal => {
                if request.target_actors.is_some() || request.interest_group != 0 {
                    tracing::debug!(
                        room = %self.state.name(),
                        actor = %sender,
                        code,
                        "explicitly addressed event is not added to the room cache"
                    );
                } else {
                    let owner = if request.cache == EventCaching::AddToRoomCacheGlobal {
                        ActorNr::NONE
                    } else {
                        sender
                    };
                    let outcome = self.state.room_cache.add_event_to_current_slice(CachedEvent {
                        actor_nr: owner,
                        code,
                        data: request.data.clone(),
                    });
                    self.after_cache(outcome);
                }
            }
            EventCaching::RemoveFromRoomCache => {
                let code_filter = (code != 0).then_some(code);
                let data_filter = (!request.data.is_empty()).then_some(&request.data);
                let removed = self.state.room_cache.remove_events(
                    request.target_actors.as_deref(),
                    code_filter,
                    data_filter,
                );
                tracing::debug!(room = %self.state.name(), removed, "room cache events removed");
            }
            EventCaching::RemoveFromRoomCacheForActorsLeft => {
                let actors = &self.state.actors;
                let removed = self
                    .state
                    .room_cache
                    .remove_events_of_departed(|nr| actors.get(nr).is_some());
                tracing::debug!(
                    room = %self.state.name(),
                    removed,
                    "room cache events of departed actors removed"
                );
            }
            EventCaching::SliceIncreaseIndex => {
                let slice = self.state.room_cache.slice_increase_index();
                self.broadcast_all(&RoomEvent::CacheSliceChanged { slice });
            }
            EventCaching::SliceSetIndex => {
                let slice = slice_argument(request)?;
                if self.state.room_cache.slice_set_index(slice)? {
                    self.broadcast_all(&RoomEvent::CacheSliceChanged { slice });
                }
            }
            EventCaching::SlicePurgeIndex => {
                self.state.room_cache.slice_purge_index(slice_argument(request)?)?;
            }
            EventCaching::SlicePurgeUpToIndex => {
                self.state
                    .room_cache
                    .slice_purge_up_to_index(slice_argument(request)?)?;
            }
        }

        if !request.cache.is_cache_only() {
            self.dispatch(sender, request);
        }
        Ok(())
    }

    fn after_cache(&mut self, outcome: CacheOutcome) {
        if outcome == CacheOutcome::Discarded {
            tracing::warn!(room = %self.state.name(), "event cache discarded, closing room");
            self.force_close("room closed: event cache discarded");
        }
    }

    /// Delivers a custom event to its recipients.
    fn dispatch(&self, sender: ActorNr, request: &RaiseEventRequest) {
        let event = RoomEvent::Custom {
            code: request.code,
            data: request.data.clone(),
            sender,
        };
        for actor_nr in self.recipients(sender, request) {
            if let Some(actor) = self.state.actors.active(actor_nr) {
                actor.send(event.clone());
            }
        }
    }

    /// Explicit targets win over an interest group, which wins over the
    /// receiver group.
    pub(crate) fn recipients(&self, sender: ActorNr, request: &RaiseEventRequest) -> Vec<ActorNr> {
        if let Some(targets) = &request.target_actors {
            return targets.clone();
        }
        if request.interest_group != 0 {
            return self
                .state
                .groups
                .members(request.interest_group)
                .filter(|nr| *nr != sender)
                .collect();
        }
        match request.receiver_group {
            ReceiverGroup::All => self.state.actors.active_numbers(),
            ReceiverGroup::Others => self
                .state
                .actors
                .active_numbers()
                .into_iter()
                .filter(|nr| *nr != sender)
                .collect(),
            ReceiverGroup::MasterClient => {
                let master = self.state.properties.master_client_id();
                if master.is_none() {
                    Vec::new()
                } else {
                    vec![master]
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    pub(crate) fn set_properties(
        &mut self,
        peer_id: PeerId,
        request: &SetPropertiesRequest,
    ) -> Result<(), RoomError> {
        let sender = self.actor_of(peer_id)?;
        let target = request.target_actor;
        let mut props = request.properties.clone();

        if target.is_none() {
            validate_well_known(&props, PropertyScope::Game)?;
            if props.contains_key(&WellKnownKey::MasterClientId.into()) {
                return Err(RoomError::InvalidOperation(
                    "MasterClientId is assigned by the server".into(),
                ));
            }
            let stripped = strip_keys(&mut props, &[WellKnownKey::PlayerTtl, WellKnownKey::EmptyRoomTtl]);
            if stripped > 0 {
                tracing::debug!(
                    room = %self.state.name(),
                    actor = %sender,
                    "TTL properties are fixed after creation, ignored"
                );
            }
        } else {
            if self.state.actors.get(target).is_none() {
                return Err(RoomError::InvalidOperation(format!("actor {target} does not exist")));
            }
            validate_well_known(&props, PropertyScope::Actor)?;
            strip_keys(&mut props, &[WellKnownKey::IsInactive, WellKnownKey::UserId]);
        }

        let expected = request.expected.as_ref();
        let changed = self.apply_properties(target, &props, expected)?;
        if changed.is_empty() {
            return Ok(());
        }

        let touches_lobby = target.is_none() && self.touches_lobby(&changed);
        let event = RoomEvent::PropertiesChanged {
            target_actor_nr: target,
            sender_actor_nr: sender,
            properties: changed,
        };
        if expected.is_some() || self.state.flags.broadcast_props_change_to_all {
            self.broadcast_all(&event);
        } else {
            self.broadcast_except(sender, &event);
        }
        if touches_lobby {
            self.notify_lobby();
        }
        Ok(())
    }

    fn store(&self, target: ActorNr) -> Option<&PropertyStore> {
        if target.is_none() {
            Some(&self.state.properties)
        } else {
            self.state.actors.get(target).map(|a| &a.properties)
        }
    }

    fn store_mut(&mut self, target: ActorNr) -> Option<&mut PropertyStore> {
        if target.is_none() {
            Some(&mut self.state.properties)
        } else {
            self.state.actors.get_mut(target).map(|a| &mut a.properties)
        }
    }

    /// Applies an update on a copy, checks the quota, then commits.
    pub(crate) fn apply_properties(
        &mut self,
        target: ActorNr,
        props: &PropertyMap,
        expected: Option<&PropertyMap>,
    ) -> Result<PropertyMap, RoomError> {
        let delete_nulls = self.state.flags.delete_null_properties;
        let current = self
            .store(target)
            .ok_or_else(|| RoomError::InvalidOperation(format!("actor {target} does not exist")))?;
        let mut candidate = current.clone();
        let changed = candidate.set_properties(props, expected, delete_nulls)?;

        let limit = self.limits.max_properties_size;
        let size = self.state.total_properties_size() - current.total_size() + candidate.total_size();
        if size > limit {
            tracing::warn!(
                room = %self.state.name(),
                size,
                limit,
                "property update exceeds quota"
            );
            self.force_close("room closed: properties exceed quota");
            return Err(RoomError::PropertiesTooLarge { size, limit });
        }

        if let Some(store) = self.store_mut(target) {
            *store = candidate;
        }
        Ok(changed)
    }

    /// Closes the room the way a client would (CAS on IsOpen), then tells
    /// everyone why.
    pub(crate) fn force_close(&mut self, message: &str) {
        if self.state.properties.is_open() {
            let key = PropertyKey::from(WellKnownKey::IsOpen);
            let stored = self.state.properties.get(&key).cloned().unwrap_or(Value::Null);
            let expected = PropertyMap::new().with(key.clone(), stored);
            let update = PropertyMap::new().with(key, false);
            match self.state.properties.set_properties(&update, Some(&expected), false) {
                Ok(changed) if !changed.is_empty() => {
                    self.broadcast_all(&RoomEvent::PropertiesChanged {
                        target_actor_nr: ActorNr::NONE,
                        sender_actor_nr: ActorNr::NONE,
                        properties: changed,
                    });
                    self.notify_lobby();
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(room = %self.state.name(), %err, "force close failed");
                }
            }
        }
        self.broadcast_all(&RoomEvent::ErrorInfo {
            message: message.to_string(),
        });
    }

    pub(crate) fn get_properties(
        &self,
        peer_id: PeerId,
        request: &GetPropertiesRequest,
    ) -> Result<PropertiesResponse, RoomError> {
        let me = self.actor_of(peer_id)?;
        let mut response = PropertiesResponse::default();

        if request.target != PropertyTarget::Actors {
            response.game_properties =
                Some(self.state.properties.filtered(request.game_keys.as_deref()));
        }
        if request.target != PropertyTarget::Game {
            let publish = self.state.flags.publish_user_id;
            let actors: Vec<_> = match &request.actor_numbers {
                Some(numbers) => numbers
                    .iter()
                    .filter_map(|nr| self.state.actors.get(*nr))
                    .collect(),
                None => self.state.actors.all_actors().collect(),
            };
            for actor in actors {
                let mut props = actor.public_properties(publish || actor.actor_nr() == me);
                if let Some(keys) = &request.actor_keys {
                    props.retain(|k, _| keys.contains(k));
                }
                response.actor_properties.insert(actor.actor_nr(), props);
            }
        }
        Ok(response)
    }

    fn touches_lobby(&self, changed: &PropertyMap) -> bool {
        let listed = self.state.properties.lobby_properties();
        changed.keys().any(|key| match key {
            PropertyKey::WellKnown(k) => matches!(
                k,
                WellKnownKey::IsOpen
                    | WellKnownKey::IsVisible
                    | WellKnownKey::MaxPlayers
                    | WellKnownKey::LobbyProperties
                    | WellKnownKey::ExpectedUsers
            ),
            PropertyKey::Custom(name) => listed.contains(name),
        })
    }

    pub(crate) fn lobby_snapshot(&self) -> LobbySnapshot {
        let props = &self.state.properties;
        LobbySnapshot {
            room_name: self.state.name().to_string(),
            lobby: self.state.lobby.clone(),
            is_open: props.is_open(),
            is_visible: props.is_visible(),
            max_players: props.max_players(),
            player_count: self.state.actors.active_count(),
            properties: self.state.lobby_visible_properties(),
        }
    }

    pub(crate) fn notify_lobby(&self) {
        self.hook.on_lobby_update(&self.lobby_snapshot());
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub(crate) fn change_groups(
        &mut self,
        peer_id: PeerId,
        request: &ChangeGroupsRequest,
    ) -> Result<(), RoomError> {
        let actor_nr = self.actor_of(peer_id)?;
        let existing = self.state.groups.group_ids();
        let Some(actor) = self.state.actors.get_mut(actor_nr) else {
            return Err(RoomError::Internal(format!("actor {actor_nr} vanished")));
        };

        if let Some(remove) = &request.remove {
            let ids: Vec<u8> = if remove.is_empty() {
                actor.groups().iter().copied().collect()
            } else {
                remove.clone()
            };
            for group in ids {
                actor.groups_mut().remove(&group);
                self.state.groups.remove(group, actor_nr);
            }
        }
        if let Some(add) = &request.add {
            let ids = if add.is_empty() { existing } else { add.clone() };
            for group in ids.into_iter().filter(|g| *g != 0) {
                actor.groups_mut().insert(group);
                self.state.groups.add(group, actor_nr);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Delivery helpers
    // -----------------------------------------------------------------------

    pub(crate) fn broadcast_all(&self, event: &RoomEvent) {
        for actor in self.state.actors.active_actors() {
            actor.send(event.clone());
        }
    }

    fn broadcast_except(&self, except: ActorNr, event: &RoomEvent) {
        for actor in self.state.actors.active_actors() {
            if actor.actor_nr() != except {
                actor.send(event.clone());
            }
        }
    }

    pub(crate) fn send_to(&self, actor_nr: ActorNr, event: RoomEvent) {
        if let Some(actor) = self.state.actors.active(actor_nr) {
            actor.send(event);
        }
    }

    fn publish_leave(&self, actor_nr: ActorNr, is_inactive: bool, master: Option<ActorNr>) {
        if self.state.flags.suppress_room_events {
            return;
        }
        self.broadcast_all(&RoomEvent::Leave {
            actor_nr,
            actor_list: self.state.actors.active_numbers(),
            is_inactive,
            master_client_id: master,
        });
    }

    // -----------------------------------------------------------------------
    // Persistence and inspection
    // -----------------------------------------------------------------------

    pub(crate) fn serializable_state(&self) -> Result<SerializableGameState, RoomError> {
        self.state.to_serializable()
    }

    /// Loads a frozen room and re-arms inactivity timers from the recorded
    /// deactivation times.
    pub(crate) fn set_state(&mut self, record: SerializableGameState) -> Result<(), RoomError> {
        let now = unix_time_ms();
        self.state.restore(record, now)?;

        let ttl = self.state.properties.player_ttl();
        let inactive: Vec<(ActorNr, u64)> = self
            .state
            .actors
            .inactive_actors()
            .map(|a| (a.actor_nr(), a.deactivation_time_ms.unwrap_or(now)))
            .collect();
        let mut expired = Vec::new();
        if ttl == 0 {
            expired.extend(inactive.iter().map(|(nr, _)| *nr));
        } else if let Ok(ttl) = u64::try_from(ttl) {
            for (actor_nr, since) in &inactive {
                let remaining = ttl.saturating_sub(now.saturating_sub(*since));
                if remaining == 0 {
                    expired.push(*actor_nr);
                } else {
                    self.schedule_cleanup(*actor_nr, Duration::from_millis(remaining));
                }
            }
        }
        for actor_nr in expired {
            self.remove_actor(actor_nr, "player TTL expired while stored");
        }

        tracing::info!(
            room = %self.state.name(),
            actors = self.state.actors.inactive_count(),
            "room state restored"
        );
        Ok(())
    }

    pub(crate) fn info(&self) -> RoomInfo {
        let props = &self.state.properties;
        let empty_room_ttl = props
            .get_well_known(WellKnownKey::EmptyRoomTtl)
            .and_then(Value::as_int)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.limits.default_empty_room_ttl());
        RoomInfo {
            name: self.state.name().to_string(),
            active_actors: self.state.actors.active_count(),
            inactive_actors: self.state.actors.inactive_count(),
            max_players: props.max_players(),
            is_open: props.is_open(),
            is_visible: props.is_visible(),
            master_client_id: props.master_client_id(),
            empty_room_ttl,
        }
    }

    pub(crate) fn debug_info(&self) -> RoomDebugInfo {
        let describe = |a: &crate::Actor| ActorDebugInfo {
            actor_nr: a.actor_nr(),
            user_id: a.user_id().map(str::to_string),
            nickname: a.nickname().map(str::to_string),
            groups: a.groups().iter().copied().collect(),
            join_time_ms: a.join_time_ms,
            deactivation_time_ms: a.deactivation_time_ms,
            deactivation_reason: a.deactivation_reason.clone(),
        };
        RoomDebugInfo {
            room_name: self.state.name().to_string(),
            active_actors: self.state.actors.active_actors().map(describe).collect(),
            inactive_actors: self.state.actors.inactive_actors().map(describe).collect(),
            master_client_id: self.state.properties.master_client_id(),
            flags: self.state.flags,
            is_open: self.state.properties.is_open(),
            current_slice: self.state.room_cache.current_slice(),
            cache_slices: self.state.room_cache.slice_indices(),
            cached_events: self.state.room_cache.total_events(),
            actor_cache_entries: self.state.actor_cache.total_entries(),
            cache_discarded: self.state.cache_discarded(),
            excluded: self.state.actors.excluded().to_vec(),
        }
    }

    /// Stops all timers and hands the final state to the hook.
    pub(crate) fn close(&mut self) {
        self.state.actors.cancel_all_timers();
        if !self.state.exists() {
            return;
        }
        match self.state.to_serializable() {
            Ok(state) => self.hook.on_close(self.state.name(), &state),
            Err(err) => tracing::warn!(
                room = %self.state.name(),
                %err,
                "could not freeze room state on close"
            ),
        }
    }
}

fn slice_argument(request: &RaiseEventRequest) -> Result<u32, RoomError> {
    request.cache_slice.ok_or_else(|| {
        RoomError::InvalidOperation(format!("{:?} needs a cache slice", request.cache))
    })
}
