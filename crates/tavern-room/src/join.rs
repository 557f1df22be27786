//! The join pipeline.
//!
//! A join walks the [`JoinStage`]s in order. Everything that can fail runs
//! before `AddingActor` commits the actor, so a rejected join leaves the
//! room untouched.
//!
//! The same pipeline serves three cases:
//!
//! - **Create**: the room has never had an actor. The request's game
//!   properties seed the room, and its flags and lobby become the room's.
//! - **Join**: a new actor number is allocated, subject to capacity.
//! - **Rejoin**: an inactive actor is reattached to the new peer and keeps
//!   its number, properties and groups. Capacity is not checked.
//!
//! Admission itself (number allocation, rejoin lookup, bans) lives in the
//! actor registry. This module sequences it with the room-level checks.

use tavern_protocol::{
    ActorNr, JoinMode, JoinRequest, JoinResponse, PeerId, PropertyMap, PropertyScope, RoomEvent,
    Value, WellKnownKey,
};

use crate::engine::Room;
use crate::properties::{strip_keys, validate_well_known};
use crate::state::unix_time_ms;
use crate::{AdmitPlan, AdmitRequest, JoinStage, PeerHandle, PropertyStore, RoomError};

/// Tracks which stage a join has reached.
///
/// Only used for sequencing and trace logging; a join that fails midway
/// simply drops it.
struct JoinProgress<'a> {
    room: &'a str,
    peer_id: PeerId,
    stage: JoinStage,
}

impl<'a> JoinProgress<'a> {
    fn new(room: &'a str, peer_id: PeerId) -> Self {
        Self {
            room,
            peer_id,
            stage: JoinStage::Connected,
        }
    }

    /// Moves to `target`, failing if the stage table forbids the step.
    fn advance(&mut self, target: JoinStage) -> Result<(), RoomError> {
        if !self.stage.can_transition_to(target) {
            return Err(RoomError::InvalidState(format!(
                "join cannot move from {} to {target}",
                self.stage
            )));
        }
        tracing::trace!(room = %self.room, peer = %self.peer_id, stage = %target, "join stage");
        self.stage = target;
        Ok(())
    }
}

impl Room {
    /// Admits `peer` to the room. `create` marks a CreateGame operation.
    ///
    /// The response goes back to the caller; Join events and cache replay
    /// go out through the peer channels before this returns.
    pub(crate) fn join(
        &mut self,
        peer: PeerHandle,
        request: &JoinRequest,
        create: bool,
    ) -> Result<JoinResponse, RoomError> {
        let name = self.state.name().to_string();
        let mut progress = JoinProgress::new(&name, peer.peer_id());

        // -- Decide create vs join ------------------------------------------
        progress.advance(JoinStage::CreatingOrLoadingGame)?;
        let creating = !self.state.exists();
        if creating && !create && request.join_mode != JoinMode::CreateIfNotExists {
            return Err(RoomError::GameDoesNotExist(name.clone()));
        }
        if !creating && create {
            return Err(RoomError::GameIdAlreadyExists(name.clone()));
        }

        // -- Validate parameters, nothing is written yet --------------------
        progress.advance(JoinStage::ConvertingParams)?;
        // The inactive flag and user id are server-owned.
        let mut actor_props = request.actor_properties.clone();
        validate_well_known(&actor_props, PropertyScope::Actor)?;
        strip_keys(&mut actor_props, &[WellKnownKey::IsInactive, WellKnownKey::UserId]);
        let seeds = if creating {
            Some(self.creation_seeds(request)?)
        } else {
            self.compare_game_params(request);
            None
        };
        self.check_join_quota(seeds.as_ref(), &actor_props, request)?;

        // A purged or never-created slice cannot be replayed.
        progress.advance(JoinStage::CheckingCacheSlice)?;
        if let Some(slice) = request.cache_slice {
            self.state.room_cache.ensure_slice(slice)?;
        }

        // -- Admit -----------------------------------------------------------
        progress.advance(JoinStage::AddingActor)?;
        let user_id = request.user_id.as_deref().filter(|u| !u.is_empty());
        let admit = AdmitRequest {
            peer_id: peer.peer_id(),
            actor_nr: request.actor_nr,
            user_id,
            join_mode: request.join_mode,
            check_user_on_join: self.state.flags.check_user_on_join,
            rejoin_supported: self.state.properties.player_ttl() != 0,
            cache_discarded: self.state.cache_discarded(),
        };
        // `resolve` only plans; the registry is not touched until `commit`.
        let plan = self.state.actors.resolve(&admit)?;
        // Rejoins skip the closed/full checks.
        if !creating && plan == AdmitPlan::NewActor {
            self.check_capacity(user_id)?;
        }
        if let Some(seeds) = seeds {
            self.state.properties = PropertyStore::from_map(seeds);
            self.state.flags = request.flags;
            self.state.lobby = request.lobby.clone().unwrap_or_default();
        }
        let (actor_nr, is_new) = self.state.actors.commit(
            plan,
            peer,
            user_id,
            request.nickname.as_deref(),
            unix_time_ms(),
        )?;

        // -- Actor committed, apply side effects -----------------------------
        progress.advance(JoinStage::CheckAfterJoinParams)?;
        if let Some(user_id) = user_id {
            self.consume_reservation(user_id);
        }
        // A rejoiner gets its old group memberships back.
        if !is_new {
            if let Some(actor) = self.state.actors.get(actor_nr) {
                for group in actor.groups() {
                    self.state.groups.add(*group, actor_nr);
                }
            }
        }
        self.update_master(None);

        progress.advance(JoinStage::ApplyActorProperties)?;
        if !actor_props.is_empty() {
            let delete_nulls = self.state.flags.delete_null_properties;
            if let Some(actor) = self.state.actors.get_mut(actor_nr) {
                actor.properties.set_properties(&actor_props, None, delete_nulls)?;
            }
        }

        progress.advance(JoinStage::BeforeJoinComplete)?;
        self.notify_lobby();

        // -- Respond and publish ---------------------------------------------
        progress.advance(JoinStage::GettingUserResponse)?;
        let response = self.join_response(actor_nr, !is_new);

        progress.advance(JoinStage::SendingUserResponse)?;
        progress.advance(JoinStage::PublishingEvents)?;
        self.publish_join(actor_nr, request.cache_slice);

        progress.advance(JoinStage::EventsPublished)?;
        progress.advance(JoinStage::Complete)?;
        tracing::info!(
            room = %name,
            actor = %actor_nr,
            rejoined = !is_new,
            created = creating,
            players = self.state.actors.active_count(),
            "actor joined"
        );
        Ok(response)
    }

    /// Room properties seeded by the creating join.
    ///
    /// A requested master id is dropped since the master is always elected.
    /// The TTL fields of the request override matching game properties, and
    /// the empty-room TTL must not exceed the configured maximum.
    fn creation_seeds(&self, request: &JoinRequest) -> Result<PropertyMap, RoomError> {
        let mut props = request.game_properties.clone();
        validate_well_known(&props, PropertyScope::Game)?;
        strip_keys(&mut props, &[WellKnownKey::MasterClientId]);

        if let Some(ttl) = request.player_ttl {
            props.insert(WellKnownKey::PlayerTtl, ttl);
        }
        if let Some(ttl) = request.empty_room_ttl {
            props.insert(WellKnownKey::EmptyRoomTtl, ttl);
        }
        let empty_ttl = props
            .get(&WellKnownKey::EmptyRoomTtl.into())
            .and_then(Value::as_int)
            .unwrap_or(0);
        let max = i64::try_from(self.limits.max_empty_room_ttl_ms).unwrap_or(i64::MAX);
        if !(0..=max).contains(&empty_ttl) {
            return Err(RoomError::InvalidOperation(format!(
                "empty room TTL {empty_ttl}ms outside 0..={max}ms"
            )));
        }
        Ok(props)
    }

    /// Later joins cannot change the room, but mismatches are worth a log.
    fn compare_game_params(&self, request: &JoinRequest) {
        for (key, value) in &request.game_properties {
            if key.well_known().is_none() {
                continue;
            }
            if self.state.properties.get(key) != Some(value) {
                tracing::debug!(
                    room = %self.state.name(),
                    key = %key,
                    "join parameter differs from room, ignored"
                );
            }
        }
    }

    /// Fails if the room's properties plus the joiner's would exceed
    /// `max_properties_size`.
    ///
    /// On create the seeds replace the (empty) room properties in the sum.
    /// User id and nickname are counted too, as they end up in the actor's
    /// property set.
    fn check_join_quota(
        &self,
        seeds: Option<&PropertyMap>,
        actor_props: &PropertyMap,
        request: &JoinRequest,
    ) -> Result<(), RoomError> {
        let identity = request.user_id.as_ref().map_or(0, |u| u.len() + 2)
            + request.nickname.as_ref().map_or(0, |n| n.len() + 2);
        let room_props = match seeds {
            Some(seeds) => seeds.approx_size(),
            None => self.state.properties.total_size(),
        };
        let actors: usize = self
            .state
            .actors
            .all_actors()
            .map(|a| a.properties.total_size())
            .sum();
        let size = room_props + actors + actor_props.approx_size() + identity;
        let limit = self.limits.max_properties_size;
        if size > limit {
            return Err(RoomError::PropertiesTooLarge { size, limit });
        }
        Ok(())
    }

    /// Fails if a new actor would not fit.
    ///
    /// Expected users hold a seat until they join, and never count against
    /// themselves.
    fn check_capacity(&self, user_id: Option<&str>) -> Result<(), RoomError> {
        let props = &self.state.properties;
        if !props.is_open() {
            return Err(RoomError::GameClosed {
                cache_discarded: self.state.cache_discarded(),
            });
        }
        let max = usize::from(props.max_players());
        if max == 0 {
            return Ok(());
        }
        let expected = props.expected_users();
        if user_id.is_some_and(|u| expected.iter().any(|e| e == u)) {
            return Ok(());
        }
        let reserved = expected
            .iter()
            .filter(|u| self.state.actors.find_by_user(u).is_none())
            .count();
        let occupied =
            self.state.actors.active_count() + self.state.actors.inactive_count() + reserved;
        if occupied >= max {
            return Err(RoomError::GameFull);
        }
        Ok(())
    }

    /// Removes `user_id` from the expected users list, if present. An empty
    /// list is deleted rather than stored.
    fn consume_reservation(&mut self, user_id: &str) {
        let mut expected = self.state.properties.expected_users();
        let before = expected.len();
        expected.retain(|u| u != user_id);
        if expected.len() == before {
            return;
        }
        if expected.is_empty() {
            self.state.properties.remove(&WellKnownKey::ExpectedUsers.into());
        } else {
            let list: Vec<Value> = expected.into_iter().map(Value::from).collect();
            self.state.properties.set(WellKnownKey::ExpectedUsers, list);
        }
    }

    /// Builds the joiner's response.
    ///
    /// With `suppress_player_info` set only the joiner's own properties are
    /// included. The joiner always sees its own user id.
    fn join_response(&self, actor_nr: ActorNr, rejoined: bool) -> JoinResponse {
        let publish = self.state.flags.publish_user_id;
        let actor_properties = self
            .state
            .actors
            .all_actors()
            .filter(|a| !self.state.flags.suppress_player_info || a.actor_nr() == actor_nr)
            .map(|a| (a.actor_nr(), a.public_properties(publish || a.actor_nr() == actor_nr)))
            .collect();
        JoinResponse {
            actor_nr,
            game_properties: self.state.properties.as_map().clone(),
            actor_properties,
            actor_list: self.state.actors.active_numbers(),
            rejoined,
        }
    }

    /// Announces the joiner, then replays both caches to it.
    ///
    /// Order matters: the Join event first, then the per-actor cache, then
    /// the room cache from `cache_slice` on. Replay goes to the joiner only.
    fn publish_join(&self, actor_nr: ActorNr, cache_slice: Option<u32>) {
        let flags = self.state.flags;
        if !flags.suppress_room_events {
            let actor_properties = if flags.suppress_player_info {
                None
            } else {
                self.state
                    .actors
                    .get(actor_nr)
                    .map(|a| a.public_properties(flags.publish_user_id))
            };
            self.broadcast_all(&RoomEvent::Join {
                actor_nr,
                actor_list: self.state.actors.active_numbers(),
                actor_properties,
            });
        }

        for event in self.state.actor_cache.replay() {
            self.send_to(actor_nr, event);
        }
        // The slice was checked before commit, so this replay only fails if
        // that check was skipped.
        match self.state.room_cache.replay(cache_slice) {
            Ok(events) => {
                for event in events {
                    self.send_to(actor_nr, event);
                }
            }
            Err(err) => tracing::warn!(
                room = %self.state.name(),
                actor = %actor_nr,
                %err,
                "room cache replay skipped"
            ),
        }
    }
}
