//! Actors of a room: active, inactive and excluded partitions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tavern_protocol::{ActorNr, JoinMode, PeerId, PropertyMap, RoomEvent, WellKnownKey};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::{PropertyStore, RoomError};

/// Channel sender for delivering events to a peer's connection.
pub type PeerSender = mpsc::UnboundedSender<RoomEvent>;

/// A connected peer as seen by a room: its id plus its event channel.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    peer_id: PeerId,
    sender: PeerSender,
}

impl PeerHandle {
    pub fn new(peer_id: PeerId, sender: PeerSender) -> Self {
        Self { peer_id, sender }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sends an event. Silently drops it if the connection is gone.
    pub fn send(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// One participant of a room.
#[derive(Debug)]
pub struct Actor {
    actor_nr: ActorNr,
    pub properties: PropertyStore,
    peer: Option<PeerHandle>,
    groups: BTreeSet<u8>,
    cleanup: Option<CleanupTimer>,
    pub join_time_ms: u64,
    pub deactivation_time_ms: Option<u64>,
    pub deactivation_reason: Option<String>,
}

#[derive(Debug)]
struct CleanupTimer {
    handle: Option<AbortHandle>,
    generation: u64,
}

impl Actor {
    pub fn new(actor_nr: ActorNr, user_id: Option<&str>, nickname: Option<&str>, now_ms: u64) -> Self {
        let mut properties = PropertyStore::new();
        if let Some(user_id) = user_id {
            properties.set(WellKnownKey::UserId, user_id);
        }
        if let Some(nickname) = nickname {
            properties.set(WellKnownKey::Nickname, nickname);
        }
        Self {
            actor_nr,
            properties,
            peer: None,
            groups: BTreeSet::new(),
            cleanup: None,
            join_time_ms: now_ms,
            deactivation_time_ms: None,
            deactivation_reason: None,
        }
    }

    pub fn actor_nr(&self) -> ActorNr {
        self.actor_nr
    }

    pub fn user_id(&self) -> Option<&str> {
        self.properties.user_id()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.properties.nickname()
    }

    pub fn peer(&self) -> Option<&PeerHandle> {
        self.peer.as_ref()
    }

    pub fn groups(&self) -> &BTreeSet<u8> {
        &self.groups
    }

    pub(crate) fn groups_mut(&mut self) -> &mut BTreeSet<u8> {
        &mut self.groups
    }

    /// Sends an event to this actor's peer, if it is connected.
    pub fn send(&self, event: RoomEvent) {
        if let Some(peer) = &self.peer {
            peer.send(event);
        }
    }

    /// The properties other actors may see.
    pub fn public_properties(&self, publish_user_id: bool) -> PropertyMap {
        let mut props = self.properties.as_map().clone();
        if !publish_user_id {
            props.remove(&WellKnownKey::UserId.into());
        }
        props
    }

    fn cancel_cleanup(&mut self) {
        if let Some(timer) = self.cleanup.take() {
            if let Some(handle) = timer.handle {
                handle.abort();
            }
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.cancel_cleanup();
    }
}

/// A banned user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedUser {
    pub user_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Inputs of an admission decision.
#[derive(Debug, Clone, Copy)]
pub struct AdmitRequest<'a> {
    pub peer_id: PeerId,
    pub actor_nr: ActorNr,
    pub user_id: Option<&'a str>,
    pub join_mode: JoinMode,
    pub check_user_on_join: bool,
    /// Player TTL is not 0.
    pub rejoin_supported: bool,
    pub cache_discarded: bool,
}

/// What admission decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitPlan {
    /// Allocate the next actor number.
    NewActor,
    /// Re-attach to this inactive actor.
    Rejoin(ActorNr),
}

// ---------------------------------------------------------------------------
// ActorRegistry
// ---------------------------------------------------------------------------

/// All actors of one room.
///
/// Actor numbers come from a monotonically increasing counter and are never
/// handed out twice, even after the actor is gone.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    active: BTreeMap<ActorNr, Actor>,
    inactive: BTreeMap<ActorNr, Actor>,
    excluded: Vec<ExcludedUser>,
    counter: i32,
    peers: HashMap<PeerId, ActorNr>,
    timer_generation: u64,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides how a joiner is admitted, without touching anything.
    pub fn resolve(&self, req: &AdmitRequest<'_>) -> Result<AdmitPlan, RoomError> {
        if let Some(actor_nr) = self.peers.get(&req.peer_id) {
            return Err(RoomError::AlreadyJoined(*actor_nr));
        }
        if let Some(user_id) = req.user_id {
            if let Some(ban) = self.excluded.iter().find(|e| e.user_id == user_id) {
                return Err(RoomError::Excluded {
                    user_id: ban.user_id.clone(),
                    reason: ban.reason.clone(),
                });
            }
        }

        if !req.actor_nr.is_none() {
            if self.active.contains_key(&req.actor_nr) {
                return Err(RoomError::AlreadyJoined(req.actor_nr));
            }
            if let Some(actor) = self.inactive.get(&req.actor_nr) {
                Self::check_rejoin(req)?;
                if let (Some(stored), Some(requested)) = (actor.user_id(), req.user_id) {
                    if stored != requested {
                        return Err(RoomError::RejoinerNotFound(format!(
                            "actor {} is reserved for another user",
                            req.actor_nr
                        )));
                    }
                }
                return Ok(AdmitPlan::Rejoin(req.actor_nr));
            }
            if req.join_mode != JoinMode::RejoinOrJoin {
                return Err(RoomError::RejoinerNotFound(format!(
                    "actor {} not found",
                    req.actor_nr
                )));
            }
        }

        if req.check_user_on_join {
            if let Some(user_id) = req.user_id {
                if self.active.values().any(|a| a.user_id() == Some(user_id)) {
                    return Err(RoomError::ActiveJoinerFound(user_id.to_string()));
                }
                if let Some(actor) = self.inactive.values().find(|a| a.user_id() == Some(user_id)) {
                    if !req.join_mode.allows_rejoin() {
                        return Err(RoomError::InactiveJoinerFound(user_id.to_string()));
                    }
                    Self::check_rejoin(req)?;
                    return Ok(AdmitPlan::Rejoin(actor.actor_nr));
                }
            }
        }

        if req.join_mode == JoinMode::RejoinOnly {
            return Err(RoomError::RejoinerNotFound(
                "no inactive actor matches this join".into(),
            ));
        }
        Ok(AdmitPlan::NewActor)
    }

    fn check_rejoin(req: &AdmitRequest<'_>) -> Result<(), RoomError> {
        if req.cache_discarded {
            return Err(RoomError::GameClosed { cache_discarded: true });
        }
        if !req.rejoin_supported {
            return Err(RoomError::RejoinerNotFound(
                "rejoin is not supported when player TTL is 0".into(),
            ));
        }
        Ok(())
    }

    /// Applies an admission decision. Returns the actor number and whether
    /// the actor is new.
    pub fn commit(
        &mut self,
        plan: AdmitPlan,
        peer: PeerHandle,
        user_id: Option<&str>,
        nickname: Option<&str>,
        now_ms: u64,
    ) -> Result<(ActorNr, bool), RoomError> {
        let peer_id = peer.peer_id();
        match plan {
            AdmitPlan::NewActor => {
                self.counter += 1;
                let actor_nr = ActorNr(self.counter);
                let mut actor = Actor::new(actor_nr, user_id, nickname, now_ms);
                actor.peer = Some(peer);
                self.active.insert(actor_nr, actor);
                self.peers.insert(peer_id, actor_nr);
                Ok((actor_nr, true))
            }
            AdmitPlan::Rejoin(actor_nr) => {
                let mut actor = self.inactive.remove(&actor_nr).ok_or_else(|| {
                    RoomError::Internal(format!("rejoin target {actor_nr} vanished"))
                })?;
                actor.cancel_cleanup();
                actor.peer = Some(peer);
                actor.properties.remove(&WellKnownKey::IsInactive.into());
                actor.deactivation_time_ms = None;
                actor.deactivation_reason = None;
                if let Some(nickname) = nickname {
                    actor.properties.set(WellKnownKey::Nickname, nickname);
                }
                self.active.insert(actor_nr, actor);
                self.peers.insert(peer_id, actor_nr);
                Ok((actor_nr, false))
            }
        }
    }

    /// Moves an active actor to the inactive partition and detaches its peer.
    ///
    /// Returns `false` (after logging) if the actor is not active.
    pub fn deactivate(&mut self, actor_nr: ActorNr, reason: &str, now_ms: u64) -> bool {
        let Some(mut actor) = self.active.remove(&actor_nr) else {
            tracing::warn!(actor = %actor_nr, "deactivate of unknown actor ignored");
            return false;
        };
        if let Some(peer) = actor.peer.take() {
            self.peers.remove(&peer.peer_id());
        }
        actor.properties.set(WellKnownKey::IsInactive, true);
        actor.deactivation_time_ms = Some(now_ms);
        actor.deactivation_reason = Some(reason.to_string());
        self.inactive.insert(actor_nr, actor);
        true
    }

    /// Removes an actor from every partition.
    pub fn remove(&mut self, actor_nr: ActorNr) -> Option<Actor> {
        let mut actor = self
            .active
            .remove(&actor_nr)
            .or_else(|| self.inactive.remove(&actor_nr))?;
        if let Some(peer) = actor.peer.take() {
            self.peers.remove(&peer.peer_id());
        }
        actor.cancel_cleanup();
        Some(actor)
    }

    /// Adds a user id to the ban list. Returns `false` if already banned.
    pub fn exclude(&mut self, user_id: &str, reason: &str) -> bool {
        if self.is_excluded(user_id) {
            return false;
        }
        self.excluded.push(ExcludedUser {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    pub fn is_excluded(&self, user_id: &str) -> bool {
        self.excluded.iter().any(|e| e.user_id == user_id)
    }

    pub fn excluded(&self) -> &[ExcludedUser] {
        &self.excluded
    }

    // -- cleanup timers --

    /// Hands out a fresh generation for an inactivity timer.
    pub fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }

    /// Attaches an inactivity timer to an inactive actor, replacing (and
    /// aborting) any previous one.
    pub fn set_cleanup(&mut self, actor_nr: ActorNr, generation: u64, handle: Option<AbortHandle>) {
        match self.inactive.get_mut(&actor_nr) {
            Some(actor) => {
                actor.cancel_cleanup();
                actor.cleanup = Some(CleanupTimer { handle, generation });
            }
            None => {
                tracing::warn!(actor = %actor_nr, "cleanup timer for non-inactive actor");
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
        }
    }

    /// Returns `true` if `generation` is the live timer of this inactive
    /// actor.
    pub fn is_current_timer(&self, actor_nr: ActorNr, generation: u64) -> bool {
        self.inactive
            .get(&actor_nr)
            .and_then(|a| a.cleanup.as_ref())
            .is_some_and(|t| t.generation == generation)
    }

    /// Aborts every pending inactivity timer.
    pub fn cancel_all_timers(&mut self) {
        for actor in self.inactive.values_mut() {
            actor.cancel_cleanup();
        }
    }

    // -- lookups --

    pub fn by_peer(&self, peer_id: PeerId) -> Option<ActorNr> {
        self.peers.get(&peer_id).copied()
    }

    pub fn get(&self, actor_nr: ActorNr) -> Option<&Actor> {
        self.active
            .get(&actor_nr)
            .or_else(|| self.inactive.get(&actor_nr))
    }

    pub fn get_mut(&mut self, actor_nr: ActorNr) -> Option<&mut Actor> {
        match self.active.get_mut(&actor_nr) {
            Some(actor) => Some(actor),
            None => self.inactive.get_mut(&actor_nr),
        }
    }

    pub fn active(&self, actor_nr: ActorNr) -> Option<&Actor> {
        self.active.get(&actor_nr)
    }

    pub fn is_active(&self, actor_nr: ActorNr) -> bool {
        self.active.contains_key(&actor_nr)
    }

    pub fn is_inactive(&self, actor_nr: ActorNr) -> bool {
        self.inactive.contains_key(&actor_nr)
    }

    /// Active actors in ascending number order.
    pub fn active_actors(&self) -> impl Iterator<Item = &Actor> {
        self.active.values()
    }

    pub fn inactive_actors(&self) -> impl Iterator<Item = &Actor> {
        self.inactive.values()
    }

    /// Every actor, active first, each partition ascending.
    pub fn all_actors(&self) -> impl Iterator<Item = &Actor> {
        self.active.values().chain(self.inactive.values())
    }

    pub fn active_numbers(&self) -> Vec<ActorNr> {
        self.active.keys().copied().collect()
    }

    /// The lowest-numbered active actor, or `ActorNr::NONE`.
    pub fn lowest_active(&self) -> ActorNr {
        self.active.keys().next().copied().unwrap_or(ActorNr::NONE)
    }

    pub fn find_by_user(&self, user_id: &str) -> Option<ActorNr> {
        self.all_actors()
            .find(|a| a.user_id() == Some(user_id))
            .map(Actor::actor_nr)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }

    pub fn counter(&self) -> i32 {
        self.counter
    }

    // -- restore --

    /// Rebuilds the registry from persisted parts. Every actor comes back
    /// inactive.
    pub(crate) fn restore(
        &mut self,
        counter: i32,
        actors: Vec<Actor>,
        excluded: Vec<ExcludedUser>,
    ) {
        self.active.clear();
        self.inactive.clear();
        self.peers.clear();
        self.counter = counter;
        self.excluded = excluded;
        for mut actor in actors {
            actor.peer = None;
            actor.properties.set(WellKnownKey::IsInactive, true);
            if self.inactive.insert(actor.actor_nr, actor).is_some() {
                tracing::warn!("duplicate actor in restored state, keeping the last one");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64) -> (PeerHandle, mpsc::UnboundedReceiver<RoomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(PeerId(id), tx), rx)
    }

    fn request(peer_id: u64) -> AdmitRequest<'static> {
        AdmitRequest {
            peer_id: PeerId(peer_id),
            actor_nr: ActorNr::NONE,
            user_id: None,
            join_mode: JoinMode::Default,
            check_user_on_join: false,
            rejoin_supported: true,
            cache_discarded: false,
        }
    }

    fn admit(reg: &mut ActorRegistry, id: u64, user: Option<&str>) -> ActorNr {
        let req = AdmitRequest {
            user_id: user,
            ..request(id)
        };
        let plan = reg.resolve(&req).unwrap();
        let (p, _rx) = peer(id);
        reg.commit(plan, p, user, None, 0).unwrap().0
    }

    #[test]
    fn test_commit_allocates_monotonic_numbers() {
        let mut reg = ActorRegistry::new();
        assert_eq!(admit(&mut reg, 1, None), ActorNr(1));
        assert_eq!(admit(&mut reg, 2, None), ActorNr(2));
        reg.remove(ActorNr(2));
        // Numbers are never reused.
        assert_eq!(admit(&mut reg, 3, None), ActorNr(3));
        assert_eq!(reg.counter(), 3);
    }

    #[test]
    fn test_resolve_rejects_second_actor_for_peer() {
        let mut reg = ActorRegistry::new();
        admit(&mut reg, 1, None);
        let err = reg.resolve(&request(1)).unwrap_err();
        assert!(matches!(err, RoomError::AlreadyJoined(ActorNr(1))));
    }

    #[test]
    fn test_resolve_rejoin_by_actor_number() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, Some("ann"));
        assert!(reg.deactivate(nr, "disconnect", 10));

        let req = AdmitRequest {
            actor_nr: nr,
            user_id: Some("ann"),
            ..request(9)
        };
        assert_eq!(reg.resolve(&req).unwrap(), AdmitPlan::Rejoin(nr));

        let (p, _rx) = peer(9);
        let (rejoined, is_new) = reg.commit(AdmitPlan::Rejoin(nr), p, Some("ann"), None, 20).unwrap();
        assert_eq!(rejoined, nr);
        assert!(!is_new);
        assert!(reg.is_active(nr));
        assert!(!reg.active(nr).unwrap().properties.is_inactive());
        assert_eq!(reg.by_peer(PeerId(9)), Some(nr));
    }

    #[test]
    fn test_resolve_rejoin_user_mismatch_fails() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, Some("ann"));
        reg.deactivate(nr, "disconnect", 0);

        let req = AdmitRequest {
            actor_nr: nr,
            user_id: Some("bob"),
            join_mode: JoinMode::RejoinOrJoin,
            ..request(2)
        };
        assert!(matches!(
            reg.resolve(&req),
            Err(RoomError::RejoinerNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_active_actor_number_fails() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, None);
        let req = AdmitRequest {
            actor_nr: nr,
            ..request(2)
        };
        assert!(matches!(reg.resolve(&req), Err(RoomError::AlreadyJoined(_))));
    }

    #[test]
    fn test_resolve_check_user_on_join() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, Some("ann"));

        let req = AdmitRequest {
            user_id: Some("ann"),
            check_user_on_join: true,
            ..request(2)
        };
        assert!(matches!(
            reg.resolve(&req),
            Err(RoomError::ActiveJoinerFound(_))
        ));

        reg.deactivate(nr, "disconnect", 0);
        assert!(matches!(
            reg.resolve(&req),
            Err(RoomError::InactiveJoinerFound(_))
        ));

        let rejoin = AdmitRequest {
            join_mode: JoinMode::RejoinOnly,
            ..req
        };
        assert_eq!(reg.resolve(&rejoin).unwrap(), AdmitPlan::Rejoin(nr));
    }

    #[test]
    fn test_resolve_rejoin_only_without_match_fails() {
        let reg = ActorRegistry::new();
        let req = AdmitRequest {
            join_mode: JoinMode::RejoinOnly,
            ..request(1)
        };
        assert!(matches!(
            reg.resolve(&req),
            Err(RoomError::RejoinerNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_rejoin_or_join_falls_back_to_new_actor() {
        let reg = ActorRegistry::new();
        let req = AdmitRequest {
            actor_nr: ActorNr(5),
            join_mode: JoinMode::RejoinOrJoin,
            ..request(1)
        };
        assert_eq!(reg.resolve(&req).unwrap(), AdmitPlan::NewActor);
    }

    #[test]
    fn test_resolve_rejoin_refused_without_ttl_or_after_discard() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, None);
        reg.deactivate(nr, "disconnect", 0);

        let req = AdmitRequest {
            actor_nr: nr,
            rejoin_supported: false,
            ..request(2)
        };
        assert!(matches!(reg.resolve(&req), Err(RoomError::RejoinerNotFound(_))));

        let req = AdmitRequest {
            actor_nr: nr,
            cache_discarded: true,
            ..request(2)
        };
        assert!(matches!(
            reg.resolve(&req),
            Err(RoomError::GameClosed { cache_discarded: true })
        ));
    }

    #[test]
    fn test_resolve_excluded_user() {
        let mut reg = ActorRegistry::new();
        assert!(reg.exclude("mallory", "griefing"));
        assert!(!reg.exclude("mallory", "again"));

        let req = AdmitRequest {
            user_id: Some("mallory"),
            ..request(1)
        };
        let err = reg.resolve(&req).unwrap_err();
        assert!(err.to_string().contains("banned"));
    }

    #[test]
    fn test_deactivate_unknown_actor_is_noop() {
        let mut reg = ActorRegistry::new();
        assert!(!reg.deactivate(ActorNr(42), "disconnect", 0));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_timer_generation_guards_stale_firings() {
        let mut reg = ActorRegistry::new();
        let nr = admit(&mut reg, 1, None);
        reg.deactivate(nr, "disconnect", 0);

        let first = reg.next_timer_generation();
        reg.set_cleanup(nr, first, None);
        let second = reg.next_timer_generation();
        reg.set_cleanup(nr, second, None);

        assert!(!reg.is_current_timer(nr, first));
        assert!(reg.is_current_timer(nr, second));
    }

    #[test]
    fn test_lowest_active_ignores_inactive() {
        let mut reg = ActorRegistry::new();
        let a = admit(&mut reg, 1, None);
        let b = admit(&mut reg, 2, None);
        assert_eq!(reg.lowest_active(), a);
        reg.deactivate(a, "disconnect", 0);
        assert_eq!(reg.lowest_active(), b);
        reg.deactivate(b, "disconnect", 0);
        assert_eq!(reg.lowest_active(), ActorNr::NONE);
    }
}
