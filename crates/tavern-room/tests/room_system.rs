//! Integration tests for the room system, driven through `RoomRegistry` and
//! `RoomHandle` the way the service layer uses them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tavern_protocol::{
    ActorNr, ChangeGroupsRequest, EventCaching, GetPropertiesRequest, Hashtable, JoinMode,
    JoinRequest, LeaveRequest, PeerId, PropertyMap, RaiseEventRequest, ReceiverGroup, RoomEvent,
    RoomFlags, SetPropertiesRequest, Value, WellKnownKey,
};
use tavern_room::{
    Continuation, HookContext, HookDecision, LobbySnapshot, NoopHook, PeerHandle,
    RoomDirectory, RoomError, RoomHandle, RoomHook, RoomLimits, RoomRegistry,
    SerializableGameState,
};
use tokio::sync::mpsc;

// =========================================================================
// Helpers
// =========================================================================

type Inbox = mpsc::UnboundedReceiver<RoomEvent>;

fn peer(id: u64) -> (PeerHandle, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerHandle::new(PeerId(id), tx), rx)
}

fn drain(inbox: &mut Inbox) -> Vec<RoomEvent> {
    let mut events = Vec::new();
    while let Ok(event) = inbox.try_recv() {
        events.push(event);
    }
    events
}

fn join_as(user: &str) -> JoinRequest {
    JoinRequest {
        user_id: Some(user.to_string()),
        ..JoinRequest::new("arena")
    }
}

async fn room(limits: RoomLimits) -> (RoomRegistry, RoomHandle) {
    room_with_hook(limits, Arc::new(NoopHook)).await
}

async fn room_with_hook(limits: RoomLimits, hook: Arc<dyn RoomHook>) -> (RoomRegistry, RoomHandle) {
    let registry = RoomRegistry::new(limits, hook);
    let handle = registry.acquire("arena").await;
    (registry, handle)
}

/// Creates the room as peer 1 and joins peers `2..=count`.
async fn populate(handle: &RoomHandle, count: u64, template: &JoinRequest) -> Vec<Inbox> {
    let mut inboxes = Vec::new();
    for id in 1..=count {
        let (p, inbox) = peer(id);
        let request = JoinRequest {
            user_id: Some(format!("user-{id}")),
            ..template.clone()
        };
        handle.join(p, request, id == 1).await.unwrap();
        inboxes.push(inbox);
    }
    for inbox in &mut inboxes {
        drain(inbox);
    }
    inboxes
}

fn custom(code: u8, cache: EventCaching) -> RaiseEventRequest {
    RaiseEventRequest {
        code,
        data: Hashtable::new().with(0i64, i64::from(code)),
        cache,
        ..RaiseEventRequest::default()
    }
}

// =========================================================================
// Actor lifecycle
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_negative_player_ttl_keeps_actor_for_rejoin() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    let template = JoinRequest {
        player_ttl: Some(-1),
        actor_properties: PropertyMap::new().with("color", "red"),
        flags: RoomFlags {
            check_user_on_join: true,
            ..RoomFlags::default()
        },
        ..JoinRequest::new("arena")
    };
    populate(&handle, 2, &template).await;

    handle.disconnect(PeerId(2)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    let info = handle.info().await.unwrap();
    assert_eq!(info.active_actors, 1);
    assert_eq!(info.inactive_actors, 1);

    let (p, _inbox) = peer(22);
    let rejoin = JoinRequest {
        join_mode: JoinMode::RejoinOnly,
        ..join_as("user-2")
    };
    let response = handle.join(p, rejoin, false).await.unwrap();
    assert!(response.rejoined);
    assert_eq!(response.actor_nr, ActorNr(2));
    let props = &response.actor_properties[&ActorNr(2)];
    assert_eq!(props.get(&"color".into()), Some(&Value::from("red")));
    assert!(!props.contains_key(&WellKnownKey::IsInactive.into()));
}

#[tokio::test(start_paused = true)]
async fn test_zero_player_ttl_removes_actor_and_rejoin_fails() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    let mut inboxes = populate(&handle, 2, &JoinRequest::new("arena")).await;

    handle.disconnect(PeerId(2)).await.unwrap();
    assert_eq!(handle.info().await.unwrap().inactive_actors, 0);
    assert!(matches!(
        drain(&mut inboxes[0]).as_slice(),
        [RoomEvent::Leave { actor_nr: ActorNr(2), is_inactive: false, .. }]
    ));

    let (p, _inbox) = peer(22);
    let rejoin = JoinRequest {
        actor_nr: ActorNr(2),
        join_mode: JoinMode::RejoinOnly,
        ..join_as("user-2")
    };
    let err = handle.join(p, rejoin, false).await.unwrap_err();
    assert!(!err.code().is_ok());
    assert!(matches!(err, RoomError::RejoinerNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_positive_player_ttl_expires_inactive_actor() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    let template = JoinRequest {
        player_ttl: Some(2_000),
        ..JoinRequest::new("arena")
    };
    let mut inboxes = populate(&handle, 2, &template).await;

    handle.disconnect(PeerId(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(handle.info().await.unwrap().inactive_actors, 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(handle.info().await.unwrap().inactive_actors, 0);
    let events = drain(&mut inboxes[0]);
    assert!(matches!(events[0], RoomEvent::Leave { is_inactive: true, .. }));
    assert!(matches!(events[1], RoomEvent::Leave { is_inactive: false, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_cancels_inactivity_timer() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    let template = JoinRequest {
        player_ttl: Some(1_000),
        ..JoinRequest::new("arena")
    };
    populate(&handle, 2, &template).await;

    handle.disconnect(PeerId(2)).await.unwrap();
    let (p, _inbox) = peer(22);
    let rejoin = JoinRequest {
        join_mode: JoinMode::RejoinOrJoin,
        actor_nr: ActorNr(2),
        ..join_as("user-2")
    };
    handle.join(p, rejoin, false).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.info().await.unwrap().active_actors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_master_is_lowest_active_actor() {
    let mut rng = rand::rng();
    for _ in 0..10 {
        let (_registry, handle) = room(RoomLimits::default()).await;
        let count = rng.random_range(2..8u64);
        populate(&handle, count, &JoinRequest::new("arena")).await;

        let mut order: Vec<u64> = (1..=count).collect();
        order.shuffle(&mut rng);
        let mut remaining: Vec<u64> = (1..=count).collect();
        for id in order {
            handle.leave(PeerId(id), LeaveRequest::default()).await.unwrap();
            remaining.retain(|r| *r != id);

            let expected = remaining
                .iter()
                .min()
                .map_or(ActorNr::NONE, |m| ActorNr(*m as i32));
            assert_eq!(handle.info().await.unwrap().master_client_id, expected);
        }
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_events_from_one_peer_arrive_in_order() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    let mut inboxes = populate(&handle, 2, &JoinRequest::new("arena")).await;

    for code in 0..50u8 {
        handle
            .raise_event(PeerId(1), custom(code, EventCaching::DoNotCache))
            .await
            .unwrap();
    }
    let codes: Vec<u8> = drain(&mut inboxes[1]).iter().map(RoomEvent::code).collect();
    assert_eq!(codes, (0..50u8).collect::<Vec<_>>());
}

// =========================================================================
// Properties
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_cas_round_trip() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    populate(&handle, 2, &JoinRequest::new("arena")).await;

    let set = SetPropertiesRequest {
        properties: PropertyMap::new().with("A", 1),
        ..SetPropertiesRequest::default()
    };
    handle.set_properties(PeerId(1), set).await.unwrap();

    let cas = SetPropertiesRequest {
        properties: PropertyMap::new().with("A", 2),
        expected: Some(PropertyMap::new().with("A", 1)),
        ..SetPropertiesRequest::default()
    };
    handle.set_properties(PeerId(2), cas.clone()).await.unwrap();
    let err = handle.set_properties(PeerId(2), cas).await.unwrap_err();
    assert!(matches!(err, RoomError::CasMismatch(_)));

    let props = handle
        .get_properties(PeerId(1), GetPropertiesRequest::default())
        .await
        .unwrap();
    assert_eq!(
        props.game_properties.unwrap().get(&"A".into()),
        Some(&Value::Int(2))
    );
}

// =========================================================================
// Caches
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_overflow_closes_room() {
    let limits = RoomLimits {
        max_cached_events: 3,
        ..RoomLimits::default()
    };
    let (_registry, handle) = room(limits).await;
    let mut inboxes = populate(&handle, 2, &JoinRequest::new("arena")).await;

    for code in 0..4 {
        handle
            .raise_event(PeerId(1), custom(code, EventCaching::AddToRoomCache))
            .await
            .unwrap();
    }
    let debug = handle.debug().await.unwrap();
    assert!(debug.cache_discarded);
    assert!(!debug.is_open);
    assert!(drain(&mut inboxes[1])
        .iter()
        .any(|e| matches!(e, RoomEvent::ErrorInfo { .. })));

    handle
        .raise_event(PeerId(1), custom(9, EventCaching::AddToRoomCache))
        .await
        .unwrap();
    assert_eq!(handle.debug().await.unwrap().cached_events, 0);

    let (p, _inbox) = peer(3);
    let err = handle.join(p, JoinRequest::new("arena"), false).await.unwrap_err();
    assert!(matches!(err, RoomError::GameClosed { cache_discarded: true }));
    assert!(err.to_string().contains("event cache discarded"));
}

#[tokio::test(start_paused = true)]
async fn test_slice_purge_and_join_to_purged_slice() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    populate(&handle, 1, &JoinRequest::new("arena")).await;

    for _ in 0..3 {
        handle
            .raise_event(PeerId(1), custom(1, EventCaching::AddToRoomCache))
            .await
            .unwrap();
        handle
            .raise_event(PeerId(1), custom(0, EventCaching::SliceIncreaseIndex))
            .await
            .unwrap();
    }
    // Slices 0..=3 exist, 3 is current.
    let purge_current = RaiseEventRequest {
        cache_slice: Some(3),
        ..custom(0, EventCaching::SlicePurgeIndex)
    };
    assert!(handle.raise_event(PeerId(1), purge_current).await.is_err());

    for slice in [3, 4] {
        let purge_too_far = RaiseEventRequest {
            cache_slice: Some(slice),
            ..custom(0, EventCaching::SlicePurgeUpToIndex)
        };
        let err = handle.raise_event(PeerId(1), purge_too_far).await.unwrap_err();
        assert!(matches!(err, RoomError::InvalidOperation(_)));
        let debug = handle.debug().await.unwrap();
        assert_eq!(debug.cache_slices, vec![0, 1, 2, 3]);
        assert_eq!(debug.cached_events, 3);
    }

    let purge_up_to = RaiseEventRequest {
        cache_slice: Some(2),
        ..custom(0, EventCaching::SlicePurgeUpToIndex)
    };
    handle.raise_event(PeerId(1), purge_up_to).await.unwrap();
    assert_eq!(handle.debug().await.unwrap().cache_slices, vec![2, 3]);

    let (p, _inbox) = peer(2);
    let stale = JoinRequest {
        cache_slice: Some(1),
        ..JoinRequest::new("arena")
    };
    let err = handle.join(p, stale, false).await.unwrap_err();
    assert_ne!(err.code().value(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_actor_merge_cache_replayed_to_joiner() {
    let (_registry, handle) = room(RoomLimits::default()).await;
    populate(&handle, 1, &JoinRequest::new("arena")).await;

    let merge = |data: Hashtable| RaiseEventRequest {
        code: 7,
        data,
        cache: EventCaching::MergeCache,
        ..RaiseEventRequest::default()
    };
    for data in [
        Hashtable::new().with(1i64, "v1"),
        Hashtable::new().with(2i64, "v3").with(3i64, "v4"),
        Hashtable::new().with(2i64, Value::Null),
    ] {
        handle.raise_event(PeerId(1), merge(data)).await.unwrap();
    }

    let (p, mut inbox) = peer(2);
    handle.join(p, JoinRequest::new("arena"), false).await.unwrap();
    let replayed: Vec<Hashtable> = drain(&mut inbox)
        .into_iter()
        .filter_map(|e| match e {
            RoomEvent::Custom { code: 7, data, sender: ActorNr(1) } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(
        replayed,
        vec![Hashtable::new().with(1i64, "v1").with(3i64, "v4")]
    );
}

// =========================================================================
// Persistence
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_ban_survives_persistence() {
    let (registry, handle) = room(RoomLimits::default()).await;
    populate(&handle, 2, &JoinRequest::new("arena")).await;
    handle.exclude("user-2", "griefing").await.unwrap();

    handle.leave(PeerId(1), LeaveRequest::default()).await.unwrap();
    let frozen = handle.get_state().await.unwrap();
    registry.shutdown_all().await;

    let (_registry, revived) = room(RoomLimits::default()).await;
    revived.set_state(frozen).await.unwrap();
    let (p, _inbox) = peer(9);
    let err = revived.join(p, join_as("user-2"), false).await.unwrap_err();
    assert!(err.to_string().contains("banned"));

    let (p, _inbox) = peer(10);
    revived.join(p, join_as("user-3"), false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_state_round_trip() {
    let (registry, handle) = room(RoomLimits::default()).await;
    let template = JoinRequest {
        player_ttl: Some(-1),
        game_properties: PropertyMap::new()
            .with("map", "forest")
            .with(WellKnownKey::LobbyProperties, vec![Value::from("map")]),
        ..JoinRequest::new("arena")
    };
    populate(&handle, 3, &template).await;

    let groups = ChangeGroupsRequest {
        remove: None,
        add: Some(vec![4, 5]),
    };
    handle.change_groups(PeerId(2), groups).await.unwrap();
    handle
        .raise_event(PeerId(1), custom(1, EventCaching::AddToRoomCache))
        .await
        .unwrap();
    handle
        .raise_event(PeerId(3), custom(2, EventCaching::ReplaceCache))
        .await
        .unwrap();
    handle.exclude("troll", "spam").await.unwrap();
    for id in 1..=3 {
        handle.disconnect(PeerId(id)).await.unwrap();
    }

    let first = handle.get_state().await.unwrap();
    registry.shutdown_all().await;

    let (_registry, revived) = room(RoomLimits::default()).await;
    revived.set_state(first.clone()).await.unwrap();
    let second = revived.get_state().await.unwrap();

    assert_eq!(second.actor_counter, first.actor_counter);
    assert_eq!(second.actors, first.actors);
    assert_eq!(second.excluded, first.excluded);
    assert_eq!(second.custom_properties, first.custom_properties);
    assert_eq!(second.binary.get("19"), first.binary.get("19"));
    assert_eq!(second.binary.get("20"), first.binary.get("20"));

    let debug = revived.debug().await.unwrap();
    assert_eq!(debug.inactive_actors.len(), 3);
    assert_eq!(debug.inactive_actors[1].groups, vec![4, 5]);
    assert_eq!(debug.master_client_id, ActorNr::NONE);
}

#[tokio::test]
async fn test_legacy_record_loads_into_room() {
    let legacy = serde_json::json!({
        "ActorCounter": 4,
        "ActorList": [],
        "IsOpen": false,
        "MaxPlayers": 6,
        "PlayerTTL": -1,
        "ExcludedUsers": ["cheater"],
        "Bogus": "ignored",
    });
    let record = SerializableGameState::from_legacy(legacy.as_object().unwrap());
    assert_eq!(record.actor_counter, 4);
    assert!(!record.is_open);
    record.validate().unwrap();

    let (_registry, handle) = room(RoomLimits::default()).await;
    handle.set_state(record).await.unwrap();
    let info = handle.info().await.unwrap();
    assert_eq!(info.max_players, 6);
    assert!(!info.is_open);
}

// =========================================================================
// Hooks
// =========================================================================

/// A hook that parks joins and hands the continuation to the test.
#[derive(Default)]
struct ParkingHook {
    parked: Mutex<Vec<Continuation>>,
    lobby: Mutex<Vec<LobbySnapshot>>,
}

impl RoomHook for ParkingHook {
    fn before_join(&self, ctx: &HookContext<'_>, _request: &JoinRequest) -> HookDecision {
        // The creator gets in right away.
        if ctx.active_actors == 0 {
            return HookDecision::proceed();
        }
        let (decision, continuation) = HookDecision::defer();
        self.parked.lock().unwrap().push(continuation);
        decision
    }

    fn before_raise_event(
        &self,
        _ctx: &HookContext<'_>,
        request: &RaiseEventRequest,
    ) -> HookDecision {
        match request.code {
            13 => HookDecision::fail("unlucky"),
            66 => panic!("plugin bug"),
            _ => HookDecision::proceed(),
        }
    }

    fn on_lobby_update(&self, snapshot: &LobbySnapshot) {
        self.lobby.lock().unwrap().push(snapshot.clone());
    }
}

#[tokio::test(start_paused = true)]
async fn test_deferred_join_times_out() {
    let limits = RoomLimits {
        plugin_timeout_ms: 500,
        ..RoomLimits::default()
    };
    let hook = Arc::new(ParkingHook::default());
    let (_registry, handle) = room_with_hook(limits, hook.clone()).await;
    let (p, _inbox) = peer(1);
    handle.join(p, JoinRequest::new("arena"), true).await.unwrap();

    let (p, _inbox) = peer(2);
    let err = handle.join(p, JoinRequest::new("arena"), false).await.unwrap_err();
    assert!(matches!(err, RoomError::PluginTimeout(d) if d == Duration::from_millis(500)));
    assert_eq!(handle.info().await.unwrap().active_actors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_join_resumes_and_queue_waits() {
    let hook = Arc::new(ParkingHook::default());
    let (_registry, handle) = room_with_hook(RoomLimits::default(), hook.clone()).await;
    let (p, _inbox) = peer(1);
    handle.join(p, JoinRequest::new("arena"), true).await.unwrap();

    let joining = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let (p, _inbox) = peer(2);
            handle.join(p, JoinRequest::new("arena"), false).await
        })
    };
    while hook.parked.lock().unwrap().is_empty() {
        tokio::task::yield_now().await;
    }

    // Queued behind the parked join.
    let info = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.info().await })
    };
    tokio::task::yield_now().await;
    assert!(!info.is_finished());

    let continuation = hook.parked.lock().unwrap().pop().unwrap();
    continuation.resume();
    let response = joining.await.unwrap().unwrap();
    assert_eq!(response.actor_nr, ActorNr(2));
    assert_eq!(info.await.unwrap().unwrap().active_actors, 2);
}

#[tokio::test(start_paused = true)]
async fn test_hook_failures_fail_only_the_operation() {
    let hook = Arc::new(ParkingHook::default());
    let (_registry, handle) = room_with_hook(RoomLimits::default(), hook.clone()).await;
    let (p, _inbox) = peer(1);
    handle.join(p, JoinRequest::new("arena"), true).await.unwrap();

    let err = handle
        .raise_event(PeerId(1), custom(13, EventCaching::DoNotCache))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Plugin(ref m) if m == "unlucky"));

    let err = handle
        .raise_event(PeerId(1), custom(66, EventCaching::DoNotCache))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::Plugin(_)));

    let ok = RaiseEventRequest {
        receiver_group: ReceiverGroup::All,
        ..custom(1, EventCaching::DoNotCache)
    };
    handle.raise_event(PeerId(1), ok).await.unwrap();
    assert!(!hook.lobby.lock().unwrap().is_empty());
}

/// Loads a stored room on creation.
struct LoadingHook {
    stored: SerializableGameState,
}

impl RoomHook for LoadingHook {
    fn on_create(&self, _ctx: &HookContext<'_>, _request: &JoinRequest) -> HookDecision {
        HookDecision::load_state(self.stored.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_on_create_loads_persisted_state() {
    let (registry, handle) = room(RoomLimits::default()).await;
    let template = JoinRequest {
        player_ttl: Some(-1),
        ..JoinRequest::new("arena")
    };
    populate(&handle, 2, &template).await;
    handle.disconnect(PeerId(1)).await.unwrap();
    handle.disconnect(PeerId(2)).await.unwrap();
    let stored = handle.get_state().await.unwrap();
    registry.shutdown_all().await;

    let hook = Arc::new(LoadingHook { stored });
    let (_registry, handle) = room_with_hook(RoomLimits::default(), hook).await;
    let (p, _inbox) = peer(5);
    let rejoin = JoinRequest {
        join_mode: JoinMode::RejoinOnly,
        actor_nr: ActorNr(2),
        ..join_as("user-2")
    };
    // CreateGame on a stored room rejoins it instead of failing.
    let response = handle.join(p, rejoin, true).await.unwrap();
    assert!(response.rejoined);
    assert_eq!(handle.info().await.unwrap().master_client_id, ActorNr(2));
}
