//! The `RoomHook` trait: the extension point for server-side plugins.
//!
//! A room consults its hook before the transitions a plugin may want to
//! intercept. The hook answers right away or defers: a deferred decision
//! hands the plugin a [`Continuation`] and parks the room until the plugin
//! resolves it or the call times out. Commands that arrive meanwhile wait
//! in the room's queue.

use std::time::Duration;

use tavern_protocol::{
    ActorNr, JoinRequest, LobbyInfo, PropertyMap, RaiseEventRequest, SetPropertiesRequest,
};
use tokio::sync::oneshot;

use crate::SerializableGameState;

/// What the hook sees about the room when it is consulted.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub room_name: &'a str,
    /// The acting actor, `ActorNr::NONE` before it is admitted.
    pub actor_nr: ActorNr,
    pub active_actors: usize,
}

/// Lobby-facing summary of a room, emitted when lobby-visible data changes.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub room_name: String,
    pub lobby: LobbyInfo,
    pub is_open: bool,
    pub is_visible: bool,
    pub max_players: u8,
    pub player_count: usize,
    /// Custom properties listed in `LobbyProperties`.
    pub properties: PropertyMap,
}

// ---------------------------------------------------------------------------
// Decisions and continuations
// ---------------------------------------------------------------------------

/// How a hook resolved a transition.
#[derive(Debug)]
pub enum HookOutcome {
    Continue,
    /// Continue after loading this persisted state (only honoured by
    /// [`RoomHook::on_create`]).
    ContinueWithState(Box<SerializableGameState>),
    Fail(String),
}

/// A hook's answer: resolved now, or later through a [`Continuation`].
#[derive(Debug)]
pub enum HookDecision {
    Ready(HookOutcome),
    Deferred(PendingCall),
}

impl HookDecision {
    pub fn proceed() -> Self {
        Self::Ready(HookOutcome::Continue)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Ready(HookOutcome::Fail(message.into()))
    }

    pub fn load_state(state: SerializableGameState) -> Self {
        Self::Ready(HookOutcome::ContinueWithState(Box::new(state)))
    }

    /// Defers the decision; the room waits for the continuation up to its
    /// configured plugin timeout.
    pub fn defer() -> (Self, Continuation) {
        Self::deferred(None)
    }

    /// Defers the decision with an explicit deadline.
    pub fn defer_with_timeout(timeout: Duration) -> (Self, Continuation) {
        Self::deferred(Some(timeout))
    }

    fn deferred(timeout: Option<Duration>) -> (Self, Continuation) {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            state: CallState::Pending,
            receiver: Some(rx),
            timeout,
        };
        (Self::Deferred(call), Continuation { sender: tx })
    }
}

/// The plugin's side of a deferred call. Dropping it fails the call.
#[derive(Debug)]
pub struct Continuation {
    sender: oneshot::Sender<HookOutcome>,
}

impl Continuation {
    pub fn resume(self) {
        let _ = self.sender.send(HookOutcome::Continue);
    }

    pub fn resume_with_state(self, state: SerializableGameState) {
        let _ = self
            .sender
            .send(HookOutcome::ContinueWithState(Box::new(state)));
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.sender.send(HookOutcome::Fail(message.into()));
    }
}

/// Where a deferred call stands.
#[derive(Debug)]
pub enum CallState {
    Pending,
    Continued(Option<Box<SerializableGameState>>),
    Failed(String),
    TimedOut,
}

impl CallState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// The room's side of a deferred call.
///
/// Leaves `Pending` exactly once: to `Continued`, `Failed` or `TimedOut`.
#[derive(Debug)]
pub struct PendingCall {
    state: CallState,
    receiver: Option<oneshot::Receiver<HookOutcome>>,
    timeout: Option<Duration>,
}

impl PendingCall {
    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Waits for the continuation. `default_timeout` applies when the hook
    /// did not pick a deadline. Once resolved, further calls return the
    /// same state without waiting.
    pub async fn resolve(&mut self, default_timeout: Duration) -> &CallState {
        let Some(receiver) = self.receiver.take() else {
            return &self.state;
        };
        let timeout = self.timeout.unwrap_or(default_timeout);
        self.state = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(HookOutcome::Continue)) => CallState::Continued(None),
            Ok(Ok(HookOutcome::ContinueWithState(state))) => CallState::Continued(Some(state)),
            Ok(Ok(HookOutcome::Fail(message))) => CallState::Failed(message),
            Ok(Err(_)) => CallState::Failed("continuation dropped".into()),
            Err(_) => CallState::TimedOut,
        };
        &self.state
    }

    pub fn into_state(self) -> CallState {
        self.state
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

// ---------------------------------------------------------------------------
// RoomHook
// ---------------------------------------------------------------------------

/// Server-side plugin attached to every room of a registry.
///
/// Every method has a default that lets the transition through, so a
/// plugin only overrides what it cares about. Methods run on the room task:
/// anything slow belongs behind [`HookDecision::defer`].
pub trait RoomHook: Send + Sync + 'static {
    /// The first join of a room that does not exist yet. May load a
    /// persisted state with [`HookDecision::load_state`].
    fn on_create(&self, _ctx: &HookContext<'_>, _request: &JoinRequest) -> HookDecision {
        HookDecision::proceed()
    }

    /// Any later join.
    fn before_join(&self, _ctx: &HookContext<'_>, _request: &JoinRequest) -> HookDecision {
        HookDecision::proceed()
    }

    fn before_raise_event(
        &self,
        _ctx: &HookContext<'_>,
        _request: &RaiseEventRequest,
    ) -> HookDecision {
        HookDecision::proceed()
    }

    fn before_set_properties(
        &self,
        _ctx: &HookContext<'_>,
        _request: &SetPropertiesRequest,
    ) -> HookDecision {
        HookDecision::proceed()
    }

    /// An actor left or became inactive.
    fn on_leave(&self, _room: &str, _actor: ActorNr, _is_inactive: bool) {}

    /// Lobby-visible data of the room changed.
    fn on_lobby_update(&self, _snapshot: &LobbySnapshot) {}

    /// The room is shutting down; `state` is its final frozen form.
    fn on_close(&self, _room: &str, _state: &SerializableGameState) {}
}

/// A hook that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl RoomHook for NoopHook {}
