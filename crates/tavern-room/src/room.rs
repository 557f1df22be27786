//! Room actor: an isolated Tokio task that owns one room.
//!
//! Each room runs in its own task and consumes a bounded command channel in
//! FIFO order, so operations, inactivity timers and hook continuations of a
//! room never run concurrently. The engine itself is synchronous; this
//! module adds hook consultation, timers and panic containment around it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tavern_protocol::{
    ActorNr, ChangeGroupsRequest, GetPropertiesRequest, JoinRequest, JoinResponse, LeaveRequest,
    PeerId, PropertiesResponse, RaiseEventRequest, SetPropertiesRequest,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::engine::{ActorTimers, Room};
use crate::{
    CallState, HookContext, HookDecision, HookOutcome, PeerHandle, RoomDebugInfo, RoomError,
    RoomHook, RoomInfo, RoomLimits, SerializableGameState,
};

type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// Commands sent to a room actor through its channel.
///
/// Variants with a `reply` are request/response; the caller waits on the
/// oneshot. A reply that is dropped means the operation failed internally.
pub(crate) enum RoomCommand {
    Join {
        peer: PeerHandle,
        request: JoinRequest,
        create: bool,
        reply: Reply<JoinResponse>,
    },
    Leave {
        peer_id: PeerId,
        request: LeaveRequest,
        reply: Reply<()>,
    },
    Disconnect {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    RaiseEvent {
        peer_id: PeerId,
        request: RaiseEventRequest,
        reply: Reply<()>,
    },
    SetProperties {
        peer_id: PeerId,
        request: SetPropertiesRequest,
        reply: Reply<()>,
    },
    GetProperties {
        peer_id: PeerId,
        request: GetPropertiesRequest,
        reply: Reply<PropertiesResponse>,
    },
    ChangeGroups {
        peer_id: PeerId,
        request: ChangeGroupsRequest,
        reply: Reply<()>,
    },
    Debug {
        reply: oneshot::Sender<RoomDebugInfo>,
    },
    Exclude {
        user_id: String,
        reason: String,
        reply: Reply<Option<ActorNr>>,
    },
    GetState {
        reply: Reply<SerializableGameState>,
    },
    SetState {
        state: Box<SerializableGameState>,
        reply: Reply<()>,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    /// An inactivity timer fired.
    ExpireActor { actor_nr: ActorNr, generation: u64 },
    Shutdown,
}

// ---------------------------------------------------------------------------
// RoomHandle
// ---------------------------------------------------------------------------

/// Handle to a running room actor. Used to send commands to it.
///
/// Cheap to clone: it is an `mpsc::Sender` plus the room name.
#[derive(Clone)]
pub struct RoomHandle {
    name: Arc<str>,
    sender: mpsc::Sender<RoomCommand>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle").field("name", &self.name).finish()
    }
}

impl RoomHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` once the room task has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn unavailable(&self) -> RoomError {
        RoomError::Unavailable(self.name.to_string())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    /// CreateGame (`create = true`) or JoinGame.
    pub async fn join(
        &self,
        peer: PeerHandle,
        request: JoinRequest,
        create: bool,
    ) -> Result<JoinResponse, RoomError> {
        self.request(|reply| RoomCommand::Join {
            peer,
            request,
            create,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, peer_id: PeerId, request: LeaveRequest) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Leave {
            peer_id,
            request,
            reply,
        })
        .await?
    }

    /// The peer's connection dropped. Returns `false` if it had no actor
    /// here.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<bool, RoomError> {
        self.request(|reply| RoomCommand::Disconnect { peer_id, reply })
            .await
    }

    pub async fn raise_event(
        &self,
        peer_id: PeerId,
        request: RaiseEventRequest,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::RaiseEvent {
            peer_id,
            request,
            reply,
        })
        .await?
    }

    pub async fn set_properties(
        &self,
        peer_id: PeerId,
        request: SetPropertiesRequest,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::SetProperties {
            peer_id,
            request,
            reply,
        })
        .await?
    }

    pub async fn get_properties(
        &self,
        peer_id: PeerId,
        request: GetPropertiesRequest,
    ) -> Result<PropertiesResponse, RoomError> {
        self.request(|reply| RoomCommand::GetProperties {
            peer_id,
            request,
            reply,
        })
        .await?
    }

    pub async fn change_groups(
        &self,
        peer_id: PeerId,
        request: ChangeGroupsRequest,
    ) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::ChangeGroups {
            peer_id,
            request,
            reply,
        })
        .await?
    }

    pub async fn debug(&self) -> Result<RoomDebugInfo, RoomError> {
        self.request(|reply| RoomCommand::Debug { reply }).await
    }

    /// Kicks and bans a user id. Returns the removed actor, if any.
    pub async fn exclude(
        &self,
        user_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Option<ActorNr>, RoomError> {
        let user_id = user_id.into();
        let reason = reason.into();
        self.request(|reply| RoomCommand::Exclude {
            user_id,
            reason,
            reply,
        })
        .await?
    }

    /// Freezes the room into its persistable form.
    pub async fn get_state(&self) -> Result<SerializableGameState, RoomError> {
        self.request(|reply| RoomCommand::GetState { reply }).await?
    }

    /// Loads a persisted state into a room that has no actors yet.
    pub async fn set_state(&self, state: SerializableGameState) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::SetState {
            state: Box::new(state),
            reply,
        })
        .await?
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomError> {
        self.request(|reply| RoomCommand::Info { reply }).await
    }

    /// Tells the room to shut down.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| self.unavailable())
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Inactivity timers that post `ExpireActor` back into the room's queue.
///
/// Holds a weak sender so pending timers never keep a room alive.
struct QueueTimers {
    sender: mpsc::WeakSender<RoomCommand>,
}

impl ActorTimers for QueueTimers {
    fn schedule_expiry(
        &self,
        actor_nr: ActorNr,
        generation: u64,
        after: Duration,
    ) -> Option<AbortHandle> {
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender
                    .send(RoomCommand::ExpireActor {
                        actor_nr,
                        generation,
                    })
                    .await;
            }
        });
        Some(task.abort_handle())
    }
}

// ---------------------------------------------------------------------------
// Error log guard
// ---------------------------------------------------------------------------

/// Limits how often a room logs internal failures.
struct LogGuard {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogGuard {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of failures swallowed since the last log line, or
    /// `None` if this one should be swallowed too.
    fn permit(&mut self) -> Option<u64> {
        let now = Instant::now();
        if self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.interval)
        {
            self.last = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

// ---------------------------------------------------------------------------
// RoomActor
// ---------------------------------------------------------------------------

/// The internal room actor state. Runs inside a Tokio task.
struct RoomActor {
    room: Room,
    receiver: mpsc::Receiver<RoomCommand>,
    log_guard: LogGuard,
}

impl RoomActor {
    /// Runs the actor loop, processing commands until shutdown.
    async fn run(mut self) {
        tracing::info!(room = %self.room.name(), "room actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Join {
                    peer,
                    request,
                    create,
                    reply,
                } => {
                    if let Some(result) = self.handle_join(peer, request, create).await {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::Leave {
                    peer_id,
                    request,
                    reply,
                } => {
                    if let Some(result) = self.guarded("leave", |room| room.leave(peer_id, request)) {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::Disconnect { peer_id, reply } => {
                    if let Some(found) = self.guarded("disconnect", |room| Ok(room.disconnect(peer_id)))
                    {
                        let _ = reply.send(found.unwrap_or(false));
                    }
                }
                RoomCommand::RaiseEvent {
                    peer_id,
                    request,
                    reply,
                } => {
                    if let Some(result) = self.handle_raise_event(peer_id, request).await {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::SetProperties {
                    peer_id,
                    request,
                    reply,
                } => {
                    if let Some(result) = self.handle_set_properties(peer_id, request).await {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::GetProperties {
                    peer_id,
                    request,
                    reply,
                } => {
                    if let Some(result) =
                        self.guarded("get_properties", |room| room.get_properties(peer_id, &request))
                    {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::ChangeGroups {
                    peer_id,
                    request,
                    reply,
                } => {
                    if let Some(result) =
                        self.guarded("change_groups", |room| room.change_groups(peer_id, &request))
                    {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::Debug { reply } => {
                    let _ = reply.send(self.room.debug_info());
                }
                RoomCommand::Exclude {
                    user_id,
                    reason,
                    reply,
                } => {
                    if let Some(result) =
                        self.guarded("exclude", |room| room.exclude(&user_id, &reason))
                    {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::GetState { reply } => {
                    let _ = reply.send(self.room.serializable_state());
                }
                RoomCommand::SetState { state, reply } => {
                    if let Some(result) = self.guarded("set_state", |room| room.set_state(*state)) {
                        let _ = reply.send(result);
                    }
                }
                RoomCommand::Info { reply } => {
                    let _ = reply.send(self.room.info());
                }
                RoomCommand::ExpireActor {
                    actor_nr,
                    generation,
                } => {
                    self.guarded("expire_actor", |room| {
                        room.expire_actor(actor_nr, generation);
                        Ok(())
                    });
                }
                RoomCommand::Shutdown => {
                    tracing::info!(room = %self.room.name(), "room shutting down");
                    break;
                }
            }
        }

        self.room.close();
        tracing::info!(room = %self.room.name(), "room actor stopped");
    }

    async fn handle_join(
        &mut self,
        peer: PeerHandle,
        request: JoinRequest,
        create: bool,
    ) -> Option<Result<JoinResponse, RoomError>> {
        let creating = !self.room.state.exists();
        let decision = self.ask_hook(ActorNr::NONE, |hook, ctx| {
            if creating {
                hook.on_create(ctx, &request)
            } else {
                hook.before_join(ctx, &request)
            }
        });

        let timeout = self.room.limits.plugin_timeout();
        let loaded = match consult(self.room.name(), timeout, decision).await {
            Ok(loaded) => loaded,
            Err(err) => return Some(Err(err)),
        };
        let mut create = create;
        if let Some(state) = loaded {
            if creating {
                match self.guarded("set_state", |room| room.set_state(*state)) {
                    Some(Ok(())) => create = false,
                    Some(Err(err)) => return Some(Err(err)),
                    None => return None,
                }
            } else {
                tracing::warn!(
                    room = %self.room.name(),
                    "hook returned state for an existing room, ignored"
                );
            }
        }
        self.guarded("join", |room| room.join(peer, &request, create))
    }

    async fn handle_raise_event(
        &mut self,
        peer_id: PeerId,
        request: RaiseEventRequest,
    ) -> Option<Result<(), RoomError>> {
        let actor_nr = match self.room.actor_of(peer_id) {
            Ok(nr) => nr,
            Err(err) => return Some(Err(err)),
        };
        let decision = self.ask_hook(actor_nr, |hook, ctx| hook.before_raise_event(ctx, &request));
        let timeout = self.room.limits.plugin_timeout();
        if let Err(err) = consult_without_state(self.room.name(), timeout, decision).await {
            return Some(Err(err));
        }
        self.guarded("raise_event", |room| room.raise_event(peer_id, &request))
    }

    async fn handle_set_properties(
        &mut self,
        peer_id: PeerId,
        request: SetPropertiesRequest,
    ) -> Option<Result<(), RoomError>> {
        let actor_nr = match self.room.actor_of(peer_id) {
            Ok(nr) => nr,
            Err(err) => return Some(Err(err)),
        };
        let decision =
            self.ask_hook(actor_nr, |hook, ctx| hook.before_set_properties(ctx, &request));
        let timeout = self.room.limits.plugin_timeout();
        if let Err(err) = consult_without_state(self.room.name(), timeout, decision).await {
            return Some(Err(err));
        }
        self.guarded("set_properties", |room| room.set_properties(peer_id, &request))
    }

    /// Asks the hook for a decision. A panicking plugin fails the operation.
    fn ask_hook(
        &self,
        actor_nr: ActorNr,
        ask: impl FnOnce(&dyn RoomHook, &HookContext<'_>) -> HookDecision,
    ) -> HookDecision {
        let ctx = self.room.context(actor_nr);
        match catch_unwind(AssertUnwindSafe(|| ask(self.room.hook.as_ref(), &ctx))) {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(room = %self.room.name(), actor = %actor_nr, "plugin panicked");
                HookDecision::fail("plugin panicked")
            }
        }
    }

    /// Runs one engine operation, containing panics.
    ///
    /// Returns `None` if the operation panicked; the caller then drops the
    /// reply and the room keeps serving.
    fn guarded<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Room) -> Result<T, RoomError>,
    ) -> Option<Result<T, RoomError>> {
        match catch_unwind(AssertUnwindSafe(|| f(&mut self.room))) {
            Ok(result) => Some(result),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                if let Some(suppressed) = self.log_guard.permit() {
                    let state = &self.room.state;
                    tracing::error!(
                        room = %state.name(),
                        op,
                        %reason,
                        suppressed,
                        active = ?state.actors().active_numbers(),
                        inactive = state.actors().inactive_count(),
                        master = %state.properties().master_client_id(),
                        flags = ?state.flags(),
                        "room operation failed"
                    );
                }
                None
            }
        }
    }
}

/// Waits for a hook decision. A deferred call parks the room loop until the
/// plugin resumes it or the deadline passes.
async fn consult(
    room: &str,
    default_timeout: Duration,
    decision: HookDecision,
) -> Result<Option<Box<SerializableGameState>>, RoomError> {
    let mut call = match decision {
        HookDecision::Ready(HookOutcome::Continue) => return Ok(None),
        HookDecision::Ready(HookOutcome::ContinueWithState(state)) => return Ok(Some(state)),
        HookDecision::Ready(HookOutcome::Fail(message)) => return Err(RoomError::Plugin(message)),
        HookDecision::Deferred(call) => call,
    };
    let timeout = call.timeout().unwrap_or(default_timeout);
    call.resolve(default_timeout).await;
    match call.into_state() {
        CallState::Continued(state) => Ok(state),
        CallState::Failed(message) => Err(RoomError::Plugin(message)),
        CallState::TimedOut => {
            tracing::warn!(room = %room, ?timeout, "plugin call timed out, failing operation");
            Err(RoomError::PluginTimeout(timeout))
        }
        CallState::Pending => Err(RoomError::Internal("plugin call left pending".into())),
    }
}

/// Like [`consult`], for transitions that cannot load a state.
async fn consult_without_state(
    room: &str,
    default_timeout: Duration,
    decision: HookDecision,
) -> Result<(), RoomError> {
    if consult(room, default_timeout, decision).await?.is_some() {
        tracing::warn!(room = %room, "hook returned state outside room creation, ignored");
    }
    Ok(())
}

/// Spawns a new room actor task and returns a handle to communicate with it.
///
/// `limits.channel_size` controls backpressure: once the channel is full,
/// senders wait.
pub(crate) fn spawn_room(
    name: &str,
    limits: RoomLimits,
    hook: Arc<dyn RoomHook>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(limits.channel_size.max(1));
    let timers = QueueTimers {
        sender: tx.downgrade(),
    };
    let log_guard = LogGuard::new(limits.error_log_interval());
    let actor = RoomActor {
        room: Room::new(name, limits, hook, Box::new(timers)),
        receiver: rx,
        log_guard,
    };

    tokio::spawn(actor.run());

    RoomHandle {
        name: Arc::from(name),
        sender: tx,
    }
}
