//! Error types for the room layer.

use std::time::Duration;

use tavern_protocol::{ActorNr, ErrorCode, PeerId, ProtocolError};

/// Errors that can occur during room operations.
///
/// Every variant maps to a caller-facing [`ErrorCode`] through
/// [`RoomError::code`]; the `Display` text becomes the debug message.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// A join without create permission found no room.
    #[error("room {0} does not exist")]
    GameDoesNotExist(String),

    /// CreateGame on a room that already exists.
    #[error("room {0} already exists")]
    GameIdAlreadyExists(String),

    /// No free actor slot.
    #[error("room is full")]
    GameFull,

    /// The room does not accept new actors.
    #[error("{}", closed_message(*cache_discarded))]
    GameClosed { cache_discarded: bool },

    /// The peer already owns this actor, or an actor in this room.
    #[error("actor {0} already joined")]
    AlreadyJoined(ActorNr),

    /// An inactive actor of the same user exists and the join mode does not
    /// allow re-attaching to it.
    #[error("found inactive actor for user {0}")]
    InactiveJoinerFound(String),

    /// An active actor of the same user exists.
    #[error("found active actor for user {0}")]
    ActiveJoinerFound(String),

    /// A rejoin found nothing to re-attach to.
    #[error("rejoin failed: {0}")]
    RejoinerNotFound(String),

    /// The user id is on the room's ban list.
    #[error("excluded user id {user_id} (banned): {reason}")]
    Excluded { user_id: String, reason: String },

    /// A CAS expectation did not match the stored value.
    #[error("CAS check failed for property {0}")]
    CasMismatch(String),

    /// The update would push the room over its property quota.
    #[error("properties too large: {size} bytes exceeds quota of {limit}")]
    PropertiesTooLarge { size: usize, limit: usize },

    /// The requested cache slice was purged or never existed.
    #[error("cache slice {0} does not exist")]
    SliceDoesNotExist(u32),

    /// Request validation failed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The peer has no actor in this room.
    #[error("{0} has not joined this room")]
    NotJoined(PeerId),

    /// A hook failed the operation.
    #[error("plugin reported error: {0}")]
    Plugin(String),

    /// A deferred hook call did not resolve in time.
    #[error("plugin call timed out after {0:?}")]
    PluginTimeout(Duration),

    /// The room is in a state that doesn't allow this operation.
    #[error("invalid room state: {0}")]
    InvalidState(String),

    /// A persisted blob could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Bookkeeping went wrong inside the room.
    #[error("internal error: {0}")]
    Internal(String),

    /// The room's command channel is full or closed.
    #[error("room {0} is unavailable")]
    Unavailable(String),
}

fn closed_message(cache_discarded: bool) -> &'static str {
    if cache_discarded {
        "room is closed: event cache discarded"
    } else {
        "room is closed"
    }
}

impl RoomError {
    /// The protocol error code reported to the caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::GameDoesNotExist(_) => ErrorCode::GameDoesNotExist,
            Self::GameIdAlreadyExists(_) => ErrorCode::GameIdAlreadyExists,
            Self::GameFull => ErrorCode::GameFull,
            Self::GameClosed { .. } => ErrorCode::GameClosed,
            Self::AlreadyJoined(_) => ErrorCode::JoinFailedPeerAlreadyJoined,
            Self::InactiveJoinerFound(_) => ErrorCode::JoinFailedFoundInactiveJoiner,
            Self::ActiveJoinerFound(_) => ErrorCode::JoinFailedFoundActiveJoiner,
            Self::RejoinerNotFound(_) => ErrorCode::JoinFailedWithRejoinerNotFound,
            Self::Excluded { .. } => ErrorCode::JoinFailedFoundExcludedUserId,
            Self::CasMismatch(_) => ErrorCode::CasMismatch,
            Self::PropertiesTooLarge { .. } => ErrorCode::PropertiesTooLarge,
            Self::SliceDoesNotExist(_) => ErrorCode::SliceDoesNotExist,
            Self::InvalidOperation(_) | Self::InvalidState(_) => ErrorCode::OperationInvalid,
            Self::NotJoined(_) => ErrorCode::NotJoined,
            Self::Plugin(_) => ErrorCode::PluginReportedError,
            Self::PluginTimeout(_) => ErrorCode::PluginTimeout,
            Self::Protocol(_) | Self::Internal(_) | Self::Unavailable(_) => {
                ErrorCode::InternalServerError
            }
        }
    }
}
