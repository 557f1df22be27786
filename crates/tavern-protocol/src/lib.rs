//! Protocol types for the Tavern room engine.
//!
//! This crate defines the "language" spoken between the connection layer
//! and the rooms:
//!
//! - **Types** ([`Operation`], [`RoomEvent`], [`PropertyMap`], [`Value`],
//!   [`ErrorCode`], etc.): already-parsed requests and the events rooms emit.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how values are turned into
//!   opaque blobs for persisted room state.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! ```text
//! Connection layer (bytes) → Protocol (Operation) → Room (state machine)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    ActorNr, ChangeGroupsRequest, ErrorCode, EventCaching, GetPropertiesRequest,
    Hashtable, JoinMode, JoinRequest, JoinResponse, Key, KeyedMap, LeaveRequest,
    LobbyInfo, Operation, OperationCode, PeerId, PropertiesResponse, PropertyKey,
    PropertyMap, PropertyScope, PropertyTarget, RaiseEventRequest, ReceiverGroup,
    RoomEvent, RoomFlags, SetPropertiesRequest, Value, WellKnownKey,
};
