//! Routes a peer's operations to the room it is in.
//!
//! The connection layer (not part of this crate) parses requests into
//! [`Operation`]s and calls [`RoomService::handle`] for each one, in the
//! order they arrived. A peer is in at most one room at a time.

use std::collections::HashMap;

use serde::Serialize;
use tavern_protocol::{
    ErrorCode, JoinRequest, JoinResponse, Operation, OperationCode, PeerId, PropertiesResponse,
};
use tavern_room::{PeerHandle, RoomDebugInfo, RoomDirectory, RoomError, RoomHandle};
use tokio::sync::Mutex;

/// Payload of a successful operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum ResponseData {
    None,
    Join(JoinResponse),
    Properties(PropertiesResponse),
    Debug(RoomDebugInfo),
}

/// What the peer gets back for one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse {
    pub op: OperationCode,
    pub return_code: ErrorCode,
    pub debug_message: Option<String>,
    pub data: ResponseData,
}

impl OperationResponse {
    fn ok(op: OperationCode, data: ResponseData) -> Self {
        Self {
            op,
            return_code: ErrorCode::Ok,
            debug_message: None,
            data,
        }
    }

    fn error(op: OperationCode, err: &RoomError) -> Self {
        Self {
            op,
            return_code: err.code(),
            debug_message: Some(err.to_string()),
            data: ResponseData::None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code.is_ok()
    }
}

/// Per-peer front door to the rooms of a [`RoomDirectory`].
pub struct RoomService<D: RoomDirectory> {
    directory: D,
    /// Room each peer is currently in.
    peers: Mutex<HashMap<PeerId, String>>,
}

impl<D: RoomDirectory> RoomService<D> {
    pub fn new(directory: D) -> Self {
        Self {
            directory,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Name of the room the peer is in.
    pub async fn room_of(&self, peer_id: PeerId) -> Option<String> {
        self.peers.lock().await.get(&peer_id).cloned()
    }

    /// Runs one operation for `peer` and builds its response.
    pub async fn handle(&self, peer: &PeerHandle, op: Operation) -> OperationResponse {
        let code = op.code();
        let peer_id = peer.peer_id();
        let result = match op {
            Operation::CreateGame(request) => self.join(peer, request, true).await,
            Operation::JoinGame(request) => self.join(peer, request, false).await,
            Operation::Leave(request) => match self.current_room(peer_id).await {
                Ok(room) => {
                    let result = room.leave(peer_id, request).await;
                    self.forget(peer_id).await;
                    result.map(|()| ResponseData::None)
                }
                Err(err) => Err(err),
            },
            Operation::RaiseEvent(request) => match self.current_room(peer_id).await {
                Ok(room) => room
                    .raise_event(peer_id, request)
                    .await
                    .map(|()| ResponseData::None),
                Err(err) => Err(err),
            },
            Operation::SetProperties(request) => match self.current_room(peer_id).await {
                Ok(room) => room
                    .set_properties(peer_id, request)
                    .await
                    .map(|()| ResponseData::None),
                Err(err) => Err(err),
            },
            Operation::GetProperties(request) => match self.current_room(peer_id).await {
                Ok(room) => room
                    .get_properties(peer_id, request)
                    .await
                    .map(ResponseData::Properties),
                Err(err) => Err(err),
            },
            Operation::ChangeGroups(request) => match self.current_room(peer_id).await {
                Ok(room) => room
                    .change_groups(peer_id, request)
                    .await
                    .map(|()| ResponseData::None),
                Err(err) => Err(err),
            },
            Operation::DebugGame => match self.current_room(peer_id).await {
                Ok(room) => room.debug().await.map(ResponseData::Debug),
                Err(err) => Err(err),
            },
        };

        match result {
            Ok(data) => OperationResponse::ok(code, data),
            Err(err) => {
                tracing::debug!(peer = %peer_id, op = %code, error = %err, "operation failed");
                OperationResponse::error(code, &err)
            }
        }
    }

    /// The peer's connection went away.
    pub async fn disconnect(&self, peer_id: PeerId) {
        let Some(name) = self.peers.lock().await.remove(&peer_id) else {
            return;
        };
        if let Some(room) = self.directory.find(&name).await {
            if let Err(err) = room.disconnect(peer_id).await {
                tracing::warn!(peer = %peer_id, room = %name, error = %err, "disconnect failed");
            }
        }
        self.directory.release(&name).await;
        tracing::info!(peer = %peer_id, room = %name, "peer disconnected");
    }

    async fn join(
        &self,
        peer: &PeerHandle,
        request: JoinRequest,
        create: bool,
    ) -> Result<ResponseData, RoomError> {
        let peer_id = peer.peer_id();
        if let Some(current) = self.room_of(peer_id).await {
            return Err(RoomError::InvalidOperation(format!(
                "{peer_id} is already in room {current}"
            )));
        }
        if request.room_name.is_empty() {
            return Err(RoomError::InvalidOperation("room name is empty".into()));
        }

        let name = request.room_name.clone();
        let room = self.directory.acquire(&name).await;
        match room.join(peer.clone(), request, create).await {
            Ok(response) => {
                self.peers.lock().await.insert(peer_id, name);
                Ok(ResponseData::Join(response))
            }
            Err(err) => {
                self.directory.release(&name).await;
                Err(err)
            }
        }
    }

    async fn current_room(&self, peer_id: PeerId) -> Result<RoomHandle, RoomError> {
        let name = self
            .room_of(peer_id)
            .await
            .ok_or(RoomError::NotJoined(peer_id))?;
        self.directory
            .find(&name)
            .await
            .ok_or(RoomError::Unavailable(name))
    }

    /// Drops the peer's room reference after it left.
    async fn forget(&self, peer_id: PeerId) {
        if let Some(name) = self.peers.lock().await.remove(&peer_id) {
            self.directory.release(&name).await;
        }
    }
}
