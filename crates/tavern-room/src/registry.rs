//! Room registry: creates rooms on demand, reference-counts them, and evicts
//! rooms nobody references once their empty-room TTL has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::room::spawn_room;
use crate::{RoomHandle, RoomHook, RoomLimits};

/// Where the service layer finds rooms.
///
/// A reference taken with [`acquire`](Self::acquire) keeps the room alive
/// until it is given back with [`release`](Self::release).
pub trait RoomDirectory {
    /// Returns the room, starting it if needed, and takes a reference.
    async fn acquire(&self, name: &str) -> RoomHandle;

    /// Gives a reference back. The last one starts the eviction timer.
    async fn release(&self, name: &str);

    /// Returns the room if it is running, without taking a reference.
    async fn find(&self, name: &str) -> Option<RoomHandle>;
}

struct RoomEntry {
    handle: RoomHandle,
    refs: usize,
    eviction: Option<AbortHandle>,
    /// Bumped on every ref change so a stale eviction timer can tell.
    epoch: u64,
}

impl RoomEntry {
    fn cancel_eviction(&mut self) {
        if let Some(timer) = self.eviction.take() {
            timer.abort();
        }
    }
}

/// The default [`RoomDirectory`]: one room task per name.
///
/// Cloning shares the same set of rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, RoomEntry>>>,
    limits: RoomLimits,
    hook: Arc<dyn RoomHook>,
}

impl RoomRegistry {
    pub fn new(limits: RoomLimits, hook: Arc<dyn RoomHook>) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            limits: limits.validated(),
            hook,
        }
    }

    pub fn limits(&self) -> &RoomLimits {
        &self.limits
    }

    /// Returns the number of running rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Lists all running room names.
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// References currently held on a room.
    pub async fn refs(&self, name: &str) -> Option<usize> {
        self.rooms.lock().await.get(name).map(|e| e.refs)
    }

    /// Stops every room.
    pub async fn shutdown_all(&self) {
        let entries: Vec<RoomEntry> = self.rooms.lock().await.drain().map(|(_, e)| e).collect();
        for mut entry in entries {
            entry.cancel_eviction();
            let _ = entry.handle.shutdown().await;
        }
    }

    fn schedule_eviction(&self, name: &str, entry: &mut RoomEntry) {
        let registry = self.clone();
        let handle = entry.handle.clone();
        let name = name.to_string();
        let epoch = entry.epoch;
        let task = tokio::spawn(async move {
            let ttl = match handle.info().await {
                Ok(info) => info.empty_room_ttl,
                Err(_) => Duration::ZERO,
            };
            tokio::time::sleep(ttl).await;
            registry.evict(&name, epoch).await;
        });
        entry.eviction = Some(task.abort_handle());
    }

    async fn evict(&self, name: &str, epoch: u64) {
        let handle = {
            let mut rooms = self.rooms.lock().await;
            match rooms.get(name) {
                Some(entry) if entry.refs == 0 && entry.epoch == epoch => {}
                _ => return,
            }
            rooms.remove(name).map(|e| e.handle)
        };
        if let Some(handle) = handle {
            let _ = handle.shutdown().await;
            tracing::info!(room = %name, "empty room evicted");
        }
    }
}

impl RoomDirectory for RoomRegistry {
    async fn acquire(&self, name: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock().await;
        if let Some(entry) = rooms.get_mut(name) {
            if !entry.handle.is_closed() {
                entry.cancel_eviction();
                entry.refs += 1;
                entry.epoch += 1;
                return entry.handle.clone();
            }
            tracing::warn!(room = %name, "room task gone, restarting");
        }

        let handle = spawn_room(name, self.limits.clone(), Arc::clone(&self.hook));
        rooms.insert(
            name.to_string(),
            RoomEntry {
                handle: handle.clone(),
                refs: 1,
                eviction: None,
                epoch: 0,
            },
        );
        tracing::info!(room = %name, rooms = rooms.len(), "room started");
        handle
    }

    async fn release(&self, name: &str) {
        let mut rooms = self.rooms.lock().await;
        let Some(entry) = rooms.get_mut(name) else {
            tracing::warn!(room = %name, "release of unknown room ignored");
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        entry.epoch += 1;
        if entry.refs == 0 {
            self.schedule_eviction(name, entry);
        }
    }

    async fn find(&self, name: &str) -> Option<RoomHandle> {
        self.rooms
            .lock()
            .await
            .get(name)
            .filter(|e| !e.handle.is_closed())
            .map(|e| e.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopHook;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(RoomLimits::default(), Arc::new(NoopHook))
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reuses_running_room() {
        let registry = registry();
        let a = registry.acquire("lobby").await;
        let b = registry.acquire("lobby").await;
        assert_eq!(a.name(), b.name());
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(registry.refs("lobby").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_evicts_after_ttl() {
        let registry = registry();
        registry.acquire("r").await;
        registry.release("r").await;

        // Default empty-room TTL is 0.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.find("r").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_cancels_eviction() {
        let limits = RoomLimits {
            default_empty_room_ttl_ms: 1_000,
            ..RoomLimits::default()
        };
        let registry = RoomRegistry::new(limits, Arc::new(NoopHook));
        registry.acquire("r").await;
        registry.release("r").await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        registry.acquire("r").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.room_names().await, vec!["r".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_clears_rooms() {
        let registry = registry();
        let handle = registry.acquire("a").await;
        registry.acquire("b").await;
        registry.shutdown_all().await;
        assert_eq!(registry.room_count().await, 0);
        while !handle.is_closed() {
            tokio::task::yield_now().await;
        }
    }
}
