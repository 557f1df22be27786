//! The room-wide, sliced event cache.
//!
//! Events raised with `AddToRoomCache` are appended to the current slice and
//! replayed to later joiners. Slices let a game drop old history in bulk:
//! move on to a new slice, then purge everything before it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tavern_protocol::{ActorNr, Hashtable, RoomEvent};

use crate::RoomError;

/// A cached custom event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEvent {
    /// Owner; `ActorNr::NONE` for global events.
    pub actor_nr: ActorNr,
    pub code: u8,
    pub data: Hashtable,
}

impl CachedEvent {
    pub fn to_event(&self) -> RoomEvent {
        RoomEvent::Custom {
            code: self.code,
            data: self.data.clone(),
            sender: self.actor_nr,
        }
    }
}

/// What happened to an event offered to a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Stored,
    /// The cache was already discarded; nothing was stored.
    Ignored,
    /// This event pushed the cache over its limit and it was discarded.
    Discarded,
}

/// Persisted form of a [`RoomEventCache`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomCacheSnapshot {
    pub current_slice: u32,
    pub slices: Vec<(u32, Vec<CachedEvent>)>,
    pub discarded: bool,
}

#[derive(Debug)]
pub struct RoomEventCache {
    slices: BTreeMap<u32, Vec<CachedEvent>>,
    current: u32,
    total: usize,
    max_events: usize,
    max_slices: usize,
    discarded: bool,
    slice_limit_exceeded: bool,
}

impl RoomEventCache {
    pub fn new(max_events: usize, max_slices: usize) -> Self {
        Self {
            slices: BTreeMap::from([(0, Vec::new())]),
            current: 0,
            total: 0,
            max_events,
            max_slices,
            discarded: false,
            slice_limit_exceeded: false,
        }
    }

    pub fn add_event_to_current_slice(&mut self, event: CachedEvent) -> CacheOutcome {
        if self.discarded {
            return CacheOutcome::Ignored;
        }
        if self.total + 1 > self.max_events {
            tracing::warn!(
                limit = self.max_events,
                "room event cache limit exceeded, discarding cache"
            );
            self.discard();
            return CacheOutcome::Discarded;
        }
        self.slices.entry(self.current).or_default().push(event);
        self.total += 1;
        CacheOutcome::Stored
    }

    /// Opens the next slice and makes it current. Returns the new index.
    pub fn slice_increase_index(&mut self) -> u32 {
        let next = self.current.saturating_add(1);
        self.open_slice(next);
        next
    }

    /// Makes `idx` the current slice. Returns `true` if it changed.
    ///
    /// Moving forward opens the slice; moving back is only allowed to a
    /// slice that still exists, so slices keep being created in increasing
    /// order.
    pub fn slice_set_index(&mut self, idx: u32) -> Result<bool, RoomError> {
        if idx == self.current {
            return Ok(false);
        }
        if idx < self.current && !self.slices.contains_key(&idx) {
            return Err(RoomError::SliceDoesNotExist(idx));
        }
        self.open_slice(idx);
        Ok(true)
    }

    fn open_slice(&mut self, idx: u32) {
        self.current = idx;
        self.slices.entry(idx).or_default();
        if self.slices.len() > self.max_slices && !self.slice_limit_exceeded {
            self.slice_limit_exceeded = true;
            tracing::warn!(
                slices = self.slices.len(),
                limit = self.max_slices,
                "room cache slice limit exceeded"
            );
        }
    }

    /// Deletes one slice. The current slice cannot be purged.
    pub fn slice_purge_index(&mut self, idx: u32) -> Result<(), RoomError> {
        if idx == self.current {
            return Err(RoomError::InvalidOperation(format!(
                "cannot purge current cache slice {idx}"
            )));
        }
        let removed = self
            .slices
            .remove(&idx)
            .ok_or(RoomError::SliceDoesNotExist(idx))?;
        self.total -= removed.len();
        Ok(())
    }

    /// Deletes every slice below `idx`. Returns how many were removed.
    ///
    /// `idx` must lie strictly below the current slice; anything else fails
    /// and leaves the cache untouched.
    pub fn slice_purge_up_to_index(&mut self, idx: u32) -> Result<usize, RoomError> {
        if idx >= self.current {
            return Err(RoomError::InvalidOperation(format!(
                "cannot purge up to {idx}, current slice is {}",
                self.current
            )));
        }
        let keep = self.slices.split_off(&idx);
        let purged = std::mem::replace(&mut self.slices, keep);
        self.total -= purged.values().map(Vec::len).sum::<usize>();
        Ok(purged.len())
    }

    /// Removes events matching every given filter. `data` matches events
    /// whose payload contains all of its entries.
    pub fn remove_events(
        &mut self,
        actors: Option<&[ActorNr]>,
        code: Option<u8>,
        data: Option<&Hashtable>,
    ) -> usize {
        self.remove_where(|e| {
            actors.is_none_or(|list| list.contains(&e.actor_nr))
                && code.is_none_or(|c| c == e.code)
                && data.is_none_or(|filter| {
                    filter.iter().all(|(k, v)| e.data.get(k) == Some(v))
                })
        })
    }

    /// Removes events of actors that are no longer in the room. Global
    /// events are kept.
    pub fn remove_events_of_departed(&mut self, present: impl Fn(ActorNr) -> bool) -> usize {
        self.remove_where(|e| !e.actor_nr.is_none() && !present(e.actor_nr))
    }

    pub fn remove_actor_events(&mut self, actor: ActorNr) -> usize {
        self.remove_where(|e| e.actor_nr == actor)
    }

    fn remove_where(&mut self, matches: impl Fn(&CachedEvent) -> bool) -> usize {
        let mut removed = 0;
        for events in self.slices.values_mut() {
            let before = events.len();
            events.retain(|e| !matches(e));
            removed += before - events.len();
        }
        self.total -= removed;
        removed
    }

    /// Events to replay to a joiner, starting at slice `from` (all slices
    /// when `None`). Every non-zero slice is preceded by a
    /// `CacheSliceChanged` marker.
    pub fn replay(&self, from: Option<u32>) -> Result<Vec<RoomEvent>, RoomError> {
        if let Some(idx) = from {
            self.ensure_slice(idx)?;
        }
        let start = from.unwrap_or(0);
        let mut out = Vec::new();
        for (idx, events) in self.slices.range(start..) {
            if *idx != 0 {
                out.push(RoomEvent::CacheSliceChanged { slice: *idx });
            }
            out.extend(events.iter().map(CachedEvent::to_event));
        }
        Ok(out)
    }

    pub fn ensure_slice(&self, idx: u32) -> Result<(), RoomError> {
        if self.slices.contains_key(&idx) {
            Ok(())
        } else {
            Err(RoomError::SliceDoesNotExist(idx))
        }
    }

    fn discard(&mut self) {
        self.discarded = true;
        self.total = 0;
        for events in self.slices.values_mut() {
            events.clear();
        }
    }

    pub fn current_slice(&self) -> u32 {
        self.current
    }

    pub fn slice_indices(&self) -> Vec<u32> {
        self.slices.keys().copied().collect()
    }

    pub fn total_events(&self) -> usize {
        self.total
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn slice_limit_exceeded(&self) -> bool {
        self.slice_limit_exceeded
    }

    pub fn snapshot(&self) -> RoomCacheSnapshot {
        RoomCacheSnapshot {
            current_slice: self.current,
            slices: self
                .slices
                .iter()
                .map(|(idx, events)| (*idx, events.clone()))
                .collect(),
            discarded: self.discarded,
        }
    }

    pub fn restore(&mut self, snapshot: RoomCacheSnapshot) {
        self.slices = snapshot.slices.into_iter().collect();
        self.current = snapshot.current_slice;
        self.slices.entry(self.current).or_default();
        self.total = self.slices.values().map(Vec::len).sum();
        self.discarded = snapshot.discarded;
        self.slice_limit_exceeded = self.slices.len() > self.max_slices;
    }
}
