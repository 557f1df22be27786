//! Per-actor event cache keyed by owner and event code.
//!
//! Unlike the room cache this keeps one payload per (actor, code): later
//! events are merged into or replace the stored payload. A joiner receives
//! every stored payload as a custom event from its owner, after the room
//! cache replay.
//!
//! Two limits apply. The total entry count is hard: crossing it discards
//! the whole cache and the room is closed by the engine. The per-actor
//! count is soft: crossing it is logged once and recorded for the debug
//! dump, nothing is dropped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tavern_protocol::{ActorNr, Hashtable, RoomEvent};

use crate::event_cache::CacheOutcome;

/// One persisted actor cache entry.
///
/// The persisted form is flat; [`ActorEventCache::restore`] rebuilds the
/// nested map from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorCacheEntry {
    /// Owner of the entry, also the `sender` of the replayed event.
    pub actor_nr: ActorNr,
    pub code: u8,
    pub data: Hashtable,
}

/// The per-actor cache itself.
///
/// Both maps are `BTreeMap`s so replay order is stable: by owner, then by
/// event code.
#[derive(Debug)]
pub struct ActorEventCache {
    entries: BTreeMap<ActorNr, BTreeMap<u8, Hashtable>>,
    /// Number of (actor, code) entries across all owners.
    total: usize,
    max_total: usize,
    max_per_actor: usize,
    /// Set once the total limit is crossed. Never cleared, except by a
    /// restore that carries it.
    discarded: bool,
    /// Latched the first time any owner crosses `max_per_actor`.
    per_actor_limit_exceeded: bool,
}

impl ActorEventCache {
    /// Creates an empty cache with the given total and per-actor limits.
    pub fn new(max_total: usize, max_per_actor: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            total: 0,
            max_total,
            max_per_actor,
            discarded: false,
            per_actor_limit_exceeded: false,
        }
    }

    /// Shallow-merges `data` into the stored payload.
    ///
    /// Keys of `data` overwrite stored keys one by one. A null value removes
    /// its own key and nothing else. If nothing is left afterwards the entry
    /// is deleted.
    pub fn merge(&mut self, actor: ActorNr, code: u8, data: &Hashtable) -> CacheOutcome {
        if self.discarded {
            return CacheOutcome::Ignored;
        }
        let mut merged = self.get(actor, code).cloned().unwrap_or_default();
        for (key, value) in data {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        if merged.is_empty() {
            self.remove_cache(actor, code);
            return CacheOutcome::Stored;
        }
        self.store(actor, code, merged)
    }

    /// Overwrites the stored payload unconditionally.
    ///
    /// An empty `data` is stored as an empty entry; use
    /// [`remove_cache`](Self::remove_cache) to delete.
    pub fn replace(&mut self, actor: ActorNr, code: u8, data: &Hashtable) -> CacheOutcome {
        if self.discarded {
            return CacheOutcome::Ignored;
        }
        self.store(actor, code, data.clone())
    }

    /// Writes one entry, enforcing both limits.
    ///
    /// Only a new (actor, code) pair counts against the total limit; an
    /// update in place never discards.
    fn store(&mut self, actor: ActorNr, code: u8, data: Hashtable) -> CacheOutcome {
        let is_new = self.get(actor, code).is_none();
        if is_new && self.total + 1 > self.max_total {
            tracing::warn!(
                limit = self.max_total,
                actor = %actor,
                "actor event cache limit exceeded, discarding cache"
            );
            self.entries.clear();
            self.total = 0;
            self.discarded = true;
            return CacheOutcome::Discarded;
        }

        let per_actor = self.entries.entry(actor).or_default();
        per_actor.insert(code, data);
        if is_new {
            self.total += 1;
        }
        // Soft limit: warn once per cache, keep the entry.
        if per_actor.len() > self.max_per_actor && !self.per_actor_limit_exceeded {
            self.per_actor_limit_exceeded = true;
            tracing::warn!(
                actor = %actor,
                entries = per_actor.len(),
                limit = self.max_per_actor,
                "per-actor event cache limit exceeded"
            );
        }
        CacheOutcome::Stored
    }

    /// Deletes one entry. Returns `true` if it existed.
    ///
    /// An owner left with no entries is dropped from the map entirely.
    pub fn remove_cache(&mut self, actor: ActorNr, code: u8) -> bool {
        let Some(per_actor) = self.entries.get_mut(&actor) else {
            return false;
        };
        let removed = per_actor.remove(&code).is_some();
        if per_actor.is_empty() {
            self.entries.remove(&actor);
        }
        if removed {
            self.total -= 1;
        }
        removed
    }

    /// Drops every entry owned by `actor`. Returns how many were removed.
    pub fn remove_actor(&mut self, actor: ActorNr) -> usize {
        let removed = self.entries.remove(&actor).map_or(0, |m| m.len());
        self.total -= removed;
        removed
    }

    /// Returns the stored payload for (actor, code), if any.
    pub fn get(&self, actor: ActorNr, code: u8) -> Option<&Hashtable> {
        self.entries.get(&actor).and_then(|m| m.get(&code))
    }

    /// Every cached payload as a custom event from its owner, ordered by
    /// owner then code.
    pub fn replay(&self) -> Vec<RoomEvent> {
        self.entries
            .iter()
            .flat_map(|(actor, per_actor)| {
                per_actor.iter().map(move |(code, data)| RoomEvent::Custom {
                    code: *code,
                    data: data.clone(),
                    sender: *actor,
                })
            })
            .collect()
    }

    pub fn total_entries(&self) -> usize {
        self.total
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn per_actor_limit_exceeded(&self) -> bool {
        self.per_actor_limit_exceeded
    }

    /// Flattens the cache for persistence, in replay order.
    pub fn snapshot(&self) -> Vec<ActorCacheEntry> {
        self.entries
            .iter()
            .flat_map(|(actor, per_actor)| {
                per_actor.iter().map(move |(code, data)| ActorCacheEntry {
                    actor_nr: *actor,
                    code: *code,
                    data: data.clone(),
                })
            })
            .collect()
    }

    /// Replaces the contents with persisted entries.
    ///
    /// Limits are not re-checked here: a persisted cache was within limits
    /// when it was written, and a discarded one arrives empty with
    /// `discarded` set.
    pub fn restore(&mut self, entries: Vec<ActorCacheEntry>, discarded: bool) {
        self.entries.clear();
        self.total = 0;
        for entry in entries {
            // Duplicate (actor, code) pairs collapse; the last one wins.
            if self
                .entries
                .entry(entry.actor_nr)
                .or_default()
                .insert(entry.code, entry.data)
                .is_none()
            {
                self.total += 1;
            }
        }
        self.discarded = discarded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_protocol::{Key, Value};

    fn cache() -> ActorEventCache {
        ActorEventCache::new(100, 10)
    }

    #[test]
    fn test_merge_nulls_remove_only_their_key() {
        let mut cache = cache();
        let a = ActorNr(1);
        cache.merge(a, 1, &Hashtable::new().with(1i64, "v1"));
        cache.merge(a, 1, &Hashtable::new().with(2i64, "v3").with(3i64, "v4"));
        cache.merge(a, 1, &Hashtable::new().with(2i64, Value::Null));

        let stored = cache.get(a, 1).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.get(&Key::Int(1)), Some(&Value::from("v1")));
        assert_eq!(stored.get(&Key::Int(3)), Some(&Value::from("v4")));
    }

    #[test]
    fn test_merge_nulling_all_but_one_key() {
        let mut cache = cache();
        let a = ActorNr(1);
        cache.merge(a, 1, &Hashtable::new().with(1i64, "v1"));
        cache.merge(a, 1, &Hashtable::new().with(2i64, "v3").with(3i64, "v4"));
        cache.merge(
            a,
            1,
            &Hashtable::new().with(1i64, Value::Null).with(2i64, Value::Null),
        );

        assert_eq!(cache.get(a, 1), Some(&Hashtable::new().with(3i64, "v4")));
    }

    #[test]
    fn test_merge_to_empty_deletes_entry() {
        let mut cache = cache();
        let a = ActorNr(1);
        cache.merge(a, 1, &Hashtable::new().with(1i64, "v1"));
        cache.merge(a, 1, &Hashtable::new().with(1i64, Value::Null));
        assert!(cache.get(a, 1).is_none());
        assert_eq!(cache.total_entries(), 0);
    }

    #[test]
    fn test_replace_overwrites() {
        let mut cache = cache();
        let a = ActorNr(2);
        cache.merge(a, 5, &Hashtable::new().with(1i64, 1i64).with(2i64, 2i64));
        cache.replace(a, 5, &Hashtable::new().with(9i64, 9i64));
        assert_eq!(cache.get(a, 5), Some(&Hashtable::new().with(9i64, 9i64)));
        assert_eq!(cache.total_entries(), 1);
    }

    #[test]
    fn test_replace_with_empty_payload_keeps_entry() {
        let mut cache = cache();
        let a = ActorNr(2);
        cache.replace(a, 5, &Hashtable::new().with(1i64, 1i64));
        assert_eq!(cache.replace(a, 5, &Hashtable::new()), CacheOutcome::Stored);

        assert_eq!(cache.get(a, 5), Some(&Hashtable::new()));
        assert_eq!(cache.total_entries(), 1);
        assert_eq!(
            cache.replay(),
            vec![RoomEvent::Custom {
                code: 5,
                data: Hashtable::new(),
                sender: a,
            }]
        );

        assert!(cache.remove_cache(a, 5));
        assert_eq!(cache.total_entries(), 0);
    }

    #[test]
    fn test_total_limit_discards_everything() {
        let mut cache = ActorEventCache::new(2, 10);
        let data = Hashtable::new().with(1i64, true);
        assert_eq!(cache.replace(ActorNr(1), 1, &data), CacheOutcome::Stored);
        assert_eq!(cache.replace(ActorNr(1), 2, &data), CacheOutcome::Stored);
        // Updating an existing entry does not grow the cache.
        assert_eq!(cache.merge(ActorNr(1), 2, &data), CacheOutcome::Stored);
        assert_eq!(cache.replace(ActorNr(2), 1, &data), CacheOutcome::Discarded);

        assert!(cache.is_discarded());
        assert!(cache.replay().is_empty());
        assert_eq!(cache.merge(ActorNr(1), 1, &data), CacheOutcome::Ignored);
    }

    #[test]
    fn test_per_actor_limit_only_flags() {
        let mut cache = ActorEventCache::new(100, 1);
        let data = Hashtable::new().with(1i64, true);
        cache.replace(ActorNr(1), 1, &data);
        assert!(!cache.per_actor_limit_exceeded());
        assert_eq!(cache.replace(ActorNr(1), 2, &data), CacheOutcome::Stored);
        assert!(cache.per_actor_limit_exceeded());
        assert!(!cache.is_discarded());
        assert_eq!(cache.total_entries(), 2);
    }

    #[test]
    fn test_remove_actor_and_replay_order() {
        let mut cache = cache();
        let data = Hashtable::new().with(1i64, true);
        cache.replace(ActorNr(2), 7, &data);
        cache.replace(ActorNr(1), 9, &data);
        cache.replace(ActorNr(1), 3, &data);

        let order: Vec<(ActorNr, u8)> = cache
            .replay()
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::Custom { code, sender, .. } => Some((sender, code)),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![(ActorNr(1), 3), (ActorNr(1), 9), (ActorNr(2), 7)]);

        assert_eq!(cache.remove_actor(ActorNr(1)), 2);
        assert_eq!(cache.total_entries(), 1);
    }
}
