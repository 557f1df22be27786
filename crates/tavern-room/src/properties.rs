//! CAS-guarded property store used for room and actor properties.

use tavern_protocol::{ActorNr, PropertyKey, PropertyMap, PropertyScope, Value, WellKnownKey};

use crate::RoomError;

/// A keyed value store with compare-and-set multi-key writes.
///
/// Well-known keys live in the same map as custom keys; the typed accessors
/// below read that map, so the two views can never disagree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyStore {
    values: PropertyMap,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: PropertyMap) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &PropertyKey) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_well_known(&self, key: WellKnownKey) -> Option<&Value> {
        self.values.get(&PropertyKey::WellKnown(key))
    }

    /// Unconditional write.
    pub fn set(&mut self, key: impl Into<PropertyKey>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &PropertyKey) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn as_map(&self) -> &PropertyMap {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Approximate encoded size of everything stored.
    pub fn total_size(&self) -> usize {
        self.values.approx_size()
    }

    /// Checks every CAS expectation against the stored values.
    ///
    /// A `Null` expectation matches an absent key (or a stored null).
    pub fn check_expected(&self, expected: &PropertyMap) -> Result<(), RoomError> {
        for (key, want) in expected {
            let matches = match self.values.get(key) {
                Some(stored) => stored == want,
                None => want.is_null(),
            };
            if !matches {
                return Err(RoomError::CasMismatch(key.to_string()));
            }
        }
        Ok(())
    }

    /// Applies a multi-key update, returning the entries that actually
    /// changed.
    ///
    /// With `expected`, nothing is written unless every expectation holds.
    /// A `Null` value deletes its key when `delete_nulls` is set and is
    /// stored as null otherwise.
    pub fn set_properties(
        &mut self,
        new: &PropertyMap,
        expected: Option<&PropertyMap>,
        delete_nulls: bool,
    ) -> Result<PropertyMap, RoomError> {
        if let Some(expected) = expected {
            self.check_expected(expected)?;
        }

        let mut changed = PropertyMap::new();
        for (key, value) in new {
            if value.is_null() && delete_nulls {
                if self.values.remove(key).is_some() {
                    changed.insert(key.clone(), Value::Null);
                }
                continue;
            }
            if self.values.get(key) != Some(value) {
                self.values.insert(key.clone(), value.clone());
                changed.insert(key.clone(), value.clone());
            }
        }
        Ok(changed)
    }

    /// Returns the stored entries, restricted to `keys` when given.
    pub fn filtered(&self, keys: Option<&[PropertyKey]>) -> PropertyMap {
        match keys {
            None => self.values.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        }
    }

    // -- typed game accessors --

    /// 0 means unlimited.
    pub fn max_players(&self) -> u8 {
        self.int(WellKnownKey::MaxPlayers)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.bool(WellKnownKey::IsOpen).unwrap_or(true)
    }

    pub fn is_visible(&self) -> bool {
        self.bool(WellKnownKey::IsVisible).unwrap_or(true)
    }

    pub fn master_client_id(&self) -> ActorNr {
        self.int(WellKnownKey::MasterClientId)
            .and_then(|v| i32::try_from(v).ok())
            .map(ActorNr)
            .unwrap_or(ActorNr::NONE)
    }

    pub fn set_master_client_id(&mut self, actor: ActorNr) {
        self.set(WellKnownKey::MasterClientId, actor.0);
    }

    pub fn expected_users(&self) -> Vec<String> {
        self.strings(WellKnownKey::ExpectedUsers)
    }

    pub fn lobby_properties(&self) -> Vec<String> {
        self.strings(WellKnownKey::LobbyProperties)
    }

    /// Milliseconds; `< 0` keeps inactive actors forever.
    pub fn player_ttl(&self) -> i32 {
        self.int(WellKnownKey::PlayerTtl)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn empty_room_ttl(&self) -> i32 {
        self.int(WellKnownKey::EmptyRoomTtl)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0)
    }

    // -- typed actor accessors --

    pub fn nickname(&self) -> Option<&str> {
        self.get_well_known(WellKnownKey::Nickname).and_then(Value::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.get_well_known(WellKnownKey::UserId).and_then(Value::as_str)
    }

    pub fn is_inactive(&self) -> bool {
        self.bool(WellKnownKey::IsInactive).unwrap_or(false)
    }

    fn int(&self, key: WellKnownKey) -> Option<i64> {
        self.get_well_known(key).and_then(Value::as_int)
    }

    fn bool(&self, key: WellKnownKey) -> Option<bool> {
        self.get_well_known(key).and_then(Value::as_bool)
    }

    fn strings(&self, key: WellKnownKey) -> Vec<String> {
        self.get_well_known(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Type-checks every well-known entry of `props` for the given scope.
///
/// Well-known keys of the other scope are rejected too: they would be
/// stored but never read.
pub fn validate_well_known(props: &PropertyMap, scope: PropertyScope) -> Result<(), RoomError> {
    for (key, value) in props {
        let Some(known) = key.well_known() else {
            continue;
        };
        if known.scope() != scope {
            return Err(RoomError::InvalidOperation(format!(
                "{known:?} is not a {scope:?} property"
            )));
        }
        if value.is_null() {
            continue;
        }
        let ok = match known {
            WellKnownKey::MaxPlayers => value.as_int().is_some_and(|v| (0..=255).contains(&v)),
            WellKnownKey::IsOpen | WellKnownKey::IsVisible | WellKnownKey::IsInactive => {
                value.as_bool().is_some()
            }
            WellKnownKey::LobbyProperties | WellKnownKey::ExpectedUsers => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| v.as_str().is_some())),
            WellKnownKey::MasterClientId
            | WellKnownKey::PlayerTtl
            | WellKnownKey::EmptyRoomTtl => value
                .as_int()
                .is_some_and(|v| i32::try_from(v).is_ok()),
            WellKnownKey::Nickname | WellKnownKey::UserId => value.as_str().is_some(),
        };
        if !ok {
            return Err(RoomError::InvalidOperation(format!(
                "unexpected value type for {known:?}"
            )));
        }
    }
    Ok(())
}

/// Drops the given server-owned keys from a client write, returning how many
/// were removed.
pub fn strip_keys(props: &mut PropertyMap, owned: &[WellKnownKey]) -> usize {
    let before = props.len();
    props.retain(|k, _| !k.well_known().is_some_and(|w| owned.contains(&w)));
    before - props.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> PropertyKey {
        PropertyKey::from(name)
    }

    #[test]
    fn test_set_properties_cas_round_trip() {
        let mut store = PropertyStore::new();
        store.set("A", 1);

        let update = PropertyMap::new().with("A", 2);
        let expected = PropertyMap::new().with("A", 1);
        let changed = store.set_properties(&update, Some(&expected), false).unwrap();
        assert_eq!(changed.get(&key("A")), Some(&Value::Int(2)));

        // Same CAS again: A is now 2, so the expectation fails.
        let err = store.set_properties(&update, Some(&expected), false).unwrap_err();
        assert!(matches!(err, RoomError::CasMismatch(_)));
        assert_eq!(store.get(&key("A")), Some(&Value::Int(2)));
    }

    #[test]
    fn test_set_properties_cas_failure_commits_nothing() {
        let mut store = PropertyStore::new();
        store.set("A", 1);
        store.set("B", 1);

        let update = PropertyMap::new().with("A", 5).with("B", 5);
        let expected = PropertyMap::new().with("A", 1).with("B", 2);
        assert!(store.set_properties(&update, Some(&expected), false).is_err());
        assert_eq!(store.get(&key("A")), Some(&Value::Int(1)));
        assert_eq!(store.get(&key("B")), Some(&Value::Int(1)));
    }

    #[test]
    fn test_set_properties_null_expectation_means_absent() {
        let mut store = PropertyStore::new();
        let update = PropertyMap::new().with("lock", "p1");
        let expected = PropertyMap::new().with("lock", Value::Null);

        assert!(store.set_properties(&update, Some(&expected), false).is_ok());
        let again = PropertyMap::new().with("lock", "p2");
        assert!(store.set_properties(&again, Some(&expected), false).is_err());
    }

    #[test]
    fn test_set_properties_null_deletes_or_stores() {
        let mut store = PropertyStore::new();
        store.set("x", 1);
        store.set("y", 1);

        let update = PropertyMap::new().with("x", Value::Null);
        let changed = store.set_properties(&update, None, true).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(store.get(&key("x")).is_none());

        let update = PropertyMap::new().with("y", Value::Null);
        store.set_properties(&update, None, false).unwrap();
        assert_eq!(store.get(&key("y")), Some(&Value::Null));
    }

    #[test]
    fn test_set_properties_reports_only_changes() {
        let mut store = PropertyStore::new();
        store.set("x", 1);
        let update = PropertyMap::new().with("x", 1).with("y", 2);
        let changed = store.set_properties(&update, None, false).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed.contains_key(&key("y")));

        // Deleting a key that is not there is not a change.
        let update = PropertyMap::new().with("zzz", Value::Null);
        assert!(store.set_properties(&update, None, true).unwrap().is_empty());
    }

    #[test]
    fn test_typed_accessors_read_generic_map() {
        let mut store = PropertyStore::new();
        assert!(store.is_open());
        assert_eq!(store.max_players(), 0);
        assert_eq!(store.master_client_id(), ActorNr::NONE);

        store.set(WellKnownKey::IsOpen, false);
        store.set(WellKnownKey::MaxPlayers, 4);
        store.set_master_client_id(ActorNr(2));
        store.set(
            WellKnownKey::ExpectedUsers,
            vec![Value::from("ann"), Value::from("bob")],
        );

        assert!(!store.is_open());
        assert_eq!(store.max_players(), 4);
        assert_eq!(store.master_client_id(), ActorNr(2));
        assert_eq!(store.expected_users(), vec!["ann", "bob"]);
        assert_eq!(
            store.get_well_known(WellKnownKey::MasterClientId),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn test_validate_well_known_rejects_bad_types() {
        let bad = PropertyMap::new().with(WellKnownKey::MaxPlayers, "four");
        assert!(validate_well_known(&bad, PropertyScope::Game).is_err());

        let bad = PropertyMap::new().with(WellKnownKey::MaxPlayers, 300);
        assert!(validate_well_known(&bad, PropertyScope::Game).is_err());

        let bad = PropertyMap::new().with(WellKnownKey::Nickname, "x");
        assert!(validate_well_known(&bad, PropertyScope::Game).is_err());

        let ok = PropertyMap::new()
            .with(WellKnownKey::IsOpen, true)
            .with(WellKnownKey::LobbyProperties, vec![Value::from("map")])
            .with(WellKnownKey::IsVisible, Value::Null)
            .with("anything", 3.5);
        assert!(validate_well_known(&ok, PropertyScope::Game).is_ok());
    }

    #[test]
    fn test_strip_keys_removes_server_owned() {
        let mut props = PropertyMap::new()
            .with(WellKnownKey::IsInactive, true)
            .with(WellKnownKey::UserId, "spoof")
            .with(WellKnownKey::Nickname, "ann")
            .with("score", 10);
        let stripped = strip_keys(&mut props, &[WellKnownKey::IsInactive, WellKnownKey::UserId]);
        assert_eq!(stripped, 2);
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_total_size_grows_with_payload() {
        let mut store = PropertyStore::new();
        let empty = store.total_size();
        store.set("blob", Value::Bytes(vec![0; 1000]));
        assert!(store.total_size() >= empty + 1000);
    }
}
