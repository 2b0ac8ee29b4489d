//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Per-session attribute storage
//!
//! Attributes are the place where filters stash protocol state (codec
//! buffers, bridge links, handshake progress). Unlike chain callbacks the
//! map is not thread-aligned: acceptors and connectors touch it during setup
//! from whatever thread they run on, so every operation is atomic per key.
//!
//! # Example
//!
//! ```
//! use relaygate_service::{AttributeKey, AttributeMap};
//!
//! const LOGIN: AttributeKey<String> = AttributeKey::new("login");
//!
//! let attributes = AttributeMap::new();
//! assert_eq!(attributes.set_if_absent(&LOGIN, "alice".to_string()), None);
//! assert!(attributes.replace(&LOGIN, &"alice".to_string(), "bob".to_string()));
//! assert_eq!(attributes.get(&LOGIN).as_deref(), Some("bob"));
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

type Value = Box<dyn Any + Send + Sync>;

/// A typed attribute key
///
/// Keys are compared by name. Using one name with two different value types
/// is a programming error; reads through the mismatched key see no value.
pub struct AttributeKey<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Create a key with a static name
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub const fn new(name: &'static str) -> Self {
        assert!(!name.is_empty(), "attribute key name must not be empty");
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    /// Create a key with a name computed at runtime
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "attribute key name must not be empty");
        Self {
            name: Cow::Owned(name),
            _marker: PhantomData,
        }
    }

    /// Get the key name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

/// Concurrent attribute map owned by a session
#[derive(Default)]
pub struct AttributeMap {
    values: DashMap<Cow<'static, str>, Value>,
}

fn downcast<T: Any + Clone>(value: &Value) -> Option<T> {
    value.downcast_ref::<T>().cloned()
}

fn downcast_owned<T: Any>(value: Value) -> Option<T> {
    value.downcast::<T>().ok().map(|boxed| *boxed)
}

impl AttributeMap {
    /// Create an empty attribute map
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current value for `key`
    pub fn get<T>(&self, key: &AttributeKey<T>) -> Option<T>
    where
        T: Any + Clone + Send + Sync,
    {
        self.values.get(key.name()).and_then(|v| downcast(v.value()))
    }

    /// Get the current value, atomically installing `default` if absent
    pub fn get_or_insert<T>(&self, key: &AttributeKey<T>, default: T) -> T
    where
        T: Any + Clone + Send + Sync,
    {
        self.get_or_insert_with(key, || default)
    }

    /// Get the current value, atomically installing the result of `init` if absent
    ///
    /// `init` runs at most once and only when no value is present.
    pub fn get_or_insert_with<T, F>(&self, key: &AttributeKey<T>, init: F) -> T
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce() -> T,
    {
        match self.values.entry(key.name.clone()) {
            Entry::Occupied(mut occupied) => match downcast::<T>(occupied.get()) {
                Some(value) => value,
                None => {
                    let value = init();
                    occupied.insert(Box::new(value.clone()));
                    value
                }
            },
            Entry::Vacant(vacant) => {
                let value = init();
                vacant.insert(Box::new(value.clone()));
                value
            }
        }
    }

    /// Set `key` to `value`, returning the previous value
    pub fn set<T>(&self, key: &AttributeKey<T>, value: T) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        self.values
            .insert(key.name.clone(), Box::new(value))
            .and_then(downcast_owned)
    }

    /// Set `key` to `value`, or remove it when `value` is `None`
    pub fn set_or_remove<T>(&self, key: &AttributeKey<T>, value: Option<T>) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        match value {
            Some(value) => self.set(key, value),
            None => self.remove(key),
        }
    }

    /// Set `key` only if it has no value
    ///
    /// Returns `None` when `value` was installed, or the existing value otherwise.
    pub fn set_if_absent<T>(&self, key: &AttributeKey<T>, value: T) -> Option<T>
    where
        T: Any + Clone + Send + Sync,
    {
        match self.values.entry(key.name.clone()) {
            Entry::Occupied(occupied) => downcast(occupied.get()),
            Entry::Vacant(vacant) => {
                vacant.insert(Box::new(value));
                None
            }
        }
    }

    /// Remove `key`, returning its value
    pub fn remove<T>(&self, key: &AttributeKey<T>) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        self.values
            .remove(key.name())
            .and_then(|(_, value)| downcast_owned(value))
    }

    /// Remove `key` only if its current value equals `expected`
    pub fn remove_if_eq<T>(&self, key: &AttributeKey<T>, expected: &T) -> bool
    where
        T: Any + PartialEq + Send + Sync,
    {
        self.values
            .remove_if(key.name(), |_, value| {
                value.downcast_ref::<T>() == Some(expected)
            })
            .is_some()
    }

    /// Replace the value of `key` with `new` only if it currently equals `old`
    pub fn replace<T>(&self, key: &AttributeKey<T>, old: &T, new: T) -> bool
    where
        T: Any + PartialEq + Send + Sync,
    {
        match self.values.get_mut(key.name()) {
            Some(mut slot) => {
                if slot.downcast_ref::<T>() == Some(old) {
                    *slot = Box::new(new) as Value;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Check if `key` has a value
    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(key.name())
    }

    /// Get the names of all keys currently set
    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|entry| entry.key().to_string()).collect()
    }

    /// Get the number of attributes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no attributes are set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove every attribute
    pub fn clear(&self) {
        self.values.clear();
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeMap")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COUNT: AttributeKey<u32> = AttributeKey::new("count");
    const NAME: AttributeKey<String> = AttributeKey::new("name");

    #[test]
    fn test_get_or_insert_installs_default_once() {
        let map = AttributeMap::new();
        assert_eq!(map.get_or_insert(&COUNT, 5), 5);
        assert_eq!(map.get_or_insert(&COUNT, 9), 5);
        assert_eq!(map.get(&COUNT), Some(5));
    }

    #[test]
    fn test_set_or_remove_none_removes() {
        let map = AttributeMap::new();
        assert_eq!(map.set(&COUNT, 1), None);
        assert_eq!(map.set(&COUNT, 2), Some(1));
        assert_eq!(map.set_or_remove(&COUNT, None), Some(2));
        assert!(!map.contains(&COUNT));
        assert!(map.is_empty());
    }

    #[test]
    fn test_set_if_absent() {
        let map = AttributeMap::new();
        assert_eq!(map.set_if_absent(&NAME, "a".to_string()), None);
        assert_eq!(map.set_if_absent(&NAME, "b".to_string()), Some("a".to_string()));
        assert_eq!(map.get(&NAME).as_deref(), Some("a"));
    }

    #[test]
    fn test_compare_and_remove() {
        let map = AttributeMap::new();
        map.set(&COUNT, 3);
        assert!(!map.remove_if_eq(&COUNT, &4));
        assert!(map.contains(&COUNT));
        assert!(map.remove_if_eq(&COUNT, &3));
        assert!(!map.contains(&COUNT));
        assert!(!map.remove_if_eq(&COUNT, &3));
    }

    #[test]
    fn test_compare_and_replace() {
        let map = AttributeMap::new();
        assert!(!map.replace(&COUNT, &0, 1));
        map.set(&COUNT, 0);
        assert!(map.replace(&COUNT, &0, 1));
        assert!(!map.replace(&COUNT, &0, 2));
        assert_eq!(map.get(&COUNT), Some(1));
    }

    #[test]
    fn test_mismatched_type_reads_as_absent() {
        let map = AttributeMap::new();
        let other: AttributeKey<String> = AttributeKey::named("count");
        map.set(&COUNT, 1);
        assert_eq!(map.get(&other), None);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_empty_key_fails_fast() {
        let _key: AttributeKey<u32> = AttributeKey::named("");
    }

    #[test]
    fn test_set_if_absent_is_atomic_across_threads() {
        let map = Arc::new(AttributeMap::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let map = map.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if map.set_if_absent(&COUNT, i).is_none() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_replace_matches_model(ops in proptest::collection::vec((0u32..4, 0u32..4), 0..64)) {
            let map = AttributeMap::new();
            let mut model: Option<u32> = None;
            for (old, new) in ops {
                if model.is_none() {
                    map.set(&COUNT, old);
                    model = Some(old);
                    continue;
                }
                let expected = model == Some(old);
                prop_assert_eq!(map.replace(&COUNT, &old, new), expected);
                if expected {
                    model = Some(new);
                }
                prop_assert_eq!(map.get(&COUNT), model);
            }
        }
    }
}
