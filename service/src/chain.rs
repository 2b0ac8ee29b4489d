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

//! Per-session filter chain
//!
//! The chain is an ordered list of uniquely named entries stored as an
//! immutable snapshot. Mutations build a new list and swap it in under a
//! write lock; every dispatched event captures the snapshot current at
//! dispatch time and walks that, so topology changes never reorder or drop
//! an event that is already in flight. An entry that has been removed is
//! skipped by in-flight walks.
//!
//! Topology changes are control operations performed by the thread that
//! owns the session setup. They do not go through the alignment layer, and
//! concurrent mutation of one chain from several threads is not supported.

use crate::{IoFilter, Result, Session, SessionError};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard, Weak};

pub(crate) type Entries = Arc<Vec<Arc<ChainEntry>>>;

const ENTRY_ADDED: u8 = 0;
const ENTRY_ACTIVE: u8 = 1;
const ENTRY_REMOVED: u8 = 2;

/// A named slot in the chain
pub(crate) struct ChainEntry {
    name: String,
    filter: Arc<dyn IoFilter>,
    state: AtomicU8,
}

impl ChainEntry {
    fn new(name: String, filter: Arc<dyn IoFilter>) -> Self {
        Self {
            name,
            filter,
            state: AtomicU8::new(ENTRY_ADDED),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn filter(&self) -> &Arc<dyn IoFilter> {
        &self.filter
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ENTRY_ACTIVE
    }
}

enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// Ordered, named filters of one session
pub struct FilterChain {
    session: Weak<Session>,
    entries: RwLock<Entries>,
}

impl FilterChain {
    pub(crate) fn new(session: Weak<Session>) -> Self {
        Self {
            session,
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// The session owning this chain
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub(crate) fn snapshot(&self) -> Entries {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a filter at the head of the chain
    pub fn add_first(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<()> {
        self.insert(Position::First, name.into(), filter)
    }

    /// Add a filter at the tail of the chain, next to the handler
    pub fn add_last(&self, name: impl Into<String>, filter: Arc<dyn IoFilter>) -> Result<()> {
        self.insert(Position::Last, name.into(), filter)
    }

    /// Add a filter immediately before `base`
    pub fn add_before(
        &self,
        base: &str,
        name: impl Into<String>,
        filter: Arc<dyn IoFilter>,
    ) -> Result<()> {
        self.insert(Position::Before(base), name.into(), filter)
    }

    /// Add a filter immediately after `base`
    pub fn add_after(
        &self,
        base: &str,
        name: impl Into<String>,
        filter: Arc<dyn IoFilter>,
    ) -> Result<()> {
        self.insert(Position::After(base), name.into(), filter)
    }

    fn locate(entries: &[Arc<ChainEntry>], position: &Position<'_>, name: &str) -> Result<usize> {
        if entries.iter().any(|entry| entry.name == name) {
            return Err(SessionError::NameConflict(name.to_string()));
        }
        let index_of = |base: &str| {
            entries
                .iter()
                .position(|entry| entry.name == base)
                .ok_or_else(|| SessionError::FilterNotFound(base.to_string()))
        };
        match position {
            Position::First => Ok(0),
            Position::Last => Ok(entries.len()),
            Position::Before(base) => index_of(base),
            Position::After(base) => index_of(base).map(|index| index + 1),
        }
    }

    fn insert(&self, position: Position<'_>, name: String, filter: Arc<dyn IoFilter>) -> Result<()> {
        if name.is_empty() {
            return Err(SessionError::Other("filter name must not be empty".into()));
        }
        Self::locate(&self.snapshot(), &position, &name)?;

        filter.on_pre_add(self, &name)?;

        let entry = Arc::new(ChainEntry::new(name.clone(), filter.clone()));
        {
            let mut entries = self.write();
            let index = Self::locate(&entries, &position, &name)?;
            let mut updated: Vec<_> = entries.iter().cloned().collect();
            updated.insert(index, entry.clone());
            *entries = Arc::new(updated);
            entry.state.store(ENTRY_ACTIVE, Ordering::Release);
        }

        if let Err(error) = filter.on_post_add(self, &name) {
            self.unlink(&entry);
            return Err(error);
        }
        tracing::debug!(filter = %name, "Filter added");
        Ok(())
    }

    fn unlink(&self, entry: &Arc<ChainEntry>) {
        let mut entries = self.write();
        let updated: Vec<_> = entries
            .iter()
            .filter(|candidate| !Arc::ptr_eq(candidate, entry))
            .cloned()
            .collect();
        *entries = Arc::new(updated);
        entry.state.store(ENTRY_REMOVED, Ordering::Release);
    }

    /// Remove the filter named `name`
    ///
    /// A failing `on_pre_remove` keeps the filter in place. Once unlinked
    /// the filter stays removed; a failing `on_post_remove` is only logged.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn IoFilter>> {
        let entry = self
            .snapshot()
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
            .ok_or_else(|| SessionError::FilterNotFound(name.to_string()))?;

        entry.filter.on_pre_remove(self, name)?;
        self.unlink(&entry);
        if let Err(error) = entry.filter.on_post_remove(self, name) {
            tracing::warn!(filter = %name, error = %error, "Post-remove hook failed");
        }
        tracing::debug!(filter = %name, "Filter removed");
        Ok(entry.filter.clone())
    }

    /// Remove every filter, tail first
    pub fn clear(&self) -> Result<()> {
        for name in self.names().into_iter().rev() {
            self.remove(&name)?;
        }
        Ok(())
    }

    /// Get the filter named `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn IoFilter>> {
        self.snapshot()
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.filter.clone())
    }

    /// Check if a filter named `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().iter().any(|entry| entry.name == name)
    }

    /// Filter names from head to tail
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if the chain has no filters
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.names())
            .finish()
    }
}

impl fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEntry")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}
