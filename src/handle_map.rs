// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Per-connection bookkeeping of virtual transient handles.

use crate::handle::{self, VHANDLE_FIRST};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tpm2_protocol::data::TpmsContext;

#[derive(Debug, Error)]
pub enum HandleMapError {
    #[error("handle is already mapped: tpm://{vhandle:#010x}")]
    Duplicate { vhandle: u32 },

    #[error("handle capacity ({capacity}) exceeded")]
    Full { capacity: usize },
}

#[derive(Debug, Default)]
struct EntryState {
    phandle: u32,
    context: Option<TpmsContext>,
}

/// Binding of one virtual handle to its backing transient object.
///
/// The physical handle is non-zero only while the object is loaded in the
/// TPM. A zero physical handle means the object lives in `context`, saved
/// and evicted. If a context load fails the stale physical handle is kept
/// and the next use retries the load.
#[derive(Debug)]
pub struct HandleMapEntry {
    vhandle: u32,
    state: Mutex<EntryState>,
}

impl HandleMapEntry {
    #[must_use]
    pub fn new(vhandle: u32, phandle: u32) -> Self {
        Self {
            vhandle,
            state: Mutex::new(EntryState {
                phandle,
                context: None,
            }),
        }
    }

    #[must_use]
    pub fn vhandle(&self) -> u32 {
        self.vhandle
    }

    #[must_use]
    pub fn phandle(&self) -> u32 {
        self.state.lock().unwrap().phandle
    }

    pub fn set_phandle(&self, phandle: u32) {
        self.state.lock().unwrap().phandle = phandle;
    }

    /// The most recent saved context, if the object has ever been evicted.
    #[must_use]
    pub fn context(&self) -> Option<TpmsContext> {
        self.state.lock().unwrap().context.clone()
    }

    /// Replaces the saved context and marks the object as evicted.
    pub fn set_saved_context(&self, context: TpmsContext) {
        let mut state = self.state.lock().unwrap();
        state.context = Some(context);
        state.phandle = 0;
    }
}

#[derive(Debug)]
struct MapState {
    entries: HashMap<u32, Arc<HandleMapEntry>>,
    next_vhandle: u32,
}

/// Virtual-to-entry map owned by a single connection.
///
/// Entries are handed out as `Arc`s so a command in flight keeps its entry
/// alive across a concurrent remove. The map locks internally; callers
/// never hold the lock across a TPM round-trip.
#[derive(Debug)]
pub struct HandleMap {
    capacity: usize,
    state: Mutex<MapState>,
}

impl HandleMap {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                next_vhandle: VHANDLE_FIRST,
            }),
        }
    }

    #[must_use]
    pub fn lookup(&self, vhandle: u32) -> Option<Arc<HandleMapEntry>> {
        self.state.lock().unwrap().entries.get(&vhandle).cloned()
    }

    /// Maps `vhandle` to `entry`.
    ///
    /// # Errors
    ///
    /// Returns `HandleMapError::Duplicate` if `vhandle` is already mapped
    /// and `HandleMapError::Full` at capacity.
    pub fn insert(&self, vhandle: u32, entry: Arc<HandleMapEntry>) -> Result<(), HandleMapError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&vhandle) {
            return Err(HandleMapError::Duplicate { vhandle });
        }
        if state.entries.len() == self.capacity {
            return Err(HandleMapError::Full {
                capacity: self.capacity,
            });
        }
        state.entries.insert(vhandle, entry);
        Ok(())
    }

    /// Unmaps `vhandle`, reporting whether an entry was present. In-flight
    /// holders of the entry keep it alive through their `Arc`.
    pub fn remove(&self, vhandle: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .entries
            .remove(&vhandle)
            .is_some()
    }

    /// Allocates the next unused virtual handle, or `None` once the
    /// transient range is exhausted.
    pub fn next_vhandle(&self) -> Option<u32> {
        let mut state = self.state.lock().unwrap();
        let vhandle = state.next_vhandle;
        if !handle::is_transient(vhandle) {
            return None;
        }
        state.next_vhandle += 1;
        Some(vhandle)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.state.lock().unwrap().entries.len() == self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
