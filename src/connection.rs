// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{handle_map::HandleMap, Config};

/// One client of the resource manager. The connection front-end creates a
/// `Connection` per accepted client and threads it through every command
/// and response so that virtualization stays scoped to that client.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    trans_map: HandleMap,
}

impl Connection {
    #[must_use]
    pub fn new(id: u64, config: &Config) -> Self {
        Self {
            id,
            trans_map: HandleMap::new(config.max_transient_objects),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The map of this connection's virtualized transient objects.
    #[must_use]
    pub fn transient_map(&self) -> &HandleMap {
        &self.trans_map
    }
}
