// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! A TPM 2.0 transient-object resource manager.
//!
//! A TPM holds only a handful of transient objects at a time, while any
//! number of clients may want keys and sequences loaded at once. This crate
//! multiplexes them: each connection gets a private space of stable virtual
//! handles, and the dispatch thread swaps the backing contexts in and out
//! of the TPM as commands reference them.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod attrs;
pub mod broker;
pub mod command;
pub mod connection;
pub mod device;
pub mod handle;
pub mod handle_map;
pub mod message;
pub mod mocktpm;
pub mod pipe;
pub mod rc;
pub mod resmgr;
pub mod response;

pub use crate::{
    broker::AccessBroker,
    command::Tpm2Command,
    connection::Connection,
    device::TpmDevice,
    message::{Message, Sink, Source},
    resmgr::ResourceManager,
    response::Tpm2Response,
};

/// Bytes in a TPM command or response header: tag, size, code.
pub const TPM_HEADER_SIZE: usize = 10;

/// Runtime knobs for the resource manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many transient objects one connection may hold mapped at a time.
    pub max_transient_objects: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_transient_objects: 27,
        }
    }
}
