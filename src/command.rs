// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Raw TPM command buffers, viewed through the 10-byte header framing.
//!
//! The resource manager never interprets command parameters; it only needs
//! the command code, the handle area and, for `TPM2_FlushContext`, the
//! flush target at the head of the parameter area.

use crate::{
    attrs::{self, CommandAttrs},
    connection::Connection,
    TPM_HEADER_SIZE,
};
use std::sync::Arc;
use thiserror::Error;
use tpm2_protocol::data::{TpmCc, TpmaCc};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command buffer truncated: {size} bytes")]
    Truncated { size: usize },

    #[error("header size {header} does not match buffer size {actual}")]
    SizeMismatch { header: usize, actual: usize },

    #[error("unknown command code: {cc:#010x}")]
    UnknownCommand { cc: u32 },
}

/// A client command bound to its originating connection.
#[derive(Debug)]
pub struct Tpm2Command {
    connection: Arc<Connection>,
    buffer: Vec<u8>,
    attrs: TpmaCc,
}

impl Tpm2Command {
    /// Wraps a raw command buffer, resolving its attribute word from the
    /// TPM's command report.
    ///
    /// # Errors
    ///
    /// Returns a `CommandError` if the buffer is shorter than a TPM header,
    /// the header size field disagrees with the buffer, the command code is
    /// not implemented by the TPM, or the handle area overruns the buffer.
    pub fn new(
        connection: Arc<Connection>,
        buffer: Vec<u8>,
        attrs_table: &CommandAttrs,
    ) -> Result<Self, CommandError> {
        if buffer.len() < TPM_HEADER_SIZE {
            return Err(CommandError::Truncated { size: buffer.len() });
        }
        let header = u32::from_be_bytes(buffer[2..6].try_into().unwrap()) as usize;
        if header != buffer.len() {
            return Err(CommandError::SizeMismatch {
                header,
                actual: buffer.len(),
            });
        }
        let cc = u32::from_be_bytes(buffer[6..10].try_into().unwrap());
        let attrs = attrs_table
            .lookup(cc)
            .ok_or(CommandError::UnknownCommand { cc })?;
        let handle_area = TPM_HEADER_SIZE + 4 * attrs::handle_count(attrs);
        if buffer.len() < handle_area {
            return Err(CommandError::Truncated { size: buffer.len() });
        }
        Ok(Self {
            connection,
            buffer,
            attrs,
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn code(&self) -> u32 {
        u32::from_be_bytes(self.buffer[6..10].try_into().unwrap())
    }

    #[must_use]
    pub fn attrs(&self) -> TpmaCc {
        self.attrs
    }

    /// Number of handles in the handle area, 0 to 3.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        attrs::handle_count(self.attrs)
    }

    /// Reads the handle at `index`, which must be below `handle_count`.
    #[must_use]
    pub fn handle(&self, index: usize) -> u32 {
        assert!(index < self.handle_count());
        let at = TPM_HEADER_SIZE + 4 * index;
        u32::from_be_bytes(self.buffer[at..at + 4].try_into().unwrap())
    }

    /// Overwrites the handle at `index`, which must be below `handle_count`.
    pub fn set_handle(&mut self, index: usize, handle: u32) {
        assert!(index < self.handle_count());
        let at = TPM_HEADER_SIZE + 4 * index;
        self.buffer[at..at + 4].copy_from_slice(&handle.to_be_bytes());
    }

    /// The flush target of a `TPM2_FlushContext` command. The target sits
    /// at the head of the parameter area, not in the handle area.
    #[must_use]
    pub fn flush_handle(&self) -> Option<u32> {
        if self.code() != TpmCc::FlushContext as u32 {
            return None;
        }
        let bytes = self.buffer.get(TPM_HEADER_SIZE..TPM_HEADER_SIZE + 4)?;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}
