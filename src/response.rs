// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Raw TPM response buffers, plus local synthesis of rc-only responses.

use crate::{attrs, connection::Connection, rc::TPM_RC_SUCCESS, TPM_HEADER_SIZE};
use std::sync::Arc;
use thiserror::Error;
use tpm2_protocol::data::{TpmSt, TpmaCc};

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response buffer truncated: {size} bytes")]
    Truncated { size: usize },

    #[error("header size {header} does not match buffer size {actual}")]
    SizeMismatch { header: usize, actual: usize },
}

/// A TPM response bound to the connection it is destined for. The attribute
/// word of the originating command decides whether the response carries a
/// handle at the head of its body.
#[derive(Debug)]
pub struct Tpm2Response {
    connection: Arc<Connection>,
    buffer: Vec<u8>,
    attrs: TpmaCc,
}

impl Tpm2Response {
    /// Wraps a response received from the TPM for the command whose
    /// attribute word is `attrs`.
    ///
    /// # Errors
    ///
    /// Returns a `ResponseError` if the buffer is shorter than a TPM header
    /// or the header size field disagrees with the buffer.
    pub fn new(
        connection: Arc<Connection>,
        buffer: Vec<u8>,
        attrs: TpmaCc,
    ) -> Result<Self, ResponseError> {
        if buffer.len() < TPM_HEADER_SIZE {
            return Err(ResponseError::Truncated { size: buffer.len() });
        }
        let header = u32::from_be_bytes(buffer[2..6].try_into().unwrap()) as usize;
        if header != buffer.len() {
            return Err(ResponseError::SizeMismatch {
                header,
                actual: buffer.len(),
            });
        }
        Ok(Self {
            connection,
            buffer,
            attrs,
        })
    }

    /// Synthesizes a header-only response carrying `rc`, the frame the TPM
    /// itself uses for every failing command.
    #[must_use]
    pub fn from_rc(connection: Arc<Connection>, rc: u32) -> Self {
        let mut buffer = Vec::with_capacity(TPM_HEADER_SIZE);
        buffer.extend_from_slice(&(TpmSt::NoSessions as u16).to_be_bytes());
        buffer.extend_from_slice(&(TPM_HEADER_SIZE as u32).to_be_bytes());
        buffer.extend_from_slice(&rc.to_be_bytes());
        Self {
            connection,
            buffer,
            attrs: TpmaCc::empty(),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn rc(&self) -> u32 {
        u32::from_be_bytes(self.buffer[6..10].try_into().unwrap())
    }

    /// Whether the response body starts with a handle.
    #[must_use]
    pub fn has_handle(&self) -> bool {
        attrs::has_response_handle(self.attrs)
            && self.rc() == TPM_RC_SUCCESS
            && self.buffer.len() >= TPM_HEADER_SIZE + 4
    }

    /// Reads the response handle. Only meaningful when `has_handle`.
    #[must_use]
    pub fn handle(&self) -> u32 {
        assert!(self.has_handle());
        u32::from_be_bytes(
            self.buffer[TPM_HEADER_SIZE..TPM_HEADER_SIZE + 4]
                .try_into()
                .unwrap(),
        )
    }

    /// Overwrites the response handle. Only meaningful when `has_handle`.
    pub fn set_handle(&mut self, handle: u32) {
        assert!(self.has_handle());
        self.buffer[TPM_HEADER_SIZE..TPM_HEADER_SIZE + 4].copy_from_slice(&handle.to_be_bytes());
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}
