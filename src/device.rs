// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! The TPM access layer: header framing over a byte transport.

use crate::{rc::TPM_RC_SUCCESS, TPM_HEADER_SIZE};
use log::trace;
use std::{
    fmt::Debug,
    io::{Read, Write},
};
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmCc, TpmSt, TpmsAuthCommand},
    message::{tpm_build_command, tpm_parse_response, TpmCommandBuild, TpmHeader, TpmResponseBody},
    TpmErrorKind, TpmWriter, TPM_MAX_COMMAND_SIZE,
};

/// A trait combining the I/O and safety traits required for a TPM transport.
pub trait TpmTransport: Read + Write + Send + Debug {}
/// Blanket implementation to automatically apply `TpmTransport` to all valid types.
impl<T: Read + Write + Send + Debug> TpmTransport for T {}

#[derive(Debug, Error)]
pub enum TpmDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response size in header: {size}")]
    InvalidResponseSize { size: usize },

    #[error("mismatched response for {command}")]
    MismatchedResponse { command: TpmCc },

    #[error("TPM protocol: {0}")]
    Protocol(TpmErrorKind),

    #[error("TPM returned an error code: {rc:#010x}")]
    Tpm { rc: u32 },
}

impl From<TpmErrorKind> for TpmDeviceError {
    fn from(err: TpmErrorKind) -> Self {
        Self::Protocol(err)
    }
}

#[derive(Debug)]
pub struct TpmDevice {
    transport: Box<dyn TpmTransport>,
}

impl TpmDevice {
    /// Creates a new TPM device from an owned transport.
    pub fn new<T: TpmTransport + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
        }
    }

    /// Writes a raw command buffer to the TPM and reads back one complete
    /// response frame, without interpreting either.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` if I/O with the device fails or the
    /// response header carries an impossible size.
    pub fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TpmDeviceError> {
        trace!(target: "resmgr::device", "command: {}", hex::encode(command));
        self.transport.write_all(command)?;
        self.transport.flush()?;

        let mut header = [0u8; TPM_HEADER_SIZE];
        self.transport.read_exact(&mut header)?;

        let Ok(size_bytes): Result<[u8; 4], _> = header[2..6].try_into() else {
            return Err(TpmDeviceError::InvalidResponseSize { size: 0 });
        };
        let size = u32::from_be_bytes(size_bytes) as usize;
        if !(TPM_HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            return Err(TpmDeviceError::InvalidResponseSize { size });
        }

        let mut response = header.to_vec();
        response.resize(size, 0);
        self.transport.read_exact(&mut response[TPM_HEADER_SIZE..])?;
        trace!(target: "resmgr::device", "response: {}", hex::encode(&response));
        Ok(response)
    }

    /// Builds and sends a typed command and parses the typed response body.
    ///
    /// # Errors
    ///
    /// Returns a `TpmDeviceError` if building the command fails, I/O with
    /// the device fails, or the TPM itself returns an error code.
    pub fn execute<C>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<TpmResponseBody, TpmDeviceError>
    where
        C: TpmHeader + TpmCommandBuild,
    {
        let mut command_buf = [0u8; TPM_MAX_COMMAND_SIZE];
        let len = {
            let mut writer = TpmWriter::new(&mut command_buf);
            let tag = if sessions.is_empty() {
                TpmSt::NoSessions
            } else {
                TpmSt::Sessions
            };
            tpm_build_command(command, tag, sessions, &mut writer)?;
            writer.len()
        };

        let response = self.transceive(&command_buf[..len])?;
        let rc = u32::from_be_bytes(response[6..10].try_into().unwrap());
        if rc != TPM_RC_SUCCESS {
            return Err(TpmDeviceError::Tpm { rc });
        }
        match tpm_parse_response(C::COMMAND, &response)? {
            Ok((_, body, _)) => Ok(body),
            Err(_) => Err(TpmDeviceError::MismatchedResponse {
                command: C::COMMAND,
            }),
        }
    }
}
