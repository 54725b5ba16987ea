// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Serialized access to the TPM shared by every subsystem.
//!
//! The broker owns the device behind a mutex, so callers on any thread get
//! whole commands in and whole responses out with no interleaving. At
//! construction it asks the TPM which commands it implements and keeps the
//! attribute report for sizing command handle areas.

use crate::{
    attrs::CommandAttrs,
    command::Tpm2Command,
    device::{TpmDevice, TpmDeviceError},
    rc::{rm_rc, TSS2_BASE_RC_GENERAL_FAILURE, TSS2_BASE_RC_IO_ERROR},
};
use log::debug;
use std::sync::Mutex;
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmCap, TpmCc, TpmaCc, TpmsContext, TpmuCapabilities},
    message::{
        TpmContextLoadCommand, TpmContextSaveCommand, TpmFlushContextCommand,
        TpmGetCapabilityCommand, TpmGetCapabilityResponse,
    },
    TpmTransient,
};

const TPM_CAP_PROPERTY_MAX: u32 = 128;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("device error: {0}")]
    Device(#[from] TpmDeviceError),

    #[error("TPM device lock poisoned")]
    LockPoisoned,

    #[error("unexpected capability data from the TPM")]
    UnexpectedCapability,
}

impl BrokerError {
    /// The return code to place in a response synthesized for a client.
    /// Codes the TPM produced travel verbatim; everything else is stamped
    /// with the resource-manager layer.
    #[must_use]
    pub fn resmgr_rc(&self) -> u32 {
        match self {
            Self::Device(TpmDeviceError::Tpm { rc }) => *rc,
            Self::Device(TpmDeviceError::Io(_)) => rm_rc(TSS2_BASE_RC_IO_ERROR),
            _ => rm_rc(TSS2_BASE_RC_GENERAL_FAILURE),
        }
    }
}

#[derive(Debug)]
pub struct AccessBroker {
    device: Mutex<TpmDevice>,
    attrs: CommandAttrs,
}

impl AccessBroker {
    /// Takes ownership of the device and scans its command report.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` if the capability query fails.
    pub fn new(mut device: TpmDevice) -> Result<Self, BrokerError> {
        let attrs = scan_commands(&mut device)?;
        debug!(target: "resmgr::broker", "TPM implements {} commands", attrs.len());
        Ok(Self {
            device: Mutex::new(device),
            attrs,
        })
    }

    /// Attribute report collected from the TPM at construction.
    #[must_use]
    pub fn command_attrs(&self) -> &CommandAttrs {
        &self.attrs
    }

    /// Forwards a client command to the TPM unmodified and returns the raw
    /// response frame.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` if I/O with the device fails.
    pub fn send_command(&self, command: &Tpm2Command) -> Result<Vec<u8>, BrokerError> {
        let mut device = self.device.lock().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(device.transceive(command.buffer())?)
    }

    /// Restores a saved context into the TPM, returning the physical handle
    /// the TPM assigned to it.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` carrying the TPM return code if the load is
    /// rejected.
    pub fn context_load(&self, context: TpmsContext) -> Result<u32, BrokerError> {
        let cmd = TpmContextLoadCommand { context };
        let mut device = self.device.lock().map_err(|_| BrokerError::LockPoisoned)?;
        let resp = device.execute(&cmd, &[])?;
        let resp = resp
            .ContextLoad()
            .map_err(|_| TpmDeviceError::MismatchedResponse {
                command: TpmCc::ContextLoad,
            })?;
        Ok(resp.loaded_handle.0)
    }

    /// Saves the context of a loaded transient object and flushes the
    /// object out of the TPM, freeing its slot. The two commands run under
    /// one lock acquisition so no other traffic slips between them.
    ///
    /// # Errors
    ///
    /// Returns a `BrokerError` carrying the TPM return code if either the
    /// save or the flush is rejected.
    pub fn context_saveflush(&self, phandle: u32) -> Result<TpmsContext, BrokerError> {
        let mut device = self.device.lock().map_err(|_| BrokerError::LockPoisoned)?;

        let save_cmd = TpmContextSaveCommand {
            save_handle: TpmTransient(phandle),
        };
        let resp = device.execute(&save_cmd, &[])?;
        let save_resp = resp
            .ContextSave()
            .map_err(|_| TpmDeviceError::MismatchedResponse {
                command: TpmCc::ContextSave,
            })?;

        let flush_cmd = TpmFlushContextCommand {
            flush_handle: TpmTransient(phandle).into(),
        };
        device.execute(&flush_cmd, &[])?;

        Ok(save_resp.context)
    }
}

fn scan_commands(device: &mut TpmDevice) -> Result<CommandAttrs, BrokerError> {
    let mut report: Vec<TpmaCc> = Vec::new();
    let mut property = 0;
    loop {
        let cmd = TpmGetCapabilityCommand {
            cap: TpmCap::Commands,
            property,
            property_count: TPM_CAP_PROPERTY_MAX,
        };
        let resp = device.execute(&cmd, &[])?;
        let TpmGetCapabilityResponse {
            more_data,
            capability_data,
        } = resp
            .GetCapability()
            .map_err(|_| TpmDeviceError::MismatchedResponse {
                command: TpmCc::GetCapability,
            })?;

        let TpmuCapabilities::Commands(commands) = capability_data.data else {
            return Err(BrokerError::UnexpectedCapability);
        };

        let next_prop = if more_data.into() {
            commands
                .last()
                .map(|c| (c.bits() & TpmaCc::COMMAND_INDEX.bits()) + 1)
        } else {
            None
        };
        report.extend(commands.iter().copied());

        if let Some(p) = next_prop {
            property = p;
        } else {
            break;
        }
    }
    Ok(CommandAttrs::from_report(report))
}
