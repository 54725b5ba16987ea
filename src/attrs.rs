// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Command attribute (`TPMA_CC`) bookkeeping.
//!
//! The attribute word for a command code tells the resource manager how
//! many handles sit in the command's handle area (`cHandles`, bits 25..27)
//! and whether the response carries a handle (`rHandle`, bit 28). The table
//! is populated from the TPM's own `GetCapability` report at startup.

use std::collections::HashMap;
use tpm2_protocol::data::TpmaCc;

const CC_HANDLES_SHIFT: u32 = 25;
const CC_HANDLES_MASK: u32 = 0x7;
const CC_RHANDLE: u32 = 1 << 28;

/// Number of handles in the command's handle area.
#[must_use]
pub fn handle_count(attrs: TpmaCc) -> usize {
    ((attrs.bits() >> CC_HANDLES_SHIFT) & CC_HANDLES_MASK) as usize
}

/// Whether the response to this command carries a handle.
#[must_use]
pub fn has_response_handle(attrs: TpmaCc) -> bool {
    attrs.bits() & CC_RHANDLE != 0
}

/// Composes an attribute word the way a TPM reports one.
pub(crate) fn word(cc: u32, handles: u32, response_handle: bool) -> TpmaCc {
    let mut bits = cc | ((handles & CC_HANDLES_MASK) << CC_HANDLES_SHIFT);
    if response_handle {
        bits |= CC_RHANDLE;
    }
    TpmaCc::from_bits_truncate(bits)
}

/// Attribute words for every command code the TPM implements.
#[derive(Debug, Default)]
pub struct CommandAttrs(HashMap<u32, TpmaCc>);

impl CommandAttrs {
    /// Builds the table from `TPMA_CC` words as reported by the TPM. The
    /// command code is the `commandIndex` field of each word.
    pub fn from_report(report: impl IntoIterator<Item = TpmaCc>) -> Self {
        let map = report
            .into_iter()
            .map(|attrs| (attrs.bits() & TpmaCc::COMMAND_INDEX.bits(), attrs))
            .collect();
        Self(map)
    }

    #[must_use]
    pub fn lookup(&self, cc: u32) -> Option<TpmaCc> {
        self.0.get(&cc).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
