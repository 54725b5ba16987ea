// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! TSS2 return-code composition.
//!
//! Errors synthesized by the resource manager itself carry the resource
//! manager layer in bits 16..23 so that clients can tell them apart from
//! codes produced by the TPM. Codes received from the TPM are forwarded
//! verbatim and never re-layered.

/// Layer indicator for resource-manager-synthesized return codes.
pub const TSS2_RESMGR_RC_LAYER: u32 = 11 << 16;

pub const TSS2_BASE_RC_GENERAL_FAILURE: u32 = 1;
pub const TSS2_BASE_RC_IO_ERROR: u32 = 10;

/// `TPM_RC_OBJECT_MEMORY`: out of transient-object memory.
pub const TPM_RC_OBJECT_MEMORY: u32 = 0x902;
/// `TPM_RC_HANDLE`: format-one handle error.
pub const TPM_RC_HANDLE: u32 = 0x08B;
/// `TPM_RC_P`: the error relates to a parameter.
pub const TPM_RC_P: u32 = 0x040;
/// `TPM_RC_1`: first handle or parameter.
pub const TPM_RC_1: u32 = 0x100;

pub const TPM_RC_SUCCESS: u32 = 0;

/// Stamps `rc` with the resource-manager layer.
#[must_use]
pub const fn rm_rc(rc: u32) -> u32 {
    TSS2_RESMGR_RC_LAYER + rc
}

/// Synthesized when a connection hits its transient-object quota.
pub const TSS2_RESMGR_RC_OBJECT_MEMORY: u32 = rm_rc(TPM_RC_OBJECT_MEMORY);
