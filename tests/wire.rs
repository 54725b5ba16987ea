// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use resmgr::{
    attrs::CommandAttrs,
    command::{CommandError, Tpm2Command},
    connection::Connection,
    response::Tpm2Response,
    Config,
};
use rstest::rstest;
use std::sync::Arc;
use tpm2_protocol::data::{TpmCc, TpmaCc};

const CC_HANDLES_SHIFT: u32 = 25;
const CC_RHANDLE: u32 = 1 << 28;

fn attrs_table() -> CommandAttrs {
    CommandAttrs::from_report([
        TpmaCc::from_bits_truncate(TpmCc::ReadPublic as u32 | (1 << CC_HANDLES_SHIFT)),
        TpmaCc::from_bits_truncate(TpmCc::FlushContext as u32),
        TpmaCc::from_bits_truncate(
            TpmCc::CreatePrimary as u32 | (1 << CC_HANDLES_SHIFT) | CC_RHANDLE,
        ),
    ])
}

fn connection() -> Arc<Connection> {
    Arc::new(Connection::new(7, &Config::default()))
}

fn frame(cc: u32, tail: &[u8]) -> Vec<u8> {
    let size = 10 + tail.len();
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&0x8001_u16.to_be_bytes());
    buf.extend_from_slice(&u32::try_from(size).unwrap().to_be_bytes());
    buf.extend_from_slice(&cc.to_be_bytes());
    buf.extend_from_slice(tail);
    buf
}

#[rstest]
fn test_command_handle_roundtrip() {
    let buffer = frame(TpmCc::ReadPublic as u32, &0x8100_0001_u32.to_be_bytes());
    let mut command = Tpm2Command::new(connection(), buffer, &attrs_table()).unwrap();
    assert_eq!(command.code(), TpmCc::ReadPublic as u32);
    assert_eq!(command.handle_count(), 1);
    assert_eq!(command.handle(0), 0x8100_0001);

    command.set_handle(0, 0x8000_0003);
    assert_eq!(command.handle(0), 0x8000_0003);
    assert_eq!(&command.buffer()[10..14], &0x8000_0003_u32.to_be_bytes());
}

#[rstest]
fn test_command_flush_handle_reads_parameter_area() {
    let buffer = frame(TpmCc::FlushContext as u32, &0x8000_0042_u32.to_be_bytes());
    let command = Tpm2Command::new(connection(), buffer, &attrs_table()).unwrap();
    assert_eq!(command.handle_count(), 0);
    assert_eq!(command.flush_handle(), Some(0x8000_0042));
}

#[rstest]
fn test_command_flush_handle_is_command_specific() {
    let buffer = frame(TpmCc::ReadPublic as u32, &0x8000_0042_u32.to_be_bytes());
    let command = Tpm2Command::new(connection(), buffer, &attrs_table()).unwrap();
    assert_eq!(command.flush_handle(), None);
}

#[rstest]
fn test_command_unknown_code_is_rejected() {
    let buffer = frame(0x7fff_ffff, &[]);
    let result = Tpm2Command::new(connection(), buffer, &attrs_table());
    assert!(matches!(result, Err(CommandError::UnknownCommand { .. })));
}

#[rstest]
fn test_command_size_mismatch_is_rejected() {
    let mut buffer = frame(TpmCc::FlushContext as u32, &[0, 0, 0, 0]);
    buffer.truncate(12);
    let result = Tpm2Command::new(connection(), buffer, &attrs_table());
    assert!(matches!(result, Err(CommandError::SizeMismatch { .. })));
}

#[rstest]
fn test_command_truncated_header_is_rejected() {
    let result = Tpm2Command::new(connection(), vec![0x80, 0x01, 0x00], &attrs_table());
    assert!(matches!(result, Err(CommandError::Truncated { .. })));
}

#[rstest]
fn test_response_rc_synthesis() {
    let response = Tpm2Response::from_rc(connection(), 0x000b_01cb);
    assert_eq!(response.rc(), 0x000b_01cb);
    assert_eq!(response.buffer().len(), 10);
    assert!(!response.has_handle());
}

#[rstest]
fn test_response_handle_rewrite() {
    let rhandle_attrs = TpmaCc::from_bits_truncate(
        TpmCc::CreatePrimary as u32 | (1 << CC_HANDLES_SHIFT) | CC_RHANDLE,
    );
    let buffer = frame(0, &0x8000_0002_u32.to_be_bytes());
    let mut response = Tpm2Response::new(connection(), buffer, rhandle_attrs).unwrap();
    assert_eq!(response.rc(), 0);
    assert!(response.has_handle());
    assert_eq!(response.handle(), 0x8000_0002);

    response.set_handle(0x8000_0000);
    assert_eq!(response.handle(), 0x8000_0000);
}

#[rstest]
fn test_response_error_frame_has_no_handle() {
    let rhandle_attrs = TpmaCc::from_bits_truncate(TpmCc::CreatePrimary as u32 | CC_RHANDLE);
    let buffer = frame(0x0000_0902, &[]);
    let response = Tpm2Response::new(connection(), buffer, rhandle_attrs).unwrap();
    assert_eq!(response.rc(), 0x902);
    assert!(!response.has_handle());
}
