// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! A software TPM implementing just enough of the command set to exercise
//! the resource manager: object creation, context save/load/flush and the
//! command-attribute capability report.
//!
//! Loaded objects live in a bounded slot array (`MOCKTPM_MAX_LOADED`) so
//! eviction pressure is observable, and every context load is assigned a
//! fresh physical handle so handle rewriting actually shows up on the wire.

use crate::{attrs, device::TpmTransport, pipe, TPM_HEADER_SIZE};
use log::{debug, error};
use std::collections::HashMap;
use tpm2_protocol::{
    data::{
        Tpm2bName, Tpm2bPublic, TpmCap, TpmCc, TpmRc, TpmRcBase, TpmRh, TpmaCc, TpmlCca,
        TpmsCapabilityData, TpmsContext, TpmtPublic, TpmuCapabilities,
    },
    message::{
        tpm_build_response, tpm_parse_command, TpmAuthResponses, TpmCommandBody,
        TpmContextLoadCommand, TpmContextLoadResponse, TpmContextSaveCommand,
        TpmContextSaveResponse, TpmCreatePrimaryCommand, TpmCreatePrimaryResponse,
        TpmFlushContextCommand, TpmFlushContextResponse, TpmGetCapabilityCommand,
        TpmGetCapabilityResponse, TpmLoadCommand, TpmLoadResponse, TpmReadPublicCommand,
        TpmReadPublicResponse, TpmResponseBody,
    },
    TpmErrorKind, TpmTransient, TpmWriter, TPM_MAX_COMMAND_SIZE,
};

/// Transient-object slots; matches the order of magnitude of real parts.
pub const MOCKTPM_MAX_LOADED: usize = 3;

type MockTpmResult = Result<(TpmRc, TpmResponseBody, TpmAuthResponses), TpmRc>;

/// MockTPM response trait
trait MockTpmResponse {
    fn build(
        &self,
        writer: &mut TpmWriter,
        rc: TpmRc,
        auth_responses: &TpmAuthResponses,
    ) -> Result<(), TpmErrorKind>;
}

macro_rules! mock_tpm_response {
    ($($variant:ident),* $(,)?) => {
        impl MockTpmResponse for TpmResponseBody {
            fn build(
                &self,
                writer: &mut TpmWriter,
                rc: TpmRc,
                auth_responses: &TpmAuthResponses,
            ) -> Result<(), TpmErrorKind> {
                match self {
                    $(
                        Self::$variant(r) => tpm_build_response(r, auth_responses, rc, writer),
                    )*
                    _ => Err(TpmErrorKind::Unreachable),
                }
            }
        }
    };
}

mock_tpm_response!(
    ContextLoad,
    ContextSave,
    CreatePrimary,
    FlushContext,
    GetCapability,
    Load,
    ReadPublic,
);

macro_rules! mock_tpm_command {
    ($state:ident, $cmd_body:ident, $($variant:ident => $handler:path),* $(,)?) => {
        match $cmd_body {
            $(
                TpmCommandBody::$variant(cmd) => $handler($state, cmd),
            )*
            _ => Err(
                TpmRc::from(TpmRcBase::CommandCode),
            ),
        }
    };
}

fn success(body: TpmResponseBody) -> MockTpmResult {
    Ok((
        TpmRc::from(TpmRcBase::Success),
        body,
        TpmAuthResponses::default(),
    ))
}

#[derive(Debug, Clone)]
struct MockObject {
    public: TpmtPublic,
}

#[derive(Debug, Default)]
struct MockTpm {
    loaded: HashMap<u32, MockObject>,
    saved: HashMap<u64, MockObject>,
    next_phandle: u32,
    next_sequence: u64,
}

impl MockTpm {
    fn new() -> Self {
        Self {
            next_phandle: TpmRh::TransientFirst as u32,
            next_sequence: 1,
            ..Default::default()
        }
    }

    /// Attribute words for every implemented command, as they would appear
    /// in a `GetCapability(Commands)` report.
    fn command_report() -> Vec<TpmaCc> {
        [
            (TpmCc::ContextLoad, 0, true),
            (TpmCc::ContextSave, 1, false),
            (TpmCc::CreatePrimary, 1, true),
            (TpmCc::FlushContext, 0, false),
            (TpmCc::GetCapability, 0, false),
            (TpmCc::Load, 1, true),
            (TpmCc::ReadPublic, 1, false),
        ]
        .into_iter()
        .map(|(cc, handles, rhandle)| attrs::word(cc as u32, handles, rhandle))
        .collect()
    }

    fn alloc_slot(&mut self) -> Result<u32, TpmRc> {
        if self.loaded.len() == MOCKTPM_MAX_LOADED {
            return Err(TpmRc::from(TpmRcBase::Memory));
        }
        let phandle = self.next_phandle;
        self.next_phandle += 1;
        Ok(phandle)
    }

    fn parse(&mut self, request_buf: &[u8]) -> MockTpmResult {
        let Ok((_handles, cmd_body, _sessions)) = tpm_parse_command(request_buf) else {
            return Err(TpmRc::from(TpmRcBase::BadTag));
        };

        mock_tpm_command! {
            self, cmd_body,
            ContextLoad => Self::context_load,
            ContextSave => Self::context_save,
            CreatePrimary => Self::create_primary,
            FlushContext => Self::flush_context,
            GetCapability => Self::get_capability,
            Load => Self::load,
            ReadPublic => Self::read_public,
        }
    }

    fn create_primary(&mut self, cmd: TpmCreatePrimaryCommand) -> MockTpmResult {
        let public = cmd.in_public.inner;
        let phandle = self.alloc_slot()?;
        self.loaded.insert(
            phandle,
            MockObject {
                public: public.clone(),
            },
        );
        let resp = TpmCreatePrimaryResponse {
            object_handle: TpmTransient(phandle),
            out_public: Tpm2bPublic { inner: public },
            creation_data: Default::default(),
            creation_hash: Default::default(),
            creation_ticket: Default::default(),
            name: Tpm2bName::default(),
        };
        success(TpmResponseBody::CreatePrimary(resp))
    }

    fn load(&mut self, cmd: TpmLoadCommand) -> MockTpmResult {
        if !self.loaded.contains_key(&cmd.parent_handle.0) {
            return Err(TpmRc::from(TpmRcBase::Handle));
        }
        let public = cmd.in_public.inner;
        let phandle = self.alloc_slot()?;
        self.loaded.insert(phandle, MockObject { public });
        let resp = TpmLoadResponse {
            object_handle: TpmTransient(phandle),
            name: Tpm2bName::default(),
        };
        success(TpmResponseBody::Load(resp))
    }

    fn read_public(&mut self, cmd: TpmReadPublicCommand) -> MockTpmResult {
        let Some(object) = self.loaded.get(&cmd.object_handle.0) else {
            return Err(TpmRc::from(TpmRcBase::Handle));
        };
        let resp = TpmReadPublicResponse {
            out_public: Tpm2bPublic::from(object.public.clone()),
            name: Tpm2bName::default(),
            qualified_name: Tpm2bName::default(),
        };
        success(TpmResponseBody::ReadPublic(resp))
    }

    fn context_save(&mut self, cmd: TpmContextSaveCommand) -> MockTpmResult {
        let Some(object) = self.loaded.get(&cmd.save_handle.0) else {
            return Err(TpmRc::from(TpmRcBase::Handle));
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.saved.insert(sequence, object.clone());
        let resp = TpmContextSaveResponse {
            context: TpmsContext {
                sequence,
                saved_handle: cmd.save_handle,
                hierarchy: TpmRh::Owner,
                context_blob: Default::default(),
            },
        };
        success(TpmResponseBody::ContextSave(resp))
    }

    fn context_load(&mut self, cmd: TpmContextLoadCommand) -> MockTpmResult {
        let Some(object) = self.saved.get(&cmd.context.sequence) else {
            return Err(TpmRc::from(TpmRcBase::Value));
        };
        let object = object.clone();
        let phandle = self.alloc_slot()?;
        self.loaded.insert(phandle, object);
        let resp = TpmContextLoadResponse {
            loaded_handle: TpmTransient(phandle),
        };
        success(TpmResponseBody::ContextLoad(resp))
    }

    fn flush_context(&mut self, cmd: TpmFlushContextCommand) -> MockTpmResult {
        if self.loaded.remove(&cmd.flush_handle).is_none() {
            return Err(TpmRc::from(TpmRcBase::Handle));
        }
        success(TpmResponseBody::FlushContext(TpmFlushContextResponse {}))
    }

    fn get_capability(&mut self, cmd: TpmGetCapabilityCommand) -> MockTpmResult {
        if cmd.cap != TpmCap::Commands {
            return Err(TpmRc::from(TpmRcBase::Value));
        }
        let mut list = TpmlCca::new();
        for word in Self::command_report()
            .into_iter()
            .filter(|w| (w.bits() & TpmaCc::COMMAND_INDEX.bits()) >= cmd.property)
            .take(cmd.property_count as usize)
        {
            list.try_push(word)
                .map_err(|_| TpmRc::from(TpmRcBase::Failure))?;
        }
        let resp = TpmGetCapabilityResponse {
            more_data: false.into(),
            capability_data: TpmsCapabilityData {
                capability: cmd.cap,
                data: TpmuCapabilities::Commands(list),
            },
        };
        success(TpmResponseBody::GetCapability(resp))
    }
}

fn mocktpm_build_response(response: MockTpmResult) -> Result<Vec<u8>, TpmErrorKind> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        match response {
            Ok((rc, response_body, auth_responses)) => {
                response_body.build(&mut writer, rc, &auth_responses)?;
            }
            Err(rc) => {
                tpm_build_response(&TpmFlushContextResponse {}, &[], rc, &mut writer)?;
            }
        }
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

fn mocktpm_run(mut stream: impl std::io::Read + std::io::Write, state: &mut MockTpm) {
    loop {
        let mut header = [0u8; TPM_HEADER_SIZE];
        if stream.read_exact(&mut header).is_err() {
            break;
        }

        let Ok(size_bytes): Result<[u8; 4], _> = header[2..6].try_into() else {
            error!("Malformed header size");
            break;
        };
        let size = u32::from_be_bytes(size_bytes) as usize;

        if !(TPM_HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            error!("Invalid command size: {size}");
            break;
        }

        let mut command_buf = header.to_vec();
        command_buf.resize(size, 0);

        if let Err(e) = stream.read_exact(&mut command_buf[TPM_HEADER_SIZE..]) {
            error!("{e}");
            break;
        }

        let response = state.parse(&command_buf);
        debug!(
            target: "resmgr::mocktpm",
            "{} loaded, {} saved",
            state.loaded.len(),
            state.saved.len()
        );
        let response = match mocktpm_build_response(response) {
            Ok(response) => response,
            Err(e) => {
                error!("{e}");
                break;
            }
        };

        if stream.write_all(&response).is_err() || stream.flush().is_err() {
            error!("no response");
            break;
        }
    }
}

/// Spawns the mock TPM on its own thread and returns the client end of the
/// byte pipe connected to it. The server exits when the client end drops.
#[must_use]
pub fn mocktpm_start() -> (std::thread::JoinHandle<()>, impl TpmTransport) {
    let (server, client) = pipe::pair();
    let handle = std::thread::spawn(move || {
        let mut state = MockTpm::new();
        mocktpm_run(server, &mut state);
    });
    (handle, client)
}
