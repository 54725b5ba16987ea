// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! The resource manager proper: a dispatch thread that rewrites handles in
//! client traffic and shuttles transient-object contexts in and out of the
//! TPM so that every connection sees a private, stable handle space.
//!
//! Each command runs a load, execute, saveflush cycle: the contexts a
//! command references are restored right before it is sent, and everything
//! it touched or created is saved and flushed right after its response is
//! on the way to the client. Between commands the TPM therefore holds no
//! transient objects on behalf of any connection, which is what makes
//! multiplexing arbitrary clients safe.

use crate::{
    broker::AccessBroker,
    command::Tpm2Command,
    handle::{self, HandleKind},
    handle_map::HandleMapEntry,
    message::{ControlCode, ControlMessage, Message, MessageQueue, Sink, Source},
    rc::{
        rm_rc, TPM_RC_1, TPM_RC_HANDLE, TPM_RC_P, TPM_RC_SUCCESS, TSS2_BASE_RC_GENERAL_FAILURE,
        TSS2_RESMGR_RC_OBJECT_MEMORY,
    },
    response::Tpm2Response,
};
use log::{debug, warn};
use std::{
    sync::{Arc, Mutex},
    thread,
};
use thiserror::Error;
use tpm2_protocol::data::TpmCc;

#[derive(Debug, Error)]
pub enum RmError {
    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker thread spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

pub struct ResourceManager {
    broker: Arc<AccessBroker>,
    in_queue: MessageQueue,
    sink: Mutex<Option<Arc<dyn Sink>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    #[must_use]
    pub fn new(broker: Arc<AccessBroker>) -> Arc<Self> {
        Arc::new(Self {
            broker,
            in_queue: MessageQueue::new(),
            sink: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the dispatch worker.
    ///
    /// # Errors
    ///
    /// Returns an `RmError` if the worker is already running or the thread
    /// cannot be spawned.
    pub fn start(self: &Arc<Self>) -> Result<(), RmError> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(RmError::AlreadyRunning);
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("resmgr".to_string())
            .spawn(move || this.dispatch())
            .map_err(RmError::Spawn)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Asks the worker to exit once it has drained everything enqueued
    /// before this call.
    pub fn cancel(&self) {
        self.in_queue
            .enqueue(Message::Control(ControlMessage::new(
                ControlCode::CheckCancel,
            )));
    }

    /// Closes the inbound queue, dropping queued work. The worker exits as
    /// soon as it comes back to the queue.
    pub fn halt(&self) {
        self.in_queue.close();
    }

    /// Waits for the worker to exit.
    ///
    /// # Errors
    ///
    /// Returns `RmError::WorkerPanicked` if the worker died on a panic.
    pub fn join(&self) -> Result<(), RmError> {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| RmError::WorkerPanicked)?;
        }
        Ok(())
    }

    /// Graceful shutdown: `cancel` followed by `join`.
    ///
    /// # Errors
    ///
    /// Returns `RmError::WorkerPanicked` if the worker died on a panic.
    pub fn stop(&self) -> Result<(), RmError> {
        self.cancel();
        self.join()
    }

    fn dispatch(self: Arc<Self>) {
        debug!(target: "resmgr::dispatch", "worker start");
        while let Some(message) = self.in_queue.dequeue() {
            match message {
                Message::Command(command) => self.process_command(command),
                Message::Control(control) => match control.code() {
                    ControlCode::CheckCancel => {
                        debug!(target: "resmgr::dispatch", "cancel requested");
                        break;
                    }
                },
                Message::Response(_) => {
                    warn!(target: "resmgr::dispatch", "response on the inbound queue, dropping");
                }
            }
        }
        debug!(target: "resmgr::dispatch", "worker exit");
    }

    /// Runs one client command through the load, execute, saveflush cycle
    /// and enqueues exactly one response downstream.
    fn process_command(&self, mut command: Tpm2Command) {
        let connection = command.connection().clone();
        debug!(
            target: "resmgr::dispatch",
            "connection {}: command {:#06x}, {} bytes",
            connection.id(),
            command.code(),
            command.buffer().len()
        );

        if self.over_object_quota(&command) {
            warn!(
                target: "resmgr::dispatch",
                "connection {} is over its transient-object quota",
                connection.id()
            );
            self.enqueue_response(Tpm2Response::from_rc(
                connection,
                TSS2_RESMGR_RC_OBJECT_MEMORY,
            ));
            return;
        }

        let mut loaded: Vec<Arc<HandleMapEntry>> = Vec::with_capacity(4);
        let response = if command.code() == TpmCc::FlushContext as u32 {
            self.flush_context(&command)
        } else {
            match self.load_contexts(&mut command, &mut loaded) {
                Ok(()) => {
                    let mut response = self.send_to_tpm(&command);
                    if response.has_handle() {
                        self.virtualize_handle(&mut response, &mut loaded);
                    }
                    response
                }
                Err(rc) => Tpm2Response::from_rc(connection, rc),
            }
        };

        self.enqueue_response(response);

        // Evict everything the command loaded or created, error or not.
        for entry in loaded {
            self.saveflush_entry(&entry);
        }
    }

    fn send_to_tpm(&self, command: &Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();
        match self.broker.send_command(command) {
            Ok(buffer) => match Tpm2Response::new(connection.clone(), buffer, command.attrs()) {
                Ok(response) => response,
                Err(err) => {
                    warn!(target: "resmgr::dispatch", "malformed TPM response: {err}");
                    Tpm2Response::from_rc(connection, rm_rc(TSS2_BASE_RC_GENERAL_FAILURE))
                }
            },
            Err(err) => {
                warn!(target: "resmgr::dispatch", "send_command failed: {err}");
                Tpm2Response::from_rc(connection, err.resmgr_rc())
            }
        }
    }

    /// Restores the contexts behind every transient handle in the command
    /// and rewrites each to the physical handle the TPM assigned. Entries
    /// consumed along the way accumulate in `loaded` for later eviction.
    ///
    /// On a load failure the TPM return code is handed back for the client
    /// response and remaining handles are left alone.
    fn load_contexts(
        &self,
        command: &mut Tpm2Command,
        loaded: &mut Vec<Arc<HandleMapEntry>>,
    ) -> Result<(), u32> {
        for index in 0..command.handle_count() {
            let vhandle = command.handle(index);
            if HandleKind::of(vhandle) != HandleKind::Transient {
                continue;
            }
            let entry = command.connection().transient_map().lookup(vhandle);
            let Some(entry) = entry else {
                // TODO: reject unmapped transient handles once it is clear
                // no client depends on referencing physical handles raw.
                warn!(
                    target: "resmgr::dispatch",
                    "no mapping for transient handle {vhandle:#010x}, passing through"
                );
                continue;
            };
            if entry.phandle() == 0 {
                let Some(context) = entry.context() else {
                    warn!(
                        target: "resmgr::dispatch",
                        "entry {vhandle:#010x} is evicted but has no saved context"
                    );
                    return Err(rm_rc(TSS2_BASE_RC_GENERAL_FAILURE));
                };
                match self.broker.context_load(context) {
                    Ok(phandle) => {
                        debug!(
                            target: "resmgr::dispatch",
                            "loaded {vhandle:#010x} as {phandle:#010x}"
                        );
                        entry.set_phandle(phandle);
                    }
                    Err(err) => {
                        warn!(
                            target: "resmgr::dispatch",
                            "context load failed for {vhandle:#010x}: {err}"
                        );
                        return Err(err.resmgr_rc());
                    }
                }
            }
            command.set_handle(index, entry.phandle());
            loaded.push(entry);
        }
        Ok(())
    }

    /// Replaces a transient handle in the response with a fresh virtual one
    /// and starts tracking the new object on the command's connection.
    ///
    /// # Panics
    ///
    /// Panics when the connection's virtual handle space is exhausted, or
    /// when the fresh virtual handle cannot be recorded in the map. The
    /// quota gate and the monotone allocator rule both out; a client must
    /// never be handed a handle its map does not resolve.
    fn virtualize_handle(&self, response: &mut Tpm2Response, loaded: &mut Vec<Arc<HandleMapEntry>>) {
        let phandle = response.handle();
        if HandleKind::of(phandle) != HandleKind::Transient {
            debug!(target: "resmgr::dispatch", "response handle is not transient");
            return;
        }
        let connection = response.connection().clone();
        let map = connection.transient_map();
        let Some(vhandle) = map.next_vhandle() else {
            panic!(
                "virtual handle space exhausted for connection {}",
                connection.id()
            );
        };
        let entry = Arc::new(HandleMapEntry::new(vhandle, phandle));
        if let Err(err) = map.insert(vhandle, entry.clone()) {
            panic!(
                "failed to map {vhandle:#010x} for connection {}: {err}",
                connection.id()
            );
        }
        debug!(
            target: "resmgr::dispatch",
            "virtualized {phandle:#010x} as {vhandle:#010x}"
        );
        response.set_handle(vhandle);
        loaded.push(entry);
    }

    /// `TPM2_FlushContext` interception. A virtualized transient object is
    /// already evicted from the TPM between commands, so flushing it is
    /// purely a map removal; no TPM round-trip happens. Session handles and
    /// everything else go to the TPM unchanged.
    fn flush_context(&self, command: &Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();
        let Some(target) = command.flush_handle() else {
            return Tpm2Response::from_rc(connection, rm_rc(TSS2_BASE_RC_GENERAL_FAILURE));
        };
        debug!(target: "resmgr::dispatch", "flush target {target:#010x}");
        match HandleKind::of(target) {
            HandleKind::Transient => {
                let rc = if connection.transient_map().remove(target) {
                    TPM_RC_SUCCESS
                } else {
                    rm_rc(TPM_RC_HANDLE + TPM_RC_P + TPM_RC_1)
                };
                Tpm2Response::from_rc(connection, rc)
            }
            _ => self.send_to_tpm(command),
        }
    }

    /// Whether the command would create a transient object this connection
    /// has no room to track.
    fn over_object_quota(&self, command: &Tpm2Command) -> bool {
        let code = command.code();
        let creates_object = code == TpmCc::CreatePrimary as u32
            || code == TpmCc::Load as u32
            || code == TpmCc::LoadExternal as u32;
        creates_object && command.connection().transient_map().is_full()
    }

    /// Saves and flushes one loaded entry, returning the TPM's transient
    /// slot to the pool. A failure is logged and the entry left as-is; the
    /// next use of the handle retries against whatever state the TPM has.
    fn saveflush_entry(&self, entry: &HandleMapEntry) {
        let phandle = entry.phandle();
        if !handle::is_transient(phandle) {
            return;
        }
        match self.broker.context_saveflush(phandle) {
            Ok(context) => {
                debug!(
                    target: "resmgr::dispatch",
                    "saved and flushed {:#010x} ({phandle:#010x})",
                    entry.vhandle()
                );
                entry.set_saved_context(context);
            }
            Err(err) => {
                warn!(
                    target: "resmgr::dispatch",
                    "context saveflush failed for {phandle:#010x}: {err}"
                );
            }
        }
    }

    fn enqueue_response(&self, response: Tpm2Response) {
        let sink = self.sink.lock().unwrap().clone();
        let Some(sink) = sink else {
            panic!("response dropped: no downstream sink registered");
        };
        sink.enqueue(Message::Response(response));
    }
}

impl Sink for ResourceManager {
    fn enqueue(&self, message: Message) {
        self.in_queue.enqueue(message);
    }
}

impl Source for ResourceManager {
    fn add_sink(&self, sink: Arc<dyn Sink>) {
        let mut slot = self.sink.lock().unwrap();
        if slot.is_some() {
            warn!(target: "resmgr::dispatch", "sink already set");
            return;
        }
        *slot = Some(sink);
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().unwrap().take() {
            assert!(
                worker.is_finished(),
                "ResourceManager dropped while its worker is running; stop it first"
            );
        }
    }
}
