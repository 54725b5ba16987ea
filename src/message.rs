// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Message-passing plumbing between pipeline stages.
//!
//! Stages are wired together with the [`Sink`] and [`Source`] traits: a
//! stage exposes `Sink::enqueue` for upstream producers and forwards its
//! output to whatever sink was registered through `Source::add_sink`.

use crate::{command::Tpm2Command, response::Tpm2Response};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
};

/// Codes understood by the dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    CheckCancel,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlMessage {
    code: ControlCode,
}

impl ControlMessage {
    #[must_use]
    pub fn new(code: ControlCode) -> Self {
        Self { code }
    }

    #[must_use]
    pub fn code(&self) -> ControlCode {
        self.code
    }
}

/// Anything that travels between pipeline stages.
#[derive(Debug)]
pub enum Message {
    Command(Tpm2Command),
    Response(Tpm2Response),
    Control(ControlMessage),
}

/// Receives messages from an upstream stage.
pub trait Sink: Send + Sync {
    fn enqueue(&self, message: Message);
}

/// Produces messages for a downstream stage.
pub trait Source {
    fn add_sink(&self, sink: Arc<dyn Sink>);
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

/// Blocking multi-producer single-consumer queue. `dequeue` parks the
/// consumer until a message arrives; closing the queue wakes it with
/// `None`, which consumers treat as an immediate shutdown.
#[derive(Debug, Default)]
pub struct MessageQueue {
    state: Mutex<QueueState>,
    cvar: Condvar,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Messages enqueued after `close` are dropped.
    pub fn enqueue(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            log::warn!(target: "resmgr::queue", "enqueue on a closed queue");
            return;
        }
        state.messages.push_back(message);
        self.cvar.notify_one();
    }

    /// Blocks until a message is available or the queue is closed.
    pub fn dequeue(&self) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            if state.closed {
                return None;
            }
            state = self.cvar.wait(state).unwrap();
        }
    }

    /// Closes the queue, dropping anything still buffered.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.messages.clear();
        self.cvar.notify_all();
    }
}
