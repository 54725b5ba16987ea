// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! In-memory byte pipe connecting the access layer to an in-process TPM.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex},
};

#[derive(Debug, Default)]
struct Channel {
    state: Mutex<ChannelState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct ChannelState {
    buffer: VecDeque<u8>,
    closed: bool,
}

/// One end of a bidirectional in-memory byte pipe. Reads block until the
/// peer writes or hangs up; dropping an end wakes a blocked peer.
#[derive(Debug)]
pub struct PipeEnd {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

/// Creates a connected pair of pipe ends.
#[must_use]
pub fn pair() -> (PipeEnd, PipeEnd) {
    let a = Arc::new(Channel::default());
    let b = Arc::new(Channel::default());
    (
        PipeEnd {
            rx: a.clone(),
            tx: b.clone(),
        },
        PipeEnd { rx: b, tx: a },
    )
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.rx.state.lock().unwrap();
        while state.buffer.is_empty() && !state.closed {
            state = self.rx.cvar.wait(state).unwrap();
        }
        if state.buffer.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(state.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.tx.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"));
        }
        state.buffer.extend(buf);
        self.tx.cvar.notify_one();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        for channel in [&self.rx, &self.tx] {
            let mut state = channel.state.lock().unwrap();
            state.closed = true;
            channel.cvar.notify_all();
        }
    }
}
