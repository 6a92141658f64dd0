/*
 * dot_stuffer.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postbridge, a POP3-to-SMTP mail forwarder.
 *
 * Postbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postbridge.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Dot stuffing for SMTP DATA (RFC 5321 4.5.2: a line starting with "." gets an extra ".").

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a line (also the start of the message).
    LineStart,
    /// Inside a line.
    Mid,
    /// Saw CR inside a line; LF would end it.
    SawCr,
}

/// Streaming dot stuffer. Feed chunks with process_chunk, then call end_message.
pub struct DotStuffer {
    state: State,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            state: State::LineStart,
        }
    }
}

impl DotStuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a chunk; call `out` for each slice to send.
    pub fn process_chunk<F>(&mut self, chunk: &[u8], mut out: F)
    where
        F: FnMut(&[u8]),
    {
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if self.state == State::LineStart && b == b'.' {
                out(&chunk[start..i]);
                out(b".");
                start = i;
            }
            self.state = match (self.state, b) {
                (State::SawCr, b'\n') => State::LineStart,
                (_, b'\r') => State::SawCr,
                _ => State::Mid,
            };
        }
        if start < chunk.len() {
            out(&chunk[start..]);
        }
    }

    /// Terminate the last line if needed, emit ".CRLF" and reset.
    pub fn end_message<F>(&mut self, mut out: F)
    where
        F: FnMut(&[u8]),
    {
        match self.state {
            State::LineStart => {}
            State::SawCr => out(b"\n"),
            State::Mid => out(b"\r\n"),
        }
        out(b".\r\n");
        self.reset();
    }

    pub fn reset(&mut self) {
        self.state = State::LineStart;
    }
}

/// Stuff a whole message and append the terminator.
pub fn stuff_message(message: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(message.len() + 128);
    let mut stuffer = DotStuffer::new();
    stuffer.process_chunk(message, |s| data.extend_from_slice(s));
    stuffer.end_message(|s| data.extend_from_slice(s));
    data
}
