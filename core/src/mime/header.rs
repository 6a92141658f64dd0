/*
 * header.rs
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

//! Header block parser.
//!
//! Lines may end in CRLF or bare LF. Continuation lines (leading space or tab)
//! are folded into the previous field with their whitespace intact. The block
//! ends at the first empty line; everything after it is the body, untouched.
//! A block that runs to the end of input is a message without a body.

use thiserror::Error;

use super::utils::{is_field_name, trim_crlf, trim_wsp};

/// One header field. The value is raw bytes with folding preserved (CRLF between lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("line {line}: no colon in header field")]
    MissingColon { line: usize },
    #[error("line {line}: invalid header field name")]
    InvalidName { line: usize },
    #[error("message starts with a continuation line")]
    LeadingContinuation,
    #[error("message is empty")]
    Empty,
}

/// Header fields in original order, and the body that follows the empty line.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    pub headers: Vec<Header>,
    pub body: &'a [u8],
}

impl<'a> ParsedMessage<'a> {
    /// First field with this name, if any.
    pub fn first(&self, name: &str) -> Option<&Header> {
        self.headers.iter().find(|h| h.is(name))
    }
}

/// Split `raw` into header fields and body.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage<'_>, HeaderError> {
    let mut headers: Vec<Header> = Vec::new();
    let mut pos = 0;
    let mut line_no = 0;
    loop {
        if pos == raw.len() {
            if headers.is_empty() {
                return Err(HeaderError::Empty);
            }
            return Ok(ParsedMessage { headers, body: &[] });
        }
        let end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(raw.len(), |i| pos + i + 1);
        let line = trim_crlf(&raw[pos..end]);
        pos = end;
        line_no += 1;

        if line.is_empty() {
            return Ok(ParsedMessage {
                headers,
                body: &raw[pos..],
            });
        }
        if line[0] == b' ' || line[0] == b'\t' {
            let last = headers.last_mut().ok_or(HeaderError::LeadingContinuation)?;
            last.value.extend_from_slice(b"\r\n");
            last.value.extend_from_slice(line);
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(HeaderError::MissingColon { line: line_no })?;
        let name = &line[..colon];
        if !is_field_name(name) {
            return Err(HeaderError::InvalidName { line: line_no });
        }
        headers.push(Header {
            name: String::from_utf8_lossy(name).into_owned(),
            value: trim_wsp(&line[colon + 1..]).to_vec(),
        });
    }
}
