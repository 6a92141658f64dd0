/*
 * transform.rs
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


//! Envelope rewrite: readdress a retrieved message to the destination mailbox
//! while keeping the original sender, recipients and message-id in `X-` headers.
//!
//! The destination's submission server only accepts mail whose From is the
//! authenticated account, so From and To both become the destination address;
//! replies still reach the author through Reply-To.

use crate::mime::{parse_message, Header, ParsedMessage};

/// Names the mailbox a message was retrieved from.
pub const SOURCE_HEADER: &str = "X-Postbridge-Source";
/// Added when the original header block could not be parsed.
pub const NOTE_HEADER: &str = "X-Postbridge-Note";
/// Value of the X-Mailer header.
pub const MAILER: &str = concat!("postbridge/", env!("CARGO_PKG_VERSION"));

/// Header names consumed by the rewrite; every other header is copied through.
const HANDLED: &[&str] = &[
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Reply-To",
    "Message-Id",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
];

/// Rewrite `raw` (retrieved from `source`) for delivery to `destination`. Never fails:
/// a message whose header block cannot be parsed is passed through with two marker headers.
pub fn rewrite(raw: &[u8], source: &str, destination: &str) -> Vec<u8> {
    match parse_message(raw) {
        Ok(message) => readdress(&message, source, destination),
        Err(e) => {
            tracing::warn!(error = %e, "header block unparsable, forwarding unchanged");
            pass_through(raw, source)
        }
    }
}

fn readdress(message: &ParsedMessage<'_>, source: &str, destination: &str) -> Vec<u8> {
    // Empty values count as absent.
    let get = |name: &str| {
        message
            .first(name)
            .map(|h| h.value.as_slice())
            .filter(|v| !v.is_empty())
    };
    let from = get("From");

    let mut out = Vec::with_capacity(message.body.len() + 1024);
    push_field(&mut out, "From", destination.as_bytes());
    push_field(&mut out, "To", destination.as_bytes());
    push_opt(&mut out, "Subject", get("Subject"));
    push_opt(&mut out, "Date", get("Date"));
    push_opt(&mut out, "X-Original-From", from);
    push_opt(&mut out, "Resent-From", from);
    push_opt(&mut out, "X-Original-To", get("To"));
    push_opt(&mut out, "X-Original-Cc", get("Cc"));
    push_opt(&mut out, "Reply-To", get("Reply-To").or(from));
    push_opt(&mut out, "X-Original-Message-Id", get("Message-Id"));
    push_field(&mut out, SOURCE_HEADER, source.as_bytes());
    push_field(&mut out, "X-Mailer", MAILER.as_bytes());
    push_opt(&mut out, "MIME-Version", get("MIME-Version"));
    push_opt(&mut out, "Content-Type", get("Content-Type"));
    push_opt(&mut out, "Content-Transfer-Encoding", get("Content-Transfer-Encoding"));

    for header in message.headers.iter().filter(|h| !is_handled(h)) {
        push_field(&mut out, &header.name, &header.value);
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(message.body);
    out
}

fn pass_through(raw: &[u8], source: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 128);
    push_field(&mut out, SOURCE_HEADER, source.as_bytes());
    push_field(&mut out, NOTE_HEADER, b"original message could not be parsed");
    out.extend_from_slice(raw);
    out
}

fn is_handled(header: &Header) -> bool {
    HANDLED.iter().any(|name| header.is(name))
}

fn push_field(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn push_opt(out: &mut Vec<u8>, name: &str, value: Option<&[u8]>) {
    if let Some(value) = value {
        push_field(out, name, value);
    }
}
