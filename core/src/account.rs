/*
 * account.rs
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

//! Mailbox accounts and the forwarding destination. Built once per run from configuration; read-only.

use std::fmt;

use crate::net::Endpoint;

/// Password or app password. Debug and Display never show the value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One source mailbox: its address (also the POP3 login and the history key),
/// its retrieval endpoint and its secret.
#[derive(Debug, Clone)]
pub struct MailboxAccount {
    pub address: String,
    pub endpoint: Endpoint,
    pub secret: Secret,
}

impl MailboxAccount {
    pub fn new(address: impl Into<String>, endpoint: Endpoint, secret: impl Into<Secret>) -> Self {
        Self {
            address: address.into(),
            endpoint,
            secret: secret.into(),
        }
    }
}

/// The single destination mailbox and the submission server that accepts mail for it.
/// The address is used as SMTP login, envelope sender and sole recipient.
#[derive(Debug, Clone)]
pub struct Destination {
    pub address: String,
    pub endpoint: Endpoint,
    pub secret: Secret,
    pub ehlo_hostname: String,
}

impl Destination {
    pub fn new(address: impl Into<String>, endpoint: Endpoint, secret: impl Into<Secret>) -> Self {
        Self {
            address: address.into(),
            endpoint,
            secret: secret.into(),
            ehlo_hostname: "localhost".to_string(),
        }
    }
}
