/*
 * mod.rs
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

//! POP3 retrieval (MailSource). One session per mailbox per run.

mod client;

pub use client::{Pop3Error, Pop3Session};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::account::{MailboxAccount, Secret};
use crate::pipeline::{MailSource, RetrievalSession};

/// Opens POP3 sessions against each mailbox's configured endpoint.
pub struct Pop3Source {
    timeout: Duration,
}

impl Pop3Source {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MailSource for Pop3Source {
    type Session = Pop3Session;

    async fn open(&self, account: &MailboxAccount) -> Result<Pop3Session, Pop3Error> {
        Pop3Session::connect(&account.endpoint, self.timeout).await
    }
}

#[async_trait]
impl RetrievalSession for Pop3Session {
    async fn authenticate(&mut self, identity: &str, secret: &Secret) -> Result<(), Pop3Error> {
        self.login(identity, secret.expose()).await
    }

    async fn list_all(&mut self) -> Result<BTreeMap<u32, String>, Pop3Error> {
        self.uidl().await
    }

    async fn fetch(&mut self, msg_no: u32) -> Result<Vec<u8>, Pop3Error> {
        self.retr(msg_no).await
    }

    async fn mark_for_deletion(&mut self, msg_no: u32) -> Result<(), Pop3Error> {
        self.dele(msg_no).await
    }

    async fn close(self, clean: bool) {
        Pop3Session::close(self, clean).await
    }
}
