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

//! SMTP client (Forwarder). Opens a fresh authenticated, encrypted session per message.

mod client;
pub mod dot_stuffer;

pub use client::{submit, DeliveryError};

use std::time::Duration;

use async_trait::async_trait;

use crate::account::Destination;
use crate::pipeline::Forwarder;

/// Forwards fully-formed messages to the single configured destination mailbox.
pub struct SmtpForwarder {
    destination: Destination,
    timeout: Duration,
}

impl SmtpForwarder {
    pub fn new(destination: Destination, timeout: Duration) -> Self {
        Self {
            destination,
            timeout,
        }
    }
}

#[async_trait]
impl Forwarder for SmtpForwarder {
    async fn send(&self, message: &[u8]) -> Result<(), DeliveryError> {
        submit(&self.destination, self.timeout, message).await
    }
}
