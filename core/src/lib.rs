/*
 * lib.rs
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


//! Postbridge core: fetch mail from POP3 mailboxes, rewrite its envelope,
//! forward it over SMTP to one destination, and remember what was forwarded.

pub mod account;
pub mod config;
pub mod history;
pub mod mime;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod sasl;
pub mod transform;

pub use account::{Destination, MailboxAccount, Secret};
pub use config::{Config, ConfigError};
pub use history::{HistoryError, HistoryStore};
pub use pipeline::{MailboxOutcome, MailboxReport, Pipeline, RunSummary};
