/*
 * pipeline.rs
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


//! Per-mailbox fetch, dedupe and forward.
//!
//! For each mailbox: connect, authenticate, list, then visit messages in
//! ascending message-number order. A message already in the history is
//! skipped without I/O. Otherwise it is fetched, rewritten, forwarded,
//! recorded and only then flagged for deletion. Message-level failures are
//! counted and processing moves on, each remaining message getting its own
//! attempt even when the session can no longer serve it. Connect, auth and
//! listing failures abort the mailbox with an unclean close so no deletion is
//! committed.
//!
//! A crash between a successful forward and a successful record means the
//! message is forwarded again on the next run. Delivery is at-least-once.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

use crate::account::{MailboxAccount, Secret};
use crate::history::{HistoryError, HistoryStore};
use crate::protocol::pop3::Pop3Error;
use crate::protocol::smtp::DeliveryError;
use crate::transform;

/// Opens retrieval sessions, one per mailbox per run.
#[async_trait]
pub trait MailSource: Sync {
    type Session: RetrievalSession;

    /// Connect and consume the greeting.
    async fn open(&self, account: &MailboxAccount) -> Result<Self::Session, Pop3Error>;
}

/// An open retrieval session. Message numbers are only valid within it.
#[async_trait]
pub trait RetrievalSession: Send + Sized {
    async fn authenticate(&mut self, identity: &str, secret: &Secret) -> Result<(), Pop3Error>;

    /// Message number to unique-id for every visible message.
    async fn list_all(&mut self) -> Result<BTreeMap<u32, String>, Pop3Error>;

    async fn fetch(&mut self, msg_no: u32) -> Result<Vec<u8>, Pop3Error>;

    /// Flag for deletion. Committed only by a clean close.
    async fn mark_for_deletion(&mut self, msg_no: u32) -> Result<(), Pop3Error>;

    /// Clean: commit deletions. Not clean: drop the transport, discarding them.
    async fn close(self, clean: bool);
}

/// Delivers one already-rewritten message to the destination.
#[async_trait]
pub trait Forwarder: Sync {
    async fn send(&self, message: &[u8]) -> Result<(), DeliveryError>;
}

/// Where a mailbox stood when it finished or was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStage {
    Connecting,
    Authenticating,
    Listing,
    ProcessingMessages,
    Closing,
}

impl fmt::Display for MailboxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MailboxStage::Connecting => "connecting",
            MailboxStage::Authenticating => "authenticating",
            MailboxStage::Listing => "listing",
            MailboxStage::ProcessingMessages => "processing",
            MailboxStage::Closing => "closing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxOutcome {
    /// Session closed cleanly; pending deletions committed.
    Completed,
    /// Session abandoned at `stage`; no deletions committed.
    Aborted { stage: MailboxStage, reason: String },
}

/// Counters for one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxReport {
    pub address: String,
    pub forwarded: usize,
    pub skipped: usize,
    pub errors: usize,
    pub outcome: MailboxOutcome,
}

impl MailboxReport {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            forwarded: 0,
            skipped: 0,
            errors: 0,
            outcome: MailboxOutcome::Completed,
        }
    }

    fn abort(&mut self, stage: MailboxStage, error: &dyn fmt::Display) {
        tracing::error!(stage = %stage, error = %error, "mailbox aborted");
        self.errors += 1;
        self.outcome = MailboxOutcome::Aborted {
            stage,
            reason: error.to_string(),
        };
    }
}

/// Aggregate over every mailbox of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub forwarded: usize,
    pub errors: usize,
    pub mailboxes: Vec<MailboxReport>,
}

impl RunSummary {
    /// A run succeeds only when no message or mailbox failed.
    pub fn is_success(&self) -> bool {
        self.errors == 0
    }
}

/// Failure of one message; the mailbox carries on with the next one.
#[derive(Debug, Error)]
pub enum MessageFailure {
    #[error("fetch failed: {0}")]
    Fetch(Pop3Error),
    #[error("forward failed: {0}")]
    Forward(DeliveryError),
    #[error("recording failed: {0}")]
    Record(HistoryError),
    #[error("delete flag failed: {0}")]
    Delete(Pop3Error),
}

/// Wires a mail source, a forwarder and the history together for one run.
pub struct Pipeline<'a, S, F> {
    source: &'a S,
    forwarder: &'a F,
    history: &'a HistoryStore,
    destination: &'a str,
}

impl<'a, S, F> Pipeline<'a, S, F>
where
    S: MailSource,
    F: Forwarder,
{
    /// `destination` is the address rewritten messages are addressed to.
    pub fn new(source: &'a S, forwarder: &'a F, history: &'a HistoryStore, destination: &'a str) -> Self {
        Self {
            source,
            forwarder,
            history,
            destination,
        }
    }

    /// Process every mailbox in order, one at a time.
    pub async fn run(&self, accounts: &[MailboxAccount]) -> RunSummary {
        let mut summary = RunSummary::default();
        for (index, account) in accounts.iter().enumerate() {
            let span = tracing::info_span!("mailbox", index, address = %account.address);
            let report = self.process_mailbox(account).instrument(span).await;
            summary.forwarded += report.forwarded;
            summary.errors += report.errors;
            summary.mailboxes.push(report);
        }
        for (mailbox, recorded) in self.history.snapshot() {
            tracing::debug!(mailbox = %mailbox, recorded, "history");
        }
        tracing::info!(
            forwarded = summary.forwarded,
            errors = summary.errors,
            mailboxes = summary.mailboxes.len(),
            "run finished"
        );
        summary
    }

    /// Drive one mailbox from connect to close.
    pub async fn process_mailbox(&self, account: &MailboxAccount) -> MailboxReport {
        let mut report = MailboxReport::new(&account.address);

        tracing::debug!(stage = %MailboxStage::Connecting, endpoint = %account.endpoint);
        let mut session = match self.source.open(account).await {
            Ok(session) => session,
            Err(e) => {
                report.abort(MailboxStage::Connecting, &e);
                return report;
            }
        };

        tracing::debug!(stage = %MailboxStage::Authenticating);
        if let Err(e) = session.authenticate(&account.address, &account.secret).await {
            session.close(false).await;
            report.abort(MailboxStage::Authenticating, &e);
            return report;
        }

        tracing::debug!(stage = %MailboxStage::Listing);
        let listing = match session.list_all().await {
            Ok(listing) => listing,
            Err(e) => {
                session.close(false).await;
                report.abort(MailboxStage::Listing, &e);
                return report;
            }
        };
        tracing::info!(messages = listing.len(), "listed");

        tracing::debug!(stage = %MailboxStage::ProcessingMessages);

        for (&msg_no, uid) in &listing {
            if self.history.contains(&account.address, uid) {
                tracing::debug!(msg_no, uid = %uid, "already forwarded, skipping");
                report.skipped += 1;
                continue;
            }
            match self.process_message(&mut session, account, msg_no, uid).await {
                Ok(()) => {
                    tracing::info!(msg_no, uid = %uid, "forwarded");
                    report.forwarded += 1;
                }
                Err(failure) => {
                    tracing::warn!(msg_no, uid = %uid, error = %failure, "message failed");
                    report.errors += 1;
                }
            }
        }

        tracing::debug!(stage = %MailboxStage::Closing);
        session.close(true).await;
        tracing::info!(
            forwarded = report.forwarded,
            skipped = report.skipped,
            errors = report.errors,
            "mailbox done"
        );
        report
    }

    /// Fetch, rewrite, forward, record, delete. Each step runs only if the previous one succeeded.
    async fn process_message(
        &self,
        session: &mut S::Session,
        account: &MailboxAccount,
        msg_no: u32,
        uid: &str,
    ) -> Result<(), MessageFailure> {
        let raw = session.fetch(msg_no).await.map_err(MessageFailure::Fetch)?;
        let outgoing = transform::rewrite(&raw, &account.address, self.destination);
        self.forwarder
            .send(&outgoing)
            .await
            .map_err(MessageFailure::Forward)?;
        self.history
            .add(&account.address, uid)
            .map_err(MessageFailure::Record)?;
        session
            .mark_for_deletion(msg_no)
            .await
            .map_err(MessageFailure::Delete)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use crate::net::{Endpoint, Security};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Open(String),
        Auth(String),
        List,
        Fetch(u32),
        Send(String),
        /// Message number, and whether its uid was already on disk when DELE was sent.
        Delete(u32, bool),
        Close(bool),
    }

    type Log = Arc<Mutex<Vec<Event>>>;

    #[derive(Clone, Default)]
    struct Server {
        messages: BTreeMap<u32, (String, Vec<u8>)>,
        refuse_connect: bool,
        reject_auth: bool,
        broken_fetch: HashSet<u32>,
        vanished: HashSet<u32>,
    }

    #[derive(Default)]
    struct SessionState {
        out_of_step: bool,
    }

    impl Server {
        fn with(mut self, msg_no: u32, uid: &str, subject: &str) -> Self {
            let raw = format!("From: someone@example.org\r\nSubject: {}\r\n\r\nbody {}\r\n", subject, msg_no);
            self.messages.insert(msg_no, (uid.to_string(), raw.into_bytes()));
            self
        }
    }

    struct MockSource {
        servers: BTreeMap<String, Server>,
        state_path: PathBuf,
        log: Log,
    }

    struct MockSession {
        server: Server,
        state: SessionState,
        address: String,
        state_path: PathBuf,
        log: Log,
    }

    impl MockSession {
        fn push(&self, event: Event) {
            self.log.lock().unwrap().push(event);
        }
    }

    fn io_error(command: &str) -> Pop3Error {
        Pop3Error::Truncated {
            command: command.to_string(),
        }
    }

    #[async_trait]
    impl MailSource for MockSource {
        type Session = MockSession;

        async fn open(&self, account: &MailboxAccount) -> Result<MockSession, Pop3Error> {
            self.log.lock().unwrap().push(Event::Open(account.address.clone()));
            let server = self.servers.get(&account.address).cloned().unwrap_or_default();
            if server.refuse_connect {
                return Err(Pop3Error::Connect {
                    endpoint: account.endpoint.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                });
            }
            Ok(MockSession {
                server,
                state: SessionState::default(),
                address: account.address.clone(),
                state_path: self.state_path.clone(),
                log: self.log.clone(),
            })
        }
    }

    #[async_trait]
    impl RetrievalSession for MockSession {
        async fn authenticate(&mut self, identity: &str, _secret: &Secret) -> Result<(), Pop3Error> {
            self.push(Event::Auth(identity.to_string()));
            if self.server.reject_auth {
                return Err(Pop3Error::Auth("-ERR invalid credentials".to_string()));
            }
            Ok(())
        }

        async fn list_all(&mut self) -> Result<BTreeMap<u32, String>, Pop3Error> {
            self.push(Event::List);
            Ok(self
                .server
                .messages
                .iter()
                .map(|(n, (uid, _))| (*n, uid.clone()))
                .collect())
        }

        async fn fetch(&mut self, msg_no: u32) -> Result<Vec<u8>, Pop3Error> {
            self.push(Event::Fetch(msg_no));
            if self.state.out_of_step {
                return Err(Pop3Error::OutOfStep {
                    command: format!("RETR {}", msg_no),
                });
            }
            if self.server.broken_fetch.contains(&msg_no) {
                self.state.out_of_step = true;
                return Err(io_error("RETR"));
            }
            match self.server.messages.get(&msg_no) {
                Some((_, raw)) if !self.server.vanished.contains(&msg_no) => Ok(raw.clone()),
                _ => Err(Pop3Error::Negative {
                    command: format!("RETR {}", msg_no),
                    response: "-ERR no such message".to_string(),
                }),
            }
        }

        async fn mark_for_deletion(&mut self, msg_no: u32) -> Result<(), Pop3Error> {
            let uid = self.server.messages[&msg_no].0.clone();
            let on_disk = HistoryStore::load(&self.state_path)
                .map(|h| h.contains(&self.address, &uid))
                .unwrap_or(false);
            self.push(Event::Delete(msg_no, on_disk));
            Ok(())
        }

        async fn close(self, clean: bool) {
            self.push(Event::Close(clean));
        }
    }

    struct MockForwarder {
        fail_subjects: HashSet<String>,
        log: Log,
    }

    #[async_trait]
    impl Forwarder for MockForwarder {
        async fn send(&self, message: &[u8]) -> Result<(), DeliveryError> {
            let text = String::from_utf8_lossy(message);
            let subject = text
                .lines()
                .find_map(|l| l.strip_prefix("Subject: "))
                .unwrap_or_default()
                .to_string();
            self.log.lock().unwrap().push(Event::Send(subject.clone()));
            if self.fail_subjects.contains(&subject) {
                return Err(DeliveryError::Rejected {
                    stage: "DATA".to_string(),
                    code: 554,
                    message: "rejected".to_string(),
                });
            }
            assert!(text.contains("X-Postbridge-Source: "));
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        state_path: PathBuf,
        history: HistoryStore,
        log: Log,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let state_path = dir.path().join("state.json");
            let history = HistoryStore::load(&state_path).unwrap();
            Self {
                _dir: dir,
                state_path,
                history,
                log: Arc::default(),
            }
        }

        async fn run(&self, servers: &[(&str, Server)], fail_subjects: &[&str]) -> RunSummary {
            let source = MockSource {
                servers: servers.iter().map(|(a, s)| (a.to_string(), s.clone())).collect(),
                state_path: self.state_path.clone(),
                log: self.log.clone(),
            };
            let forwarder = MockForwarder {
                fail_subjects: fail_subjects.iter().map(|s| s.to_string()).collect(),
                log: self.log.clone(),
            };
            let accounts: Vec<MailboxAccount> = servers
                .iter()
                .map(|(a, _)| MailboxAccount::new(*a, Endpoint::new("pop.test", 995, Security::Implicit), "pw"))
                .collect();
            Pipeline::new(&source, &forwarder, &self.history, "me@dest.test")
                .run(&accounts)
                .await
        }

        fn events(&self) -> Vec<Event> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    const BOX: &str = "a@source.test";

    #[tokio::test]
    async fn skips_known_uid_and_forwards_new_one() {
        let h = Harness::new();
        h.history.add(BOX, "abc").unwrap();
        let server = Server::default().with(1, "abc", "one").with(2, "def", "two");

        let summary = h.run(&[(BOX, server)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (1, 0));
        assert!(summary.is_success());
        assert_eq!(summary.mailboxes[0].skipped, 1);
        assert_eq!(
            h.events(),
            vec![
                Event::Open(BOX.to_string()),
                Event::Auth(BOX.to_string()),
                Event::List,
                Event::Fetch(2),
                Event::Send("two".to_string()),
                Event::Delete(2, true),
                Event::Close(true),
            ]
        );
        assert!(h.history.contains(BOX, "def"));
    }

    #[tokio::test]
    async fn forward_failure_is_isolated() {
        let h = Harness::new();
        let server = Server::default()
            .with(1, "u1", "one")
            .with(2, "u2", "two")
            .with(3, "u3", "three");

        let summary = h.run(&[(BOX, server)], &["two"]).await;

        assert_eq!((summary.forwarded, summary.errors), (2, 1));
        assert!(!summary.is_success());
        let events = h.events();
        assert!(events.contains(&Event::Send("two".to_string())));
        assert!(!events.iter().any(|e| matches!(e, Event::Delete(2, _))));
        assert!(events.contains(&Event::Delete(3, true)));
        assert_eq!(events.last(), Some(&Event::Close(true)));
        assert!(!h.history.contains(BOX, "u2"));
        assert!(h.history.contains(BOX, "u3"));
    }

    #[tokio::test]
    async fn delete_only_after_record_is_on_disk() {
        let h = Harness::new();
        let server = Server::default().with(1, "u1", "one").with(2, "u2", "two");
        h.run(&[(BOX, server)], &[]).await;
        let deletes: Vec<Event> = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Delete(..)))
            .collect();
        assert_eq!(deletes, vec![Event::Delete(1, true), Event::Delete(2, true)]);
    }

    #[tokio::test]
    async fn second_run_forwards_nothing() {
        let h = Harness::new();
        let server = Server::default().with(1, "u1", "one").with(2, "u2", "two");
        let first = h.run(&[(BOX, server.clone())], &[]).await;
        assert_eq!(first.forwarded, 2);
        h.events();

        let second = h.run(&[(BOX, server)], &[]).await;
        assert_eq!((second.forwarded, second.errors), (0, 0));
        assert_eq!(second.mailboxes[0].skipped, 2);
        assert_eq!(
            h.events(),
            vec![
                Event::Open(BOX.to_string()),
                Event::Auth(BOX.to_string()),
                Event::List,
                Event::Close(true),
            ]
        );
        assert_eq!(h.history.snapshot().get(BOX), Some(&2));
    }

    #[tokio::test]
    async fn auth_failure_aborts_with_unclean_close() {
        let h = Harness::new();
        let server = Server {
            reject_auth: true,
            ..Server::default().with(1, "u1", "one")
        };
        let summary = h.run(&[(BOX, server)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (0, 1));
        assert!(matches!(
            summary.mailboxes[0].outcome,
            MailboxOutcome::Aborted {
                stage: MailboxStage::Authenticating,
                ..
            }
        ));
        assert_eq!(
            h.events(),
            vec![
                Event::Open(BOX.to_string()),
                Event::Auth(BOX.to_string()),
                Event::Close(false),
            ]
        );
    }

    #[tokio::test]
    async fn connect_failure_does_not_stop_other_mailboxes() {
        let h = Harness::new();
        let down = Server {
            refuse_connect: true,
            ..Server::default()
        };
        let up = Server::default().with(1, "u1", "one");
        let summary = h.run(&[("down@source.test", down), (BOX, up)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (1, 1));
        assert!(matches!(
            summary.mailboxes[0].outcome,
            MailboxOutcome::Aborted {
                stage: MailboxStage::Connecting,
                ..
            }
        ));
        assert_eq!(summary.mailboxes[1].outcome, MailboxOutcome::Completed);
    }

    #[tokio::test]
    async fn record_failure_prevents_delete() {
        let h = Harness::new();
        std::fs::create_dir(h.state_path.with_file_name("state.json.tmp")).unwrap();
        let server = Server::default().with(1, "u1", "one");

        let summary = h.run(&[(BOX, server)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (0, 1));
        let events = h.events();
        assert!(events.contains(&Event::Send("one".to_string())));
        assert!(!events.iter().any(|e| matches!(e, Event::Delete(..))));
        assert_eq!(events.last(), Some(&Event::Close(true)));
        assert!(!h.history.contains(BOX, "u1"));
    }

    #[tokio::test]
    async fn broken_transfer_counts_every_remaining_message() {
        let h = Harness::new();
        let mut server = Server::default()
            .with(1, "u1", "one")
            .with(2, "u2", "two")
            .with(3, "u3", "three");
        server.broken_fetch.insert(1);

        let summary = h.run(&[(BOX, server)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (0, 3));
        assert_eq!(summary.mailboxes[0].outcome, MailboxOutcome::Completed);
        let events = h.events();
        assert!(events.contains(&Event::Fetch(2)));
        assert!(events.contains(&Event::Fetch(3)));
        assert!(!events.iter().any(|e| matches!(e, Event::Send(_) | Event::Delete(..))));
        assert_eq!(events.last(), Some(&Event::Close(true)));
        assert!(h.history.snapshot().is_empty());
    }

    #[tokio::test]
    async fn negative_fetch_moves_on() {
        let h = Harness::new();
        let mut server = Server::default().with(1, "u1", "one").with(2, "u2", "two");
        server.vanished.insert(1);

        let summary = h.run(&[(BOX, server)], &[]).await;

        assert_eq!((summary.forwarded, summary.errors), (1, 1));
        let events = h.events();
        assert!(events.contains(&Event::Delete(2, true)));
        assert!(!events.iter().any(|e| matches!(e, Event::Delete(1, _))));
    }
}
