/*
 * client.rs
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

//! POP3 protocol client: connect, STLS, USER/PASS, UIDL, RETR, DELE, QUIT.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::net::{Connection, Endpoint, Security};

/// POP3 client error (network, protocol, auth).
#[derive(Debug, Error)]
pub enum Pop3Error {
    /// TCP connect or TLS establishment failed.
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// Transport failure after the session was established.
    #[error("i/o error during {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    /// Server answered -ERR.
    #[error("{command} rejected: {response}")]
    Negative { command: String, response: String },
    /// Server answered with something that is neither +OK nor -ERR.
    #[error("malformed response to {command}: {response}")]
    Malformed { command: String, response: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Stream ended before the terminating "." line.
    #[error("{command} ended before the terminator line")]
    Truncated { command: String },
    /// Not sent: an earlier command left the stream out of step with the server.
    #[error("{command} not sent: session is out of step with the server")]
    OutOfStep { command: String },
}

impl Pop3Error {
    /// True when the session can no longer be trusted to stay in step with the server
    /// (transport failure, timeout mid-response, truncated or unrecognised reply).
    fn breaks_session(&self) -> bool {
        matches!(
            self,
            Pop3Error::Connect { .. }
                | Pop3Error::Io { .. }
                | Pop3Error::Timeout { .. }
                | Pop3Error::Malformed { .. }
                | Pop3Error::Truncated { .. }
                | Pop3Error::OutOfStep { .. }
        )
    }
}

/// Server status token of a single-line response.
#[derive(Debug, PartialEq, Eq)]
enum Status {
    Ok,
    Err,
}

fn parse_status(line: &str) -> Option<Status> {
    if line.starts_with("+OK") {
        Some(Status::Ok)
    } else if line.starts_with("-ERR") {
        Some(Status::Err)
    } else {
        None
    }
}

/// Strip the line ending (CRLF or bare LF) from one raw line.
fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parse one UIDL listing line: "<msg_no> <unique-id>". Anything else is None.
pub(crate) fn parse_uidl_line(line: &str) -> Option<(u32, String)> {
    let (num, uid) = line.trim().split_once(' ')?;
    let msg_no: u32 = num.parse().ok()?;
    let uid = uid.trim();
    if msg_no == 0 || uid.is_empty() || uid.contains(char::is_whitespace) {
        return None;
    }
    Some((msg_no, uid.to_string()))
}

/// POP3 session over one connection. Call login, then uidl/retr/dele, then close.
///
/// After a transport failure, timeout or unrecognised reply the session refuses
/// every further command with `OutOfStep`; only `close` still talks to the server.
pub struct Pop3Session {
    stream: BufStream<Connection>,
    timeout: Duration,
    line: Vec<u8>,
    out_of_step: bool,
}

impl Pop3Session {
    /// Connect, consume the greeting and, for StartTls endpoints, upgrade with STLS.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self, Pop3Error> {
        let conn = Connection::open(endpoint, timeout)
            .await
            .map_err(|source| Pop3Error::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let mut session = Self::from_connection(conn, timeout);
        session.greeting().await?;
        if endpoint.security == Security::StartTls {
            session.command("STLS", "STLS").await?;
            // Anything buffered ahead of the handshake is discarded with the old BufStream.
            let upgraded = session
                .stream
                .into_inner()
                .upgrade(&endpoint.host, timeout)
                .await
                .map_err(|source| Pop3Error::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
            session = Self::from_connection(upgraded, timeout);
        }
        Ok(session)
    }

    fn from_connection(conn: Connection, timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(conn),
            timeout,
            line: Vec::with_capacity(1024),
            out_of_step: false,
        }
    }

    async fn greeting(&mut self) -> Result<(), Pop3Error> {
        let timeout = self.timeout;
        let line = bounded("greeting", timeout, self.read_status_line("greeting")).await?;
        match parse_status(&line) {
            Some(Status::Ok) => Ok(()),
            Some(Status::Err) => Err(Pop3Error::Negative {
                command: "greeting".to_string(),
                response: line,
            }),
            None => Err(Pop3Error::Malformed {
                command: "greeting".to_string(),
                response: line,
            }),
        }
    }

    /// USER then PASS. A negative answer to either step is an auth failure;
    /// the connection stays open and the caller decides what to do.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), Pop3Error> {
        self.command(&format!("USER {}", username), "USER")
            .await
            .map_err(auth_failure)?;
        self.command(&format!("PASS {}", password), "PASS")
            .await
            .map_err(auth_failure)?;
        Ok(())
    }

    /// UIDL -> message number to unique-id for every visible message.
    /// Lines that are not "<integer> <token>" are skipped.
    pub async fn uidl(&mut self) -> Result<BTreeMap<u32, String>, Pop3Error> {
        let timeout = self.timeout;
        let result = bounded("UIDL", timeout, async {
            self.exchange("UIDL", "UIDL").await?;
            let mut entries = BTreeMap::new();
            loop {
                let line = self.read_raw_line("UIDL").await?;
                let content = strip_eol(&line);
                if content == b"." {
                    break;
                }
                match parse_uidl_line(&String::from_utf8_lossy(content)) {
                    Some((msg_no, uid)) => {
                        entries.insert(msg_no, uid);
                    }
                    None => {
                        tracing::debug!(line = %String::from_utf8_lossy(content), "skipping unparsable UIDL line");
                    }
                }
            }
            Ok(entries)
        })
        .await;
        self.track(result)
    }

    /// RETR msg -> full message bytes, CRLF per line, dot-unstuffed.
    pub async fn retr(&mut self, msg_no: u32) -> Result<Vec<u8>, Pop3Error> {
        let timeout = self.timeout;
        let label = format!("RETR {}", msg_no);
        let result = bounded(&label, timeout, async {
            self.exchange(&label, &label).await?;
            let mut out = Vec::new();
            loop {
                let line = self.read_raw_line(&label).await?;
                let content = strip_eol(&line);
                if content == b"." {
                    break;
                }
                // RFC 1939 byte-stuffing: a leading "." is doubled by the server.
                let content = content.strip_prefix(b".").unwrap_or(content);
                out.extend_from_slice(content);
                out.extend_from_slice(b"\r\n");
            }
            Ok(out)
        })
        .await;
        self.track(result)
    }

    /// DELE msg. The server only removes the message when the session ends with QUIT.
    pub async fn dele(&mut self, msg_no: u32) -> Result<(), Pop3Error> {
        let label = format!("DELE {}", msg_no);
        self.command(&label, &label).await.map(|_| ())
    }

    /// End the session. Clean: QUIT (best-effort) so pending deletions commit.
    /// Not clean: drop the transport without QUIT, leaving every DELE uncommitted.
    pub async fn close(mut self, clean: bool) {
        let timeout = self.timeout;
        if clean && self.out_of_step {
            // The reply could not be told apart from earlier output; send QUIT without reading it.
            let sent = bounded("QUIT", timeout, self.send_line("QUIT", "QUIT")).await;
            if let Err(e) = sent {
                tracing::debug!(error = %e, "QUIT failed");
            }
        } else if clean {
            if let Err(e) = self.command("QUIT", "QUIT").await {
                tracing::debug!(error = %e, "QUIT failed");
            }
        }
        let _ = tokio::time::timeout(timeout, self.stream.shutdown()).await;
    }

    /// Send a command and read its single-line status, bounded by the timeout.
    async fn command(&mut self, line: &str, label: &str) -> Result<String, Pop3Error> {
        let timeout = self.timeout;
        let result = bounded(label, timeout, self.exchange(line, label)).await;
        self.track(result)
    }

    /// Remember a failure that leaves the stream out of step with the server.
    fn track<T>(&mut self, result: Result<T, Pop3Error>) -> Result<T, Pop3Error> {
        if let Err(e) = &result {
            if e.breaks_session() && !self.out_of_step {
                tracing::warn!(error = %e, "POP3 session out of step, refusing further commands");
                self.out_of_step = true;
            }
        }
        result
    }

    async fn exchange(&mut self, line: &str, label: &str) -> Result<String, Pop3Error> {
        if self.out_of_step {
            return Err(Pop3Error::OutOfStep {
                command: label.to_string(),
            });
        }
        self.send_line(line, label).await?;
        let response = self.read_status_line(label).await?;
        match parse_status(&response) {
            Some(Status::Ok) => Ok(response),
            Some(Status::Err) => Err(Pop3Error::Negative {
                command: label.to_string(),
                response,
            }),
            None => Err(Pop3Error::Malformed {
                command: label.to_string(),
                response,
            }),
        }
    }

    async fn send_line(&mut self, line: &str, label: &str) -> Result<(), Pop3Error> {
        let io_err = |source| Pop3Error::Io {
            command: label.to_string(),
            source,
        };
        self.stream.write_all(line.as_bytes()).await.map_err(io_err)?;
        self.stream.write_all(b"\r\n").await.map_err(io_err)?;
        self.stream.flush().await.map_err(io_err)
    }

    async fn read_status_line(&mut self, label: &str) -> Result<String, Pop3Error> {
        let line = self.read_raw_line(label).await?;
        Ok(String::from_utf8_lossy(strip_eol(&line)).trim_end().to_string())
    }

    /// Read one raw line including its line ending. EOF or a partial last line is Truncated.
    async fn read_raw_line(&mut self, label: &str) -> Result<Vec<u8>, Pop3Error> {
        self.line.clear();
        let n = self
            .stream
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|source| Pop3Error::Io {
                command: label.to_string(),
                source,
            })?;
        if n == 0 || self.line.last() != Some(&b'\n') {
            return Err(Pop3Error::Truncated {
                command: label.to_string(),
            });
        }
        Ok(self.line.clone())
    }
}

fn auth_failure(e: Pop3Error) -> Pop3Error {
    match e {
        Pop3Error::Negative { response, .. } => Pop3Error::Auth(response),
        other => other,
    }
}

async fn bounded<T, F>(label: &str, timeout: Duration, fut: F) -> Result<T, Pop3Error>
where
    F: Future<Output = Result<T, Pop3Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(Pop3Error::Timeout {
            command: label.to_string(),
            timeout,
        }),
    }
}
