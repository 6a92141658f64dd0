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

//! Async SMTP submission client: connect, EHLO, STARTTLS, AUTH, MAIL FROM, RCPT TO, DATA/BDAT, QUIT.
//! One connection per message; nothing is pooled.

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};

use crate::account::Destination;
use crate::net::{Connection, Security};
use crate::protocol::smtp::dot_stuffer::stuff_message;
use crate::sasl::{initial_client_response, login_respond_to_challenge, SaslMechanism};

/// Delivery failure (network, TLS, auth, or a rejected transaction step).
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o error during {stage}: {source}")]
    Io {
        stage: String,
        #[source]
        source: io::Error,
    },
    #[error("{stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },
    #[error("TLS negotiation failed: {0}")]
    Tls(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{stage} rejected: {code} {message}")]
    Rejected {
        stage: String,
        code: u16,
        message: String,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Parsed SMTP response (code + text of every line).
#[derive(Debug)]
struct SmtpResponse {
    code: u16,
    lines: Vec<String>,
}

impl SmtpResponse {
    fn message(&self) -> &str {
        self.lines.last().map(|s| s.as_str()).unwrap_or("")
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Capabilities from an EHLO response.
#[derive(Debug, Default, PartialEq, Eq)]
struct Capabilities {
    starttls: bool,
    chunking: bool,
    auth: Vec<String>,
}

fn parse_capabilities(r: &SmtpResponse) -> Capabilities {
    let mut caps = Capabilities::default();
    // First line is the greeting text, the rest are extensions.
    for line in r.lines.iter().skip(1) {
        let upper = line.to_ascii_uppercase();
        if upper == "STARTTLS" {
            caps.starttls = true;
        } else if upper == "CHUNKING" {
            caps.chunking = true;
        } else if let Some(rest) = upper.strip_prefix("AUTH") {
            if rest.starts_with(' ') || rest.starts_with('=') {
                caps.auth
                    .extend(rest[1..].split_whitespace().map(|m| m.to_string()));
            }
        }
    }
    caps
}

/// Parse one response line into (code, continuation, text).
fn parse_response_line(line: &str) -> Option<(u16, bool, &str)> {
    if line.len() < 3 || !line.is_char_boundary(3) {
        return None;
    }
    let code: u16 = line[..3].parse().ok()?;
    let rest = &line[3..];
    match rest.as_bytes().first() {
        None => Some((code, false, "")),
        Some(b'-') => Some((code, true, rest[1..].trim())),
        Some(b' ') => Some((code, false, rest[1..].trim())),
        Some(_) => None,
    }
}

struct SmtpSession {
    stream: BufStream<Connection>,
    timeout: Duration,
    line: Vec<u8>,
}

impl SmtpSession {
    fn new(conn: Connection, timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(conn),
            timeout,
            line: Vec::with_capacity(512),
        }
    }

    async fn read_response(&mut self, stage: &str) -> Result<SmtpResponse, DeliveryError> {
        let mut lines = Vec::new();
        loop {
            self.line.clear();
            let n = self
                .stream
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(|source| io_error(stage, source))?;
            if n == 0 {
                return Err(io_error(
                    stage,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
                ));
            }
            let text = String::from_utf8_lossy(&self.line);
            let text = text.trim_end_matches(['\r', '\n']);
            let (code, continuation, message) = parse_response_line(text).ok_or_else(|| {
                DeliveryError::Protocol(format!("malformed reply to {}: {}", stage, text))
            })?;
            lines.push(message.to_string());
            if !continuation {
                return Ok(SmtpResponse { code, lines });
            }
        }
    }

    async fn write_line(&mut self, line: &[u8], stage: &str) -> Result<(), DeliveryError> {
        self.stream.write_all(line).await.map_err(|e| io_error(stage, e))?;
        self.stream.write_all(b"\r\n").await.map_err(|e| io_error(stage, e))?;
        self.stream.flush().await.map_err(|e| io_error(stage, e))
    }

    /// Send a command and read the reply, bounded by the timeout.
    async fn command(&mut self, line: &str, stage: &str) -> Result<SmtpResponse, DeliveryError> {
        let timeout = self.timeout;
        bounded(stage, timeout, async {
            self.write_line(line.as_bytes(), stage).await?;
            self.read_response(stage).await
        })
        .await
    }

    /// Like command, but any non-2xx reply is a rejection.
    async fn expect_success(&mut self, line: &str, stage: &str) -> Result<SmtpResponse, DeliveryError> {
        let r = self.command(line, stage).await?;
        if !r.is_success() {
            return Err(rejected(stage, &r));
        }
        Ok(r)
    }

    async fn greeting(&mut self) -> Result<(), DeliveryError> {
        let timeout = self.timeout;
        let r = bounded("greeting", timeout, self.read_response("greeting")).await?;
        if r.code != 220 {
            return Err(rejected("greeting", &r));
        }
        Ok(())
    }

    async fn ehlo(&mut self, hostname: &str) -> Result<Capabilities, DeliveryError> {
        let r = self.expect_success(&format!("EHLO {}", hostname), "EHLO").await?;
        Ok(parse_capabilities(&r))
    }

    async fn authenticate(
        &mut self,
        caps: &Capabilities,
        authcid: &str,
        password: &str,
    ) -> Result<(), DeliveryError> {
        let mechanism = SaslMechanism::choose(&caps.auth).ok_or_else(|| {
            DeliveryError::Auth(format!(
                "no supported mechanism in [{}]",
                caps.auth.join(" ")
            ))
        })?;
        tracing::debug!(mechanism = %mechanism, "SMTP AUTH");
        let initial = initial_client_response(mechanism, authcid, password);
        let cmd = if initial.is_empty() {
            format!("AUTH {}", mechanism)
        } else {
            format!("AUTH {} {}", mechanism, initial)
        };
        let mut r = self.command(&cmd, "AUTH").await?;
        loop {
            match r.code {
                235 => return Ok(()),
                334 if mechanism == SaslMechanism::Login => {
                    let answer = login_respond_to_challenge(r.message(), authcid, password)
                        .map_err(|e| DeliveryError::Auth(e.to_string()))?;
                    r = self.command(&answer, "AUTH").await?;
                }
                _ => {
                    return Err(DeliveryError::Auth(format!("{} {}", r.code, r.message())));
                }
            }
        }
    }

    /// MAIL FROM, one RCPT TO, then BDAT when CHUNKING is advertised, otherwise dot-stuffed DATA.
    async fn transaction(
        &mut self,
        sender: &str,
        recipient: &str,
        message: &[u8],
        use_bdat: bool,
    ) -> Result<(), DeliveryError> {
        self.expect_success(&format!("MAIL FROM:<{}>", sender), "MAIL FROM")
            .await?;
        let r = self
            .command(&format!("RCPT TO:<{}>", recipient), "RCPT TO")
            .await?;
        if !r.is_success() {
            return Err(rejected("RCPT TO", &r));
        }

        let timeout = self.timeout;
        let r = if use_bdat {
            bounded("BDAT", timeout, async {
                self.write_line(format!("BDAT {} LAST", message.len()).as_bytes(), "BDAT")
                    .await?;
                self.stream.write_all(message).await.map_err(|e| io_error("BDAT", e))?;
                self.stream.flush().await.map_err(|e| io_error("BDAT", e))?;
                self.read_response("BDAT").await
            })
            .await?
        } else {
            let r = self.command("DATA", "DATA").await?;
            if r.code != 354 {
                return Err(rejected("DATA", &r));
            }
            let data = stuff_message(message);
            bounded("message body", timeout, async {
                self.stream
                    .write_all(&data)
                    .await
                    .map_err(|e| io_error("message body", e))?;
                self.stream.flush().await.map_err(|e| io_error("message body", e))?;
                self.read_response("message body").await
            })
            .await?
        };
        if !r.is_success() {
            return Err(rejected("message", &r));
        }
        Ok(())
    }

    async fn quit(&mut self) {
        if let Err(e) = self.command("QUIT", "QUIT").await {
            tracing::debug!(error = %e, "SMTP QUIT failed");
        }
        let _ = tokio::time::timeout(self.timeout, self.stream.shutdown()).await;
    }
}

fn io_error(stage: &str, source: io::Error) -> DeliveryError {
    DeliveryError::Io {
        stage: stage.to_string(),
        source,
    }
}

fn rejected(stage: &str, r: &SmtpResponse) -> DeliveryError {
    DeliveryError::Rejected {
        stage: stage.to_string(),
        code: r.code,
        message: r.message().to_string(),
    }
}

async fn bounded<T, F>(stage: &str, timeout: Duration, fut: F) -> Result<T, DeliveryError>
where
    F: Future<Output = Result<T, DeliveryError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(DeliveryError::Timeout {
            stage: stage.to_string(),
            timeout,
        }),
    }
}

/// Run one SMTP session: connect, secure, authenticate as the destination account and submit
/// `message` with that account as both envelope sender and sole recipient. QUIT is best-effort.
pub async fn submit(destination: &Destination, timeout: Duration, message: &[u8]) -> Result<(), DeliveryError> {
    let endpoint = &destination.endpoint;
    let conn = Connection::open(endpoint, timeout)
        .await
        .map_err(|source| DeliveryError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
    let mut session = SmtpSession::new(conn, timeout);
    session.greeting().await?;
    let mut caps = session.ehlo(&destination.ehlo_hostname).await?;

    if endpoint.security == Security::StartTls {
        if !caps.starttls {
            return Err(DeliveryError::Tls("server does not advertise STARTTLS".to_string()));
        }
        let r = session.command("STARTTLS", "STARTTLS").await?;
        if r.code != 220 {
            return Err(DeliveryError::Tls(format!("{} {}", r.code, r.message())));
        }
        let upgraded = session
            .stream
            .into_inner()
            .upgrade(&endpoint.host, timeout)
            .await
            .map_err(|e| DeliveryError::Tls(e.to_string()))?;
        session = SmtpSession::new(upgraded, timeout);
        caps = session.ehlo(&destination.ehlo_hostname).await?;
    }

    session
        .authenticate(&caps, &destination.address, destination.secret.expose())
        .await?;
    session
        .transaction(&destination.address, &destination.address, message, caps.chunking)
        .await?;
    session.quit().await;
    Ok(())
}
