/*
 * config.rs
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


//! Run configuration: an XML file, then `POSTBRIDGE_*` environment overrides,
//! then defaults, then validation.
//!
//! XML is read with the quick_xml event reader. Unknown elements are ignored
//! and listed in `Config::ignored` for the caller to report once logging is up.
//! Validation reports every problem at once.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;

use crate::account::{Destination, MailboxAccount};
use crate::net::{Endpoint, Security};

pub const DEFAULT_STATE_PATH: &str = "/data/state.json";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_POP3_HOST: &str = "pop.mail.yahoo.com";
pub const DEFAULT_POP3_PORT: u16 = 995;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing configuration: {0}")]
    Xml(String),
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Validated configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub destination: Destination,
    pub mailboxes: Vec<MailboxAccount>,
    pub state_path: PathBuf,
    pub log_level: String,
    /// Bound on every connect, handshake and command round-trip.
    pub timeout: Duration,
    /// Unknown elements skipped while reading the file, as `section/name`.
    pub ignored: Vec<String>,
}

impl Config {
    /// Read `path` and resolve it against the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_xml_with_env(&content, |key| std::env::var(key).ok())
    }

    /// Parse `content`, apply overrides from `env`, fill defaults and validate.
    pub fn from_xml_with_env<F>(content: &str, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw = parse_xml(content)?;
        raw.apply_env(env);
        raw.resolve()
    }
}

/// One `<destination>` or `<mailbox>` element as written.
#[derive(Debug, Default)]
struct RawAccount {
    email: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<String>,
    security: Option<String>,
}

impl RawAccount {
    fn set(&mut self, element: &[u8], text: String) -> bool {
        let slot = match element {
            b"email" => &mut self.email,
            b"password" => &mut self.password,
            b"host" => &mut self.host,
            b"port" => &mut self.port,
            b"security" => &mut self.security,
            _ => return false,
        };
        *slot = Some(text);
        true
    }
}

#[derive(Debug, Default)]
struct RawConfig {
    destination: RawAccount,
    mailboxes: Vec<RawAccount>,
    state_path: Option<String>,
    log_level: Option<String>,
    timeout_secs: Option<String>,
    ehlo_hostname: Option<String>,
    ignored: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Top,
    Destination,
    Mailbox,
}

impl Section {
    fn name(self) -> &'static str {
        match self {
            Section::Top => "postbridge",
            Section::Destination => "destination",
            Section::Mailbox => "mailbox",
        }
    }
}

/// Parse XML using quick_xml. Expects <postbridge><destination>..</destination><mailbox>..</mailbox>...</postbridge>.
fn parse_xml(content: &str) -> Result<RawConfig, ConfigError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut raw = RawConfig::default();
    let mut section = Section::Top;
    let mut element = Vec::<u8>::new();
    let mut seen_root = false;

    loop {
        let text = match reader.read_event_into(&mut buf) {
            Err(e) => return Err(ConfigError::Xml(e.to_string())),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = e.name();
                let name = name.as_ref();
                if !seen_root {
                    if name != b"postbridge" {
                        return Err(ConfigError::Xml(format!(
                            "root element must be <postbridge>, found <{}>",
                            String::from_utf8_lossy(name)
                        )));
                    }
                    seen_root = true;
                } else if section == Section::Top && name == b"destination" {
                    section = Section::Destination;
                } else if section == Section::Top && name == b"mailbox" {
                    raw.mailboxes.push(RawAccount::default());
                    section = Section::Mailbox;
                } else {
                    element.clear();
                    element.extend_from_slice(name);
                }
                None
            }
            Ok(Event::Text(e)) => Some(e.unescape().map_err(|e| ConfigError::Xml(e.to_string()))?.into_owned()),
            Ok(Event::CData(e)) => Some(String::from_utf8_lossy(&e.into_inner()).into_owned()),
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"destination" | b"mailbox" => section = Section::Top,
                    _ => element.clear(),
                }
                None
            }
            _ => None,
        };
        if let Some(text) = text {
            if !element.is_empty() {
                assign(&mut raw, section, &element, text.trim().to_string());
            }
        }
        buf.clear();
    }
    if !seen_root {
        return Err(ConfigError::Xml("no <postbridge> element".to_string()));
    }
    Ok(raw)
}

fn assign(raw: &mut RawConfig, section: Section, element: &[u8], text: String) {
    let known = match section {
        Section::Destination => match element {
            b"ehlo-hostname" => {
                raw.ehlo_hostname = Some(text);
                true
            }
            _ => raw.destination.set(element, text),
        },
        Section::Mailbox => match raw.mailboxes.last_mut() {
            Some(mailbox) => mailbox.set(element, text),
            None => false,
        },
        Section::Top => {
            let slot = match element {
                b"state-path" => Some(&mut raw.state_path),
                b"log-level" => Some(&mut raw.log_level),
                b"timeout-secs" => Some(&mut raw.timeout_secs),
                b"ehlo-hostname" => Some(&mut raw.ehlo_hostname),
                _ => None,
            };
            match slot {
                Some(slot) => {
                    *slot = Some(text);
                    true
                }
                None => false,
            }
        }
    };
    if !known {
        raw.ignored
            .push(format!("{}/{}", section.name(), String::from_utf8_lossy(element)));
    }
}

impl RawConfig {
    /// Non-empty environment values replace what the file says.
    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.is_empty());
        if let Some(v) = get("POSTBRIDGE_DEST_EMAIL") {
            self.destination.email = Some(v);
        }
        if let Some(v) = get("POSTBRIDGE_DEST_PASSWORD") {
            self.destination.password = Some(v);
        }
        if let Some(v) = get("POSTBRIDGE_STATE_PATH") {
            self.state_path = Some(v);
        }
        if let Some(v) = get("POSTBRIDGE_LOG_LEVEL") {
            self.log_level = Some(v);
        }
        for (i, mailbox) in self.mailboxes.iter_mut().enumerate() {
            if let Some(v) = get(&format!("POSTBRIDGE_MAILBOX_{}_EMAIL", i)) {
                mailbox.email = Some(v);
            }
            if let Some(v) = get(&format!("POSTBRIDGE_MAILBOX_{}_PASSWORD", i)) {
                mailbox.password = Some(v);
            }
        }
    }

    fn resolve(self) -> Result<Config, ConfigError> {
        let mut problems = Vec::new();

        let destination = resolve_account(
            "destination",
            &self.destination,
            DEFAULT_SMTP_HOST,
            DEFAULT_SMTP_PORT,
            "POSTBRIDGE_DEST_PASSWORD",
            |port| if port == 465 { Security::Implicit } else { Security::StartTls },
            &mut problems,
        );
        if self.mailboxes.is_empty() {
            problems.push("at least one <mailbox> must be configured".to_string());
        }
        let mailboxes: Vec<_> = self
            .mailboxes
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                resolve_account(
                    &format!("mailbox[{}]", i),
                    raw,
                    DEFAULT_POP3_HOST,
                    DEFAULT_POP3_PORT,
                    &format!("POSTBRIDGE_MAILBOX_{}_PASSWORD", i),
                    |_| Security::Implicit,
                    &mut problems,
                )
            })
            .collect();

        let log_level = self
            .log_level
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
            .to_ascii_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            problems.push(format!(
                "log-level \"{}\" is not one of {}",
                log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        let timeout_secs = match self.timeout_secs.as_deref() {
            None => DEFAULT_TIMEOUT_SECS,
            Some(s) => match s.parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    problems.push(format!("timeout-secs \"{}\" must be a positive integer", s));
                    DEFAULT_TIMEOUT_SECS
                }
            },
        };

        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }

        let (address, endpoint, secret) = destination;
        let mut destination = Destination::new(address, endpoint, secret.as_str());
        if let Some(hostname) = self.ehlo_hostname.filter(|h| !h.is_empty()) {
            destination.ehlo_hostname = hostname;
        }
        Ok(Config {
            destination,
            mailboxes: mailboxes
                .into_iter()
                .map(|(address, endpoint, secret)| MailboxAccount::new(address, endpoint, secret.as_str()))
                .collect(),
            state_path: PathBuf::from(self.state_path.unwrap_or_else(|| DEFAULT_STATE_PATH.to_string())),
            log_level,
            timeout: Duration::from_secs(timeout_secs),
            ignored: self.ignored,
        })
    }
}

/// Fill defaults for one account and record what is missing or malformed.
/// Returns (address, endpoint, password); the values are only meaningful when no problem was added.
fn resolve_account(
    label: &str,
    raw: &RawAccount,
    default_host: &str,
    default_port: u16,
    password_env: &str,
    default_security: impl Fn(u16) -> Security,
    problems: &mut Vec<String>,
) -> (String, Endpoint, String) {
    let address = raw.email.clone().unwrap_or_default();
    if address.is_empty() {
        problems.push(format!("{}: email is required", label));
    }
    let password = raw.password.clone().unwrap_or_default();
    if password.is_empty() {
        problems.push(format!(
            "{}: password is required (set it in the file or via {})",
            label, password_env
        ));
    }
    let host = raw
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| default_host.to_string());
    let port = match raw.port.as_deref() {
        None => default_port,
        Some(s) => match s.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => {
                problems.push(format!("{}: port \"{}\" must be 1-65535", label, s));
                default_port
            }
        },
    };
    let security = match raw.security.as_deref() {
        None => default_security(port),
        Some(s) => Security::from_name(s).unwrap_or_else(|| {
            problems.push(format!(
                "{}: security \"{}\" must be implicit, starttls or none",
                label, s
            ));
            default_security(port)
        }),
    };
    (address, Endpoint::new(host, port, security), password)
}
