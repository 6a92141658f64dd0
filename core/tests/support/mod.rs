/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * In-process POP3 and SMTP servers on 127.0.0.1 for the integration tests.
 * Plaintext only; each accepted connection is served on its own task.
 */

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Server-side mailbox. Message numbers are positions in `messages` at session start.
#[derive(Debug, Default)]
pub struct Pop3Mailbox {
    pub messages: Vec<(String, Vec<u8>)>,
    pub commands: Vec<String>,
    pub sessions: usize,
}

impl Pop3Mailbox {
    pub fn uids(&self) -> Vec<String> {
        self.messages.iter().map(|(uid, _)| uid.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Pop3Behaviour {
    pub greeting: String,
    pub password: String,
    /// Emit a line that is not "<n> <uid>" inside the UIDL listing.
    pub uidl_noise: bool,
    /// Close the connection halfway through every RETR.
    pub truncate_retr: bool,
    /// Accept connections and never say anything.
    pub silent: bool,
    /// Answer DELE and QUIT normally but never remove anything.
    pub ignore_deletes: bool,
    /// Stop answering once this command verb arrives.
    pub stall_on: Option<&'static str>,
}

impl Default for Pop3Behaviour {
    fn default() -> Self {
        Self {
            greeting: "+OK POP3 server ready".to_string(),
            password: "secret".to_string(),
            uidl_noise: false,
            truncate_retr: false,
            silent: false,
            ignore_deletes: false,
            stall_on: None,
        }
    }
}

pub struct Pop3Server {
    pub port: u16,
    pub mailbox: Arc<Mutex<Pop3Mailbox>>,
}

impl Pop3Server {
    pub fn uids(&self) -> Vec<String> {
        self.mailbox.lock().unwrap().uids()
    }

    pub fn commands(&self) -> Vec<String> {
        self.mailbox.lock().unwrap().commands.clone()
    }
}

pub async fn start_pop3(messages: &[(&str, &[u8])], behaviour: Pop3Behaviour) -> Pop3Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mailbox = Arc::new(Mutex::new(Pop3Mailbox {
        messages: messages
            .iter()
            .map(|(uid, raw)| (uid.to_string(), raw.to_vec()))
            .collect(),
        ..Pop3Mailbox::default()
    }));
    let shared = mailbox.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_pop3(stream, shared.clone(), behaviour.clone()));
        }
    });
    Pop3Server { port, mailbox }
}

/// RFC 1939 byte-stuffing plus the terminator line.
fn pop3_stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 8);
    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn serve_pop3(stream: TcpStream, mailbox: Arc<Mutex<Pop3Mailbox>>, b: Pop3Behaviour) {
    if b.silent {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        drop(stream);
        return;
    }
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let snapshot = {
        let mut m = mailbox.lock().unwrap();
        m.sessions += 1;
        m.messages.clone()
    };
    let mut deleted = BTreeSet::new();
    let mut user_given = false;
    let mut authed = false;

    if writer.write_all(format!("{}\r\n", b.greeting).as_bytes()).await.is_err() {
        return;
    }
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let cmd = line.trim_end().to_string();
        mailbox.lock().unwrap().commands.push(cmd.clone());
        let (verb, arg) = cmd.split_once(' ').unwrap_or((cmd.as_str(), ""));
        if b.stall_on.map_or(false, |stall| verb.eq_ignore_ascii_case(stall)) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }
        let lookup = |arg: &str| {
            arg.parse::<usize>()
                .ok()
                .filter(|n| *n >= 1 && *n <= snapshot.len())
        };
        let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
            "USER" => {
                user_given = true;
                b"+OK send PASS\r\n".to_vec()
            }
            "PASS" if user_given && arg == b.password => {
                authed = true;
                b"+OK logged in\r\n".to_vec()
            }
            "PASS" => b"-ERR invalid credentials\r\n".to_vec(),
            "UIDL" if authed => {
                let mut out = b"+OK unique-id listing follows\r\n".to_vec();
                if b.uidl_noise {
                    out.extend_from_slice(b"this is not a listing line\r\n");
                }
                for (i, (uid, _)) in snapshot.iter().enumerate() {
                    if !deleted.contains(&(i + 1)) {
                        out.extend_from_slice(format!("{} {}\r\n", i + 1, uid).as_bytes());
                    }
                }
                out.extend_from_slice(b".\r\n");
                out
            }
            "RETR" if authed => match lookup(arg).filter(|n| !deleted.contains(n)) {
                Some(n) => {
                    let mut out = b"+OK message follows\r\n".to_vec();
                    let body = pop3_stuff(&snapshot[n - 1].1);
                    if b.truncate_retr {
                        out.extend_from_slice(&body[..body.len() / 2]);
                        let _ = writer.write_all(&out).await;
                        return;
                    }
                    out.extend_from_slice(&body);
                    out
                }
                None => b"-ERR no such message\r\n".to_vec(),
            },
            "DELE" if authed => match lookup(arg) {
                Some(n) => {
                    deleted.insert(n);
                    b"+OK marked\r\n".to_vec()
                }
                None => b"-ERR no such message\r\n".to_vec(),
            },
            "QUIT" => {
                if !b.ignore_deletes {
                    let gone: BTreeSet<String> = deleted
                        .iter()
                        .map(|n: &usize| snapshot[*n - 1].0.clone())
                        .collect();
                    mailbox
                        .lock()
                        .unwrap()
                        .messages
                        .retain(|(uid, _)| !gone.contains(uid));
                }
                let _ = writer.write_all(b"+OK bye\r\n").await;
                return;
            }
            "STLS" => b"-ERR STLS not available\r\n".to_vec(),
            _ => b"-ERR unknown command\r\n".to_vec(),
        };
        if writer.write_all(&reply).await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Default)]
pub struct SmtpInbox {
    pub messages: Vec<Vec<u8>>,
    /// (MAIL FROM, RCPT TO) per accepted message.
    pub envelopes: Vec<(String, String)>,
    /// Identities that authenticated successfully.
    pub logins: Vec<String>,
    /// Every command line received, in order.
    pub commands: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SmtpBehaviour {
    pub password: String,
    pub chunking: bool,
    /// Mechanisms advertised on the AUTH line; only these are accepted.
    pub auth: &'static str,
    /// Refuse any message whose content contains this text.
    pub reject_containing: Option<String>,
}

impl Default for SmtpBehaviour {
    fn default() -> Self {
        Self {
            password: "dest-secret".to_string(),
            chunking: false,
            auth: "PLAIN LOGIN",
            reject_containing: None,
        }
    }
}

pub struct SmtpServer {
    pub port: u16,
    pub inbox: Arc<Mutex<SmtpInbox>>,
}

impl SmtpServer {
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().unwrap().messages.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.inbox.lock().unwrap().commands.clone()
    }
}

fn decode_b64(line: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(line.trim())
        .unwrap_or_default()
}

pub async fn start_smtp(behaviour: SmtpBehaviour) -> SmtpServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let inbox = Arc::new(Mutex::new(SmtpInbox::default()));
    let shared = inbox.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_smtp(stream, shared.clone(), behaviour.clone()));
        }
    });
    SmtpServer { port, inbox }
}

async fn serve_smtp(stream: TcpStream, inbox: Arc<Mutex<SmtpInbox>>, b: SmtpBehaviour) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut sender = String::new();
    let mut recipient = String::new();
    let mut authed = false;

    if writer.write_all(b"220 test.local ESMTP\r\n").await.is_err() {
        return;
    }
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        let upper = line.to_ascii_uppercase();
        inbox.lock().unwrap().commands.push(line.clone());
        let offers = |mechanism: &str| b.auth.split_whitespace().any(|m| m == mechanism);

        let content = if upper.starts_with("EHLO") {
            let mut reply = format!("250-test.local\r\n250-AUTH {}\r\n", b.auth);
            if b.chunking {
                reply.push_str("250-CHUNKING\r\n");
            }
            reply.push_str("250 8BITMIME\r\n");
            let _ = writer.write_all(reply.as_bytes()).await;
            continue;
        } else if upper == "AUTH LOGIN" && offers("LOGIN") {
            let mut answers = Vec::new();
            for challenge in ["VXNlcm5hbWU6", "UGFzc3dvcmQ6"] {
                if writer
                    .write_all(format!("334 {}\r\n", challenge).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
                let mut answer = String::new();
                match reader.read_line(&mut answer).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                inbox.lock().unwrap().commands.push(answer.trim_end().to_string());
                answers.push(decode_b64(&answer));
            }
            let ok = answers[1] == b.password.as_bytes();
            if ok {
                authed = true;
                inbox
                    .lock()
                    .unwrap()
                    .logins
                    .push(String::from_utf8_lossy(&answers[0]).into_owned());
            }
            let reply: &[u8] = if ok {
                b"235 2.7.0 accepted\r\n"
            } else {
                b"535 5.7.8 bad credentials\r\n"
            };
            let _ = writer.write_all(reply).await;
            continue;
        } else if let Some(initial) = line.strip_prefix("AUTH PLAIN ").filter(|_| offers("PLAIN")) {
            let decoded = decode_b64(initial);
            let parts: Vec<&[u8]> = decoded.split(|&c| c == 0).collect();
            let ok = parts.len() == 3 && parts[2] == b.password.as_bytes();
            if ok {
                authed = true;
                inbox
                    .lock()
                    .unwrap()
                    .logins
                    .push(String::from_utf8_lossy(parts[1]).into_owned());
            }
            let reply: &[u8] = if ok {
                b"235 2.7.0 accepted\r\n"
            } else {
                b"535 5.7.8 bad credentials\r\n"
            };
            let _ = writer.write_all(reply).await;
            continue;
        } else if upper.starts_with("MAIL FROM:") && authed {
            sender = line[10..].trim_matches(|c| c == '<' || c == '>').to_string();
            let _ = writer.write_all(b"250 OK\r\n").await;
            continue;
        } else if upper.starts_with("RCPT TO:") && authed {
            recipient = line[8..].trim_matches(|c| c == '<' || c == '>').to_string();
            let _ = writer.write_all(b"250 OK\r\n").await;
            continue;
        } else if upper == "DATA" && authed {
            let _ = writer.write_all(b"354 go ahead\r\n").await;
            let mut message = Vec::new();
            let mut data_line = Vec::new();
            loop {
                data_line.clear();
                match reader.read_until(b'\n', &mut data_line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if data_line == b".\r\n" {
                    break;
                }
                let unstuffed = data_line.strip_prefix(b".").unwrap_or(&data_line);
                message.extend_from_slice(unstuffed);
            }
            message
        } else if upper.starts_with("BDAT ") && authed {
            let size: usize = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mut message = vec![0u8; size];
            if reader.read_exact(&mut message).await.is_err() {
                return;
            }
            message
        } else if upper == "QUIT" {
            let _ = writer.write_all(b"221 bye\r\n").await;
            return;
        } else {
            let _ = writer.write_all(b"502 not implemented\r\n").await;
            continue;
        };

        let rejected = b
            .reject_containing
            .as_ref()
            .map_or(false, |needle| String::from_utf8_lossy(&content).contains(needle.as_str()));
        if rejected {
            let _ = writer.write_all(b"554 5.7.1 message refused\r\n").await;
        } else {
            {
                let mut guard = inbox.lock().unwrap();
                guard.messages.push(content);
                guard.envelopes.push((sender.clone(), recipient.clone()));
            }
            let _ = writer.write_all(b"250 2.0.0 queued\r\n").await;
        }
    }
}
