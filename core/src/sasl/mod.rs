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

//! SASL client for SMTP submission: PLAIN and LOGIN over TLS.

mod mechanism;
mod plain;

pub use mechanism::SaslMechanism;
pub use plain::encode_plain;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SaslError {
    pub message: String,
}

impl SaslError {
    pub fn invalid(msg: &str) -> Self {
        Self { message: msg.to_string() }
    }
}

/// Base64 initial response sent with "AUTH <mechanism>". Empty for LOGIN, which waits for challenges.
pub fn initial_client_response(mechanism: SaslMechanism, authcid: &str, password: &str) -> String {
    match mechanism {
        SaslMechanism::Plain => STANDARD.encode(encode_plain("", authcid, password)),
        SaslMechanism::Login => String::new(),
    }
}

/// LOGIN: first challenge is "Username:", second is "Password:". Returns the base64 answer.
pub fn login_respond_to_challenge(challenge_b64: &str, authcid: &str, password: &str) -> Result<String, SaslError> {
    let decoded = STANDARD
        .decode(challenge_b64.trim())
        .map_err(|_| SaslError::invalid("invalid base64 in LOGIN challenge"))?;
    let s = String::from_utf8_lossy(&decoded).to_lowercase();
    if s.contains("username") {
        Ok(STANDARD.encode(authcid.as_bytes()))
    } else if s.contains("password") {
        Ok(STANDARD.encode(password.as_bytes()))
    } else {
        Err(SaslError::invalid("unexpected LOGIN challenge"))
    }
}
