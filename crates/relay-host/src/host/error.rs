// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use clipsync_common::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("missing credentials")]
    MissingCredentials,
    #[error("first message must be authentication")]
    NotAuthenticated,
    #[error("too many failed attempts, address blocked")]
    Blocked,
    #[error("authentication timed out")]
    Timeout,
    #[error("too many authentication attempts")]
    TooManyAttempts,
}

/// Errors that end up in front of a client, either as an `error` notice or a close reason.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("rate limit exceeded: at most {limit} messages per minute")]
    RateLimit { limit: u32, strikes: u32 },
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// The reason string sent to the client.
    pub fn client_reason(&self) -> String {
        match self {
            RelayError::Auth(e) => e.to_string(),
            RelayError::RateLimit { limit, .. } => {
                format!("rate limit exceeded: at most {limit} messages per minute")
            }
            RelayError::Protocol(e) => e.to_string(),
            RelayError::Transport(_) => "transport error".to_string(),
        }
    }

    /// Whether the connection survives this error on its own.
    ///
    /// Recoverable errors can still add up to a disconnect through strike counters.
    pub fn is_recoverable(&self) -> bool {
        match self {
            RelayError::RateLimit { .. } | RelayError::Protocol(_) => true,
            RelayError::Auth(AuthError::InvalidCredentials)
            | RelayError::Auth(AuthError::MissingCredentials)
            | RelayError::Auth(AuthError::NotAuthenticated) => true,
            RelayError::Auth(_) | RelayError::Transport(_) => false,
        }
    }
}

impl From<axum::Error> for RelayError {
    fn from(e: axum::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}
