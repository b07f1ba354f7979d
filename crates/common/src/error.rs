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

use thiserror::Error;

/// Everything that can go wrong turning a wire frame into a message, or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid base64 image payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("binary frame too short to carry a header")]
    Truncated,
    #[error("invalid binary frame header: {0}")]
    BadHeader(String),
    #[error("declared payload length {declared} does not match the {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("empty clipboard payload")]
    EmptyPayload,
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

impl CodecError {
    pub fn is_oversized(&self) -> bool {
        matches!(self, CodecError::Oversized { .. })
    }
}
