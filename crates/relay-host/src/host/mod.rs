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

mod broker;
pub mod credentials;
mod error;
pub mod guard;
mod listener;
pub mod registry;
mod ws_connection;

pub use broker::{RelayConfig, SyncBroker, health_handler, mk_routes, ws_handler};
pub use credentials::{CredentialError, CredentialSource, CredentialStore, HashingParams};
pub use error::{AuthError, RelayError};
pub use guard::{AbuseGuard, Admission, FailureOutcome, GuardConfig, MessageWindow, Rejection};
pub use listener::Listener;
pub use registry::{BroadcastReport, ConnectionHandle, ConnectionRegistry, Outbound};
pub use ws_connection::ConnectionState;
