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

//! Abuse protection: per-address connection throttling, authentication failure tracking with
//! temporary blocks, and per-connection message rate limiting.
//!
//! Every time-dependent operation has an `_at` variant taking the current instant.

use std::{
    collections::{HashMap, VecDeque},
    fmt::{Display, Formatter},
    net::IpAddr,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub rate_limit_per_minute: u32,
    pub rate_limit_strikes: u32,
    pub connection_attempts_per_minute: u32,
    pub auth_failure_threshold: u32,
    pub auth_failure_window: Duration,
    pub block_duration: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 30,
            rate_limit_strikes: 3,
            connection_attempts_per_minute: 30,
            auth_failure_threshold: 5,
            auth_failure_window: Duration::from_secs(600),
            block_duration: Duration::from_secs(900),
        }
    }
}

/// Why a connection was refused before the WebSocket upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Blocked { retry_after: Duration },
    TooManyConnections,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Blocked { retry_after } => write!(
                f,
                "address blocked after repeated authentication failures, retry in {}s",
                retry_after.as_secs().max(1)
            ),
            Rejection::TooManyConnections => write!(f, "too many connection attempts"),
        }
    }
}

/// Verdict on a single inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Over the limit; the message is dropped and the connection gets a strike.
    Rejected { strikes: u32 },
    /// Out of strikes; the connection should be closed.
    Disconnect { strikes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { failures: u32 },
    Blocked { until: Instant },
}

/// Sliding window of one connection's accepted messages, owned by that connection.
///
/// Strikes are never forgiven for the life of the connection.
#[derive(Debug, Default)]
pub struct MessageWindow {
    accepted: VecDeque<Instant>,
    strikes: u32,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

#[derive(Debug, Default)]
struct AddressRecord {
    failures: VecDeque<Instant>,
    attempts: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl AddressRecord {
    fn expire(&mut self, now: Instant, config: &GuardConfig) {
        if let Some(until) = self.blocked_until
            && until <= now
        {
            self.blocked_until = None;
            self.failures.clear();
        }
        trim_window(&mut self.attempts, now, MINUTE);
        trim_window(&mut self.failures, now, config.auth_failure_window);
    }

    fn is_idle(&self) -> bool {
        self.blocked_until.is_none() && self.failures.is_empty() && self.attempts.is_empty()
    }
}

/// Drop entries at least `span` old.
fn trim_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

pub struct AbuseGuard {
    config: GuardConfig,
    addresses: Mutex<HashMap<IpAddr, AddressRecord>>,
}

impl AbuseGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            addresses: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<IpAddr, AddressRecord>> {
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit_connection(&self, addr: IpAddr) -> Result<(), Rejection> {
        self.admit_connection_at(addr, Instant::now())
    }

    pub fn admit_connection_at(&self, addr: IpAddr, now: Instant) -> Result<(), Rejection> {
        let mut table = self.table();
        let record = table.entry(addr).or_default();
        record.expire(now, &self.config);
        if let Some(until) = record.blocked_until {
            return Err(Rejection::Blocked {
                retry_after: until.saturating_duration_since(now),
            });
        }
        if record.attempts.len() >= self.config.connection_attempts_per_minute as usize {
            return Err(Rejection::TooManyConnections);
        }
        record.attempts.push_back(now);
        Ok(())
    }

    pub fn admit_message(&self, window: &mut MessageWindow) -> Admission {
        self.admit_message_at(window, Instant::now())
    }

    /// Rejected messages are not recorded, so they do not extend the window.
    pub fn admit_message_at(&self, window: &mut MessageWindow, now: Instant) -> Admission {
        trim_window(&mut window.accepted, now, MINUTE);
        if window.accepted.len() < self.config.rate_limit_per_minute as usize {
            window.accepted.push_back(now);
            return Admission::Allowed;
        }
        window.strikes += 1;
        if window.strikes >= self.config.rate_limit_strikes {
            Admission::Disconnect {
                strikes: window.strikes,
            }
        } else {
            Admission::Rejected {
                strikes: window.strikes,
            }
        }
    }

    pub fn record_auth_failure(&self, addr: IpAddr) -> FailureOutcome {
        self.record_auth_failure_at(addr, Instant::now())
    }

    pub fn record_auth_failure_at(&self, addr: IpAddr, now: Instant) -> FailureOutcome {
        let mut table = self.table();
        let record = table.entry(addr).or_default();
        record.expire(now, &self.config);
        record.failures.push_back(now);
        let failures = record.failures.len() as u32;
        if failures >= self.config.auth_failure_threshold {
            let until = now + self.config.block_duration;
            record.blocked_until = Some(until);
            warn!(
                %addr,
                failures,
                block_secs = self.config.block_duration.as_secs(),
                "Blocking address after repeated authentication failures"
            );
            return FailureOutcome::Blocked { until };
        }
        debug!(%addr, failures, "Authentication failure recorded");
        FailureOutcome::Counted { failures }
    }

    /// A successful login clears the address's failure history.
    pub fn record_auth_success(&self, addr: IpAddr) {
        if let Some(record) = self.table().get_mut(&addr) {
            record.failures.clear();
        }
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.is_blocked_at(addr, Instant::now())
    }

    pub fn is_blocked_at(&self, addr: IpAddr, now: Instant) -> bool {
        self.table()
            .get(&addr)
            .and_then(|record| record.blocked_until)
            .is_some_and(|until| until > now)
    }

    /// Forget expired blocks and stale windows. Returns how many addresses were dropped.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, record| {
            record.expire(now, &self.config);
            !record.is_idle()
        });
        before - table.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.table().len()
    }
}
