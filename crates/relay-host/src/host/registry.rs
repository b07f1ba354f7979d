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

use axum::extract::ws::Message;
use clipsync_common::ConnectionId;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Message),
    Close { code: u16, reason: String },
}

/// The registry's view of an authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub username: String,
    pub peer_addr: SocketAddr,
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        username: String,
        peer_addr: SocketAddr,
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            username,
            peer_addr,
            sender,
            cancel,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Peers whose queue was full or gone; they have been unregistered and cancelled.
    pub evicted: Vec<ConnectionId>,
}

/// The set of live, authenticated connections.
///
/// Fan-out never waits on a peer: each gets a `try_send` onto its bounded queue, and a peer
/// that cannot take the frame is dropped from the set.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection, returning the new live count.
    pub fn register(&self, handle: ConnectionHandle) -> usize {
        let mut connections = self.write();
        connections.insert(handle.id, handle);
        connections.len()
    }

    /// Remove a connection. Safe to call for one that is already gone.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.write().remove(&id)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().values().map(|h| h.username.clone()).collect();
        names.sort();
        names
    }

    /// Queue `message` for every live connection except `exclude`.
    pub fn broadcast(&self, message: &Message, exclude: ConnectionId) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let connections = self.read();
            for (id, handle) in connections.iter() {
                if *id == exclude {
                    continue;
                }
                match handle.sender.try_send(Outbound::Message(message.clone())) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(connection_id = %id, username = %handle.username, "Outbound queue full, evicting slow peer");
                        report.evicted.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(connection_id = %id, "Outbound queue closed, evicting peer");
                        report.evicted.push(*id);
                    }
                }
            }
        }
        for id in &report.evicted {
            if let Some(handle) = self.unregister(*id) {
                handle.cancel.cancel();
            }
        }
        report
    }

    /// Cancel and forget every connection. Returns how many there were.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.write().drain().map(|(_, handle)| handle).collect();
        for handle in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }
}
