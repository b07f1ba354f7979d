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

use crate::host::{
    broker::SyncBroker,
    error::{AuthError, RelayError},
    guard::{Admission, FailureOutcome, MessageWindow},
    registry::{ConnectionHandle, Outbound},
};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use clipsync_common::{ClipboardMessage, ConnectionId, Frame, Inbound, ServerMessage};
use futures_util::{Sink, SinkExt, StreamExt, stream::SplitStream};
use std::{fmt::Display, net::SocketAddr, ops::ControlFlow, time::Duration};
use tokio::{
    select,
    sync::mpsc,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

pub enum ReadEvent {
    Frame(Frame),
    KeepAlive,
    ConnectionClose,
    Cancelled,
    TimedOut,
    TransportError(RelayError),
}

pub struct WebSocketConnection {
    pub(crate) id: ConnectionId,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) broker: SyncBroker,
    pub(crate) outbound: mpsc::Sender<Outbound>,
    outbound_rx: Option<mpsc::Receiver<Outbound>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: ConnectionState,
    pub(crate) username: Option<String>,
    pub(crate) failed_auth_count: u32,
    pub(crate) window: MessageWindow,
    pub(crate) malformed_count: u32,
}

impl WebSocketConnection {
    pub fn new(broker: SyncBroker, peer_addr: SocketAddr) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(broker.config().outbound_queue_depth);
        let cancel = broker.shutdown_token().child_token();
        Self {
            id: ConnectionId::new(),
            peer_addr,
            broker,
            outbound,
            outbound_rx: Some(outbound_rx),
            cancel,
            state: ConnectionState::Connecting,
            username: None,
            failed_auth_count: 0,
            window: MessageWindow::new(),
            malformed_count: 0,
        }
    }

    pub async fn run(mut self, socket: WebSocket) {
        info!(peer_addr = ?self.peer_addr, connection_id = %self.id, "New connection");
        let (ws_sender, mut ws_receiver) = socket.split();

        let Some(outbound_rx) = self.outbound_rx.take() else {
            error!(connection_id = %self.id, "Connection started twice");
            return;
        };
        let writer = tokio::spawn(write_loop(
            ws_sender,
            outbound_rx,
            self.broker.config().write_timeout,
            self.cancel.clone(),
        ));

        self.state = ConnectionState::Authenticating;
        match self.authenticate(&mut ws_receiver).await {
            Ok(()) => self.relay_loop(&mut ws_receiver).await,
            Err(e) if e.is_recoverable() => {
                debug!(peer_addr = ?self.peer_addr, connection_id = %self.id, "Authentication ended: {e}");
            }
            Err(e) => {
                info!(peer_addr = ?self.peer_addr, connection_id = %self.id, "Authentication ended: {e}");
            }
        }
        self.close();

        // Dropping our sender lets the writer drain what is queued and finish.
        drop(self);
        if let Err(e) = writer.await {
            warn!("Writer task failed: {e}");
        }
    }

    async fn next_event(
        &self,
        ws_receiver: &mut SplitStream<WebSocket>,
        deadline: Instant,
    ) -> ReadEvent {
        select! {
            _ = self.cancel.cancelled() => ReadEvent::Cancelled,
            next = timeout_at(deadline, ws_receiver.next()) => match next {
                Err(_) => ReadEvent::TimedOut,
                Ok(None) => ReadEvent::ConnectionClose,
                Ok(Some(Err(e))) => ReadEvent::TransportError(e.into()),
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => ReadEvent::Frame(Frame::Text(text.as_str().to_string())),
                    Message::Binary(bytes) => ReadEvent::Frame(Frame::Binary(bytes)),
                    Message::Ping(_) | Message::Pong(_) => ReadEvent::KeepAlive,
                    Message::Close(_) => ReadEvent::ConnectionClose,
                },
            },
        }
    }

    async fn authenticate(
        &mut self,
        ws_receiver: &mut SplitStream<WebSocket>,
    ) -> Result<(), RelayError> {
        let config = self.broker.config().clone();
        let deadline = Instant::now() + config.auth_timeout;
        loop {
            let frame = match self.next_event(ws_receiver, deadline).await {
                ReadEvent::Frame(frame) => frame,
                ReadEvent::KeepAlive => continue,
                ReadEvent::TimedOut => {
                    self.notify(&AuthError::Timeout.into());
                    self.close_with(close_code::POLICY, "authentication timed out");
                    return Err(AuthError::Timeout.into());
                }
                ReadEvent::ConnectionClose | ReadEvent::Cancelled => {
                    return Err(RelayError::Transport(
                        "closed before authenticating".to_string(),
                    ));
                }
                ReadEvent::TransportError(e) => return Err(e),
            };

            let attempt = match self.broker.codec().decode(&frame) {
                Ok(Inbound::Auth { username, password }) => {
                    if username.is_empty() || password.is_empty() {
                        Err(AuthError::MissingCredentials)
                    } else {
                        self.check_credentials(username, password).await
                    }
                }
                Ok(_) | Err(_) => Err(AuthError::NotAuthenticated),
            };

            let error = match attempt {
                Ok(username) => {
                    self.activate(username);
                    return Ok(());
                }
                Err(AuthError::Blocked) => {
                    self.reply(&ServerMessage::auth_rejected(AuthError::Blocked.to_string()));
                    self.close_with(close_code::POLICY, "blocked");
                    return Err(AuthError::Blocked.into());
                }
                Err(e) => e,
            };

            self.failed_auth_count += 1;
            match error {
                AuthError::NotAuthenticated => self.notify(&error.into()),
                _ => self.reply(&ServerMessage::auth_rejected(error.to_string())),
            }
            if self.failed_auth_count >= config.max_auth_attempts {
                warn!(
                    peer_addr = ?self.peer_addr,
                    attempts = self.failed_auth_count,
                    "Too many authentication attempts"
                );
                self.close_with(close_code::POLICY, "too many authentication attempts");
                return Err(AuthError::TooManyAttempts.into());
            }
        }
    }

    async fn check_credentials(
        &self,
        username: String,
        password: String,
    ) -> Result<String, AuthError> {
        let guard = self.broker.guard();
        let ip = self.peer_addr.ip();
        // Another connection from this address may have tripped the block meanwhile.
        if guard.is_blocked(ip) {
            return Err(AuthError::Blocked);
        }
        let verified = self
            .broker
            .credentials()
            .verify_blocking(username.clone(), password)
            .await;
        if verified {
            guard.record_auth_success(ip);
            return Ok(username);
        }
        warn!(peer_addr = ?self.peer_addr, username = %username, "Invalid credentials");
        match guard.record_auth_failure(ip) {
            FailureOutcome::Blocked { .. } => Err(AuthError::Blocked),
            FailureOutcome::Counted { .. } => Err(AuthError::InvalidCredentials),
        }
    }

    /// Confirm the login and join the live set.
    fn activate(&mut self, username: String) {
        self.reply(&ServerMessage::auth_accepted(format!(
            "Welcome {username}! Clipboard sync active."
        )));
        let total = self.broker.registry().register(ConnectionHandle::new(
            self.id,
            username.clone(),
            self.peer_addr,
            self.outbound.clone(),
            self.cancel.clone(),
        ));
        info!(
            peer_addr = ?self.peer_addr,
            connection_id = %self.id,
            username = %username,
            total,
            "User authenticated"
        );
        self.username = Some(username);
        self.state = ConnectionState::Active;
    }

    async fn relay_loop(&mut self, ws_receiver: &mut SplitStream<WebSocket>) {
        let idle_timeout = self.broker.config().idle_timeout;
        loop {
            let deadline = Instant::now() + idle_timeout;
            let frame = match self.next_event(ws_receiver, deadline).await {
                ReadEvent::Frame(frame) => frame,
                ReadEvent::KeepAlive => continue,
                ReadEvent::TimedOut => {
                    info!(connection_id = %self.id, "Idle timeout");
                    self.close_with(close_code::AWAY, "idle timeout");
                    break;
                }
                ReadEvent::ConnectionClose => {
                    info!(connection_id = %self.id, "Connection closed");
                    break;
                }
                ReadEvent::Cancelled => {
                    debug!(connection_id = %self.id, "Connection cancelled");
                    break;
                }
                ReadEvent::TransportError(e) => {
                    debug!(connection_id = %self.id, "Transport error: {e}");
                    break;
                }
            };
            if self.process_frame(frame).is_break() {
                break;
            }
        }
    }

    /// Size check, decode, then act. Only clipboard updates count against the rate limit.
    fn process_frame(&mut self, frame: Frame) -> ControlFlow<()> {
        let codec = self.broker.codec();
        if let Err(e) = codec.check_size(&frame) {
            return self.protocol_fault(e.into());
        }

        match codec.decode(&frame) {
            Ok(Inbound::Clipboard(message)) => return self.admit_and_relay(message),
            Ok(Inbound::Ping) => self.reply(&ServerMessage::Pong),
            Ok(Inbound::Auth { .. }) => {
                debug!(connection_id = %self.id, "Ignoring repeated authentication");
                self.reply(&ServerMessage::error("already authenticated"));
            }
            Err(e) => return self.protocol_fault(e.into()),
        }
        ControlFlow::Continue(())
    }

    fn admit_and_relay(&mut self, message: ClipboardMessage) -> ControlFlow<()> {
        match self.broker.guard().admit_message(&mut self.window) {
            Admission::Allowed => {
                self.relay(message);
                ControlFlow::Continue(())
            }
            Admission::Rejected { strikes } => {
                warn!(connection_id = %self.id, username = ?self.username, strikes, "Rate limit exceeded");
                self.notify(&self.rate_limit_error(strikes));
                ControlFlow::Continue(())
            }
            Admission::Disconnect { strikes } => {
                warn!(connection_id = %self.id, username = ?self.username, strikes, "Rate limit exceeded repeatedly, disconnecting");
                self.notify(&self.rate_limit_error(strikes));
                self.close_with(close_code::POLICY, "rate limited");
                ControlFlow::Break(())
            }
        }
    }

    fn rate_limit_error(&self, strikes: u32) -> RelayError {
        RelayError::RateLimit {
            limit: self.broker.config().guard.rate_limit_per_minute,
            strikes,
        }
    }

    fn relay(&self, message: ClipboardMessage) {
        let message = message.with_origin(self.id);
        let frame = match self
            .broker
            .codec()
            .encode_clipboard(&message, self.username.as_deref())
        {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection_id = %self.id, "Unable to encode clipboard update: {e}");
                return;
            }
        };
        let report = self
            .broker
            .registry()
            .broadcast(&to_ws_message(frame), self.id);
        info!(
            connection_id = %self.id,
            username = ?self.username,
            kind = ?message.kind(),
            size = message.size_bytes(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Relayed clipboard update"
        );
    }

    fn protocol_fault(&mut self, error: RelayError) -> ControlFlow<()> {
        self.malformed_count += 1;
        warn!(
            connection_id = %self.id,
            username = ?self.username,
            malformed = self.malformed_count,
            "Rejected frame: {error}"
        );
        self.notify(&error);
        if self.malformed_count >= self.broker.config().max_malformed_frames {
            self.close_with(close_code::POLICY, "too many malformed messages");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn notify(&self, error: &RelayError) {
        self.reply(&ServerMessage::error(error.client_reason()));
    }

    fn reply(&self, message: &ServerMessage) {
        match self.broker.codec().encode_server(message) {
            Ok(frame) => self.enqueue(Outbound::Message(to_ws_message(frame))),
            Err(e) => error!(connection_id = %self.id, "Unable to encode reply: {e}"),
        }
    }

    fn close_with(&self, code: u16, reason: &str) {
        self.enqueue(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn enqueue(&self, outbound: Outbound) {
        if let Err(e) = self.outbound.try_send(outbound) {
            debug!(connection_id = %self.id, "Dropping outbound frame: {e}");
        }
    }

    /// Leave the live set. Safe to call whatever state the connection is in.
    fn close(&mut self) {
        debug!(connection_id = %self.id, state = ?self.state, "Closing connection");
        if self.broker.registry().unregister(self.id).is_some() {
            info!(
                connection_id = %self.id,
                username = ?self.username,
                remaining = self.broker.registry().count(),
                "User disconnected"
            );
        }
        self.state = ConnectionState::Closed;
    }
}

pub(crate) fn to_ws_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

/// Drains the outbound queue onto the socket, one bounded write at a time.
///
/// Once `cancel` fires, anything still queued is dropped and only a close frame is attempted.
async fn write_loop<S>(
    mut ws_sender: S,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut finished = false;
    while !cancel.is_cancelled() {
        let outbound = select! {
            biased;
            outbound = outbound_rx.recv() => outbound,
            _ = cancel.cancelled() => break,
        };
        let Some(outbound) = outbound else {
            break;
        };
        let (message, last) = match outbound {
            Outbound::Message(message) => (message, false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        let sent = select! {
            biased;
            _ = cancel.cancelled(), if !last => break,
            sent = timeout(write_timeout, ws_sender.send(message)) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Write failed: {e}");
                finished = true;
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!("Write timed out after {write_timeout:?}");
                finished = true;
                cancel.cancel();
                break;
            }
        }
        if last {
            finished = true;
            break;
        }
    }
    if cancel.is_cancelled() && !finished {
        let close = Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "connection closed by relay".into(),
        }));
        let _ = timeout(write_timeout, ws_sender.send(close)).await;
    }
    let _ = timeout(write_timeout, ws_sender.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::PollSender;

    #[tokio::test]
    async fn test_cancelled_writer_drops_queued_frames() {
        // A peer that takes one frame at a time and then stops reading.
        let (sink_tx, mut sink_rx) = mpsc::channel::<Message>(1);
        let (outbound, outbound_rx) = mpsc::channel(64);
        for i in 0..64 {
            outbound
                .try_send(Outbound::Message(Message::text(format!("frame {i}"))))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            PollSender::new(sink_tx),
            outbound_rx,
            Duration::from_secs(10),
            cancel.clone(),
        ));

        assert_eq!(sink_rx.recv().await, Some(Message::text("frame 0")));
        cancel.cancel();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(message) = sink_rx.recv().await {
                rest.push(message);
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();

        assert!(rest.len() <= 3, "{} frames written after cancel", rest.len());
        assert_eq!(
            rest.last(),
            Some(&Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "connection closed by relay".into(),
            })))
        );
    }

    #[tokio::test]
    async fn test_writer_sends_close_last() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<Message>(8);
        let (outbound, outbound_rx) = mpsc::channel(8);
        outbound
            .try_send(Outbound::Message(Message::text("notice")))
            .unwrap();
        outbound
            .try_send(Outbound::Close {
                code: close_code::POLICY,
                reason: "rate limited".to_string(),
            })
            .unwrap();
        outbound
            .try_send(Outbound::Message(Message::text("never sent")))
            .unwrap();
        write_loop(
            PollSender::new(sink_tx),
            outbound_rx,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(sink_rx.recv().await, Some(Message::text("notice")));
        assert!(matches!(
            sink_rx.recv().await,
            Some(Message::Close(Some(CloseFrame { code: close_code::POLICY, .. })))
        ));
        assert_eq!(sink_rx.recv().await, None);
    }
}
