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

#![allow(dead_code)]

use clipsync_common::{ClipboardMessage, Frame, MessageCodec, ServerEvent, ServerMessage};
use clipsync_relay::host::{
    CredentialSource, CredentialStore, HashingParams, Listener, RelayConfig, SyncBroker,
};
use eyre::eyre;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

pub const USERS: &[(&str, &str)] = &[
    ("alice", "wonderland"),
    ("bob", "builder"),
    ("carol", "caroling"),
    ("dave", "diving"),
];

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A relay running in-process on an ephemeral localhost port.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub broker: SyncBroker,
    server: JoinHandle<eyre::Result<()>>,
}

impl TestRelay {
    pub async fn start(config: RelayConfig) -> eyre::Result<Self> {
        let pairs = USERS
            .iter()
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .collect();
        let credentials = CredentialStore::load(
            &[CredentialSource::Static(pairs)],
            HashingParams::new(1024, 1),
        )?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let broker = SyncBroker::new(config, Arc::new(credentials));
        let server = tokio::spawn(Listener::serve(listener, broker.clone()));
        Ok(Self {
            addr,
            broker,
            server,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> Result<Client, tungstenite::Error> {
        Client::connect(&self.url()).await
    }

    pub async fn login(&self, username: &str, password: &str) -> eyre::Result<Client> {
        let mut client = self.connect().await?;
        client.auth(username, password).await?;
        match client.recv_reply().await? {
            ServerMessage::AuthResult { success: true, .. } => Ok(client),
            other => Err(eyre!("login as {username} failed: {other:?}")),
        }
    }

    /// Log in as the first `n` test users.
    pub async fn login_all(&self, n: usize) -> eyre::Result<Vec<Client>> {
        let mut clients = Vec::with_capacity(n);
        for (username, password) in USERS.iter().take(n) {
            clients.push(self.login(username, password).await?);
        }
        self.wait_for_connections(n).await?;
        Ok(clients)
    }

    pub async fn wait_for_connections(&self, n: usize) -> eyre::Result<()> {
        let start = Instant::now();
        loop {
            let count = self.broker.registry().count();
            if count == n {
                return Ok(());
            }
            if start.elapsed() > RECV_TIMEOUT {
                return Err(eyre!("expected {n} live connections, still have {count}"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Plain HTTP GET, returning the raw response.
    pub async fn http_get(&self, path: &str) -> eyre::Result<String> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream
            .write_all(
                format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr)
                    .as_bytes(),
            )
            .await?;
        let mut response = String::new();
        tokio::time::timeout(RECV_TIMEOUT, stream.read_to_string(&mut response)).await??;
        Ok(response)
    }

    pub async fn stop(self) -> eyre::Result<()> {
        self.broker.shutdown();
        self.server.await??;
        Ok(())
    }
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: MessageCodec,
}

impl Client {
    pub async fn connect(url: &str) -> Result<Self, tungstenite::Error> {
        let (ws, _response) = connect_async(url).await?;
        Ok(Self {
            ws,
            codec: MessageCodec::default(),
        })
    }

    pub async fn send_frame(&mut self, frame: Frame) -> eyre::Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, value: serde_json::Value) -> eyre::Result<()> {
        self.send_frame(Frame::Text(value.to_string())).await
    }

    pub async fn auth(&mut self, username: &str, password: &str) -> eyre::Result<()> {
        self.send_json(json!({"type": "auth", "username": username, "password": password}))
            .await
    }

    pub async fn send_text(&mut self, text: &str) -> eyre::Result<()> {
        self.send_json(json!({"type": "clipboard", "kind": "text", "data": text}))
            .await
    }

    /// The next event from the relay, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> eyre::Result<Option<ServerEvent>> {
        loop {
            let next = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| eyre!("timed out waiting for the relay"))?;
            let frame = match next {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_string()),
                Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
                Some(Ok(_)) => continue,
            };
            eprintln!("<< {frame:?}");
            return Ok(Some(self.codec.decode_server(&frame)?));
        }
    }

    pub async fn recv_reply(&mut self) -> eyre::Result<ServerMessage> {
        match self.recv().await? {
            Some(ServerEvent::Reply(reply)) => Ok(reply),
            other => Err(eyre!("expected a reply, got {other:?}")),
        }
    }

    /// The reason of the next `error` notice.
    pub async fn recv_error(&mut self) -> eyre::Result<String> {
        match self.recv_reply().await? {
            ServerMessage::Error { reason } => Ok(reason),
            other => Err(eyre!("expected an error notice, got {other:?}")),
        }
    }

    pub async fn recv_clipboard(&mut self) -> eyre::Result<(ClipboardMessage, Option<String>)> {
        match self.recv().await? {
            Some(ServerEvent::Clipboard { message, from }) => Ok((message, from)),
            other => Err(eyre!("expected a clipboard update, got {other:?}")),
        }
    }

    pub async fn expect_closed(&mut self) -> eyre::Result<()> {
        match self.recv().await? {
            None => Ok(()),
            Some(event) => Err(eyre!("expected the relay to close, got {event:?}")),
        }
    }

    /// Fails if anything at all arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) -> eyre::Result<()> {
        match tokio::time::timeout(wait, self.ws.next()).await {
            Err(_) => Ok(()),
            Ok(other) => Err(eyre!("expected silence, got {other:?}")),
        }
    }

    pub async fn close(mut self) -> eyre::Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    /// Drop the TCP connection without a WebSocket close handshake.
    pub fn drop_socket(self) {
        drop(self.ws);
    }
}

/// The HTTP status of a refused WebSocket handshake.
pub fn rejected_status(result: Result<Client, tungstenite::Error>) -> eyre::Result<u16> {
    match result {
        Err(tungstenite::Error::Http(response)) => Ok(response.status().as_u16()),
        Err(e) => Err(eyre!("expected an HTTP rejection, got {e}")),
        Ok(_) => Err(eyre!("expected an HTTP rejection, but the handshake succeeded")),
    }
}
