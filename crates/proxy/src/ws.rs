// Switcheroo - JSON-RPC traffic switch
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WebSocket messengers.
//!
//! Sources arrive as axum upgrades ([`AxumMessenger`]); targets are dialed
//! with tokio-tungstenite ([`TungsteniteMessenger`], [`WsDialer`]). Both are
//! the same [`WsMessenger`] over a different socket type.

use crate::{
    error::{CloseCause, TransportError},
    messenger::{CloseState, Messenger},
    remote::Dialer,
};
use async_trait::async_trait;
use axum::extract::ws as axum_ws;
use futures::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, Stream, StreamExt,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Give up sending a close frame after this long.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Give up dialing a target after this long.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A frame as the messenger cares about it.
#[derive(Debug)]
pub enum Incoming {
    /// Text frame
    Text(String),
    /// Binary frame of the given length
    Binary(usize),
    /// Ping, pong and raw frames, handled by the socket itself
    Control,
    /// Close frame
    Close,
}

/// Frame type of a WebSocket implementation.
pub trait WsFrame: Send + Sized + 'static {
    /// A text frame
    fn text(text: String) -> Self;
    /// Classify a received frame
    fn into_incoming(self) -> Incoming;
}

impl WsFrame for axum_ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn into_incoming(self) -> Incoming {
        match self {
            Self::Text(text) => Incoming::Text(text.as_str().to_owned()),
            Self::Binary(data) => Incoming::Binary(data.len()),
            Self::Ping(_) | Self::Pong(_) => Incoming::Control,
            Self::Close(_) => Incoming::Close,
        }
    }
}

impl WsFrame for tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn into_incoming(self) -> Incoming {
        match self {
            Self::Text(text) => Incoming::Text(text.as_str().to_owned()),
            Self::Binary(data) => Incoming::Binary(data.len()),
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Incoming::Control,
            Self::Close(_) => Incoming::Close,
        }
    }
}

/// A WebSocket implementation a [`WsMessenger`] can drive.
pub trait WsSocket: Send + Unpin + Sized + 'static {
    /// Frame type
    type Frame: WsFrame;
    /// Error type of both halves
    type Error: fmt::Display + Send;
}

impl WsSocket for axum_ws::WebSocket {
    type Frame = axum_ws::Message;
    type Error = axum::Error;
}

impl<T> WsSocket for WebSocketStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Frame = tungstenite::Message;
    type Error = tungstenite::Error;
}

/// A source connection accepted by the HTTP surface.
pub type AxumMessenger = WsMessenger<axum_ws::WebSocket>;

/// A dialed target connection.
pub type TungsteniteMessenger = WsMessenger<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// [`Messenger`] over a split WebSocket.
pub struct WsMessenger<S: WsSocket> {
    peer: String,
    sink: Mutex<SplitSink<S, S::Frame>>,
    stream: Mutex<SplitStream<S>>,
    state: CloseState,
    close_sent: AtomicBool,
}

impl<S: WsSocket> fmt::Debug for WsMessenger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsMessenger")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S> WsMessenger<S>
where
    S: WsSocket
        + Stream<Item = Result<<S as WsSocket>::Frame, <S as WsSocket>::Error>>
        + Sink<<S as WsSocket>::Frame, Error = <S as WsSocket>::Error>,
{
    /// Take over an established socket
    pub fn new(socket: S, peer: impl Into<String>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            peer: peer.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            state: CloseState::new(),
            close_sent: AtomicBool::new(false),
        }
    }

    fn broken(&self, error: impl fmt::Display) -> TransportError {
        let reason = error.to_string();
        self.state.close(CloseCause::Transport(reason.clone()));
        TransportError::Broken(reason)
    }

    async fn next_frame(&self) -> Result<String, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(frame)) => match frame.into_incoming() {
                    Incoming::Text(text) => return Ok(text),
                    Incoming::Binary(len) => {
                        let reason = format!("binary frame of {len} bytes");
                        return Err(TransportError::Unexpected(reason));
                    }
                    Incoming::Control => trace!(peer = %self.peer, "control frame"),
                    Incoming::Close => {
                        self.state.close(CloseCause::RemoteClosed);
                        return Err(self.state.closed_error());
                    }
                },
                Some(Err(e)) => return Err(self.broken(e)),
                None => {
                    self.state.close(CloseCause::RemoteClosed);
                    return Err(self.state.closed_error());
                }
            }
        }
    }
}

#[async_trait]
impl<S> Messenger for WsMessenger<S>
where
    S: WsSocket
        + Stream<Item = Result<<S as WsSocket>::Frame, <S as WsSocket>::Error>>
        + Sink<<S as WsSocket>::Frame, Error = <S as WsSocket>::Error>,
{
    async fn read(&self) -> Result<String, TransportError> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        let signal = self.state.signal();
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(self.state.closed_error()),
            frame = self.next_frame() => frame,
        }
    }

    async fn write(&self, frame: String) -> Result<(), TransportError> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        let signal = self.state.signal();
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(<S as WsSocket>::Frame::text(frame)).await
        };
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(self.state.closed_error()),
            sent = send => sent.map_err(|e| self.broken(e)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.close(CloseCause::Closed);
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // a peer that already hung up does not need a close frame
        if matches!(self.state.cause(), Some(CloseCause::RemoteClosed | CloseCause::Transport(_))) {
            return Ok(());
        }
        // closing the sink sends the close frame
        let send = async { self.sink.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, send).await {
            Ok(Ok(())) => {
                debug!(peer = %self.peer, "sent close frame");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Broken(e.to_string())),
            Err(_) => Err(TransportError::Broken(format!(
                "timed out sending close frame to {}",
                self.peer
            ))),
        }
    }

    fn close_with_cause(&self, cause: CloseCause) {
        self.state.close(cause);
    }

    fn err(&self) -> Option<CloseCause> {
        self.state.cause()
    }

    fn close_signal(&self) -> CancellationToken {
        self.state.signal()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Dials targets over plain WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Messenger>, TransportError> {
        let failed =
            |reason: String| TransportError::Dial { endpoint: endpoint.to_string(), reason };
        let connect = tokio_tungstenite::connect_async(endpoint);
        let (socket, response) = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| failed(format!("no answer within {}s", DIAL_TIMEOUT.as_secs())))?
            .map_err(|e| failed(e.to_string()))?;
        debug!(endpoint, status = %response.status(), "dialed target");
        Ok(Arc::new(TungsteniteMessenger::new(socket, endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type Accepted = tokio::task::JoinHandle<WebSocketStream<tokio::net::TcpStream>>;

    async fn upstream() -> (String, Accepted) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });
        (format!("ws://{addr}"), accept)
    }

    #[tokio::test]
    async fn test_text_frames_both_ways() {
        let (endpoint, accept) = upstream().await;
        let client = WsDialer.dial(&endpoint).await.unwrap();
        let server = WsMessenger::new(accept.await.unwrap(), "client");

        client.write(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.into()).await.unwrap();
        assert!(server.read().await.unwrap().contains("ping"));

        server.write("pong".into()).await.unwrap();
        assert_eq!(client.read().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_binary_frames_are_not_fatal() {
        let (endpoint, accept) = upstream().await;
        let client = WsDialer.dial(&endpoint).await.unwrap();
        let mut server = accept.await.unwrap();

        server.send(tungstenite::Message::Binary(vec![1, 2, 3].into())).await.unwrap();
        server.send(tungstenite::Message::Text("after".to_string().into())).await.unwrap();

        let err = client.read().await.unwrap_err();
        assert!(!err.is_fatal(), "{err}");
        assert_eq!(client.read().await.unwrap(), "after");
        assert_eq!(client.err(), None);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() {
        let (endpoint, accept) = upstream().await;
        let client = WsDialer.dial(&endpoint).await.unwrap();
        let server = WsMessenger::new(accept.await.unwrap(), "client");

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.err(), Some(CloseCause::Closed));

        assert!(server.read().await.unwrap_err().is_fatal());
        assert_eq!(server.err(), Some(CloseCause::RemoteClosed));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = WsDialer.dial(&format!("ws://{addr}")).await.unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }), "{err}");
    }
}
