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

//! Links to targets.
//!
//! A session owns one link task. The task takes envelopes bound for the target
//! and writes them to the current target connection, dialing it first when
//! there is none. Keep-alive links dial as soon as the session opens; other
//! links are closed after [`DEFAULT_IDLE_TIMEOUT`] without traffic and redialed
//! on the next message.
//!
//! When the target cannot be reached, requests are answered with an internal
//! error that travels back through the pipeline like a real response. The same
//! happens to requests still in flight when the target connection goes away,
//! and a link is never closed for idleness while a request is in flight.

use crate::{
    config::TargetConfig,
    connection::{enqueue, Connection, QUEUE_CAPACITY},
    direction::{MessageKind, Side},
    envelope::{Envelope, SessionId, TokenKey},
    error::{CloseCause, TransportError},
    message::{error_codes, RpcError, RpcResponse},
    messenger::Messenger,
};
use async_trait::async_trait;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Idle time after which a link without keep-alive is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens connections to targets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `endpoint`
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Messenger>, TransportError>;
}

impl std::fmt::Debug for dyn Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dialer")
    }
}

/// Settings of one target link.
#[derive(Clone)]
pub struct RemoteLink {
    /// Target name
    pub name: String,
    /// Session the link belongs to
    pub session: SessionId,
    /// Endpoint to dial
    pub endpoint: String,
    /// Dial up front and stay connected while idle
    pub keep_alive: bool,
    /// Idle time before a link without keep-alive is closed
    pub idle_timeout: Duration,
    /// Dials the endpoint
    pub dialer: Arc<dyn Dialer>,
}

impl std::fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLink")
            .field("name", &self.name)
            .field("session", &self.session)
            .field("endpoint", &self.endpoint)
            .field("keep_alive", &self.keep_alive)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl RemoteLink {
    /// Link settings for `target`
    pub fn new(
        name: &str,
        session: SessionId,
        target: &TargetConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            name: name.to_string(),
            session,
            endpoint: target.endpoint.clone(),
            keep_alive: target.keep_alive,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dialer,
        }
    }

    /// Override the idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Spawn the link task.
    ///
    /// Envelopes sent to `outbox` go to the target; everything the target
    /// sends, and the errors standing in for answers it could not give, go
    /// to `inbound`. The task ends when `cancel` fires or `outbox` closes.
    pub fn spawn(
        self,
        outbox: mpsc::Receiver<Envelope>,
        inbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("target", name = %self.name, session = self.session);
        let (from_target, from_target_rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = LinkTask {
            link: self,
            inbound,
            from_target,
            cancel,
            current: None,
            in_flight: HashMap::new(),
        };
        tokio::spawn(task.run(outbox, from_target_rx).instrument(span))
    }
}

struct LinkTask {
    link: RemoteLink,
    inbound: mpsc::Sender<Envelope>,
    // the current connection reads into this, so the link sees every response
    from_target: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    current: Option<Connection>,
    // requests written to the current connection and not yet answered
    in_flight: HashMap<TokenKey, Envelope>,
}

impl LinkTask {
    async fn run(
        mut self,
        mut outbox: mpsc::Receiver<Envelope>,
        mut from_target: mpsc::Receiver<Envelope>,
    ) {
        if self.link.keep_alive {
            if let Err(e) = self.connect().await {
                warn!(error = %e, "keep-alive dial failed, will retry on the next message");
            }
        }

        loop {
            let busy = !self.in_flight.is_empty();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = from_target.recv() => {
                    if let Some(envelope) = envelope {
                        self.relay(envelope).await;
                    }
                }
                envelope = outbox.recv() => match envelope {
                    Some(envelope) => self.deliver(envelope, &mut from_target).await,
                    None => break,
                },
                _ = Self::connection_closed(self.current.as_ref()) => {
                    if let Some(conn) = self.current.take() {
                        info!(cause = ?conn.err(), "target connection closed");
                        self.hang_up(conn, CloseCause::RemoteClosed, &mut from_target).await;
                    }
                }
                _ = Self::idle_deadline(self.current.as_ref(), &self.link, busy) => {
                    if let Some(conn) = self.current.take() {
                        info!(idle = ?conn.idle_for(), "closing idle target connection");
                        self.hang_up(conn, CloseCause::Closed, &mut from_target).await;
                    }
                }
            }
        }

        if let Some(conn) = self.current.take() {
            self.disconnect(conn, CloseCause::Shutdown).await;
        }
        debug!(abandoned = self.in_flight.len(), "target link stopped");
    }

    async fn connection_closed(current: Option<&Connection>) {
        match current {
            Some(conn) => conn.closed().await,
            None => std::future::pending().await,
        }
    }

    /// Resolves once the current connection has been idle long enough to close.
    /// A connection with unanswered requests is never idle.
    async fn idle_deadline(current: Option<&Connection>, link: &RemoteLink, busy: bool) {
        let Some(conn) = current.filter(|_| !link.keep_alive && !busy) else {
            return std::future::pending().await;
        };
        loop {
            let idle = conn.idle_for();
            if idle >= link.idle_timeout {
                return;
            }
            tokio::time::sleep(link.idle_timeout - idle).await;
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let link = &self.link;
        let messenger = link.dialer.dial(&link.endpoint).await?;
        info!(endpoint = %link.endpoint, "connected to target");
        let conn = Connection::spawn(
            format!("target {}", link.name),
            link.session,
            Side::Target,
            messenger,
            self.from_target.clone(),
            self.cancel.clone(),
        );
        self.current = Some(conn);
        Ok(())
    }

    async fn disconnect(&self, conn: Connection, cause: CloseCause) {
        if let Err(e) = conn.close(cause).await {
            debug!(error = %e, "closing target connection");
        }
    }

    /// Close `conn` and answer every request it left unanswered.
    async fn hang_up(
        &mut self,
        conn: Connection,
        cause: CloseCause,
        from_target: &mut mpsc::Receiver<Envelope>,
    ) {
        let error = TransportError::Closed(conn.err().unwrap_or_else(|| cause.clone()));
        self.disconnect(conn, cause).await;
        // responses read before the close still count
        while let Ok(envelope) = from_target.try_recv() {
            self.relay(envelope).await;
        }
        if self.in_flight.is_empty() {
            return;
        }
        warn!(unanswered = self.in_flight.len(), "target connection lost with requests in flight");
        for (_, request) in std::mem::take(&mut self.in_flight) {
            self.unavailable(request, &error).await;
        }
    }

    /// Pass on what the target sent, settling the request a response answers.
    async fn relay(&mut self, envelope: Envelope) {
        if envelope.kind() == MessageKind::Response {
            if let Some(key) = envelope.token_key() {
                self.in_flight.remove(&key);
            }
        }
        enqueue(&self.inbound, envelope, &self.cancel).await;
    }

    async fn deliver(&mut self, envelope: Envelope, from_target: &mut mpsc::Receiver<Envelope>) {
        if self.current.as_ref().is_some_and(Connection::is_closed) {
            if let Some(conn) = self.current.take() {
                self.hang_up(conn, CloseCause::RemoteClosed, from_target).await;
            }
        }
        if self.current.is_none() {
            if let Err(e) = self.connect().await {
                warn!(error = %e, "target unavailable");
                self.unavailable(envelope, &e).await;
                return;
            }
        }
        let Some(conn) = self.current.as_ref() else { return };
        let awaited = match (envelope.kind(), envelope.token_key()) {
            (MessageKind::Request, Some(key)) => Some((key, envelope.clone())),
            _ => None,
        };
        match conn.send(envelope).await {
            Ok(()) => {
                if let Some((key, request)) = awaited {
                    self.in_flight.insert(key, request);
                }
            }
            Err(envelope) => {
                let error = TransportError::Closed(conn.err().unwrap_or(CloseCause::Closed));
                self.unavailable(envelope, &error).await;
            }
        }
    }

    /// Answer a request the target will never see.
    async fn unavailable(&self, envelope: Envelope, error: &TransportError) {
        let id = match (envelope.kind(), envelope.message.id()) {
            (MessageKind::Request, Some(id)) => id.clone(),
            _ => {
                warn!(
                    kind = ?envelope.kind(),
                    id = ?envelope.message.id(),
                    "dropping message for unavailable target"
                );
                return;
            }
        };
        let reply = envelope.reply(RpcResponse::failure(
            Some(id),
            RpcError {
                code: error_codes::INTERNAL_ERROR,
                message: "target unavailable".to_string(),
                data: Some(json!(error.to_string())),
            },
        ));
        enqueue(&self.inbound, reply, &self.cancel).await;
    }
}
