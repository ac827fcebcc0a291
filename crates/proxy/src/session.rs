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

//! Sessions: one source connection switched to its target.
//!
//! Opening a session wires four pieces together: the source connection loops,
//! the path for traffic read from the source, the path for traffic read from
//! the target, and the target link. All of them stop when the session's
//! cancellation token fires.

use crate::{
    config::{SourceConfig, TargetConfig},
    connection::{enqueue, Connection, QUEUE_CAPACITY},
    direction::Side,
    envelope::{Envelope, SessionId},
    error::{CloseCause, RouteError, TransportError},
    messenger::Messenger,
    pipeline::{spawn_path, Chains, PathEnds},
    remote::{Dialer, RemoteLink},
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything needed to open a session.
pub struct SessionSetup<'a> {
    /// Session id
    pub id: SessionId,
    /// Source name
    pub source_name: &'a str,
    /// Source configuration
    pub source: &'a SourceConfig,
    /// Target name
    pub target_name: &'a str,
    /// Target configuration
    pub target: &'a TargetConfig,
    /// Dials the target
    pub dialer: Arc<dyn Dialer>,
    /// Idle time before a target link without keep-alive is closed
    pub idle_timeout: Duration,
}

/// A live source connection and everything running on its behalf.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    source: String,
    target: String,
    cancel: CancellationToken,
    chains: Arc<Chains>,
    messenger: Arc<dyn Messenger>,
    source_in: mpsc::Sender<Envelope>,
    target_in: mpsc::Sender<Envelope>,
    source_conn: Mutex<Option<Connection>>,
    link: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start the session over `messenger`, the accepted source connection.
    pub fn open(setup: SessionSetup<'_>, messenger: Arc<dyn Messenger>) -> Arc<Self> {
        let SessionSetup { id, source_name, source, target_name, target, dialer, idle_timeout } =
            setup;
        let cancel = CancellationToken::new();
        let chains = Arc::new(Chains::new(id, &source.effects, &target.effects));

        let (source_in, source_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (target_in, target_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (to_target, target_outbox) = mpsc::channel(QUEUE_CAPACITY);

        let source_conn = Connection::spawn(
            format!("source {source_name}"),
            id,
            Side::Source,
            messenger.clone(),
            source_in.clone(),
            cancel.clone(),
        );
        let to_source = source_conn.outbound();

        spawn_path(
            chains.clone(),
            Side::Source,
            source_rx,
            PathEnds { output: to_target.clone(), replies: to_source.clone() },
            cancel.clone(),
        );
        spawn_path(
            chains.clone(),
            Side::Target,
            target_rx,
            PathEnds { output: to_source, replies: to_target },
            cancel.clone(),
        );
        let link = RemoteLink::new(target_name, id, target, dialer)
            .with_idle_timeout(idle_timeout)
            .spawn(target_outbox, target_in.clone(), cancel.clone());

        info!(session = id, source = source_name, target = target_name, "session opened");
        Arc::new(Self {
            id,
            source: source_name.to_string(),
            target: target_name.to_string(),
            cancel,
            chains,
            messenger,
            source_in,
            target_in,
            source_conn: Mutex::new(Some(source_conn)),
            link: Mutex::new(Some(link)),
        })
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Name of the source this session serves
    pub fn source_name(&self) -> &str {
        &self.source
    }

    /// Name of the target this session is switched to
    pub fn target_name(&self) -> &str {
        &self.target
    }

    /// Runtime effect state of the session
    pub fn chains(&self) -> &Arc<Chains> {
        &self.chains
    }

    /// Why the source connection closed
    pub fn err(&self) -> Option<CloseCause> {
        self.messenger.err()
    }

    /// Whether the session has been closed or its source has gone
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.messenger.err().is_some()
    }

    /// Resolves once the source connection closes or the session is closed
    pub async fn closed(&self) {
        let signal = self.messenger.close_signal();
        tokio::select! {
            _ = signal.cancelled() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Feed `envelope` into the path for its origin side, as if it had been
    /// read from that side's connection.
    pub async fn inject(&self, envelope: Envelope) -> Result<(), RouteError> {
        if self.is_closed() {
            return Err(RouteError::SessionClosed(self.id));
        }
        let queue = match envelope.origin {
            Side::Source => &self.source_in,
            Side::Target => &self.target_in,
        };
        if enqueue(queue, envelope, &self.cancel).await {
            Ok(())
        } else {
            Err(RouteError::SessionClosed(self.id))
        }
    }

    /// Stop everything, send the source a close frame and hand back every
    /// token the session held. Safe to call repeatedly and concurrently; only
    /// the first call reports a close failure.
    pub async fn close(&self, cause: CloseCause) -> Result<(), TransportError> {
        self.cancel.cancel();
        let conn = self.source_conn.lock().take();
        let Some(conn) = conn else { return Ok(()) };

        let result = conn.close(cause).await;
        let link = self.link.lock().take();
        if let Some(link) = link {
            if let Err(e) = link.await {
                warn!(session = self.id, error = %e, "target link did not finish cleanly");
            }
        }
        let released = self.chains.release_session();
        debug!(session = self.id, released, "session resources released");
        info!(
            session = self.id,
            source = %self.source,
            cause = ?self.messenger.err(),
            "session closed"
        );
        result
    }
}
