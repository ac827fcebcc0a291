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

//! In-process messengers.
//!
//! [`MemoryMessenger::pair`] gives two connected ends, and [`MemoryDialer`]
//! hands one end to a registered listener on every dial. Together they let a
//! session run without any socket.

use crate::{
    error::{CloseCause, TransportError},
    messenger::{CloseState, Messenger},
    remote::Dialer,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const FRAME_BUFFER: usize = 100;

/// One end of an in-memory duplex link.
#[derive(Debug)]
pub struct MemoryMessenger {
    name: String,
    inbox: Mutex<mpsc::Receiver<String>>,
    outbox: mpsc::Sender<String>,
    state: Arc<CloseState>,
    peer: Arc<CloseState>,
}

impl MemoryMessenger {
    /// Two connected ends. Frames written to one are read from the other;
    /// closing one makes the other report [`CloseCause::RemoteClosed`] once it
    /// has read everything already sent.
    pub fn pair(name: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(FRAME_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(FRAME_BUFFER);
        let a_state = Arc::new(CloseState::new());
        let b_state = Arc::new(CloseState::new());
        let a = Self {
            name: format!("{name}/a"),
            inbox: Mutex::new(a_rx),
            outbox: b_tx,
            state: a_state.clone(),
            peer: b_state.clone(),
        };
        let b = Self {
            name: format!("{name}/b"),
            inbox: Mutex::new(b_rx),
            outbox: a_tx,
            state: b_state,
            peer: a_state,
        };
        (a, b)
    }

    fn remote_closed(&self) -> TransportError {
        self.state.close(CloseCause::RemoteClosed);
        self.state.closed_error()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn read(&self) -> Result<String, TransportError> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        let mut inbox = self.inbox.lock().await;
        let signal = self.state.signal();
        let peer = self.peer.signal();
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(self.state.closed_error()),
            frame = inbox.recv() => frame.ok_or_else(|| self.remote_closed()),
            _ = peer.cancelled() => inbox.try_recv().map_err(|_| self.remote_closed()),
        }
    }

    async fn write(&self, frame: String) -> Result<(), TransportError> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        if self.peer.is_closed() {
            return Err(self.remote_closed());
        }
        let signal = self.state.signal();
        let peer = self.peer.signal();
        tokio::select! {
            sent = self.outbox.send(frame) => sent.map_err(|_| self.remote_closed()),
            _ = signal.cancelled() => Err(self.state.closed_error()),
            _ = peer.cancelled() => Err(self.remote_closed()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.close(CloseCause::Closed);
        Ok(())
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
        format!("memory:{}", self.name)
    }
}

/// Dials registered in-memory endpoints.
#[derive(Debug, Default)]
pub struct MemoryDialer {
    listeners: DashMap<String, mpsc::UnboundedSender<MemoryMessenger>>,
    dials: AtomicUsize,
}

impl MemoryDialer {
    /// A dialer with no endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept dials to `endpoint`; every dial yields the far end of a new pair.
    pub fn listen(&self, endpoint: &str) -> mpsc::UnboundedReceiver<MemoryMessenger> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(endpoint.to_string(), tx);
        rx
    }

    /// Stop accepting dials to `endpoint`
    pub fn unlisten(&self, endpoint: &str) {
        self.listeners.remove(endpoint);
    }

    /// Number of dial attempts so far, failed ones included
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Messenger>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let unavailable = |reason: &str| TransportError::Dial {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        let listener = self
            .listeners
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| unavailable("connection refused"))?;

        let (near, far) = MemoryMessenger::pair(endpoint);
        listener.send(far).map_err(|_| unavailable("listener gone"))?;
        Ok(Arc::new(near))
    }
}
