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

//! The transport seam.
//!
//! Connection loops only talk to a [`Messenger`]: text frames in, text frames
//! out, and a close signal. WebSocket connections on both sides implement it,
//! and so does the in-memory pair used in tests.

use crate::error::{CloseCause, TransportError};
use async_trait::async_trait;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A duplex text-frame transport.
///
/// `read` is only called by one task and `write` by one other task, but both
/// may run concurrently with each other and with any of the close methods.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Next text frame. Fatal errors (see [`TransportError::is_fatal`]) mean
    /// the messenger is closed and [`Messenger::err`] reports why.
    async fn read(&self) -> Result<String, TransportError>;

    /// Send one text frame
    async fn write(&self, frame: String) -> Result<(), TransportError>;

    /// Send a close frame and close. Idempotent; only the first call does any work.
    async fn close(&self) -> Result<(), TransportError>;

    /// Mark the messenger closed with `cause` and wake everyone waiting on it.
    /// Idempotent; the first cause sticks.
    fn close_with_cause(&self, cause: CloseCause);

    /// Why the messenger closed, `None` while it is open
    fn err(&self) -> Option<CloseCause>;

    /// Fires once the messenger is closed
    fn close_signal(&self) -> CancellationToken;

    /// Peer description for logs
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

impl std::fmt::Debug for dyn Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Messenger({})", self.peer())
    }
}

/// Close bookkeeping shared by messenger implementations.
#[derive(Debug, Default)]
pub struct CloseState {
    signal: CancellationToken,
    cause: OnceLock<CloseCause>,
}

impl CloseState {
    /// An open state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cause` and fire the signal. Returns `true` for the first close only.
    pub fn close(&self, cause: CloseCause) -> bool {
        let first = self.cause.set(cause.clone()).is_ok();
        if first {
            debug!(%cause, "messenger closed");
        }
        self.signal.cancel();
        first
    }

    /// The first recorded cause
    pub fn cause(&self) -> Option<CloseCause> {
        self.cause.get().cloned()
    }

    /// Whether a cause has been recorded
    pub fn is_closed(&self) -> bool {
        self.cause.get().is_some()
    }

    /// Token fired on close
    pub fn signal(&self) -> CancellationToken {
        self.signal.clone()
    }

    /// `Closed` with the recorded cause
    pub fn closed_error(&self) -> TransportError {
        TransportError::Closed(self.cause().unwrap_or(CloseCause::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_cause_sticks() {
        let state = Arc::new(CloseState::new());
        assert!(!state.is_closed());

        let mut handles = Vec::new();
        for i in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.close(CloseCause::Transport(format!("failure {i}")))
            }));
        }
        let mut firsts = 0;
        for handle in handles {
            firsts += usize::from(handle.await.unwrap());
        }
        assert_eq!(firsts, 1);

        let cause = state.cause().unwrap();
        assert!(!state.close(CloseCause::Shutdown));
        assert_eq!(state.cause(), Some(cause));
        assert!(state.signal().is_cancelled());
    }
}
