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

//! Concurrency limiting of in-flight requests.
//!
//! A request takes a token before it is forwarded and holds it, keyed by
//! (session, requester side, id), until the response with that id passes the
//! same effect. Tokens are also handed back when the request or its response
//! is dropped or answered early, and when the session closes.

use super::Outcome;
use crate::{
    direction::MessageKind,
    envelope::{Envelope, SessionId, TokenKey},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Caps the number of requests awaiting a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelEffect {
    /// Number of requests that may be open at any time.
    /// 0 blocks all requests, 1 makes the RPC synchronous.
    pub max: u32,
}

impl ParallelEffect {
    /// A pool with all tokens available
    pub fn pool(&self) -> TokenPool {
        TokenPool::new(self.max as usize)
    }
}

/// Runtime state of one [`ParallelEffect`].
#[derive(Debug)]
pub struct TokenPool {
    max: usize,
    semaphore: Arc<Semaphore>,
    held: Mutex<HashMap<TokenKey, OwnedSemaphorePermit>>,
}

impl TokenPool {
    /// A pool of `max` tokens
    pub fn new(max: usize) -> Self {
        Self { max, semaphore: Arc::new(Semaphore::new(max)), held: Mutex::new(HashMap::new()) }
    }

    /// Wait for a token and hold it for `key`. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, key: TokenKey, cancel: &CancellationToken) -> bool {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => return false,
        };
        // the semaphore is never closed
        let Ok(permit) = permit else { return false };
        // a reused id replaces the old entry, handing its token back
        self.held.lock().insert(key, permit);
        true
    }

    /// Hand back the token held for `key`, if any
    pub fn release(&self, key: &TokenKey) -> bool {
        self.held.lock().remove(key).is_some()
    }

    /// Hand back every token held by `session`; returns how many
    pub fn release_session(&self, session: SessionId) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|key, _| key.session != session);
        before - held.len()
    }

    /// Tokens currently held
    pub fn in_flight(&self) -> usize {
        self.held.lock().len()
    }

    /// Tokens currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Pool size
    pub fn max(&self) -> usize {
        self.max
    }

    /// Give back the token of a response's request; other messages are left alone.
    pub(super) fn settle(&self, envelope: &Envelope) {
        if envelope.kind() != MessageKind::Response {
            return;
        }
        if let Some(key) = envelope.token_key() {
            if self.release(&key) {
                trace!(session = envelope.session, id = %key.id, "parallel token returned");
            }
        }
    }

    pub(super) async fn apply(&self, envelope: Envelope) -> Outcome {
        match (envelope.kind(), envelope.token_key()) {
            (MessageKind::Request, Some(key)) => {
                if self.acquire(key, &envelope.cancel).await {
                    Outcome::Forward(envelope)
                } else {
                    Outcome::Cancelled(envelope)
                }
            }
            // notifications are never answered, so they hold nothing
            (MessageKind::Request, None) => Outcome::Forward(envelope),
            (MessageKind::Response, _) => {
                self.settle(&envelope);
                Outcome::Forward(envelope)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        direction::Side,
        message::{RpcId, RpcRequest, RpcResponse},
    };
    use serde_json::json;
    use std::time::Duration;

    fn request(session: SessionId, id: i64, cancel: &CancellationToken) -> Envelope {
        let message = RpcRequest::new(id, "eth_call", None).into();
        Envelope::new(message, session, Side::Source, cancel.clone())
    }

    fn response(session: SessionId, id: i64) -> Envelope {
        Envelope::new(
            RpcResponse::success(Some(RpcId::from(id)), json!("0x")).into(),
            session,
            Side::Target,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_max_one_serializes_requests() {
        let pool = Arc::new(TokenPool::new(1));
        let cancel = CancellationToken::new();

        assert!(matches!(pool.apply(request(1, 1, &cancel)).await, Outcome::Forward(_)));
        assert_eq!(pool.in_flight(), 1);

        let second = {
            let pool = pool.clone();
            let req = request(1, 2, &cancel);
            tokio::spawn(async move { pool.apply(req).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second request must wait for the first response");

        // an unrelated response changes nothing
        assert!(matches!(pool.apply(response(1, 99)).await, Outcome::Forward(_)));
        assert!(!second.is_finished());

        assert!(matches!(pool.apply(response(1, 1)).await, Outcome::Forward(_)));
        let outcome = tokio::time::timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Forward(_)));
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_max_zero_blocks_until_cancelled() {
        let pool = TokenPool::new(0);
        let cancel = CancellationToken::new();
        let req = request(1, 1, &cancel);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        assert!(matches!(pool.apply(req).await, Outcome::Cancelled(_)));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_does_not_starve_later_sessions() {
        let pool = TokenPool::new(1);
        let first = CancellationToken::new();
        assert!(pool.acquire(request(1, 7, &first).token_key().unwrap(), &first).await);
        assert_eq!(pool.available(), 0);

        // session 1 closes without ever seeing its response
        first.cancel();
        assert_eq!(pool.release_session(1), 1);
        assert_eq!(pool.available(), 1);

        let second = CancellationToken::new();
        let req = request(2, 7, &second);
        let outcome = tokio::time::timeout(Duration::from_secs(1), pool.apply(req)).await.unwrap();
        assert!(matches!(outcome, Outcome::Forward(_)));
    }

    #[tokio::test]
    async fn test_notifications_hold_nothing() {
        let pool = TokenPool::new(1);
        let cancel = CancellationToken::new();
        let mut req = request(1, 1, &cancel);
        if let crate::message::Message::Request(inner) = &mut req.message {
            inner.id = None;
        }
        assert!(matches!(pool.apply(req).await, Outcome::Forward(_)));
        assert_eq!(pool.available(), 1);
    }
}
