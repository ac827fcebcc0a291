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

//! Messages in transit, with their routing context.

use crate::{
    direction::{Direction, MessageKind, Side},
    message::{Message, RpcId, RpcResponse},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Identity of a session: one source connection and its target link.
pub type SessionId = u64;

/// A message plus where it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The message itself
    pub message: Message,
    /// Session the message belongs to
    pub session: SessionId,
    /// Side it was read from
    pub origin: Side,
    /// Method name; for responses, the method of the request they answer
    pub method: Option<String>,
    /// Fires when the owning session closes
    pub cancel: CancellationToken,
}

impl Envelope {
    /// Wrap a message read from `origin`
    pub fn new(
        message: Message,
        session: SessionId,
        origin: Side,
        cancel: CancellationToken,
    ) -> Self {
        let method = message.method().map(str::to_string);
        Self { message, session, origin, method, cancel }
    }

    /// Request or response
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// The single direction bit this envelope travels on
    pub fn direction(&self) -> Direction {
        Direction::of(self.origin, self.kind())
    }

    /// Method name used for filtering
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Side that issued the request this envelope belongs to
    pub fn requester(&self) -> Side {
        match self.kind() {
            MessageKind::Request => self.origin,
            MessageKind::Response => self.origin.opposite(),
        }
    }

    /// In-flight key of the request/response pair, if the message has an id
    pub fn token_key(&self) -> Option<TokenKey> {
        self.message.id().map(|id| TokenKey {
            session: self.session,
            requester: self.requester(),
            id: id.clone(),
        })
    }

    /// A synthetic response to this request, travelling back to the requester
    pub fn reply(&self, response: RpcResponse) -> Self {
        Self {
            message: Message::Response(response),
            session: self.session,
            origin: self.origin.opposite(),
            method: self.method.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Message as JSON text, for logs
    pub fn json(&self) -> String {
        serde_json::to_string(&self.message).unwrap_or_else(|e| format!("invalid: {e}"))
    }
}

/// Identifies one in-flight request: who asked, and under which id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    /// Session of the request
    pub session: SessionId,
    /// Side that sent the request
    pub requester: Side,
    /// Request id
    pub id: RpcId,
}

/// Remembers request methods so responses can be filtered by method too.
#[derive(Debug, Default)]
pub struct MethodTracker {
    pending: Mutex<HashMap<TokenKey, String>>,
}

impl MethodTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request's method, or fill in a response's method from its request.
    pub fn observe(&self, envelope: &mut Envelope) {
        let Some(key) = envelope.token_key() else { return };
        match envelope.kind() {
            MessageKind::Request => {
                if let Some(method) = &envelope.method {
                    self.pending.lock().insert(key, method.clone());
                }
            }
            MessageKind::Response => {
                if let Some(method) = self.pending.lock().remove(&key) {
                    envelope.method = Some(method);
                }
            }
        }
    }

    /// Forget a request that will never see its response
    pub fn forget(&self, key: &TokenKey) {
        self.pending.lock().remove(key);
    }

    /// Number of requests awaiting a response
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
