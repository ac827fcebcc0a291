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

//! Fixed results in place of real ones.

use super::Outcome;
use crate::{
    envelope::Envelope,
    message::{Message, RpcResponse},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replaces results with a configured value.
///
/// Placed on responses it rewrites what the real peer answered. Placed on
/// requests it answers them directly, so they never reach the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstituteEffect {
    /// The result to answer with
    pub result: Value,
}

impl SubstituteEffect {
    pub(super) fn apply(&self, mut envelope: Envelope) -> Outcome {
        match &mut envelope.message {
            Message::Response(rsp) => {
                rsp.result = Some(self.result.clone());
                rsp.error = None;
                Outcome::Forward(envelope)
            }
            Message::Request(req) => match req.id.clone() {
                Some(id) => {
                    let reply = envelope.reply(RpcResponse::success(Some(id), self.result.clone()));
                    Outcome::Reply(reply)
                }
                // nobody waits for a notification's answer
                None => Outcome::Drop(envelope),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        direction::Side,
        message::{RpcError, RpcId, RpcRequest},
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn substitute() -> SubstituteEffect {
        SubstituteEffect { result: json!({"balance": "0x0"}) }
    }

    #[test]
    fn test_error_response_is_replaced_with_result() {
        let rsp = RpcResponse::failure(
            Some(RpcId::from(4)),
            RpcError { code: -32000, message: "nope".into(), data: None },
        );
        let envelope = Envelope::new(rsp.into(), 1, Side::Target, CancellationToken::new());

        let Outcome::Forward(out) = substitute().apply(envelope) else {
            panic!("expected forward")
        };
        let Message::Response(rsp) = out.message else { panic!("expected a response") };
        assert_eq!(rsp.id, Some(RpcId::from(4)));
        assert_eq!(rsp.result, Some(json!({"balance": "0x0"})));
        assert_eq!(rsp.error, None);
    }

    #[test]
    fn test_request_is_answered_directly() {
        let req = RpcRequest::new("q-1", "eth_getBalance", Some(json!(["0xabc", "latest"])));
        let envelope = Envelope::new(req.into(), 1, Side::Source, CancellationToken::new());

        let Outcome::Reply(reply) = substitute().apply(envelope) else { panic!("expected reply") };
        assert_eq!(reply.origin, Side::Target);
        assert_eq!(reply.message.id(), Some(&RpcId::from("q-1")));
        let Message::Response(rsp) = reply.message else { panic!("expected a response") };
        assert_eq!(rsp.result, Some(json!({"balance": "0x0"})));
    }

    #[test]
    fn test_notification_is_swallowed() {
        let mut req = RpcRequest::new(1, "eth_subscription", None);
        req.id = None;
        let envelope = Envelope::new(req.into(), 1, Side::Target, CancellationToken::new());
        assert!(matches!(substitute().apply(envelope), Outcome::Drop(_)));
    }
}
