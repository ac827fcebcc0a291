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

//! Synthetic error replies.

use super::drop::check_chance;
use crate::message::{error_codes, RpcError, RpcId, RpcResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_code() -> i64 {
    error_codes::SERVER_ERROR
}

/// Answers requests with an error instead of forwarding them.
///
/// Only requests are affected; responses pass untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorEffect {
    /// Probability of answering with the error.
    /// Set to 0 to disable. Negative probability has no effect.
    #[serde(default)]
    pub chance: f64,
    /// Error code to reply with
    #[serde(default = "default_code")]
    pub code: i64,
    /// Error message to reply with
    #[serde(default)]
    pub message: String,
    /// Structured error data, JSON-encoded in the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorEffect {
    /// Whether this request should be answered with the error
    pub fn roll(&self) -> bool {
        check_chance(self.chance)
    }

    /// The error reply for request `id`
    pub fn response(&self, id: &RpcId) -> RpcResponse {
        RpcResponse::failure(
            Some(id.clone()),
            RpcError { code: self.code, message: self.message.clone(), data: self.data.clone() },
        )
    }
}
