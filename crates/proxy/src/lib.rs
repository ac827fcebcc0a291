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

//! Switcheroo JSON-RPC switch
//!
//! Accepts WebSocket connections from RPC clients ("sources"), relays their
//! traffic to configured upstream endpoints ("targets") and carries responses
//! and server-initiated messages back. Between the two sides a configurable
//! chain of effects can delay, drop, fail, throttle or rewrite messages, which
//! makes it a harness for testing how clients and nodes cope with a
//! misbehaving peer.

pub mod backend;
pub mod config;
pub mod connection;
pub mod direction;
pub mod effect;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod message;
pub mod messenger;
pub mod pipeline;
pub mod remote;
pub mod server;
pub mod session;
pub mod ws;

pub use backend::Backend;
pub use config::Config;
pub use direction::{Direction, Side};
pub use effect::EffectConfig;
pub use error::{ConfigError, EffectError, MultiError, RouteError, TransportError};
pub use server::{Server, ServerBuilder};
