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

//! Error types of the switch.
//!
//! Failures are local to whatever hit them: codec errors cost one message,
//! transport errors cost one connection, route errors cost one envelope.
//! Only [`ConfigError`] is allowed to stop the process, and only at startup.

use crate::direction::Direction;
use std::{fmt, path::PathBuf};
use thiserror::Error;

/// Configuration could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the config file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// YAML decoding failed (including unknown fields)
    #[error("failed to decode YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML decoding failed (including unknown fields)
    #[error("failed to decode TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// An effect entry failed validation
    #[error("{owner} effect #{index}: {reason}")]
    InvalidEffect {
        /// `source <name>` or `target <name>`
        owner: String,
        /// Position of the effect in its chain
        index: usize,
        /// What is wrong with it
        #[source]
        reason: EffectError,
    },

    /// A target entry failed validation
    #[error("target {name}: {reason}")]
    InvalidTarget {
        /// Target name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// A source references a target that is not configured
    #[error("source {source_name} references unknown target {target}")]
    UnknownTarget {
        /// Source name
        source_name: String,
        /// Referenced target name
        target: String,
    },

    /// A source does not name a target and there is no single target to default to
    #[error("source {0} must name a target (configured targets: {1})")]
    AmbiguousTarget(String, usize),
}

/// An effect entry that cannot be run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EffectError {
    /// The direction mask names no single or combined direction
    #[error("invalid direction {0}")]
    InvalidDirection(Direction),

    /// The entry configures no effect
    #[error("no effect specified")]
    NoVariant,

    /// The entry configures more than one effect
    #[error("exactly one effect per entry, found {0}")]
    TooManyVariants(usize),

    /// A chance that is not a number
    #[error("chance must be a number, got {0}")]
    InvalidChance(f64),

    /// A negative or NaN rate
    #[error("invalid rate, cannot be negative: {0}")]
    InvalidRate(f64),
}

/// Which half of the config a lookup was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// `sources` mapping
    Source,
    /// `targets` mapping
    Target,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// An envelope or a connection could not be routed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    /// Name not present in the active config
    #[error("unknown {kind} {name}")]
    ConfigLookup {
        /// Mapping that was searched
        kind: LookupKind,
        /// Name that was not found
        name: String,
    },

    /// Shutdown has started, no new connections are taken
    #[error("not accepting new connections")]
    NotAccepting,

    /// Dial request without a source name
    #[error("cannot upgrade connection without a source name")]
    MissingName,

    /// No live session for the envelope
    #[error("session {0} is closed")]
    SessionClosed(u64),
}

/// A wire frame could not be decoded or a message could not be encoded.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid JSON or not a JSON-RPC message
    #[error("failed to decode JSON-RPC frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// `[]` is not a valid batch
    #[error("empty JSON-RPC batch")]
    EmptyBatch,

    /// Encoding failed
    #[error("failed to encode JSON-RPC message: {0}")]
    Encode(serde_json::Error),
}

/// A messenger operation failed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport is closed; `cause` says why
    #[error("connection closed: {0}")]
    Closed(CloseCause),

    /// The transport failed and is now broken
    #[error("transport failure: {0}")]
    Broken(String),

    /// A frame the switch does not handle (binary, for instance); the transport stays usable
    #[error("unexpected frame: {0}")]
    Unexpected(String),

    /// Dialing a target failed
    #[error("failed to dial {endpoint}: {reason}")]
    Dial {
        /// Endpoint that was dialed
        endpoint: String,
        /// Reason reported by the client
        reason: String,
    },
}

impl TransportError {
    /// Whether the transport can still be used after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Unexpected(_))
    }
}

/// Why a connection closed. Recorded once; later closes keep the first cause.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed locally without a specific reason
    #[error("closed")]
    Closed,

    /// Closed because the server or session is shutting down
    #[error("shutting down")]
    Shutdown,

    /// The peer closed the connection
    #[error("closed by peer")]
    RemoteClosed,

    /// The transport reported a failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A connection task panicked
    #[error("{task} panic: {message}")]
    Panic {
        /// `reader` or `writer`
        task: &'static str,
        /// Panic payload rendered as text
        message: String,
    },
}

/// Several failures, none of which is swallowed.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<eyre::Report>,
}

impl MultiError {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a failure
    pub fn push(&mut self, error: impl Into<eyre::Report>) {
        self.errors.push(error.into());
    }

    /// Take over every failure collected by `other`
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }

    /// Number of collected failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing failed
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected failures
    pub fn errors(&self) -> &[eyre::Report] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, the whole collection otherwise
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{error:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
