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

//! Traffic classification for effect matching.
//!
//! Every message is classified by the side it was read from and whether it is
//! a request or a response. That gives four bits; an effect's [`Direction`] is
//! one of seven named unions of them.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Side of the switch a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// A client that dialed into the switch
    Source,
    /// An upstream endpoint the switch dials out to
    Target,
}

impl Side {
    /// The other side
    pub fn opposite(self) -> Self {
        match self {
            Self::Source => Self::Target,
            Self::Target => Self::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Has a method; may expect an answer
    Request,
    /// Answers a request by id
    Response,
}

/// Direction mask an effect is matched on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Direction(u8);

impl Direction {
    /// Requests from source to target (regular usage, before the server handles the request)
    pub const SOURCE_REQUEST: Self = Self(0b0001);
    /// Responses by source to target (bidirectional RPC, server talking to client)
    pub const SOURCE_RESPONSE: Self = Self(0b0010);
    /// Requests from target to source (bidirectional RPC, incl. subscription events)
    pub const TARGET_REQUEST: Self = Self(0b0100);
    /// Responses by target to source (after the server handled the request)
    pub const TARGET_RESPONSE: Self = Self(0b1000);
    /// Anything from the source. Not one of the seven configurable masks.
    const SOURCE_ANY: u8 = 0b0011;
    /// Anything from the target. Not one of the seven configurable masks.
    const TARGET_ANY: u8 = 0b1100;
    /// Requests, both directions
    pub const BI_REQUEST: Self = Self(0b0101);
    /// Responses, both directions
    pub const BI_RESPONSE: Self = Self(0b1010);
    /// Any kind of request or response (default)
    pub const ANY: Self = Self(0b1111);

    const NAMED: [(Self, &'static str); 7] = [
        (Self::SOURCE_REQUEST, "source-request"),
        (Self::SOURCE_RESPONSE, "source-response"),
        (Self::TARGET_REQUEST, "target-request"),
        (Self::TARGET_RESPONSE, "target-response"),
        (Self::BI_REQUEST, "bi-request"),
        (Self::BI_RESPONSE, "bi-response"),
        (Self::ANY, "any"),
    ];

    /// Build a mask from raw bits, accepting only the seven named values.
    pub fn from_bits(bits: u8) -> Result<Self, InvalidDirection> {
        let direction = Self(bits);
        if direction.is_valid() {
            Ok(direction)
        } else {
            Err(InvalidDirection(format!("unknown-{bits}")))
        }
    }

    /// The single bit describing a message of `kind` read from `side`.
    pub fn of(side: Side, kind: MessageKind) -> Self {
        match (side, kind) {
            (Side::Source, MessageKind::Request) => Self::SOURCE_REQUEST,
            (Side::Source, MessageKind::Response) => Self::SOURCE_RESPONSE,
            (Side::Target, MessageKind::Request) => Self::TARGET_REQUEST,
            (Side::Target, MessageKind::Response) => Self::TARGET_RESPONSE,
        }
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether any request bit is set
    pub fn match_request(self) -> bool {
        self.0 & Self::BI_REQUEST.0 != 0
    }

    /// Whether any response bit is set
    pub fn match_response(self) -> bool {
        self.0 & Self::BI_RESPONSE.0 != 0
    }

    /// Whether any source bit is set
    pub fn match_source(self) -> bool {
        self.0 & Self::SOURCE_ANY != 0
    }

    /// Whether any target bit is set
    pub fn match_target(self) -> bool {
        self.0 & Self::TARGET_ANY != 0
    }

    /// Whether the mask applies to a message of `kind` read from `side`.
    pub fn matches(self, side: Side, kind: MessageKind) -> bool {
        let side_matches = match side {
            Side::Source => self.match_source(),
            Side::Target => self.match_target(),
        };
        let kind_matches = match kind {
            MessageKind::Request => self.match_request(),
            MessageKind::Response => self.match_response(),
        };
        side_matches && kind_matches
    }

    /// Whether this is one of the seven named masks
    pub fn is_valid(self) -> bool {
        Self::NAMED.iter().any(|(named, _)| *named == self)
    }

    fn name(self) -> Option<&'static str> {
        Self::NAMED.iter().find(|(named, _)| *named == self).map(|(_, name)| *name)
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::ANY
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown-{}", self.0),
        }
    }
}

impl fmt::Debug for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Direction({self})")
    }
}

/// A direction name or bit pattern outside the seven named masks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid direction: {0:?}")]
pub struct InvalidDirection(String);

impl FromStr for Direction {
    type Err = InvalidDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMED
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(direction, _)| *direction)
            .ok_or_else(|| InvalidDirection(s.to_string()))
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIDES: [Side; 2] = [Side::Source, Side::Target];
    const KINDS: [MessageKind; 2] = [MessageKind::Request, MessageKind::Response];

    #[test]
    fn test_truth_table_for_named_masks() {
        // (mask, source-request, source-response, target-request, target-response)
        let table = [
            (Direction::SOURCE_REQUEST, [true, false, false, false]),
            (Direction::SOURCE_RESPONSE, [false, true, false, false]),
            (Direction::TARGET_REQUEST, [false, false, true, false]),
            (Direction::TARGET_RESPONSE, [false, false, false, true]),
            (Direction::BI_REQUEST, [true, false, true, false]),
            (Direction::BI_RESPONSE, [false, true, false, true]),
            (Direction::ANY, [true, true, true, true]),
        ];

        for (mask, expected) in table {
            let mut i = 0;
            for side in SIDES {
                for kind in KINDS {
                    assert_eq!(mask.matches(side, kind), expected[i], "{mask} on {side} {kind:?}");
                    // for the named masks, the AND of projections is plain bit membership
                    let bit = Direction::of(side, kind).bits();
                    assert_eq!(mask.bits() & bit != 0, expected[i]);
                    i += 1;
                }
            }
        }
    }

    #[test]
    fn test_only_named_bit_patterns_are_valid() {
        let valid: Vec<u8> = (0u8..16).filter(|bits| Direction::from_bits(*bits).is_ok()).collect();
        assert_eq!(valid, vec![0b0001, 0b0010, 0b0100, 0b0101, 0b1000, 0b1010, 0b1111]);

        let err = Direction::from_bits(0b1001).unwrap_err();
        assert_eq!(err.to_string(), "invalid direction: \"unknown-9\"");
    }

    #[test]
    fn test_side_and_kind_projections() {
        assert!(Direction::BI_REQUEST.match_source());
        assert!(Direction::BI_REQUEST.match_target());
        assert!(!Direction::BI_REQUEST.match_response());
        assert!(Direction::TARGET_RESPONSE.match_target());
        assert!(!Direction::TARGET_RESPONSE.match_source());
        assert!(Direction::ANY.match_request() && Direction::ANY.match_response());
    }

    #[test]
    fn test_names_round_trip_and_default() {
        for (direction, name) in Direction::NAMED {
            assert_eq!(direction.to_string(), name);
            assert_eq!(name.parse::<Direction>().unwrap(), direction);
        }
        assert_eq!(Direction::default(), Direction::ANY);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_serde_uses_names() {
        let direction: Direction = serde_json::from_str("\"bi-response\"").unwrap();
        assert_eq!(direction, Direction::BI_RESPONSE);
        let encoded = serde_json::to_string(&Direction::TARGET_REQUEST).unwrap();
        assert_eq!(encoded, "\"target-request\"");
        assert!(serde_json::from_str::<Direction>("\"source-any\"").is_err());
    }
}
