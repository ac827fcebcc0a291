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

//! Random message loss.

use crate::error::EffectError;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Drops messages with a given probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropEffect {
    /// Probability of dropping a matched message.
    /// Set to 0 to disable. Negative probability has no effect.
    #[serde(default)]
    pub chance: f64,
}

impl DropEffect {
    /// Whether this message should be dropped
    pub fn roll(&self) -> bool {
        check_chance(self.chance)
    }
}

/// True with probability `chance`; values outside `[0, 1]` clamp to never/always.
///
/// Draws from the thread-local CSPRNG, so consecutive calls are independent.
pub fn check_chance(chance: f64) -> bool {
    if chance <= 0.0 {
        return false;
    }
    if chance >= 1.0 {
        return true;
    }
    rand::rng().random::<f64>() < chance
}

/// Validation shared by every chance-driven effect
pub(crate) fn validate_chance(chance: f64) -> Result<(), EffectError> {
    if chance.is_nan() {
        return Err(EffectError::InvalidChance(chance));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIALS: usize = 10_000;

    fn drops(chance: f64) -> usize {
        let effect = DropEffect { chance };
        (0..TRIALS).filter(|_| effect.roll()).count()
    }

    #[test]
    fn test_zero_chance_never_drops() {
        assert_eq!(drops(0.0), 0);
        assert_eq!(drops(-0.5), 0);
    }

    #[test]
    fn test_full_chance_always_drops() {
        assert_eq!(drops(1.0), TRIALS);
        assert_eq!(drops(3.0), TRIALS);
    }

    #[test]
    fn test_half_chance_is_roughly_half() {
        let dropped = drops(0.5);
        assert!((4_000..=6_000).contains(&dropped), "dropped {dropped} of {TRIALS}");
    }

    #[test]
    fn test_nan_is_rejected() {
        assert!(validate_chance(f64::NAN).is_err());
        assert!(validate_chance(0.3).is_ok());
    }
}
