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

//! Added latency.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delays matched messages by a flat time plus uniform jitter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DelayEffect {
    /// Maximum extra delay, drawn uniformly. Zero disables jitter.
    #[serde(default, with = "duration")]
    pub max_jitter: Duration,
    /// Flat extra delay. Zero disables it.
    #[serde(default, with = "duration")]
    pub time: Duration,
}

impl DelayEffect {
    /// The delay for one message, `None` when there is nothing to wait for
    pub fn sample(&self) -> Option<Duration> {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::rng().random_range(Duration::ZERO..=self.max_jitter)
        };
        let total = self.time.saturating_add(jitter);
        (!total.is_zero()).then_some(total)
    }
}

/// Durations as humantime strings (`"150ms"`, `"1s 500ms"`) or integer milliseconds.
/// Negative durations are valid and mean no delay.
pub(crate) mod duration {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        NegativeMillis(i64),
        Text(String),
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
            Repr::NegativeMillis(_) => Ok(Duration::ZERO),
            Repr::Text(text) => {
                let trimmed = text.trim();
                let (negative, magnitude) = match trimmed.strip_prefix('-') {
                    Some(rest) => (true, rest.trim_start()),
                    None => (false, trimmed),
                };
                let parsed = humantime::parse_duration(magnitude)
                    .map_err(|e| de::Error::custom(format!("invalid duration {text:?}: {e}")))?;
                Ok(if negative { Duration::ZERO } else { parsed })
            }
        }
    }

    pub(crate) fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_delay_samples_nothing() {
        assert_eq!(DelayEffect::default().sample(), None);
    }

    #[test]
    fn test_flat_delay_without_jitter() {
        let effect = DelayEffect { time: Duration::from_millis(40), ..Default::default() };
        assert_eq!(effect.sample(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let effect =
            DelayEffect { time: Duration::from_millis(10), max_jitter: Duration::from_millis(5) };
        for _ in 0..1_000 {
            let delay = effect.sample().unwrap();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_duration_formats() {
        let effect: DelayEffect =
            serde_json::from_str(r#"{"time": "1s 250ms", "maxJitter": 20}"#).unwrap();
        assert_eq!(effect.time, Duration::from_millis(1_250));
        assert_eq!(effect.max_jitter, Duration::from_millis(20));

        assert!(serde_json::from_str::<DelayEffect>(r#"{"time": "5 parsecs"}"#).is_err());
        assert!(serde_json::from_str::<DelayEffect>(r#"{"time": "1s", "extra": 1}"#).is_err());
    }

    #[test]
    fn test_negative_durations_mean_no_delay() {
        let effect: DelayEffect =
            serde_json::from_str(r#"{"time": "-5ms", "maxJitter": -20}"#).unwrap();
        assert_eq!(effect.time, Duration::ZERO);
        assert_eq!(effect.max_jitter, Duration::ZERO);
        assert_eq!(effect.sample(), None);

        let yaml: DelayEffect = serde_yaml::from_str("time: -1s\nmaxJitter: 10ms").unwrap();
        assert_eq!(yaml.time, Duration::ZERO);
        assert_eq!(yaml.max_jitter, Duration::from_millis(10));
        assert!(serde_json::from_str::<DelayEffect>(r#"{"time": "-soon"}"#).is_err());
    }
}
