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

//! Token-bucket rate limiting.
//!
//! Messages wait for a token instead of being dropped. The bucket starts full,
//! refills continuously at `rate` tokens per second and never holds more than
//! `burst` tokens.

use crate::error::EffectError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Limits the rate of matched messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitEffect {
    /// Events per second, i.e. how fast tokens become available again.
    /// Negative rates are invalid.
    pub rate: f64,
    /// Number of tokens that may be taken at once
    pub burst: u32,
}

impl RateLimitEffect {
    /// Reject rates that cannot drive a bucket
    pub fn validate(&self) -> Result<(), EffectError> {
        if self.rate.is_nan() || self.rate < 0.0 {
            return Err(EffectError::InvalidRate(self.rate));
        }
        Ok(())
    }

    /// A full bucket with this configuration
    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.rate, self.burst)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Runtime state of one [`RateLimitEffect`].
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            rate: rate.max(0.0),
            burst,
            state: Mutex::new(BucketState { tokens: burst, last: Instant::now() }),
        }
    }

    /// Take a token if one is available.
    ///
    /// Otherwise returns how long until one will be, or `None` when the bucket
    /// can never hand out a token (zero rate or zero burst).
    pub fn try_take(&self) -> Result<(), Option<Duration>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last = now;

        // refill arithmetic is inexact; a hair short of a token is a token
        if state.tokens + 1e-9 >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            return Ok(());
        }
        if self.rate <= 0.0 || self.burst < 1.0 {
            return Err(None);
        }
        let wait = (1.0 - state.tokens) / self.rate;
        Err(Some(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX)))
    }

    /// Wait for a token. Returns `false` if `cancel` fired first.
    pub async fn take(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_take() {
                Ok(()) => return true,
                Err(None) => {
                    cancel.cancelled().await;
                    return false;
                }
                Err(Some(wait)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }
}
