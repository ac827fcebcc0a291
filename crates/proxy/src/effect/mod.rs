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

//! Traffic-shaping and fault-injection effects.
//!
//! An effect is configured by an [`EffectConfig`]: a direction mask, optional
//! matchers, and exactly one variant payload. Each session turns the config
//! into an [`Effect`], which owns the runtime state of stateful variants
//! (token bucket, token pool), so sessions never share that state.
//!
//! Evaluating an effect on an [`Envelope`] yields an [`Outcome`]. Envelopes
//! the effect does not apply to are forwarded unchanged.

pub mod delay;
pub mod drop;
pub mod error;
pub mod parallel;
pub mod rate_limit;
pub mod substitute;

pub use delay::DelayEffect;
pub use drop::DropEffect;
pub use error::ErrorEffect;
pub use parallel::{ParallelEffect, TokenPool};
pub use rate_limit::{RateLimitEffect, TokenBucket};
pub use substitute::SubstituteEffect;

use crate::{
    direction::{Direction, MessageKind},
    envelope::{Envelope, SessionId, TokenKey},
    error::EffectError,
    message::Message,
};
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, sync::Arc, time::Duration};
use tracing::trace;

/// Result of running one envelope through one effect.
#[derive(Debug)]
pub enum Outcome {
    /// Hand the envelope to the next stage
    Forward(Envelope),
    /// Hand the envelope to the next stage after the delay
    Delay(Envelope, Duration),
    /// Discard the envelope
    Drop(Envelope),
    /// Discard the envelope and send this reply back to the requester
    Reply(Envelope),
    /// The envelope's cancellation fired while it was waiting
    Cancelled(Envelope),
}

impl Outcome {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Forward(_) => "forward",
            Self::Delay(..) => "delay",
            Self::Drop(_) => "drop",
            Self::Reply(_) => "reply",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// Regex matched against a message's method name.
///
/// Messages without a method name are matched as the empty string.
#[derive(Debug, Clone)]
pub struct MethodFilter(Regex);

impl MethodFilter {
    /// Compile a filter
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self)
    }

    /// Whether `method` is selected
    pub fn matches(&self, method: Option<&str>) -> bool {
        self.0.is_match(method.unwrap_or_default())
    }

    /// Source pattern
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for MethodFilter {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for MethodFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MethodFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern)
            .map_err(|e| de::Error::custom(format!("invalid filter {pattern:?}: {e}")))
    }
}

/// Extra matcher over the whole message, for effects built in code.
#[derive(Clone)]
pub struct MessagePredicate(Arc<dyn Fn(&Message) -> bool + Send + Sync>);

impl MessagePredicate {
    /// Wrap a closure
    pub fn new(predicate: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Whether `message` is selected
    pub fn matches(&self, message: &Message) -> bool {
        (self.0)(message)
    }
}

impl fmt::Debug for MessagePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessagePredicate(..)")
    }
}

/// One entry of an effect chain, as configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EffectConfig {
    /// Traffic the effect applies to
    #[serde(default)]
    pub direction: Direction,
    /// Method names the effect applies to; absent matches everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<MethodFilter>,
    /// Message matcher; cannot be set from a config file
    #[serde(skip)]
    pub predicate: Option<MessagePredicate>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayEffect>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop: Option<DropEffect>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEffect>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitEffect>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelEffect>,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute: Option<SubstituteEffect>,
}

impl EffectConfig {
    /// Restrict the effect to `direction`
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Restrict the effect to methods matching `pattern`
    pub fn with_filter(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.filter = Some(MethodFilter::new(pattern)?);
        Ok(self)
    }

    /// Restrict the effect to messages accepted by `predicate`
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(MessagePredicate::new(predicate));
        self
    }

    /// Number of populated variant payloads
    pub fn variants(&self) -> usize {
        [
            self.delay.is_some(),
            self.drop.is_some(),
            self.error.is_some(),
            self.rate_limit.is_some(),
            self.parallel.is_some(),
            self.substitute.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// Check the entry can be run: a named direction, exactly one variant, sane values.
    pub fn validate(&self) -> Result<(), EffectError> {
        if !self.direction.is_valid() {
            return Err(EffectError::InvalidDirection(self.direction));
        }
        match self.variants() {
            0 => return Err(EffectError::NoVariant),
            1 => {}
            n => return Err(EffectError::TooManyVariants(n)),
        }
        if let Some(drop) = &self.drop {
            drop::validate_chance(drop.chance)?;
        }
        if let Some(error) = &self.error {
            drop::validate_chance(error.chance)?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }
}

impl From<DelayEffect> for EffectConfig {
    fn from(effect: DelayEffect) -> Self {
        Self { delay: Some(effect), ..Default::default() }
    }
}

impl From<DropEffect> for EffectConfig {
    fn from(effect: DropEffect) -> Self {
        Self { drop: Some(effect), ..Default::default() }
    }
}

impl From<ErrorEffect> for EffectConfig {
    fn from(effect: ErrorEffect) -> Self {
        Self { error: Some(effect), ..Default::default() }
    }
}

impl From<RateLimitEffect> for EffectConfig {
    fn from(effect: RateLimitEffect) -> Self {
        Self { rate_limit: Some(effect), ..Default::default() }
    }
}

impl From<ParallelEffect> for EffectConfig {
    fn from(effect: ParallelEffect) -> Self {
        Self { parallel: Some(effect), ..Default::default() }
    }
}

impl From<SubstituteEffect> for EffectConfig {
    fn from(effect: SubstituteEffect) -> Self {
        Self { substitute: Some(effect), ..Default::default() }
    }
}

#[derive(Debug)]
enum EffectKind {
    Pass,
    Delay(DelayEffect),
    Drop(DropEffect),
    Error(ErrorEffect),
    RateLimit(TokenBucket),
    Parallel(TokenPool),
    Substitute(SubstituteEffect),
}

/// A configured effect with its own runtime state.
#[derive(Debug)]
pub struct Effect {
    direction: Direction,
    filter: Option<MethodFilter>,
    predicate: Option<MessagePredicate>,
    kind: EffectKind,
}

impl Effect {
    /// Fresh runtime state for `config`. A config without variant passes everything.
    pub fn new(config: &EffectConfig) -> Self {
        let kind = if let Some(delay) = &config.delay {
            EffectKind::Delay(delay.clone())
        } else if let Some(drop) = &config.drop {
            EffectKind::Drop(drop.clone())
        } else if let Some(error) = &config.error {
            EffectKind::Error(error.clone())
        } else if let Some(rate_limit) = &config.rate_limit {
            EffectKind::RateLimit(rate_limit.bucket())
        } else if let Some(parallel) = &config.parallel {
            EffectKind::Parallel(parallel.pool())
        } else if let Some(substitute) = &config.substitute {
            EffectKind::Substitute(substitute.clone())
        } else {
            EffectKind::Pass
        };
        Self {
            direction: config.direction,
            filter: config.filter.clone(),
            predicate: config.predicate.clone(),
            kind,
        }
    }

    /// Variant name, for logs
    pub fn name(&self) -> &'static str {
        match self.kind {
            EffectKind::Pass => "pass",
            EffectKind::Delay(_) => "delay",
            EffectKind::Drop(_) => "drop",
            EffectKind::Error(_) => "error",
            EffectKind::RateLimit(_) => "rateLimit",
            EffectKind::Parallel(_) => "parallel",
            EffectKind::Substitute(_) => "substitute",
        }
    }

    /// Whether direction, filter and predicate all select `envelope`
    pub fn applies(&self, envelope: &Envelope) -> bool {
        self.direction.matches(envelope.origin, envelope.kind())
            && self.filter.as_ref().is_none_or(|filter| filter.matches(envelope.method()))
            && self.predicate.as_ref().is_none_or(|predicate| predicate.matches(&envelope.message))
    }

    /// Run `envelope` through the effect.
    ///
    /// Only rate limiting and concurrency limiting wait here; both give up
    /// when the envelope's session closes.
    pub async fn process(&self, envelope: Envelope) -> Outcome {
        if !self.applies(&envelope) {
            // a response settles its request's token even when not selected
            if let EffectKind::Parallel(pool) = &self.kind {
                pool.settle(&envelope);
            }
            return Outcome::Forward(envelope);
        }
        trace!(effect = self.name(), session = envelope.session, "effect applies");

        match &self.kind {
            EffectKind::Pass => Outcome::Forward(envelope),
            EffectKind::Delay(delay) => match delay.sample() {
                Some(wait) => Outcome::Delay(envelope, wait),
                None => Outcome::Forward(envelope),
            },
            EffectKind::Drop(drop) => {
                if drop.roll() {
                    Outcome::Drop(envelope)
                } else {
                    Outcome::Forward(envelope)
                }
            }
            EffectKind::Error(error) => {
                if envelope.kind() != MessageKind::Request || !error.roll() {
                    return Outcome::Forward(envelope);
                }
                match envelope.message.id() {
                    Some(id) => {
                        let reply = envelope.reply(error.response(id));
                        Outcome::Reply(reply)
                    }
                    None => Outcome::Drop(envelope),
                }
            }
            EffectKind::RateLimit(bucket) => {
                if bucket.take(&envelope.cancel).await {
                    Outcome::Forward(envelope)
                } else {
                    Outcome::Cancelled(envelope)
                }
            }
            EffectKind::Parallel(pool) => pool.apply(envelope).await,
            EffectKind::Substitute(substitute) => substitute.apply(envelope),
        }
    }

    /// Give back any concurrency token held for `key`
    pub fn release(&self, key: &TokenKey) -> bool {
        match &self.kind {
            EffectKind::Parallel(pool) => pool.release(key),
            _ => false,
        }
    }

    /// Give back every concurrency token held by `session`
    pub fn release_session(&self, session: SessionId) -> usize {
        match &self.kind {
            EffectKind::Parallel(pool) => pool.release_session(session),
            _ => 0,
        }
    }

    /// Concurrency pool of a parallel effect
    pub fn pool(&self) -> Option<&TokenPool> {
        match &self.kind {
            EffectKind::Parallel(pool) => Some(pool),
            _ => None,
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
    use tokio_util::sync::CancellationToken;

    fn request(method: &str, id: i64, origin: Side) -> Envelope {
        Envelope::new(
            RpcRequest::new(id, method, Some(json!([]))).into(),
            1,
            origin,
            CancellationToken::new(),
        )
    }

    fn response(id: i64, origin: Side) -> Envelope {
        Envelope::new(
            RpcResponse::success(Some(RpcId::from(id)), json!("0x1")).into(),
            1,
            origin,
            CancellationToken::new(),
        )
    }

    fn error_effect() -> EffectConfig {
        ErrorEffect { chance: 1.0, code: -32000, message: "boom".into(), data: None }.into()
    }

    #[tokio::test]
    async fn test_error_replies_with_request_id() {
        let effect = Effect::new(&error_effect());
        for id in 0..20 {
            let Outcome::Reply(reply) = effect.process(request("eth_call", id, Side::Source)).await
            else {
                panic!("request {id} was not answered");
            };
            assert_eq!(reply.origin, Side::Target);
            let Message::Response(rsp) = reply.message else { panic!("expected a response") };
            assert_eq!(rsp.id, Some(RpcId::from(id)));
            assert_eq!(rsp.error.map(|e| e.code), Some(-32000));
        }
    }

    #[tokio::test]
    async fn test_error_leaves_responses_alone() {
        let effect = Effect::new(&error_effect());
        assert!(matches!(effect.process(response(1, Side::Target)).await, Outcome::Forward(_)));
    }

    #[tokio::test]
    async fn test_direction_and_filter_are_anded() {
        let config = EffectConfig::from(DropEffect { chance: 1.0 })
            .with_direction(Direction::SOURCE_REQUEST)
            .with_filter("^eth_send")
            .unwrap();
        let effect = Effect::new(&config);

        assert!(effect.applies(&request("eth_sendRawTransaction", 1, Side::Source)));
        assert!(!effect.applies(&request("eth_call", 1, Side::Source)));
        assert!(!effect.applies(&request("eth_sendRawTransaction", 1, Side::Target)));
        assert!(!effect.applies(&response(1, Side::Source)));

        assert!(matches!(
            effect.process(request("eth_call", 2, Side::Source)).await,
            Outcome::Forward(_)
        ));
        assert!(matches!(
            effect.process(request("eth_sendTransaction", 3, Side::Source)).await,
            Outcome::Drop(_)
        ));
    }

    #[tokio::test]
    async fn test_predicate_sees_whole_message() {
        let config = EffectConfig::from(DropEffect { chance: 1.0 })
            .with_predicate(|message| matches!(message, Message::Request(r) if r.params.is_some()));
        let effect = Effect::new(&config);

        let mut bare = request("eth_chainId", 1, Side::Source);
        if let Message::Request(req) = &mut bare.message {
            req.params = None;
        }
        assert!(!effect.applies(&bare));
        assert!(effect.applies(&request("eth_chainId", 2, Side::Source)));
    }

    #[tokio::test]
    async fn test_empty_config_passes_through() {
        let effect = Effect::new(&EffectConfig::default());
        assert_eq!(effect.name(), "pass");
        assert!(matches!(
            effect.process(request("eth_call", 1, Side::Source)).await,
            Outcome::Forward(_)
        ));
    }

    #[tokio::test]
    async fn test_unselected_response_still_returns_token() {
        let config = EffectConfig::from(ParallelEffect { max: 1 })
            .with_direction(Direction::BI_REQUEST);
        let effect = Effect::new(&config);

        assert!(matches!(
            effect.process(request("eth_call", 5, Side::Source)).await,
            Outcome::Forward(_)
        ));
        assert_eq!(effect.pool().map(TokenPool::available), Some(0));

        // bi-request does not select responses, the token comes back regardless
        assert!(matches!(effect.process(response(5, Side::Target)).await, Outcome::Forward(_)));
        assert_eq!(effect.pool().map(TokenPool::available), Some(1));
    }

    #[test]
    fn test_validate() {
        assert_eq!(EffectConfig::default().validate(), Err(EffectError::NoVariant));

        let mut two = EffectConfig::from(DropEffect { chance: 0.1 });
        two.parallel = Some(ParallelEffect { max: 2 });
        assert_eq!(two.validate(), Err(EffectError::TooManyVariants(2)));

        let negative = EffectConfig::from(RateLimitEffect { rate: -2.0, burst: 1 });
        assert_eq!(negative.validate(), Err(EffectError::InvalidRate(-2.0)));

        let nan = EffectConfig::from(DropEffect { chance: f64::NAN });
        assert!(matches!(nan.validate(), Err(EffectError::InvalidChance(_))));

        assert!(EffectConfig::from(SubstituteEffect { result: json!(null) }).validate().is_ok());
    }

    #[test]
    fn test_deserialize_entry() {
        let config: EffectConfig = serde_json::from_value(json!({
            "direction": "bi-response",
            "filter": "^eth_get",
            "rateLimit": {"rate": 2.5, "burst": 3}
        }))
        .unwrap();
        assert_eq!(config.direction, Direction::BI_RESPONSE);
        assert_eq!(config.filter.as_ref().map(MethodFilter::as_str), Some("^eth_get"));
        assert_eq!(config.rate_limit, Some(RateLimitEffect { rate: 2.5, burst: 3 }));
        assert!(config.validate().is_ok());

        let unknown = serde_json::from_value::<EffectConfig>(json!({"shuffle": {}}));
        assert!(unknown.is_err());
        let bad_regex = serde_json::from_value::<EffectConfig>(json!({"filter": "(", "drop": {}}));
        assert!(bad_regex.is_err());
    }
}
