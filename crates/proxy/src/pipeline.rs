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

//! Effect pipelines.
//!
//! A session has two paths. Traffic read from the source runs through the
//! source chain and then the target chain; traffic read from the target runs
//! through the target chain and then the source chain. Each effect on a path
//! is one stage task, and stages are linked by bounded queues:
//!
//! ```text
//! input -> entry -> stage(effect 0) -> stage(effect 1) -> ... -> output
//!                         \                  \
//!                          `------ replies ---`-----> requester
//! ```
//!
//! A stage handles its queue in order. Delays run on their own timer task so
//! the messages behind a delayed one keep moving; rate and concurrency limits
//! hold up the stage itself.

use crate::{
    connection::{enqueue, QUEUE_CAPACITY},
    direction::Side,
    effect::{Effect, EffectConfig, Outcome},
    envelope::{Envelope, MethodTracker, SessionId, TokenKey},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

/// Runtime effects of one session.
#[derive(Debug)]
pub struct Chains {
    session: SessionId,
    source: Vec<Arc<Effect>>,
    target: Vec<Arc<Effect>>,
    tracker: MethodTracker,
}

impl Chains {
    /// Fresh runtime state for both chains of `session`
    pub fn new(session: SessionId, source: &[EffectConfig], target: &[EffectConfig]) -> Self {
        let build = |configs: &[EffectConfig]| -> Vec<Arc<Effect>> {
            configs.iter().map(|config| Arc::new(Effect::new(config))).collect()
        };
        Self {
            session,
            source: build(source),
            target: build(target),
            tracker: MethodTracker::new(),
        }
    }

    /// Effects in the order traffic read from `origin` meets them
    pub fn path(&self, origin: Side) -> Vec<Arc<Effect>> {
        let (first, second) = match origin {
            Side::Source => (&self.source, &self.target),
            Side::Target => (&self.target, &self.source),
        };
        first.iter().chain(second).cloned().collect()
    }

    /// Effects of one chain
    pub fn chain(&self, side: Side) -> &[Arc<Effect>] {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// Method bookkeeping shared by both paths
    pub fn tracker(&self) -> &MethodTracker {
        &self.tracker
    }

    /// Forget the request behind `envelope`: its tokens go back to every
    /// pool and its method annotation is dropped.
    pub fn abandon(&self, envelope: &Envelope) {
        if let Some(key) = envelope.token_key() {
            self.release(&key);
        }
    }

    /// Give back every token held for `key`
    pub fn release(&self, key: &TokenKey) {
        let released =
            self.source.iter().chain(&self.target).filter(|effect| effect.release(key)).count();
        self.tracker.forget(key);
        if released > 0 {
            trace!(session = self.session, id = %key.id, released, "released tokens");
        }
    }

    /// Give back every token the session holds
    pub fn release_session(&self) -> usize {
        let released: usize = self
            .source
            .iter()
            .chain(&self.target)
            .map(|effect| effect.release_session(self.session))
            .sum();
        if released > 0 {
            debug!(session = self.session, released, "released tokens of closed session");
        }
        released
    }
}

/// Where a path delivers what comes out of it.
#[derive(Debug, Clone)]
pub struct PathEnds {
    /// Traffic that made it through every stage
    pub output: mpsc::Sender<Envelope>,
    /// Synthetic replies, sent back towards the side the path reads from
    pub replies: mpsc::Sender<Envelope>,
}

/// Spawn the stage tasks of the path for traffic read from `origin`.
///
/// The tasks stop when `cancel` fires or `input` is closed.
pub fn spawn_path(
    chains: Arc<Chains>,
    origin: Side,
    input: mpsc::Receiver<Envelope>,
    ends: PathEnds,
    cancel: CancellationToken,
) {
    let span = tracing::debug_span!("path", session = chains.session, from = %origin);
    let effects = chains.path(origin);

    // stages are wired back to front so each knows its successor
    let mut next = ends.output;
    for (index, effect) in effects.into_iter().enumerate().rev() {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stage = Stage {
            index,
            effect,
            chains: chains.clone(),
            next,
            replies: ends.replies.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(stage.run(rx).instrument(span.clone()));
        next = tx;
    }
    tokio::spawn(entry(chains, input, next, cancel).instrument(span));
}

/// First task of a path: annotates methods before any effect looks at them.
async fn entry(
    chains: Arc<Chains>,
    mut input: mpsc::Receiver<Envelope>,
    next: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let mut envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            envelope = input.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        chains.tracker().observe(&mut envelope);
        trace!(message = %envelope.json(), "entering pipeline");
        if !enqueue(&next, envelope, &cancel).await {
            break;
        }
    }
}

struct Stage {
    index: usize,
    effect: Arc<Effect>,
    chains: Arc<Chains>,
    next: mpsc::Sender<Envelope>,
    replies: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl Stage {
    async fn run(self, mut input: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = input.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let outcome = self.effect.process(envelope).await;
            trace!(
                stage = self.index,
                effect = self.effect.name(),
                outcome = outcome.label(),
                "stage"
            );
            if !self.settle(outcome).await {
                break;
            }
        }
        trace!(stage = self.index, "stage stopped");
    }

    /// Act on an outcome. Returns `false` once the path is shutting down.
    async fn settle(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Forward(envelope) => enqueue(&self.next, envelope, &self.cancel).await,
            Outcome::Delay(envelope, wait) => {
                let next = self.next.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(
                    async move {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        enqueue(&next, envelope, &cancel).await;
                    }
                    .in_current_span(),
                );
                true
            }
            Outcome::Drop(envelope) => {
                debug!(
                    effect = self.effect.name(),
                    kind = ?envelope.kind(),
                    id = ?envelope.message.id(),
                    method = envelope.method(),
                    "dropped message"
                );
                self.chains.abandon(&envelope);
                true
            }
            Outcome::Reply(reply) => {
                debug!(effect = self.effect.name(), id = ?reply.message.id(), "answered early");
                self.chains.abandon(&reply);
                enqueue(&self.replies, reply, &self.cancel).await
            }
            // only the path's own cancellation stops the stage
            Outcome::Cancelled(_) if self.cancel.is_cancelled() => false,
            Outcome::Cancelled(envelope) => {
                debug!(
                    effect = self.effect.name(),
                    id = ?envelope.message.id(),
                    method = envelope.method(),
                    "message cancelled while waiting"
                );
                self.chains.abandon(&envelope);
                true
            }
        }
    }
}
