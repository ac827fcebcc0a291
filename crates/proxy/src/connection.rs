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

//! Connection loops.
//!
//! Every live messenger is driven by exactly two tasks:
//!
//! - the **reader** decodes frames, expands batches and pushes one
//!   [`Envelope`] per message onto the inbound queue;
//! - the **writer** pops envelopes off the outbound queue and writes them,
//!   one message per frame.
//!
//! A malformed frame or a transient write failure costs one message. A broken
//! transport closes the connection. A panic in either task is caught at the
//! task boundary and turned into [`CloseCause::Panic`].

use crate::{
    direction::Side,
    envelope::{Envelope, SessionId},
    error::{CloseCause, TransportError},
    message::{decode_frame, encode_message},
    messenger::Messenger,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Capacity of every queue between loops and pipeline stages.
pub const QUEUE_CAPACITY: usize = 100;

/// Push `envelope` onto `queue` unless `cancel` fires first. Returns `false`
/// if the envelope was not queued.
pub async fn enqueue(
    queue: &mpsc::Sender<Envelope>,
    envelope: Envelope,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = queue.send(envelope) => sent.is_ok(),
    }
}

/// A messenger together with its reader and writer tasks.
#[derive(Debug)]
pub struct Connection {
    name: String,
    messenger: Arc<dyn Messenger>,
    outbound: mpsc::Sender<Envelope>,
    last_activity: Arc<Mutex<Instant>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Start both loops. Messages read are wrapped as envelopes of `session`
    /// originating from `side` and pushed onto `inbound`; envelopes sent with
    /// [`Connection::send`] are written out.
    pub fn spawn(
        name: impl Into<String>,
        session: SessionId,
        side: Side,
        messenger: Arc<dyn Messenger>,
        inbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (outbound, queue) = mpsc::channel(QUEUE_CAPACITY);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let span =
            tracing::info_span!("connection", %name, session, %side, peer = %messenger.peer());

        let reader = tokio::spawn(
            supervise(
                "reader",
                messenger.clone(),
                read_loop(ReadLoop {
                    session,
                    side,
                    messenger: messenger.clone(),
                    inbound,
                    cancel,
                    last_activity: last_activity.clone(),
                }),
            )
            .instrument(span.clone()),
        );
        let writer = tokio::spawn(
            supervise(
                "writer",
                messenger.clone(),
                write_loop(messenger.clone(), queue, last_activity.clone()),
            )
            .instrument(span),
        );
        info!(%name, session, %side, "connection loops started");

        Self { name, messenger, outbound, last_activity, reader, writer }
    }

    /// Queue `envelope` for writing; gives it back if the writer is gone.
    pub async fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        if self.is_closed() {
            return Err(envelope);
        }
        let signal = self.messenger.close_signal();
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(envelope),
            sent = self.outbound.send(envelope.clone()) => sent.map_err(|e| e.0),
        }
    }

    /// Sender side of the outbound queue
    pub fn outbound(&self) -> mpsc::Sender<Envelope> {
        self.outbound.clone()
    }

    /// Connection name for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying messenger
    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Whether the messenger has closed
    pub fn is_closed(&self) -> bool {
        self.messenger.err().is_some()
    }

    /// Why the messenger closed
    pub fn err(&self) -> Option<CloseCause> {
        self.messenger.err()
    }

    /// Resolves once the messenger has closed
    pub async fn closed(&self) {
        self.messenger.close_signal().cancelled().await;
    }

    /// Time since a frame was last read or written
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Close with `cause`, send the close frame and wait for both loops.
    pub async fn close(self, cause: CloseCause) -> Result<(), TransportError> {
        self.messenger.close_with_cause(cause);
        let result = self.messenger.close().await;
        for task in [self.reader, self.writer] {
            if let Err(e) = task.await {
                warn!(name = %self.name, error = %e, "connection task did not finish cleanly");
            }
        }
        debug!(name = %self.name, "connection closed");
        result
    }
}

/// Run a connection task, turning a panic into a close of its messenger.
pub async fn supervise<F>(task: &'static str, messenger: Arc<dyn Messenger>, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
        let message = panic_message(payload.as_ref());
        error!(task, %message, "connection task panicked");
        messenger.close_with_cause(CloseCause::Panic { task, message });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct ReadLoop {
    session: SessionId,
    side: Side,
    messenger: Arc<dyn Messenger>,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
}

async fn read_loop(ctx: ReadLoop) {
    let signal = ctx.messenger.close_signal();
    loop {
        let frame = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            frame = ctx.messenger.read() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() || ctx.messenger.err().is_some() => {
                debug!(error = %e, "read failed, stopping reader");
                break;
            }
            Err(e) => {
                warn!(error = %e, "skipping frame");
                continue;
            }
        };
        *ctx.last_activity.lock() = Instant::now();

        let messages = match decode_frame(&frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping malformed frame");
                continue;
            }
        };
        trace!(count = messages.len(), "decoded frame");
        for message in messages {
            let envelope = Envelope::new(message, ctx.session, ctx.side, ctx.cancel.clone());
            let queued = tokio::select! {
                biased;
                _ = signal.cancelled() => false,
                queued = enqueue(&ctx.inbound, envelope, &ctx.cancel) => queued,
            };
            if !queued {
                debug!("inbound queue closed, stopping reader");
                return;
            }
        }
    }
    debug!(cause = ?ctx.messenger.err(), "reader stopped");
}

async fn write_loop(
    messenger: Arc<dyn Messenger>,
    mut queue: mpsc::Receiver<Envelope>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let signal = messenger.close_signal();
    loop {
        let envelope = tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            envelope = queue.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let frame = match encode_message(&envelope.message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping message that cannot be encoded");
                continue;
            }
        };
        trace!(frame = %frame, "writing");
        match messenger.write(frame).await {
            Ok(()) => *last_activity.lock() = Instant::now(),
            Err(e) if e.is_fatal() || messenger.err().is_some() => {
                debug!(error = %e, "write failed, stopping writer");
                break;
            }
            Err(e) => warn!(error = %e, "dropping message after write failure"),
        }
    }
    if let Err(e) = messenger.close().await {
        debug!(error = %e, "close after writer stopped");
    }
    debug!(cause = ?messenger.err(), "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryMessenger,
        message::{Message, RpcId, RpcRequest},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use switcheroo_common::logging::ensure_test_logging;

    struct Harness {
        conn: Connection,
        peer: MemoryMessenger,
        inbound: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    }

    fn harness() -> Harness {
        ensure_test_logging(None);
        let (near, peer) = MemoryMessenger::pair("conn");
        let (tx, inbound) = mpsc::channel(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let conn = Connection::spawn("test", 7, Side::Source, Arc::new(near), tx, cancel.clone());
        Harness { conn, peer, inbound, cancel }
    }

    fn id_of(envelope: &Envelope) -> Option<RpcId> {
        envelope.message.id().cloned()
    }

    #[tokio::test]
    async fn test_batch_expands_in_order() {
        let mut h = harness();
        h.peer
            .write(
                r#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","id":2,"method":"b"}]"#
                    .into(),
            )
            .await
            .unwrap();
        h.peer.write(r#"{"jsonrpc":"2.0","id":3,"method":"c"}"#.into()).await.unwrap();

        let first = h.inbound.recv().await.unwrap();
        let second = h.inbound.recv().await.unwrap();
        let third = h.inbound.recv().await.unwrap();
        assert_eq!(id_of(&first), Some(RpcId::from(1)));
        assert_eq!(id_of(&second), Some(RpcId::from(2)));
        assert_eq!(id_of(&third), Some(RpcId::from(3)));
        assert_eq!(first.session, 7);
        assert_eq!(first.origin, Side::Source);
        assert_eq!(first.method(), Some("a"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let mut h = harness();
        h.peer.write("{not json".into()).await.unwrap();
        h.peer.write("[]".into()).await.unwrap();
        h.peer.write(r#"{"jsonrpc":"2.0","id":"ok","method":"eth_chainId"}"#.into()).await.unwrap();

        let envelope = h.inbound.recv().await.unwrap();
        assert_eq!(id_of(&envelope), Some(RpcId::from("ok")));
        assert!(!h.conn.is_closed());
    }

    #[tokio::test]
    async fn test_writer_sends_one_message_per_frame() {
        let h = harness();
        for id in 0..3 {
            let message: Message = RpcRequest::new(id, "eth_blockNumber", Some(json!([]))).into();
            let envelope = Envelope::new(message, 7, Side::Target, h.cancel.clone());
            h.conn.send(envelope).await.unwrap();
        }
        for id in 0..3 {
            let frame = h.peer.read().await.unwrap();
            let decoded = decode_frame(&frame).unwrap();
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].id(), Some(&RpcId::from(id)));
        }
    }

    #[tokio::test]
    async fn test_peer_close_stops_both_loops() {
        let h = harness();
        h.peer.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), h.conn.closed()).await.unwrap();
        assert_eq!(h.conn.err(), Some(CloseCause::RemoteClosed));
        h.conn.close(CloseCause::Closed).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_keeps_first_cause() {
        let h = harness();
        h.conn.messenger().close_with_cause(CloseCause::Shutdown);
        h.conn.messenger().close_with_cause(CloseCause::Closed);
        h.conn.close(CloseCause::Transport("late".into())).await.unwrap();
        assert!(h.peer.read().await.is_err());
    }

    /// Panics on the first read.
    struct PanickingMessenger {
        inner: MemoryMessenger,
    }

    #[async_trait]
    impl Messenger for PanickingMessenger {
        async fn read(&self) -> Result<String, TransportError> {
            panic!("decoder exploded");
        }

        async fn write(&self, frame: String) -> Result<(), TransportError> {
            self.inner.write(frame).await
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.inner.close().await
        }

        fn close_with_cause(&self, cause: CloseCause) {
            self.inner.close_with_cause(cause);
        }

        fn err(&self) -> Option<CloseCause> {
            self.inner.err()
        }

        fn close_signal(&self) -> CancellationToken {
            self.inner.close_signal()
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_close_cause() {
        ensure_test_logging(None);
        let (near, _peer) = MemoryMessenger::pair("panic");
        let (tx, _rx) = mpsc::channel(QUEUE_CAPACITY);
        let conn = Connection::spawn(
            "panicky",
            1,
            Side::Target,
            Arc::new(PanickingMessenger { inner: near }),
            tx,
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert_eq!(
            conn.err(),
            Some(CloseCause::Panic { task: "reader", message: "decoder exploded".into() })
        );
        conn.close(CloseCause::Closed).await.unwrap();
    }
}
