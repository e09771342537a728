//! Concurrent dispatch of inbound deliveries.
//!
//! One loop runs per consume stream. Each delivery is decoded, routed to a
//! registered handler or upstream, executed on its own task, and
//! acknowledged once the callback returns. Protocol errors and routing
//! misses acknowledge and drop the delivery so the loop never stalls on a
//! bad frame. At-most-once: callback errors are logged, never requeued.

use std::sync::Arc;

use futures::{future::BoxFuture, pin_mut, Stream, StreamExt};
use lapin::{acker::Acker, options::BasicAckOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::codec::{Codec, Frame};
use crate::types::Registry;

/// Removes a delivery from its queue.
///
/// Abstracted from the lapin [`Acker`] so the dispatch loop can be
/// exercised against in-memory streams.
pub(crate) trait Acknowledge: Send + 'static {
    fn ack(self) -> BoxFuture<'static, ()>;
}

impl Acknowledge for Acker {
    fn ack(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = Acker::ack(&self, BasicAckOptions::default()).await {
                error!(error = %e, "Failed to ack delivery");
            }
        })
    }
}

/// Process one delivery stream until it closes, then drain.
///
/// Every spawned callback task holds a clone of a guard sender; once the
/// stream ends the loop drops its own guard and blocks until all clones
/// are gone, so `drained` fires only after the last in-flight callback
/// has completed and acknowledged.
pub(crate) async fn run<S, A>(
    deliveries: S,
    codec: Arc<Codec>,
    registry: Arc<Registry>,
    stream: &'static str,
    drained: oneshot::Sender<()>,
) where
    S: Stream<Item = (Vec<u8>, A)> + Send,
    A: Acknowledge,
{
    let (guard, mut inflight) = mpsc::channel::<()>(1);
    pin_mut!(deliveries);

    while let Some((body, acker)) = deliveries.next().await {
        let frame = match codec.decode(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(stream, error = %e, "Dropping undecodable delivery");
                acker.ack().await;
                continue;
            }
        };

        let Frame {
            sender,
            destination,
            receiver,
            payload,
        } = frame;

        // A frame carrying a proxy hop goes to the upstream named by the
        // hop, never to the destination handler.
        if !receiver.handler.is_empty() {
            let Some(upstream) = registry.upstream(&receiver.handler) else {
                warn!(stream, upstream = %receiver.handler, "No upstream registered, dropping");
                acker.ack().await;
                continue;
            };

            let upstream = Arc::clone(upstream);
            let name = receiver.handler;
            let token = guard.clone();
            tokio::spawn(async move {
                let _token = token;
                if let Err(e) = upstream.forward(sender, destination, payload).await {
                    error!(stream, upstream = %name, error = %e, "Upstream failed");
                }
                acker.ack().await;
            });
        } else {
            let Some(handler) = registry.handler(&destination.handler) else {
                warn!(stream, handler = %destination.handler, "No handler registered, dropping");
                acker.ack().await;
                continue;
            };

            let handler = Arc::clone(handler);
            let name = destination.handler;
            let token = guard.clone();
            tokio::spawn(async move {
                let _token = token;
                if let Err(e) = handler.handle(sender, payload).await {
                    error!(stream, handler = %name, error = %e, "Handler failed");
                }
                acker.ack().await;
            });
        }
    }

    drop(guard);
    let _ = inflight.recv().await;

    debug!(stream, "Delivery stream drained");
    let _ = drained.send(());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::RpcError;
    use crate::types::{Destination, Handler, Receiver, Sender, Upstream};

    struct TestAcker {
        acked: Arc<AtomicUsize>,
    }

    impl Acknowledge for TestAcker {
        fn ack(self) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                self.acked.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    /// Handler that records each (sender, payload) it receives.
    struct RecordingHandler {
        tx: mpsc::UnboundedSender<(Sender, Bytes)>,
        fail: bool,
    }

    impl Handler for RecordingHandler {
        fn handle(&self, sender: Sender, payload: Bytes) -> BoxFuture<'static, Result<(), RpcError>> {
            let tx = self.tx.clone();
            let fail = self.fail;
            Box::pin(async move {
                let _ = tx.send((sender, payload));
                if fail {
                    Err(RpcError::Handler("induced failure".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct RecordingUpstream {
        tx: mpsc::UnboundedSender<(Sender, Destination, Bytes)>,
    }

    impl Upstream for RecordingUpstream {
        fn forward(
            &self,
            sender: Sender,
            destination: Destination,
            payload: Bytes,
        ) -> BoxFuture<'static, Result<(), RpcError>> {
            let tx = self.tx.clone();
            Box::pin(async move {
                let _ = tx.send((sender, destination, payload));
                Ok(())
            })
        }
    }

    /// Handler that blocks until released, for drain tests.
    struct BlockingHandler {
        release: Arc<Notify>,
    }

    impl Handler for BlockingHandler {
        fn handle(&self, _sender: Sender, _payload: Bytes) -> BoxFuture<'static, Result<(), RpcError>> {
            let release = self.release.clone();
            Box::pin(async move {
                release.notified().await;
                Ok(())
            })
        }
    }

    fn codec() -> Arc<Codec> {
        Arc::new(Codec::new("secret").unwrap())
    }

    fn frame(codec: &Codec, destination: &Destination, receiver: &Receiver, payload: &[u8]) -> Vec<u8> {
        codec
            .encode(&Sender::new("svc", "i1"), destination, receiver, payload)
            .unwrap()
            .to_vec()
    }

    async fn run_stream(
        bodies: Vec<Vec<u8>>,
        codec: Arc<Codec>,
        registry: Registry,
        acked: Arc<AtomicUsize>,
    ) {
        let deliveries: Vec<_> = bodies
            .into_iter()
            .map(|body| (body, TestAcker { acked: acked.clone() }))
            .collect();
        let (drained_tx, drained_rx) = oneshot::channel();

        run(
            futures::stream::iter(deliveries),
            codec,
            Arc::new(registry),
            "test",
            drained_tx,
        )
        .await;

        drained_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_invoked_once_with_exact_frame() {
        let codec = codec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx, fail: false }));

        let acked = Arc::new(AtomicUsize::new(0));
        let destination = Destination::unicast("svc", "i1", "echo");
        let body = frame(&codec, &destination, &Receiver::default(), br#"{"x":1}"#);

        run_stream(vec![body], codec, registry, acked.clone()).await;

        let (sender, payload) = rx.recv().await.unwrap();
        assert_eq!(sender, Sender::new("svc", "i1"));
        assert_eq!(&payload[..], br#"{"x":1}"#);
        assert!(rx.try_recv().is_err());
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_proxy_precedence_over_handler() {
        let codec = codec();
        let (handler_tx, mut handler_rx) = mpsc::unbounded_channel();
        let (upstream_tx, mut upstream_rx) = mpsc::unbounded_channel();

        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx: handler_tx, fail: false }));
        registry.set_upstream("bridge", Arc::new(RecordingUpstream { tx: upstream_tx }));

        let destination = Destination::unicast("svc", "i1", "echo");
        let receiver = Receiver::group("proxy", "bridge");
        let acked = Arc::new(AtomicUsize::new(0));
        let body = frame(&codec, &destination, &receiver, b"fwd");

        run_stream(vec![body], codec, registry, acked.clone()).await;

        let (sender, forwarded, payload) = upstream_rx.recv().await.unwrap();
        assert_eq!(sender, Sender::new("svc", "i1"));
        assert_eq!(forwarded.handler, "echo");
        assert_eq!(&payload[..], b"fwd");
        assert!(handler_rx.try_recv().is_err());
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_routing_miss_is_non_fatal() {
        let codec = codec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx, fail: false }));

        let acked = Arc::new(AtomicUsize::new(0));
        let miss = frame(
            &codec,
            &Destination::unicast("svc", "i1", "unknown"),
            &Receiver::default(),
            b"lost",
        );
        let hit = frame(
            &codec,
            &Destination::unicast("svc", "i1", "echo"),
            &Receiver::default(),
            b"kept",
        );

        run_stream(vec![miss, hit], codec, registry, acked.clone()).await;

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(&payload[..], b"kept");
        assert_eq!(acked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upstream_miss_acks_and_drops() {
        let codec = codec();
        let registry = Registry::default();
        let acked = Arc::new(AtomicUsize::new(0));

        let body = frame(
            &codec,
            &Destination::unicast("svc", "i1", "echo"),
            &Receiver::group("proxy", "unregistered"),
            b"lost",
        );

        run_stream(vec![body], codec, registry, acked.clone()).await;
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_delivery_acked_without_invocation() {
        let codec = codec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx, fail: false }));

        let acked = Arc::new(AtomicUsize::new(0));
        run_stream(vec![b"garbage".to_vec()], codec, registry, acked.clone()).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_token_acked_without_invocation() {
        let codec = codec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx, fail: false }));

        let other = Codec::new("other-token").unwrap();
        let body = frame(
            &other,
            &Destination::unicast("svc", "i1", "echo"),
            &Receiver::default(),
            b"forged",
        );

        let acked = Arc::new(AtomicUsize::new(0));
        run_stream(vec![body], codec, registry, acked.clone()).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_still_acks() {
        let codec = codec();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::default();
        registry.set_handler("echo", Arc::new(RecordingHandler { tx, fail: true }));

        let acked = Arc::new(AtomicUsize::new(0));
        let body = frame(
            &codec,
            &Destination::unicast("svc", "i1", "echo"),
            &Receiver::default(),
            b"doomed",
        );

        run_stream(vec![body], codec, registry, acked.clone()).await;

        assert!(rx.recv().await.is_some());
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_callbacks() {
        let codec = codec();
        let release = Arc::new(Notify::new());
        let mut registry = Registry::default();
        registry.set_handler("slow", Arc::new(BlockingHandler { release: release.clone() }));

        let acked = Arc::new(AtomicUsize::new(0));
        let bodies: Vec<_> = (0..3)
            .map(|_| {
                (
                    frame(
                        &codec,
                        &Destination::unicast("svc", "i1", "slow"),
                        &Receiver::default(),
                        b"work",
                    ),
                    TestAcker { acked: acked.clone() },
                )
            })
            .collect();

        let (drained_tx, mut drained_rx) = oneshot::channel();
        let loop_task = tokio::spawn(run(
            futures::stream::iter(bodies),
            codec,
            Arc::new(registry),
            "test",
            drained_tx,
        ));

        // The stream is exhausted but all three callbacks are parked, so
        // the drain signal must not fire yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drained_rx.try_recv().is_err());
        assert_eq!(acked.load(Ordering::SeqCst), 0);

        release.notify_waiters();
        tokio::time::timeout(Duration::from_secs(5), &mut drained_rx)
            .await
            .expect("drain timed out")
            .unwrap();
        assert_eq!(acked.load(Ordering::SeqCst), 3);

        loop_task.await.unwrap();
    }
}
