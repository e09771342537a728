//! Connection lifecycle state machine.
//!
//! One event loop runs per `Rpc` instance, reacting to connect, reconnect
//! and halt signals. Dials run as independent tasks and report back into
//! the loop through the signal channel, so at most one dial is in flight
//! at a time. A monotonically increasing attempt counter bounds the
//! total number of dials; hitting the ceiling stops the listener for
//! good.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use lapin::{acker::Acker, Connection, ConnectionProperties, Consumer};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::RpcConfig;
use crate::dispatch;
use crate::topology::{Topology, TopologyPlan};
use crate::types::{Identity, Registry, State};

/// Cross-task signals driving the lifecycle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Dial now. Sent by `listen()` and by the close watcher.
    Connect,
    /// Dial after the backoff interval. Sent by a failed dial or failed
    /// topology setup.
    Reconnect,
    /// Terminate the loop. Sent by `shutdown()`.
    Halt,
}

/// State shared between the lifecycle loop, dial tasks, and the public
/// `Rpc` surface.
pub(crate) struct Shared {
    /// True from `listen()` until shutdown or attempt exhaustion. An
    /// expected closure (explicit shutdown) must not re-trigger a dial.
    pub online: AtomicBool,
    pub connection: RwLock<Option<Arc<Connection>>>,
    pub active: Mutex<Option<Active>>,
    pub connected_tx: watch::Sender<bool>,
    pub state_tx: watch::Sender<State>,
}

/// Live topology plus the drain receivers shutdown waits on.
pub(crate) struct Active {
    pub topology: Topology,
    pub drained: Vec<oneshot::Receiver<()>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            connection: RwLock::new(None),
            active: Mutex::new(None),
            connected_tx: watch::channel(false).0,
            state_tx: watch::channel(State::Disconnected).0,
        }
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state_tx.send_replace(state);
    }
}

/// Everything a lifecycle loop and its dial tasks need.
#[derive(Clone)]
pub(crate) struct LoopCtx {
    pub identity: Identity,
    pub config: RpcConfig,
    pub codec: Arc<Codec>,
    pub registry: Arc<Registry>,
    pub shared: Arc<Shared>,
    pub tx: mpsc::UnboundedSender<Signal>,
}

/// Run the lifecycle event loop until halted or exhausted.
pub(crate) async fn run(ctx: LoopCtx, mut rx: mpsc::UnboundedReceiver<Signal>) {
    let mut attempt: u32 = 0;

    while let Some(signal) = rx.recv().await {
        match signal {
            Signal::Connect => {
                if !begin_dial(&ctx, &mut attempt) {
                    break;
                }
            }
            Signal::Reconnect => {
                if !ctx.shared.online.load(Ordering::SeqCst) {
                    info!(app = %ctx.identity.name, "Offline, not reconnecting");
                    break;
                }
                ctx.shared.set_state(State::Reconnecting);
                tokio::time::sleep(Duration::from_millis(ctx.config.backoff_ms)).await;
                if !begin_dial(&ctx, &mut attempt) {
                    break;
                }
            }
            Signal::Halt => {
                debug!(app = %ctx.identity.name, "Lifecycle loop halted");
                break;
            }
        }
    }
}

/// Check the attempt ceiling and spawn a dial task. Returns false when
/// the loop should stop listening.
fn begin_dial(ctx: &LoopCtx, attempt: &mut u32) -> bool {
    if !ctx.shared.online.load(Ordering::SeqCst) {
        info!(app = %ctx.identity.name, "Offline, not connecting");
        return false;
    }

    if *attempt >= ctx.config.max_attempts {
        error!(
            app = %ctx.identity.name,
            attempts = *attempt,
            "Reconnect attempt limit reached, giving up"
        );
        ctx.shared.online.store(false, Ordering::SeqCst);
        ctx.shared.set_state(State::Disconnected);
        return false;
    }

    *attempt += 1;
    ctx.shared.set_state(State::Connecting);
    info!(app = %ctx.identity.name, attempt = *attempt, "Connecting to broker");
    tokio::spawn(dial(ctx.clone()));

    true
}

/// Dial the broker, set up topology, and start the dispatch loops.
///
/// Failures report back to the lifecycle loop as a reconnect signal and
/// never mutate loop state directly.
async fn dial(ctx: LoopCtx) {
    let uri = ctx.config.resolve_uri();

    let conn = match Connection::connect(&uri, ConnectionProperties::default()).await {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            error!(app = %ctx.identity.name, error = %e, "Dial failed");
            let _ = ctx.tx.send(Signal::Reconnect);
            return;
        }
    };

    // Unexpected closure re-enters the connect state; an expected one
    // (online already flipped off) is ignored.
    {
        let shared = Arc::clone(&ctx.shared);
        let tx = ctx.tx.clone();
        let app = ctx.identity.name.clone();
        conn.on_error(move |e| {
            if shared.online.load(Ordering::SeqCst) {
                warn!(app = %app, error = %e, "Connection closed unexpectedly, reconnecting");
                shared.connected_tx.send_replace(false);
                let _ = tx.send(Signal::Connect);
            }
        });
    }

    let plan = TopologyPlan::new(&ctx.identity.name, &ctx.identity.instance);
    let (topology, direct, topic) = match Topology::establish(&conn, plan, ctx.config.prefetch).await
    {
        Ok(established) => established,
        Err(e) => {
            error!(app = %ctx.identity.name, error = %e, "Topology setup failed");
            let _ = ctx.tx.send(Signal::Reconnect);
            return;
        }
    };

    ctx.shared.set_state(State::Subscribed);

    let (direct_drained_tx, direct_drained_rx) = oneshot::channel();
    let (topic_drained_tx, topic_drained_rx) = oneshot::channel();
    tokio::spawn(dispatch::run(
        deliveries(direct),
        Arc::clone(&ctx.codec),
        Arc::clone(&ctx.registry),
        "direct",
        direct_drained_tx,
    ));
    tokio::spawn(dispatch::run(
        deliveries(topic),
        Arc::clone(&ctx.codec),
        Arc::clone(&ctx.registry),
        "topic",
        topic_drained_tx,
    ));

    *ctx.shared.connection.write().await = Some(Arc::clone(&conn));
    *ctx.shared.active.lock().await = Some(Active {
        topology,
        drained: vec![direct_drained_rx, topic_drained_rx],
    });

    ctx.shared.connected_tx.send_replace(true);
    ctx.shared.set_state(State::Connected);
    info!(app = %ctx.identity.name, instance = %ctx.identity.instance, "Connected");
}

/// Adapt a lapin consumer into the dispatch loop's delivery stream.
/// Transport-level stream errors are logged and skipped.
fn deliveries(consumer: Consumer) -> impl Stream<Item = (Vec<u8>, Acker)> + Send {
    consumer.filter_map(|delivery| async move {
        match delivery {
            Ok(d) => Some((d.data, d.acker)),
            Err(e) => {
                error!(error = %e, "Consumer stream error");
                None
            }
        }
    })
}
