//! Feed Manager (C4, spec §4.4): owns both upstream Connections, serialises
//! every Registry mutation through one control loop, and pumps decoded
//! ticks to the Dispatcher.

use crate::connection::session::SessionIssuer;
use crate::connection::{Connection, ConnectionHandle, ConnectionState, FeedCommand};
use crate::core::AppConfig;
use crate::dispatcher::TickDispatcher;
use crate::evaluator::PlanStore;
use crate::exchange::ExchangeSegment;
use crate::registry::SubscriptionRegistry;
use crate::tick_queue::TickQueue;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TICK_QUEUE_CAPACITY: usize = 1024;

/// Worker pool size for Dispatcher+Evaluator work (§5: "small, bounded, e.g. 4").
const WORKER_POOL_SIZE: usize = 4;

/// Read-only handles onto both Connections' state, for the `/healthz` surface
/// (C11, spec §4.11) — cloned out before the handles move into the manager.
#[derive(Clone)]
pub struct FeedHealth {
    pub ltp: watch::Receiver<ConnectionState>,
    pub snap: watch::Receiver<ConnectionState>,
}

/// A Registry mutation request. Control Plane (C7) and startup initial-fill
/// both go through this channel rather than calling `SubscriptionRegistry`
/// directly, so that the mutation and the resulting subscribe/unsubscribe
/// frame are emitted as one atomic step of the control loop (§4.4 "Ordering").
#[derive(Debug, Clone)]
pub enum RegistryMutation {
    Add {
        plan_id: String,
        token: i64,
        symbol: String,
        exchange: ExchangeSegment,
    },
    Remove {
        plan_id: String,
    },
}

pub struct FeedManager {
    registry: Arc<SubscriptionRegistry>,
    plan_store: Arc<dyn PlanStore>,
    dispatcher: Arc<TickDispatcher>,
    ltp_handle: ConnectionHandle,
    snap_handle: ConnectionHandle,
    mutations_rx: mpsc::UnboundedReceiver<RegistryMutation>,
    cancel: CancellationToken,
}

impl FeedManager {
    /// Builds the Feed Manager, spawns both Connections and the shared tick
    /// worker pool, and returns the manager (to be spawned as the control
    /// loop), the mutation sender external callers use, the health handles,
    /// and every `JoinHandle` spawned along the way so the caller can await
    /// them on shutdown (§5 "Cancellation").
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        session_issuer: Arc<dyn SessionIssuer>,
        registry: Arc<SubscriptionRegistry>,
        plan_store: Arc<dyn PlanStore>,
        dispatcher: Arc<TickDispatcher>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedSender<RegistryMutation>, FeedHealth, Vec<JoinHandle<()>>) {
        let ltp_queue = Arc::new(TickQueue::new("ltp", TICK_QUEUE_CAPACITY));
        let snap_queue = Arc::new(TickQueue::new("snapquote", TICK_QUEUE_CAPACITY));

        let (ltp_conn, ltp_handle) = Connection::new(1, config.clone(), session_issuer.clone(), ltp_queue.clone(), cancel.clone());
        let (snap_conn, snap_handle) = Connection::new(3, config, session_issuer, snap_queue.clone(), cancel.clone());

        let mut inner_handles = vec![ltp_conn.spawn(), snap_conn.spawn()];

        for _ in 0..WORKER_POOL_SIZE {
            inner_handles.push(spawn_tick_worker(ltp_queue.clone(), snap_queue.clone(), dispatcher.clone(), cancel.clone()));
        }

        let (mutations_tx, mutations_rx) = mpsc::unbounded_channel();
        let health = FeedHealth {
            ltp: ltp_handle.state.clone(),
            snap: snap_handle.state.clone(),
        };

        let manager = Self {
            registry,
            plan_store,
            dispatcher,
            ltp_handle,
            snap_handle,
            mutations_rx,
            cancel,
        };
        (manager, mutations_tx, health, inner_handles)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Loads every non-terminal plan from the external store and binds it
    /// into the Registry before either Connection reaches READY, so the
    /// first Ready transition flushes a complete batched subscribe (§4.4).
    pub async fn initial_fill(&self) {
        match self.plan_store.fetch_all().await {
            Ok(plans) => {
                let count = plans.len();
                for plan in plans {
                    self.registry.add(plan.id, plan.token, plan.symbol, plan.exchange);
                }
                info!(count, "initial fill from plan store complete");
            }
            Err(e) => {
                warn!(error = %e, "initial fill from plan store failed; starting with an empty registry");
            }
        }
    }

    async fn run(mut self) {
        let mut ltp_state = self.ltp_handle.state.clone();
        let mut snap_state = self.snap_handle.state.clone();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                mutation = self.mutations_rx.recv() => {
                    let Some(mutation) = mutation else { return };
                    self.apply_mutation(mutation);
                }
                Ok(()) = ltp_state.changed() => {
                    if *ltp_state.borrow() == ConnectionState::Ready {
                        self.flush_full_resubscribe(&self.ltp_handle);
                    }
                }
                Ok(()) = snap_state.changed() => {
                    if *snap_state.borrow() == ConnectionState::Ready {
                        self.flush_full_resubscribe(&self.snap_handle);
                    }
                }
            }
        }
    }

    fn apply_mutation(&self, mutation: RegistryMutation) {
        use crate::registry::SubscriptionEffect;

        let (effect, token, exchange) = match mutation {
            RegistryMutation::Add { plan_id, token, symbol, exchange } => {
                (self.registry.add(plan_id, token, symbol, exchange), token, exchange)
            }
            RegistryMutation::Remove { plan_id } => {
                // Capture the binding before releasing it: once `remove`
                // drops the last holder, the Registry no longer knows which
                // token/exchange the unsubscribe frame should name.
                let Some((token, exchange)) = self.registry.token_for_plan(&plan_id) else {
                    return;
                };
                (self.registry.remove(&plan_id), token, exchange)
            }
        };

        let mut snapshot = crate::registry::GroupedSnapshot::new();
        snapshot.insert(exchange, vec![token]);

        match effect {
            SubscriptionEffect::Subscribe => {
                let _ = self.ltp_handle.commands.send(FeedCommand::Subscribe(snapshot.clone()));
                let _ = self.snap_handle.commands.send(FeedCommand::Subscribe(snapshot));
            }
            SubscriptionEffect::Unsubscribe => {
                let _ = self.ltp_handle.commands.send(FeedCommand::Unsubscribe(snapshot.clone()));
                let _ = self.snap_handle.commands.send(FeedCommand::Unsubscribe(snapshot));
            }
            SubscriptionEffect::None => {}
        }
    }

    fn flush_full_resubscribe(&self, handle: &ConnectionHandle) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            return;
        }
        let _ = handle.commands.send(FeedCommand::FullResubscribe(snapshot));
    }
}

/// One worker of the shared Dispatcher+Evaluator pool (§5): pulls from
/// whichever Connection's bounded queue has a tick ready, so the two
/// Connections' I/O-bound dispatch work fans out across the pool instead of
/// being serialized behind a single task per Connection.
fn spawn_tick_worker(
    ltp_queue: Arc<TickQueue>,
    snap_queue: Arc<TickQueue>,
    dispatcher: Arc<TickDispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                tick = ltp_queue.pop() => dispatcher.dispatch(tick).await,
                tick = snap_queue.pop() => dispatcher.dispatch(tick).await,
            }
        }
    })
}
