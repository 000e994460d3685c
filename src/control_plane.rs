//! Control Plane (C7, spec §4.7): listens on the external `orderplan:new`
//! and `orderplan:delete` channels and turns them into Registry mutations
//! routed through the Feed Manager's control loop.

use crate::evaluator::PlanStore;
use crate::feed_manager::RegistryMutation;
use crate::store::EventBus;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANNEL_NEW: &str = "orderplan:new";
const CHANNEL_DELETE: &str = "orderplan:delete";

pub struct ControlPlane {
    bus: Arc<dyn EventBus>,
    plan_store: Arc<dyn PlanStore>,
    mutations: mpsc::UnboundedSender<RegistryMutation>,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        bus: Arc<dyn EventBus>,
        plan_store: Arc<dyn PlanStore>,
        mutations: mpsc::UnboundedSender<RegistryMutation>,
        cancel: CancellationToken,
    ) -> Self {
        Self { bus, plan_store, mutations, cancel }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut stream = match self
            .bus
            .subscribe(vec![CHANNEL_NEW.to_string(), CHANNEL_DELETE.to_string()])
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "control plane failed to subscribe; order plan changes will not be picked up");
                return;
            }
        };
        info!(channels = ?[CHANNEL_NEW, CHANNEL_DELETE], "control plane listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                msg = stream.next() => {
                    match msg {
                        Some((channel, payload)) => self.handle_event(&channel, &payload).await,
                        None => {
                            warn!("control plane pub/sub stream ended");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, channel: &str, payload: &str) {
        let plan_id = payload.trim();
        if plan_id.is_empty() {
            debug!(channel, "ignoring malformed order plan event (empty payload)");
            return;
        }

        match channel {
            CHANNEL_NEW => self.handle_new(plan_id).await,
            CHANNEL_DELETE => self.handle_delete(plan_id),
            _ => debug!(channel, "ignoring event on unrecognised channel"),
        }
    }

    async fn handle_new(&self, plan_id: &str) {
        match self.plan_store.fetch(plan_id).await {
            Ok(Some(plan)) => {
                let _ = self.mutations.send(RegistryMutation::Add {
                    plan_id: plan.id,
                    token: plan.token,
                    symbol: plan.symbol,
                    exchange: plan.exchange,
                });
            }
            Ok(None) => {
                debug!(plan_id, "orderplan:new referenced a plan that no longer exists; ignoring");
            }
            Err(e) => {
                warn!(plan_id, error = %e, "failed to fetch order plan for orderplan:new");
            }
        }
    }

    fn handle_delete(&self, plan_id: &str) {
        let _ = self.mutations.send(RegistryMutation::Remove { plan_id: plan_id.to_string() });
    }
}
