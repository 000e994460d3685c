//! Order-plan data model and the deterministic evaluator (C6, spec §4.6).

use crate::core::AppError;
use crate::exchange::ExchangeSegment;
use crate::registry::SubscriptionRegistry;
use crate::store::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Created,
    EntryTriggered,
    ExitTriggered,
    Executed,
    Cancelled,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlan {
    pub id: String,
    pub symbol: String,
    pub token: i64,
    pub exchange: ExchangeSegment,
    pub transaction_type: TransactionType,
    pub entry_price: f64,
    pub exit_price: f64,
    pub status: PlanStatus,
    pub current_price: f64,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Narrow interface the core reads/writes order plans through. The HTTP CRUD
/// API that originates plan rows lives outside this crate; this trait is the
/// only door the core has into that store (spec §4.9, §1 "out of scope").
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn fetch(&self, plan_id: &str) -> Result<Option<OrderPlan>, AppError>;
    async fn fetch_all(&self) -> Result<Vec<OrderPlan>, AppError>;
    async fn update_status(
        &self,
        plan_id: &str,
        status: PlanStatus,
        current_price: f64,
        last_updated: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

/// Computes the next status for `plan` given the latest traded price (§4.6).
///
/// Pure and side-effect free; callers persist and publish the result.
pub fn next_status(plan_status: PlanStatus, transaction_type: TransactionType, price: f64, entry: f64, exit: f64) -> PlanStatus {
    if plan_status.is_terminal() {
        return plan_status;
    }

    match transaction_type {
        TransactionType::Buy => {
            if matches!(plan_status, PlanStatus::Created | PlanStatus::EntryTriggered) && price >= exit {
                return PlanStatus::ExitTriggered;
            }
            if plan_status == PlanStatus::Created && price <= entry {
                return PlanStatus::EntryTriggered;
            }
        }
        TransactionType::Sell => {
            if matches!(plan_status, PlanStatus::Created | PlanStatus::EntryTriggered) && price <= exit {
                return PlanStatus::ExitTriggered;
            }
            if plan_status == PlanStatus::Created && price >= entry {
                return PlanStatus::EntryTriggered;
            }
        }
    }

    plan_status
}

pub struct OrderPlanEvaluator {
    store: Arc<dyn PlanStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<SubscriptionRegistry>,
}

impl OrderPlanEvaluator {
    pub fn new(store: Arc<dyn PlanStore>, bus: Arc<dyn EventBus>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { store, bus, registry }
    }

    /// Evaluate one plan against the latest traded price and persist/publish
    /// the result. A "plan not found" drops the binding from the Registry
    /// instead of treating it as an error (§4.6, §7 error kind 4).
    pub async fn evaluate(&self, plan_id: &str, last_price: f64) {
        let plan = match self.store.fetch(plan_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(plan_id, "order plan referenced by registry but absent in store; unsubscribing");
                self.registry.remove(plan_id);
                return;
            }
            Err(e) => {
                warn!(plan_id, error = %e, "plan store fetch failed; skipping this tick");
                return;
            }
        };

        let now = Utc::now();
        let new_status = next_status(plan.status, plan.transaction_type, last_price, plan.entry_price, plan.exit_price);

        match self.store.update_status(plan_id, new_status, last_price, now).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(plan_id, "order plan disappeared mid-update; unsubscribing");
                self.registry.remove(plan_id);
                return;
            }
            Err(e) => {
                // Write failure does not unsubscribe (§4.6).
                warn!(plan_id, error = %e, "failed to persist order plan transition");
                return;
            }
        }

        if new_status == plan.status {
            return;
        }

        let payload = json!({
            "id": plan_id,
            "symbol": plan.symbol,
            "status": new_status,
            "previous_status": plan.status,
            "current_price": last_price,
            "last_updated": now,
        });
        if let Err(e) = self.bus.publish(&format!("orderplan:update:{plan_id}"), &payload).await {
            warn!(plan_id, error = %e, "failed to publish order plan transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_entry_then_exit() {
        let s = next_status(PlanStatus::Created, TransactionType::Buy, 99.50, 100.00, 110.00);
        assert_eq!(s, PlanStatus::EntryTriggered);

        let s = next_status(PlanStatus::EntryTriggered, TransactionType::Buy, 110.00, 100.00, 110.00);
        assert_eq!(s, PlanStatus::ExitTriggered);
    }

    #[test]
    fn sell_entry_then_exit() {
        let s = next_status(PlanStatus::Created, TransactionType::Sell, 120.00, 110.00, 100.00);
        assert_eq!(s, PlanStatus::EntryTriggered);

        let s = next_status(PlanStatus::EntryTriggered, TransactionType::Sell, 99.00, 110.00, 100.00);
        assert_eq!(s, PlanStatus::ExitTriggered);
    }

    #[test]
    fn buy_can_exit_directly_from_created() {
        // P >= exit from CREATED should jump straight to EXIT_TRIGGERED.
        let s = next_status(PlanStatus::Created, TransactionType::Buy, 111.00, 100.00, 110.00);
        assert_eq!(s, PlanStatus::ExitTriggered);
    }

    #[test]
    fn terminal_statuses_never_move() {
        for terminal in [PlanStatus::Executed, PlanStatus::Cancelled, PlanStatus::Failed] {
            let s = next_status(terminal, TransactionType::Buy, 0.0, 100.0, 110.0);
            assert_eq!(s, terminal);
        }
    }

    #[test]
    fn price_between_entry_and_exit_is_a_noop() {
        let s = next_status(PlanStatus::Created, TransactionType::Buy, 105.00, 100.00, 110.00);
        assert_eq!(s, PlanStatus::Created);
    }
}
