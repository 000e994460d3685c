//! Postgres-backed `PlanStore` (C9, spec §4.9).
//!
//! Free functions over `&Db` plus prepared-statement queries, same shape as
//! the teacher's `dao` modules (see `dao::profile_dao`), wrapped in a thin
//! struct so it can be handed around as `Arc<dyn PlanStore>`.

use crate::core::AppError;
use crate::db::Db;
use crate::evaluator::{OrderPlan, PlanStatus, PlanStore, TransactionType};
use crate::exchange;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_postgres::Row;

pub struct PostgresPlanStore {
    db: Arc<Db>,
}

impl PostgresPlanStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

fn row_to_plan(row: &Row) -> OrderPlan {
    let exchange_str: String = row.get("exchange");
    OrderPlan {
        id: row.get("id"),
        symbol: row.get("symbol"),
        token: row.get("token"),
        exchange: exchange::detect(&exchange_str),
        transaction_type: match row.get::<_, String>("transaction_type").as_str() {
            "SELL" => TransactionType::Sell,
            _ => TransactionType::Buy,
        },
        entry_price: row.get("entry_price"),
        exit_price: row.get("exit_price"),
        status: match row.get::<_, String>("status").as_str() {
            "ENTRY_TRIGGERED" => PlanStatus::EntryTriggered,
            "EXIT_TRIGGERED" => PlanStatus::ExitTriggered,
            "EXECUTED" => PlanStatus::Executed,
            "CANCELLED" => PlanStatus::Cancelled,
            "FAILED" => PlanStatus::Failed,
            _ => PlanStatus::Created,
        },
        current_price: row.get("current_price"),
        last_updated: row.get("last_updated"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl PlanStore for PostgresPlanStore {
    async fn fetch(&self, plan_id: &str) -> Result<Option<OrderPlan>, AppError> {
        let row = self
            .db
            .client()
            .query_opt(
                "SELECT id, symbol, token, exchange, transaction_type, entry_price, exit_price, \
                 status, current_price, last_updated, created_at \
                 FROM trade.order_plan WHERE id = $1",
                &[&plan_id],
            )
            .await?;
        Ok(row.as_ref().map(row_to_plan))
    }

    async fn fetch_all(&self) -> Result<Vec<OrderPlan>, AppError> {
        let rows = self
            .db
            .client()
            .query(
                "SELECT id, symbol, token, exchange, transaction_type, entry_price, exit_price, \
                 status, current_price, last_updated, created_at \
                 FROM trade.order_plan WHERE status NOT IN ('EXECUTED', 'CANCELLED', 'FAILED')",
                &[],
            )
            .await?;
        Ok(rows.iter().map(row_to_plan).collect())
    }

    async fn update_status(
        &self,
        plan_id: &str,
        status: PlanStatus,
        current_price: f64,
        last_updated: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let status_str = match status {
            PlanStatus::Created => "CREATED",
            PlanStatus::EntryTriggered => "ENTRY_TRIGGERED",
            PlanStatus::ExitTriggered => "EXIT_TRIGGERED",
            PlanStatus::Executed => "EXECUTED",
            PlanStatus::Cancelled => "CANCELLED",
            PlanStatus::Failed => "FAILED",
        };
        let n = self
            .db
            .client()
            .execute(
                "UPDATE trade.order_plan SET status = $1, current_price = $2, last_updated = $3 WHERE id = $4",
                &[&status_str, &current_price, &last_updated, &plan_id],
            )
            .await?;
        Ok(n > 0)
    }
}
