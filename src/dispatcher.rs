//! Tick Dispatcher (C5, spec §4.5): writes the latest-price cache, publishes
//! pub/sub updates, and fans each tick out to the Evaluator for every plan
//! bound to its token.

use crate::decoder::Tick;
use crate::evaluator::OrderPlanEvaluator;
use crate::registry::SubscriptionRegistry;
use crate::store::{EventBus, LatestPriceStore};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

pub struct TickDispatcher {
    kv: Arc<dyn LatestPriceStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<SubscriptionRegistry>,
    evaluator: Arc<OrderPlanEvaluator>,
}

impl TickDispatcher {
    pub fn new(
        kv: Arc<dyn LatestPriceStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<SubscriptionRegistry>,
        evaluator: Arc<OrderPlanEvaluator>,
    ) -> Self {
        Self { kv, bus, registry, evaluator }
    }

    pub async fn dispatch(&self, tick: Tick) {
        let token = tick.token();
        let Some(symbol) = self.registry.symbol_for_token(token) else {
            // No plan currently cares about this token (e.g. it just got
            // unsubscribed); still safe to drop the tick silently.
            return;
        };

        let payload = tick_snapshot(&tick, &symbol);

        if let Err(e) = self.kv.set_latest_price(&symbol, &payload).await {
            warn!(symbol, error = %e, "failed to write latest-price");
        }
        if let Err(e) = self.bus.publish(&format!("price:update:{symbol}"), &payload).await {
            warn!(symbol, error = %e, "failed to publish price update");
        }

        if let Some(snap) = tick.snap_quote() {
            let depth_payload = depth_snapshot(snap, &symbol);
            if let Err(e) = self.kv.set_market_depth(&symbol, &depth_payload).await {
                warn!(symbol, error = %e, "failed to write market depth");
            }
            if let Err(e) = self.bus.publish(&format!("marketdepth:update:{symbol}"), &depth_payload).await {
                warn!(symbol, error = %e, "failed to publish market depth update");
            }
        }

        let last_price = tick.last_price();
        for plan_id in self.registry.plans_for_token(token) {
            self.evaluator.evaluate(&plan_id, last_price).await;
        }
    }
}

fn tick_snapshot(tick: &Tick, symbol: &str) -> Value {
    let now = Utc::now();
    let mut v = json!({
        "symbol": symbol,
        "exchange": tick.exchange().as_str(),
        "last_price": tick.last_price(),
        "updated_at": now,
    });

    if let Some(q) = tick.quote() {
        v["last_qty"] = json!(q.last_qty);
        v["avg_price"] = json!(q.avg_price);
        v["volume"] = json!(q.volume);
        v["total_buy_qty"] = json!(q.total_buy_qty);
        v["total_sell_qty"] = json!(q.total_sell_qty);
        v["ohlc"] = json!({
            "open": q.ohlc.open,
            "high": q.ohlc.high,
            "low": q.ohlc.low,
            "close": q.ohlc.close,
        });
    }

    if let Some(snap) = tick.snap_quote() {
        v["open_interest"] = json!(snap.open_interest);
        v["oi_change_pct"] = json!(snap.oi_change_pct);
        v["upper_circuit"] = json!(snap.upper_circuit);
        v["lower_circuit"] = json!(snap.lower_circuit);
        v["week52_high"] = json!(snap.week52_high);
        v["week52_low"] = json!(snap.week52_low);
        v["best_five"] = depth_levels(snap);
    }

    v
}

fn depth_snapshot(snap: &crate::decoder::SnapQuoteTick, symbol: &str) -> Value {
    json!({
        "symbol": symbol,
        "updated_at": Utc::now(),
        "depth": depth_levels(snap),
    })
}

fn depth_levels(snap: &crate::decoder::SnapQuoteTick) -> Value {
    json!({
        "buy": snap.buy_depth.iter().map(|l| l.price).collect::<Vec<_>>(),
        "sell": snap.sell_depth.iter().map(|l| l.price).collect::<Vec<_>>(),
    })
}
