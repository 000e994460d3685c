//! Subscription registry (C3, spec §4.3): authoritative
//! `token -> {plan-ids, exchange, symbol}` map with a `symbol <-> token` index.
//!
//! Single mutex, short non-blocking operations, single-writer (the Feed
//! Manager's control loop). Side-effects (subscribe/unsubscribe) are
//! returned as values rather than invoked while holding the lock.

use crate::exchange::ExchangeSegment;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub type PlanId = String;
pub type Token = i64;

#[derive(Debug, Clone)]
struct TokenEntry {
    plan_ids: HashSet<PlanId>,
    exchange: ExchangeSegment,
    symbol: String,
}

/// Side-effect the caller must act on after a registry mutation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEffect {
    Subscribe,
    Unsubscribe,
    /// The registry state didn't change (e.g. removing a plan that wasn't
    /// the last holder of its token).
    None,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_token: HashMap<Token, TokenEntry>,
    token_by_plan: HashMap<PlanId, Token>,
}

/// Grouped view suitable for composing a vendor subscribe/unsubscribe frame.
pub type GroupedSnapshot = HashMap<ExchangeSegment, Vec<Token>>;

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `plan_id` to `token`. Returns the effect the caller should act
    /// on: `Subscribe` the first time this token is seen, `None` otherwise.
    ///
    /// If the plan was previously bound to a different token, that binding
    /// is released first (a plan-id appears in at most one token's set).
    pub fn add(&self, plan_id: PlanId, token: Token, symbol: String, exchange: ExchangeSegment) -> SubscriptionEffect {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");

        if let Some(prev_token) = inner.token_by_plan.get(&plan_id).copied() {
            if prev_token == token {
                // Already bound to this token; nothing to do.
                return SubscriptionEffect::None;
            }
            release_plan_from_token(&mut inner.by_token, &plan_id, prev_token);
        }

        inner.token_by_plan.insert(plan_id.clone(), token);
        let entry = inner.by_token.entry(token);
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                o.get_mut().plan_ids.insert(plan_id);
                SubscriptionEffect::None
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                let mut plan_ids = HashSet::new();
                plan_ids.insert(plan_id);
                v.insert(TokenEntry {
                    plan_ids,
                    exchange,
                    symbol,
                });
                SubscriptionEffect::Subscribe
            }
        }
    }

    /// Removes `plan_id` from whatever token it's bound to. Returns the
    /// effect: `Unsubscribe` if this was the last holder of its token.
    pub fn remove(&self, plan_id: &str) -> SubscriptionEffect {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let Some(token) = inner.token_by_plan.remove(plan_id) else {
            return SubscriptionEffect::None;
        };
        release_plan_from_token(&mut inner.by_token, plan_id, token)
    }

    /// Plan-ids currently bound to `token`, for dispatch to the Evaluator.
    pub fn plans_for_token(&self, token: Token) -> Vec<PlanId> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .by_token
            .get(&token)
            .map(|e| e.plan_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn symbol_for_token(&self, token: Token) -> Option<String> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_token.get(&token).map(|e| e.symbol.clone())
    }

    /// Looks up the token + exchange a plan is currently bound to, without
    /// mutating anything. Callers that need to compose an unsubscribe frame
    /// after `remove()` has already released the binding should capture this
    /// beforehand.
    pub fn token_for_plan(&self, plan_id: &str) -> Option<(Token, ExchangeSegment)> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let token = *inner.token_by_plan.get(plan_id)?;
        let exchange = inner.by_token.get(&token)?.exchange;
        Some((token, exchange))
    }

    /// Grouped view of every currently-registered token, for composing a
    /// full resubscribe frame.
    pub fn snapshot(&self) -> GroupedSnapshot {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let mut grouped: GroupedSnapshot = HashMap::new();
        for (token, entry) in inner.by_token.iter() {
            grouped.entry(entry.exchange).or_default().push(*token);
        }
        grouped
    }

    pub fn token_count(&self) -> usize {
        self.inner.lock().expect("registry mutex poisoned").by_token.len()
    }

    pub fn contains_token(&self, token: Token) -> bool {
        self.inner.lock().expect("registry mutex poisoned").by_token.contains_key(&token)
    }
}

fn release_plan_from_token(
    by_token: &mut HashMap<Token, TokenEntry>,
    plan_id: &str,
    token: Token,
) -> SubscriptionEffect {
    let Some(entry) = by_token.get_mut(&token) else {
        return SubscriptionEffect::None;
    };
    entry.plan_ids.remove(plan_id);
    if entry.plan_ids.is_empty() {
        by_token.remove(&token);
        SubscriptionEffect::Unsubscribe
    } else {
        SubscriptionEffect::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeSegment;

    #[test]
    fn first_add_yields_subscribe() {
        let reg = SubscriptionRegistry::new();
        let effect = reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        assert_eq!(effect, SubscriptionEffect::Subscribe);
        assert!(reg.contains_token(101));
    }

    #[test]
    fn second_plan_on_same_token_is_a_noop() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        let effect = reg.add("p2".into(), 101, "X".into(), ExchangeSegment::NseCm);
        assert_eq!(effect, SubscriptionEffect::None);
    }

    #[test]
    fn add_then_remove_is_a_noop_round_trip() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        let effect = reg.remove("p1");
        assert_eq!(effect, SubscriptionEffect::Unsubscribe);
        assert!(!reg.contains_token(101));
        assert_eq!(reg.token_count(), 0);
    }

    #[test]
    fn remove_does_not_unsubscribe_while_other_holders_remain() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        reg.add("p2".into(), 101, "X".into(), ExchangeSegment::NseCm);
        let effect = reg.remove("p1");
        assert_eq!(effect, SubscriptionEffect::None);
        assert!(reg.contains_token(101));
    }

    #[test]
    fn snapshot_groups_by_exchange() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        reg.add("p2".into(), 202, "Y".into(), ExchangeSegment::Mcx);
        let snap = reg.snapshot();
        assert_eq!(snap.get(&ExchangeSegment::NseCm), Some(&vec![101]));
        assert_eq!(snap.get(&ExchangeSegment::Mcx), Some(&vec![202]));
    }

    #[test]
    fn plan_rebinding_moves_from_old_token() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        reg.add("p1".into(), 202, "Y".into(), ExchangeSegment::NseCm);
        assert!(!reg.contains_token(101));
        assert!(reg.contains_token(202));
    }

    #[test]
    fn no_orphan_tokens_invariant() {
        let reg = SubscriptionRegistry::new();
        reg.add("p1".into(), 101, "X".into(), ExchangeSegment::NseCm);
        reg.add("p2".into(), 202, "Y".into(), ExchangeSegment::NseCm);
        reg.remove("p1");
        let snap = reg.snapshot();
        let tokens: Vec<Token> = snap.values().flatten().copied().collect();
        assert_eq!(tokens, vec![202]);
    }
}
