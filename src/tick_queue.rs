//! Bounded per-Connection tick queue (C2/C4, spec §5): "a bounded queue per
//! Connection (default 1024). Overflow drops the oldest tick for that token
//! and logs."
//!
//! A `VecDeque` behind a `std::sync::Mutex`, with a `tokio::sync::Notify` so
//! a small worker pool can all await the same queue without busy-polling —
//! the read loop's `push` is synchronous and never suspends, so a slow
//! Dispatcher never blocks the socket reader.

use crate::decoder::Tick;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;

pub struct TickQueue {
    label: &'static str,
    capacity: usize,
    inner: Mutex<VecDeque<Tick>>,
    notify: Notify,
}

impl TickQueue {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        Self {
            label,
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Enqueues a tick off the Connection's read loop. Never suspends.
    ///
    /// At capacity, evicts the oldest queued tick for the same token so the
    /// freshest state for that token is kept; if no queued tick shares the
    /// token, falls back to evicting the globally oldest entry so the queue
    /// never grows past `capacity`.
    pub fn push(&self, tick: Tick) {
        let mut q = self.inner.lock().expect("tick queue mutex poisoned");
        if q.len() >= self.capacity {
            let token = tick.token();
            if let Some(pos) = q.iter().position(|queued| queued.token() == token) {
                q.remove(pos);
                warn!(mode = self.label, token, "tick queue full; dropped oldest queued tick for this token");
            } else if let Some(dropped) = q.pop_front() {
                warn!(
                    mode = self.label,
                    token,
                    dropped_token = dropped.token(),
                    "tick queue full; no queued tick shares this token, dropped globally oldest tick"
                );
            }
        }
        q.push_back(tick);
        drop(q);
        self.notify.notify_one();
    }

    /// Pops the oldest queued tick, waiting if the queue is empty.
    ///
    /// Safe to call from several concurrent workers: the `Notified` future is
    /// armed before the queue is inspected, so a `push` racing a waiter can
    /// never be missed between the check and the wait.
    pub async fn pop(&self) -> Tick {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.inner.lock().expect("tick queue mutex poisoned");
                if let Some(tick) = q.pop_front() {
                    return tick;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("tick queue mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::LtpTick;
    use crate::exchange::ExchangeSegment;
    use std::sync::Arc;
    use std::time::Duration;

    fn tick(token: i64, price: f64) -> Tick {
        Tick::Ltp(LtpTick {
            token,
            exchange: ExchangeSegment::NseCm,
            sequence: 0,
            exchange_timestamp_ms: 0,
            last_price: price,
        })
    }

    #[test]
    fn overflow_drops_oldest_tick_for_the_same_token_not_the_incoming_one() {
        let q = TickQueue::new("test", 2);
        q.push(tick(101, 1.0));
        q.push(tick(101, 2.0));
        // Both slots hold token 101; a third arrival for 101 must evict the
        // older 101 entry and keep itself, not the other way round.
        q.push(tick(101, 3.0));

        assert_eq!(q.len(), 2);
        let inner = q.inner.lock().unwrap();
        let prices: Vec<f64> = inner.iter().map(|t| t.last_price()).collect();
        assert_eq!(prices, vec![2.0, 3.0]);
    }

    #[test]
    fn overflow_without_a_same_token_match_drops_globally_oldest() {
        let q = TickQueue::new("test", 2);
        q.push(tick(101, 1.0));
        q.push(tick(202, 2.0));
        q.push(tick(303, 3.0));

        let inner = q.inner.lock().unwrap();
        let tokens: Vec<i64> = inner.iter().map(|t| t.token()).collect();
        assert_eq!(tokens, vec![202, 303]);
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let q = Arc::new(TickQueue::new("test", 4));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(tick(101, 5.0));
        let received = handle.await.unwrap();
        assert_eq!(received.token(), 101);
    }
}
