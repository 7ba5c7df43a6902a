//! Fair-share admission control for LLM work.
//!
//! Every LLM call in the daemon — chat turns, cron firings, workflow steps —
//! passes through one [`WorkQueue`]. Submissions carry a `submitter key`
//! (peer JID, `cron:<id>`, `wf:<id>`); the queue enforces a global in-flight
//! cap, a per-key waiting cap with fail-fast rejection, and strict FIFO
//! within a key. At most one task per key runs at a time, which is what makes
//! per-correspondent ordering hold end to end. Across keys the dispatcher
//! round-robins over whoever is waiting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The per-key waiting cap is full — the submitter is told immediately.
    #[error("too busy: backlog full for '{0}'")]
    BacklogFull(String),

    /// The queue is draining and no longer admits work.
    #[error("queue is shutting down")]
    Draining,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub in_flight: usize,
    pub waiting: usize,
    pub waiting_keys: usize,
    pub total_processed: u64,
    pub draining: bool,
}

#[derive(Default)]
struct KeyState {
    waiting: VecDeque<u64>,
    running: bool,
}

struct QueueState {
    max_concurrent: usize,
    max_waiting_per_key: usize,
    in_flight: usize,
    draining: bool,
    keys: HashMap<String, KeyState>,
    grants: HashMap<u64, oneshot::Sender<()>>,
    /// Tickets granted a slot whose waiter has not yet woken to claim it.
    /// Lets a cancelled waiter be told apart from a purged one at drop time.
    granted_unclaimed: HashSet<u64>,
    /// Round-robin ring of keys that currently have waiters.
    ring: VecDeque<String>,
    next_ticket: u64,
    total_processed: u64,
}

impl QueueState {
    /// Grant as many waiting tickets as capacity allows, round-robin across
    /// keys. A key with a running task is skipped — FIFO within key depends
    /// on one-at-a-time execution.
    fn dispatch(&mut self) {
        let mut skipped = 0;
        while self.in_flight < self.max_concurrent && !self.ring.is_empty() {
            if skipped > self.ring.len() {
                break; // every remaining key has a running task
            }
            let Some(key) = self.ring.pop_front() else { break };

            let ticket = match self.keys.get_mut(&key) {
                Some(state) if !state.running && !state.waiting.is_empty() => {
                    let ticket = state.waiting.pop_front();
                    state.running = true;
                    ticket
                }
                Some(state) if !state.waiting.is_empty() => {
                    // Running with more queued — keep it in the ring.
                    self.ring.push_back(key);
                    skipped += 1;
                    continue;
                }
                _ => continue,
            };
            let Some(ticket) = ticket else { continue };

            self.in_flight += 1;
            self.granted_unclaimed.insert(ticket);
            let sent = self
                .grants
                .remove(&ticket)
                .map(|tx| tx.send(()).is_ok())
                .unwrap_or(false);
            if !sent {
                // Waiter vanished between enqueue and grant — give the slot
                // straight back.
                self.granted_unclaimed.remove(&ticket);
                self.in_flight -= 1;
                if let Some(state) = self.keys.get_mut(&key) {
                    state.running = false;
                }
            }

            if self.keys.get(&key).is_some_and(|k| !k.waiting.is_empty()) {
                self.ring.push_back(key);
            }
            skipped = 0;
        }
    }

    fn remove_waiting(&mut self, key: &str, ticket: u64) {
        if let Some(state) = self.keys.get_mut(key) {
            state.waiting.retain(|&t| t != ticket);
            if state.waiting.is_empty() && !state.running {
                self.keys.remove(key);
                self.ring.retain(|k| k != key);
            }
        }
    }

    fn release(&mut self, key: &str) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.total_processed += 1;
        if let Some(state) = self.keys.get_mut(key) {
            state.running = false;
            if state.waiting.is_empty() {
                self.keys.remove(key);
                self.ring.retain(|k| k != key);
            }
        }
        self.dispatch();
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    settled: Arc<Notify>,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize, max_waiting_per_key: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                max_concurrent: max_concurrent.max(1),
                max_waiting_per_key: max_waiting_per_key.max(1),
                in_flight: 0,
                draining: false,
                keys: HashMap::new(),
                grants: HashMap::new(),
                granted_unclaimed: HashSet::new(),
                ring: VecDeque::new(),
                next_ticket: 0,
                total_processed: 0,
            })),
            settled: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `task` once a slot for `key` is granted.
    ///
    /// Fails fast with [`QueueError::BacklogFull`] when the key already has
    /// the maximum number of waiters, and with [`QueueError::Draining`] once
    /// shutdown has begun. The slot is released when the task settles, even
    /// if the returned future is dropped mid-run.
    pub async fn submit<F, T>(&self, key: &str, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire_slot(key).await?;
        let out = task.await;
        drop(permit);
        Ok(out)
    }

    /// Cooperative slot sharing: wait for a slot without supplying the work.
    /// The cron scheduler uses this so heavy jobs count against the same
    /// global cap that interactive chat uses.
    pub async fn acquire_slot(&self, key: &str) -> Result<SlotPermit, QueueError> {
        let (ticket, rx) = {
            let mut state = self.lock();
            if state.draining {
                return Err(QueueError::Draining);
            }
            let max_waiting = state.max_waiting_per_key;
            let entry = state.keys.entry(key.to_string()).or_default();
            if entry.waiting.len() >= max_waiting {
                warn!(key, waiting = entry.waiting.len(), "backlog full — rejecting submission");
                return Err(QueueError::BacklogFull(key.to_string()));
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (tx, rx) = oneshot::channel();
            if let Some(entry) = state.keys.get_mut(key) {
                entry.waiting.push_back(ticket);
            }
            state.grants.insert(ticket, tx);
            if !state.ring.iter().any(|k| k == key) {
                state.ring.push_back(key.to_string());
            }
            state.dispatch();
            (ticket, rx)
        };

        // Guard: a waiter dropped before (or racing with) its grant must leave
        // no stale ticket and no leaked slot.
        let mut pending = PendingTicket {
            queue: self.clone(),
            key: key.to_string(),
            ticket,
            claimed: false,
        };

        match rx.await {
            Ok(()) => {
                pending.claimed = true;
                self.lock().granted_unclaimed.remove(&ticket);
                debug!(key, "queue slot granted");
                Ok(SlotPermit { queue: self.clone(), key: key.to_string() })
            }
            Err(_) => Err(QueueError::Draining),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            in_flight: state.in_flight,
            waiting: state.keys.values().map(|k| k.waiting.len()).sum(),
            waiting_keys: state.keys.values().filter(|k| !k.waiting.is_empty()).count(),
            total_processed: state.total_processed,
            draining: state.draining,
        }
    }

    /// Reject every waiter whose key starts with `prefix` (workflow eviction
    /// cleanup — one workflow submits under `wf:<id>:<step>` keys). Running
    /// work is untouched. Returns how many waiters were rejected.
    pub fn purge_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let matching: Vec<String> = state
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        let mut purged = 0;
        for key in matching {
            if let Some(entry) = state.keys.get_mut(&key) {
                let tickets: Vec<u64> = entry.waiting.drain(..).collect();
                purged += tickets.len();
                for ticket in tickets {
                    state.grants.remove(&ticket);
                }
            }
            if state.keys.get(&key).is_some_and(|entry| !entry.running) {
                state.keys.remove(&key);
                state.ring.retain(|k| *k != key);
            }
        }
        purged
    }

    /// Stop admission, reject all waiters, and wait for in-flight tasks to
    /// settle. Returns how many settled within the timeout.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let at_start = {
            let mut state = self.lock();
            state.draining = true;
            // Dropping the grant senders fails every pending `acquire_slot`.
            state.grants.clear();
            for key in state.keys.values_mut() {
                key.waiting.clear();
            }
            state.ring.clear();
            state.in_flight
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            if self.lock().in_flight == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let remaining = self.lock().in_flight;
        at_start.saturating_sub(remaining)
    }
}

/// Cleans up after a waiter that never claimed its slot. If the ticket is
/// still queued it is simply removed; if the grant already happened (the
/// waiter was cancelled between grant and wake-up) the slot is released so
/// capacity cannot leak; if the ticket was purged or drained there is
/// nothing to undo.
struct PendingTicket {
    queue: WorkQueue,
    key: String,
    ticket: u64,
    claimed: bool,
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut state = self.queue.lock();
        if state.grants.remove(&self.ticket).is_some() {
            state.remove_waiting(&self.key, self.ticket);
        } else if state.granted_unclaimed.remove(&self.ticket) {
            state.release(&self.key);
        }
        drop(state);
        self.queue.settled.notify_waiters();
    }
}

/// RAII queue slot. Dropping it releases the slot and wakes the dispatcher.
pub struct SlotPermit {
    queue: WorkQueue,
    key: String,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.queue.lock().release(&self.key);
        self.queue.settled.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_submitted_work_and_counts_it() {
        let queue = WorkQueue::new(2, 3);
        let out = queue.submit("user", async { 41 + 1 }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(queue.stats().total_processed, 1);
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn global_cap_is_never_exceeded() {
        let queue = WorkQueue::new(2, 10);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let queue = queue.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(&format!("key-{i}"), async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {} > cap 2", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn per_key_backlog_fails_fast() {
        let queue = WorkQueue::new(1, 1);

        // Occupy the only slot.
        let _permit = queue.acquire_slot("busy").await.unwrap();
        // One waiter for "user" is allowed…
        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.acquire_slot("user").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // …the second is rejected immediately.
        let err = queue.submit("user", async {}).await.unwrap_err();
        assert_eq!(err, QueueError::BacklogFull("user".to_string()));

        drop(_permit);
        let permit = waiter.await.unwrap().unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn fifo_within_one_key() {
        let queue = WorkQueue::new(1, 8);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit("same-key", async move {
                        order.lock().unwrap().push(i);
                    })
                    .await
                    .unwrap();
            }));
            // Stagger spawns so enqueue order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn drain_rejects_new_work_and_reports_settled() {
        let queue = WorkQueue::new(2, 4);
        let queue2 = queue.clone();
        let long = tokio::spawn(async move {
            queue2
                .submit("peer", async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let drained = queue.drain(Duration::from_secs(1)).await;
        assert_eq!(drained, 1);

        let err = queue.submit("peer", async {}).await.unwrap_err();
        assert_eq!(err, QueueError::Draining);
        long.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slot_permit_release_unblocks_next_key() {
        let queue = WorkQueue::new(1, 2);
        let permit = queue.acquire_slot("cron:1").await.unwrap();
        assert_eq!(queue.stats().in_flight, 1);

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.submit("chat", async { "ok" }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.stats().waiting, 1);

        drop(permit);
        assert_eq!(waiter.await.unwrap().unwrap(), "ok");
    }

    #[tokio::test]
    async fn purge_prefix_rejects_only_matching_waiters() {
        let queue = WorkQueue::new(1, 4);
        let _permit = queue.acquire_slot("busy").await.unwrap();

        let queue_a = queue.clone();
        let waiter_a = tokio::spawn(async move { queue_a.acquire_slot("wf:1").await });
        let queue_b = queue.clone();
        let waiter_b = tokio::spawn(async move { queue_b.acquire_slot("chat").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.purge_prefix("wf:1"), 1);
        assert!(matches!(waiter_a.await.unwrap(), Err(QueueError::Draining)));

        drop(_permit);
        assert!(waiter_b.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_stale_ticket() {
        let queue = WorkQueue::new(1, 2);
        let permit = queue.acquire_slot("a").await.unwrap();

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move { queue2.acquire_slot("b").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.stats().waiting, 0);

        // Capacity is intact: a fresh submission still runs.
        drop(permit);
        assert_eq!(queue.submit("c", async { 1 }).await.unwrap(), 1);
    }
}
