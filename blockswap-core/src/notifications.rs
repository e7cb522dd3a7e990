//! Block arrival notifications
//!
//! Couples incoming blocks to outstanding local requests. A subscription
//! covers a set of keys and yields each matching block at most once; its
//! stream closes once every key has been delivered, when it is dropped or
//! cancelled, or when the registry shuts down.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use cid::Cid;
use tokio::sync::mpsc;
use tracing::trace;

use crate::block::Block;

/// Identifies a subscription for explicit cancellation.
pub type SubId = u64;

#[derive(Default)]
pub struct Notifications {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    next_id: SubId,
    subs: HashMap<SubId, Subscription>,
    by_key: HashMap<Cid, HashSet<SubId>>,
}

struct Subscription {
    tx: mpsc::Sender<Block>,
    remaining: HashSet<Cid>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `keys`. The returned receiver yields each
    /// requested block as it arrives and closes once all have been
    /// delivered. An empty key set (or a shut-down registry) yields a
    /// receiver that is closed from the start.
    pub fn subscribe(&self, keys: &[Cid]) -> (SubId, mpsc::Receiver<Block>) {
        let unique: HashSet<Cid> = keys.iter().copied().collect();
        // Each key is delivered at most once, so sizing the channel to the
        // key count means publish never blocks on a live subscriber.
        let (tx, rx) = mpsc::channel(unique.len().max(1));

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;

        if state.closed || unique.is_empty() {
            // Dropping tx closes rx immediately.
            return (id, rx);
        }

        for key in &unique {
            state.by_key.entry(*key).or_default().insert(id);
        }
        state.subs.insert(
            id,
            Subscription {
                tx,
                remaining: unique,
            },
        );

        (id, rx)
    }

    /// Deliver a block to every live subscription waiting on its key.
    pub fn publish(&self, block: &Block) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }

        let Some(ids) = state.by_key.remove(&block.cid) else {
            return;
        };

        for id in ids {
            let finished = match state.subs.get_mut(&id) {
                Some(sub) => {
                    sub.remaining.remove(&block.cid);
                    // A full channel cannot happen (sized to the key count);
                    // a closed one means the waiter already went away.
                    let gone = sub.tx.try_send(block.clone()).is_err();
                    gone || sub.remaining.is_empty()
                }
                None => continue,
            };

            if finished {
                trace!(sub = id, cid = %block.cid, "subscription complete");
                remove_sub(&mut state, id);
            }
        }
    }

    /// Drop a subscription before it completes. No-op if already finished.
    pub fn unsubscribe(&self, id: SubId) {
        let mut state = self.state.lock().unwrap();
        remove_sub(&mut state, id);
    }

    /// Close every open subscription and refuse new ones.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.subs.clear();
        state.by_key.clear();
    }

    #[cfg(test)]
    fn live_subs(&self) -> usize {
        self.state.lock().unwrap().subs.len()
    }
}

fn remove_sub(state: &mut State, id: SubId) {
    if let Some(sub) = state.subs.remove(&id) {
        for key in sub.remaining {
            if let Some(ids) = state.by_key.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    state.by_key.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u8) -> Block {
        Block::new(vec![n; 4]).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_then_publish() {
        let notif = Notifications::new();
        let b = block(1);

        let (_, mut rx) = notif.subscribe(&[b.cid]);
        notif.publish(&b);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, b);

        // All keys delivered: stream closes
        assert!(rx.recv().await.is_none());
        assert_eq!(notif.live_subs(), 0);
    }

    #[tokio::test]
    async fn test_publish_delivers_once() {
        let notif = Notifications::new();
        let b = block(1);

        let (_, mut rx) = notif.subscribe(&[b.cid]);
        notif.publish(&b);
        notif.publish(&b);

        assert_eq!(rx.recv().await.unwrap(), b);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_keys() {
        let notif = Notifications::new();
        let b1 = block(1);
        let b2 = block(2);

        let (_, mut rx) = notif.subscribe(&[b1.cid, b2.cid]);
        notif.publish(&b2);
        notif.publish(&b1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, b2);
        assert_eq!(second, b1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let notif = Notifications::new();
        let b = block(1);

        let (_, mut rx1) = notif.subscribe(&[b.cid]);
        let (_, mut rx2) = notif.subscribe(&[b.cid]);
        notif.publish(&b);

        assert_eq!(rx1.recv().await.unwrap(), b);
        assert_eq!(rx2.recv().await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_empty_keys_closed_immediately() {
        let notif = Notifications::new();
        let (_, mut rx) = notif.subscribe(&[]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let notif = Notifications::new();
        let b = block(1);

        let (id, mut rx) = notif.subscribe(&[b.cid]);
        notif.unsubscribe(id);

        assert!(rx.recv().await.is_none());
        notif.publish(&b); // must not panic or deliver
        assert_eq!(notif.live_subs(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let notif = Notifications::new();
        let b1 = block(1);
        let b2 = block(2);

        let (_, rx) = notif.subscribe(&[b1.cid, b2.cid]);
        drop(rx);

        // First publish after the drop notices the dead waiter
        notif.publish(&b1);
        assert_eq!(notif.live_subs(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams() {
        let notif = Notifications::new();
        let b = block(1);

        let (_, mut rx) = notif.subscribe(&[b.cid]);
        notif.shutdown();

        assert!(rx.recv().await.is_none());

        // New subscriptions after shutdown are closed from the start
        let (_, mut rx) = notif.subscribe(&[b.cid]);
        assert!(rx.recv().await.is_none());
    }
}
