//! Per-peer task scheduling
//!
//! A two-level priority queue deciding which block to send to which peer
//! next. The outer level ranks peers: anyone with no pending tasks sinks to
//! the bottom, otherwise the peer with the fewest in-flight sends wins.
//! The inner level ranks one peer's tasks with a pluggable comparator.
//!
//! Both levels are binary heaps that store a back-pointer to each element's
//! position, so priority updates and peer re-ranking are O(log n) in-place
//! operations. Cancellation is lazy: `remove` marks the task and `pop`
//! discards marked tasks when they surface.

use std::collections::{HashMap, HashSet};

use cid::Cid;
use libp2p_identity::PeerId;

use crate::wantlist::Entry;

type TaskId = u64;

/// A scheduled intent to send one block to one peer.
#[derive(Debug, Clone)]
pub struct Task {
    pub key: Cid,
    pub peer: PeerId,
    pub priority: i32,
    seq: TaskId,
    partner_gen: u64,
    trash: bool,
    pos: usize,
}

impl Task {
    /// Monotonic creation order, shared across all peers.
    pub fn created(&self) -> u64 {
        self.seq
    }

    /// Generation of the peer entry this task was popped under; pass it back
    /// to [`PeerTaskQueue::task_done`].
    pub fn generation(&self) -> u64 {
        self.partner_gen
    }
}

/// Returns true when `a` should be served before `b`.
pub type TaskCmp = fn(&Task, &Task) -> bool;

/// Serve tasks strictly in creation order.
pub fn fifo(a: &Task, b: &Task) -> bool {
    a.seq < b.seq
}

/// Respect the requesting peer's declared priority; tasks for different
/// peers fall back to creation order.
pub fn v1(a: &Task, b: &Task) -> bool {
    if a.peer == b.peer {
        if a.priority != b.priority {
            return a.priority > b.priority;
        }
        return a.seq < b.seq;
    }
    fifo(a, b)
}

struct Partner {
    active: usize,
    active_keys: HashSet<Cid>,
    pending: usize,
    seq: u64,
    pos: usize,
    heap: Vec<TaskId>,
}

/// The two-level scheduler. Not internally synchronized; the decision engine
/// guards it with its own mutex.
pub struct PeerTaskQueue {
    cmp: TaskCmp,
    tasks: HashMap<TaskId, Task>,
    ids: HashMap<(PeerId, Cid), TaskId>,
    partners: HashMap<PeerId, Partner>,
    peer_heap: Vec<PeerId>,
    next_task_id: TaskId,
    next_partner_seq: u64,
}

impl PeerTaskQueue {
    pub fn new(cmp: TaskCmp) -> Self {
        Self {
            cmp,
            tasks: HashMap::new(),
            ids: HashMap::new(),
            partners: HashMap::new(),
            peer_heap: Vec::new(),
            next_task_id: 0,
            next_partner_seq: 0,
        }
    }

    /// Schedule `entry` for `to`. A second push for the same `(peer, key)`
    /// only updates the queued task's priority; a push for a key currently
    /// being sent to that peer is dropped.
    pub fn push(&mut self, entry: Entry, to: PeerId) {
        self.ensure_partner(to);

        if let Some(&id) = self.ids.get(&(to, entry.key)) {
            let task = self.tasks.get_mut(&id).expect("task map out of sync");
            if task.trash {
                // A cancelled-but-not-yet-popped task comes back to life.
                task.trash = false;
                let partner = self.partners.get_mut(&to).expect("partner missing");
                partner.pending += 1;
                let pos = partner.pos;
                peer_fix(&mut self.peer_heap, &mut self.partners, pos);
            }
            let task = self.tasks.get_mut(&id).expect("task map out of sync");
            task.priority = entry.priority;
            let pos = task.pos;
            let partner = self.partners.get_mut(&to).expect("partner missing");
            task_fix(&mut partner.heap, &mut self.tasks, self.cmp, pos);
            return;
        }

        let partner = self.partners.get_mut(&to).expect("partner missing");
        if partner.active_keys.contains(&entry.key) {
            return;
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        let pos = partner.heap.len();
        partner.heap.push(id);
        self.tasks.insert(
            id,
            Task {
                key: entry.key,
                peer: to,
                priority: entry.priority,
                seq: id,
                partner_gen: partner.seq,
                trash: false,
                pos,
            },
        );
        self.ids.insert((to, entry.key), id);
        task_sift_up(&mut partner.heap, &mut self.tasks, self.cmp, pos);

        partner.pending += 1;
        let ppos = partner.pos;
        peer_fix(&mut self.peer_heap, &mut self.partners, ppos);
    }

    /// Take the next task to perform. The task's key joins its peer's active
    /// set; call [`PeerTaskQueue::task_done`] once the send completes.
    pub fn pop(&mut self) -> Option<Task> {
        if self.peer_heap.is_empty() {
            return None;
        }
        let peer = self.peer_heap[0];

        let mut out = None;
        loop {
            let id = {
                let partner = self.partners.get_mut(&peer).expect("partner missing");
                if partner.heap.is_empty() {
                    break;
                }
                task_pop_top(&mut partner.heap, &mut self.tasks, self.cmp)
            };
            let task = self.tasks.remove(&id).expect("task map out of sync");
            self.ids.remove(&(peer, task.key));
            if task.trash {
                continue; // discarded by a lazy cancel
            }

            let partner = self.partners.get_mut(&peer).expect("partner missing");
            partner.active_keys.insert(task.key);
            partner.active += 1;
            partner.pending -= 1;
            out = Some(task);
            break;
        }

        // Accounting changed this peer's rank
        let pos = self.partners[&peer].pos;
        peer_fix(&mut self.peer_heap, &mut self.partners, pos);
        out
    }

    /// Lazily cancel the task for `(peer, key)`, if any. The heap entry is
    /// discarded when it reaches the top.
    pub fn remove(&mut self, key: &Cid, peer: PeerId) {
        if let Some(&id) = self.ids.get(&(peer, *key)) {
            let task = self.tasks.get_mut(&id).expect("task map out of sync");
            if !task.trash {
                task.trash = true;
                let partner = self.partners.get_mut(&peer).expect("partner missing");
                partner.pending -= 1;
                let pos = partner.pos;
                peer_fix(&mut self.peer_heap, &mut self.partners, pos);
            }
        }
    }

    /// Mark the in-flight send of `key` to `peer` as finished. `generation`
    /// comes from the popped [`Task`].
    ///
    /// Panics if `peer` has no in-flight sends: completions must pair with
    /// pops. A completion for a peer entry that has since been removed
    /// (disconnect, possibly followed by a reconnect) is a no-op.
    pub fn task_done(&mut self, peer: PeerId, key: &Cid, generation: u64) {
        if let Some(partner) = self.partners.get_mut(&peer) {
            if partner.seq != generation {
                return; // completion outlived the peer entry it was popped under
            }
            partner.active_keys.remove(key);
            assert!(partner.active > 0, "more tasks completed than started");
            partner.active -= 1;
            let pos = partner.pos;
            peer_fix(&mut self.peer_heap, &mut self.partners, pos);
        }
    }

    /// Forget a peer entirely: its queued tasks, its active accounting and
    /// its rank.
    pub fn remove_peer(&mut self, peer: PeerId) {
        if let Some(partner) = self.partners.remove(&peer) {
            for id in partner.heap {
                if let Some(task) = self.tasks.remove(&id) {
                    self.ids.remove(&(peer, task.key));
                }
            }

            let i = partner.pos;
            let last = self.peer_heap.len() - 1;
            self.peer_heap.swap(i, last);
            self.peer_heap.pop();
            if i < self.peer_heap.len() {
                peer_fix(&mut self.peer_heap, &mut self.partners, i);
            }
        }
    }

    /// Number of queued (non-cancelled) tasks for `peer`.
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.partners.get(peer).map_or(0, |p| p.pending)
    }

    /// Number of in-flight sends for `peer`.
    pub fn active(&self, peer: &PeerId) -> usize {
        self.partners.get(peer).map_or(0, |p| p.active)
    }

    /// Whether a live task exists for `(peer, key)`.
    pub fn is_queued(&self, peer: &PeerId, key: &Cid) -> bool {
        self.ids
            .get(&(*peer, *key))
            .and_then(|id| self.tasks.get(id))
            .is_some_and(|t| !t.trash)
    }

    fn ensure_partner(&mut self, peer: PeerId) {
        if !self.partners.contains_key(&peer) {
            let seq = self.next_partner_seq;
            self.next_partner_seq += 1;
            let pos = self.peer_heap.len();
            self.partners.insert(
                peer,
                Partner {
                    active: 0,
                    active_keys: HashSet::new(),
                    pending: 0,
                    seq,
                    pos,
                    heap: Vec::new(),
                },
            );
            self.peer_heap.push(peer);
            peer_sift_up(&mut self.peer_heap, &mut self.partners, pos);
        }
    }
}

/// Outer ordering: idle peers last, then fewest in-flight sends first,
/// then partner insertion order.
fn peer_before(partners: &HashMap<PeerId, Partner>, a: &PeerId, b: &PeerId) -> bool {
    let pa = &partners[a];
    let pb = &partners[b];
    if pa.pending == 0 && pb.pending == 0 {
        return pa.seq < pb.seq;
    }
    if pa.pending == 0 {
        return false;
    }
    if pb.pending == 0 {
        return true;
    }
    if pa.active != pb.active {
        return pa.active < pb.active;
    }
    pa.seq < pb.seq
}

fn peer_set_pos(partners: &mut HashMap<PeerId, Partner>, heap: &[PeerId], i: usize) {
    if let Some(p) = partners.get_mut(&heap[i]) {
        p.pos = i;
    }
}

fn peer_sift_up(heap: &mut [PeerId], partners: &mut HashMap<PeerId, Partner>, mut i: usize) -> usize {
    while i > 0 {
        let parent = (i - 1) / 2;
        if peer_before(partners, &heap[i], &heap[parent]) {
            heap.swap(i, parent);
            peer_set_pos(partners, heap, i);
            i = parent;
        } else {
            break;
        }
    }
    peer_set_pos(partners, heap, i);
    i
}

fn peer_sift_down(heap: &mut [PeerId], partners: &mut HashMap<PeerId, Partner>, mut i: usize) {
    loop {
        let left = 2 * i + 1;
        let right = left + 1;
        let mut best = i;
        if left < heap.len() && peer_before(partners, &heap[left], &heap[best]) {
            best = left;
        }
        if right < heap.len() && peer_before(partners, &heap[right], &heap[best]) {
            best = right;
        }
        if best == i {
            break;
        }
        heap.swap(i, best);
        peer_set_pos(partners, heap, i);
        i = best;
    }
    peer_set_pos(partners, heap, i);
}

fn peer_fix(heap: &mut [PeerId], partners: &mut HashMap<PeerId, Partner>, i: usize) {
    let i = peer_sift_up(heap, partners, i);
    peer_sift_down(heap, partners, i);
}

fn task_before(tasks: &HashMap<TaskId, Task>, cmp: TaskCmp, a: TaskId, b: TaskId) -> bool {
    cmp(&tasks[&a], &tasks[&b])
}

fn task_set_pos(tasks: &mut HashMap<TaskId, Task>, heap: &[TaskId], i: usize) {
    if let Some(t) = tasks.get_mut(&heap[i]) {
        t.pos = i;
    }
}

fn task_sift_up(heap: &mut [TaskId], tasks: &mut HashMap<TaskId, Task>, cmp: TaskCmp, mut i: usize) -> usize {
    while i > 0 {
        let parent = (i - 1) / 2;
        if task_before(tasks, cmp, heap[i], heap[parent]) {
            heap.swap(i, parent);
            task_set_pos(tasks, heap, i);
            i = parent;
        } else {
            break;
        }
    }
    task_set_pos(tasks, heap, i);
    i
}

fn task_sift_down(heap: &mut [TaskId], tasks: &mut HashMap<TaskId, Task>, cmp: TaskCmp, mut i: usize) {
    loop {
        let left = 2 * i + 1;
        let right = left + 1;
        let mut best = i;
        if left < heap.len() && task_before(tasks, cmp, heap[left], heap[best]) {
            best = left;
        }
        if right < heap.len() && task_before(tasks, cmp, heap[right], heap[best]) {
            best = right;
        }
        if best == i {
            break;
        }
        heap.swap(i, best);
        task_set_pos(tasks, heap, i);
        i = best;
    }
    task_set_pos(tasks, heap, i);
}

fn task_fix(heap: &mut [TaskId], tasks: &mut HashMap<TaskId, Task>, cmp: TaskCmp, i: usize) {
    let i = task_sift_up(heap, tasks, cmp, i);
    task_sift_down(heap, tasks, cmp, i);
}

fn task_pop_top(heap: &mut Vec<TaskId>, tasks: &mut HashMap<TaskId, Task>, cmp: TaskCmp) -> TaskId {
    let last = heap.len() - 1;
    heap.swap(0, last);
    let id = heap.pop().expect("heap not empty");
    if !heap.is_empty() {
        task_set_pos(tasks, heap, 0);
        task_sift_down(heap, tasks, cmp, 0);
    }
    id
}
