use blockswap_core::block::content_cid;
use blockswap_core::taskqueue::{v1, PeerTaskQueue};
use blockswap_core::wantlist::Entry;
use cid::Cid;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use libp2p_identity::PeerId;

fn keys(n: usize) -> Vec<Cid> {
    (0..n)
        .map(|i| content_cid(&(i as u64).to_be_bytes()).unwrap())
        .collect()
}

/// Benchmark: scheduling throughput for a single requesting peer
fn bench_single_peer(c: &mut Criterion) {
    let keys = keys(1024);

    c.bench_function("push_pop_single_peer_1024", |b| {
        let peer = PeerId::random();
        b.iter(|| {
            let mut q = PeerTaskQueue::new(v1);
            for (i, key) in keys.iter().enumerate() {
                q.push(
                    Entry {
                        key: *key,
                        priority: i as i32,
                    },
                    peer,
                );
            }
            while let Some(task) = q.pop() {
                black_box(&task);
                q.task_done(peer, &task.key, task.generation());
            }
        });
    });
}

/// Benchmark: fair scheduling across many requesting peers
fn bench_many_peers(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop_many_peers");
    for peers in [8usize, 64, 256] {
        let keys = keys(32);
        let peer_ids: Vec<PeerId> = (0..peers).map(|_| PeerId::random()).collect();

        group.bench_with_input(BenchmarkId::from_parameter(peers), &peers, |b, _| {
            b.iter(|| {
                let mut q = PeerTaskQueue::new(v1);
                for peer in &peer_ids {
                    for (i, key) in keys.iter().enumerate() {
                        q.push(
                            Entry {
                                key: *key,
                                priority: i as i32,
                            },
                            *peer,
                        );
                    }
                }
                while let Some(task) = q.pop() {
                    q.task_done(task.peer, &task.key, task.generation());
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: lazy cancellation cost
fn bench_cancel_heavy(c: &mut Criterion) {
    let keys = keys(1024);

    c.bench_function("push_cancel_pop_1024", |b| {
        let peer = PeerId::random();
        b.iter(|| {
            let mut q = PeerTaskQueue::new(v1);
            for (i, key) in keys.iter().enumerate() {
                q.push(
                    Entry {
                        key: *key,
                        priority: i as i32,
                    },
                    peer,
                );
            }
            // cancel every other task, then drain
            for key in keys.iter().step_by(2) {
                q.remove(key, peer);
            }
            while let Some(task) = q.pop() {
                q.task_done(peer, &task.key, task.generation());
            }
        });
    });
}

criterion_group!(benches, bench_single_peer, bench_many_peers, bench_cancel_heavy);
criterion_main!(benches);
