//! Property: after `recycle()`, a stub survives if and only if it is
//! reachable from the lifeguard roots (§8 P1 "Reachability", P2
//! "Liveness"). Builds a random functional graph over a fixed node count
//! and checks the collector's verdict against an independently computed
//! BFS closure.

mod common;

use bedrock::stub::GuardedRef;
use common::*;
use quickcheck_macros::quickcheck;
use std::collections::HashSet;

const NODES: usize = 12;

fn bfs_reachable(adjacency: &[Option<usize>], roots: &HashSet<usize>) -> HashSet<usize> {
    let mut seen: HashSet<usize> = roots.clone();
    let mut frontier: Vec<usize> = roots.iter().copied().collect();
    while let Some(node) = frontier.pop() {
        if let Some(next) = adjacency[node] {
            if seen.insert(next) {
                frontier.push(next);
            }
        }
    }
    seen
}

#[quickcheck]
fn survival_matches_reachability_from_roots(edges: Vec<u8>, roots: Vec<u8>) -> bool {
    // Each node has at most one outgoing edge, so the graph is a functional
    // graph (possibly containing cycles) — exactly the shape a rooted cycle
    // scenario needs (§8 scenario 1).
    let adjacency: Vec<Option<usize>> =
        (0..NODES).map(|i| edges.get(i).map(|e| *e as usize % NODES)).collect();
    let root_set: HashSet<usize> = roots.iter().map(|r| *r as usize % NODES).collect();

    let mut rt = new_runtime();
    let nodes: Vec<_> = (0..NODES).map(|_| alloc_array(&mut rt, 1)).collect();
    for (i, target) in adjacency.iter().enumerate() {
        if let Some(j) = target {
            set_ref(nodes[i], 0, nodes[*j]);
        }
    }

    let guards: Vec<_> =
        root_set.iter().map(|&i| rt.push_lifeguard(GuardedRef::Stub(nodes[i]))).collect();
    rt.recycle();

    let reachable = bfs_reachable(&adjacency, &root_set);
    let ok = (0..NODES).all(|i| is_free(nodes[i]) != reachable.contains(&i));

    // The lifeguard registry nests strictly LIFO; release in reverse of
    // creation order.
    for g in guards.into_iter().rev() {
        drop(g);
    }
    ok
}
