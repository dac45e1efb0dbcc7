use std::collections::VecDeque;

use log::trace;

use crate::{Error, Result};

/// Generic FIFO worklist fixed point over a directed graph of
/// `node_count` nodes. `flow` maps a node and its joined input fact to
/// the facts it contributes to other nodes; contributions are joined at
/// the target and the target re-enqueued on change. Returns the input
/// fact of every node.
///
/// Seeds are joined in first, then every node is visited at least once
/// in index order: a node whose correct input *is* bottom still has a
/// transfer output its neighbors must see (a liveness exit block
/// generates facts from an empty input), so visiting cannot be gated on
/// the input changing.
///
/// The same loop drives both the per-method block engine and the
/// inter-method side-effect pass. Termination is the caller's contract:
/// the fact lattice must have finite height and `flow` must be
/// monotonic. `max_visits` bounds the iteration and turns a violated
/// contract into [`Error::Diverged`] instead of a hang.
pub(crate) fn solve<F: Clone + PartialEq>(
    node_count: usize,
    seeds: Vec<(usize, F)>,
    bottom: F,
    mut flow: impl FnMut(usize, &F) -> Vec<(usize, F)>,
    join: impl Fn(&F, &F) -> F,
    max_visits: usize,
    analysis: &'static str,
) -> Result<Vec<F>> {
    let mut facts = vec![bottom; node_count];
    let mut queued = vec![true; node_count];
    let mut worklist: VecDeque<usize> = (0..node_count).collect();

    for (node, fact) in seeds {
        facts[node] = join(&facts[node], &fact);
    }

    let mut visits = 0usize;
    while let Some(node) = worklist.pop_front() {
        queued[node] = false;
        visits += 1;
        if visits > max_visits {
            return Err(Error::Diverged { analysis, visits });
        }

        for (target, contribution) in flow(node, &facts[node]) {
            let joined = join(&facts[target], &contribution);
            if joined != facts[target] {
                facts[target] = joined;
                if !queued[target] {
                    queued[target] = true;
                    worklist.push_back(target);
                }
            }
        }
    }

    trace!("{analysis}: fixed point after {visits} visits");
    Ok(facts)
}
