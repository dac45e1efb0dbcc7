//! Method-level call graph and the interprocedural side-effect pass: a
//! coarser dataflow problem (nodes are methods, edges are call sites)
//! driven by the same worklist solver as the per-method engine.

use std::collections::BTreeMap;

use log::debug;

use crate::dataflow::AnalysisConfig;
use crate::ir::{InsnKind, MethodBody, MethodKey};
use crate::solver::solve;
use crate::Result;

/// How a method may affect state outside its own frame. Ordered as a
/// lattice: `None < Local < Any`, join is `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum SideEffectStatus {
    /// Touches nothing beyond its own locals and operand stack.
    None,
    /// Mutates only fields of its own class.
    Local,
    /// May mutate arbitrary reachable state.
    Any,
}

impl SideEffectStatus {
    /// Coarse intraprocedural classification of one body: field and
    /// array writes decide the status, calls are resolved later by the
    /// closure pass.
    pub fn of_body(owner: &str, body: &MethodBody) -> SideEffectStatus {
        let mut status = SideEffectStatus::None;
        for insn in &body.insns {
            let written = match &insn.kind {
                InsnKind::PutField(field) if field.owner == owner => SideEffectStatus::Local,
                InsnKind::PutField(_) | InsnKind::ArrayStore => SideEffectStatus::Any,
                _ => SideEffectStatus::None,
            };
            status = status.max(written);
        }
        status
    }
}

/// Closed side-effect verdicts, one per known method.
pub type SideEffectMap = BTreeMap<MethodKey, SideEffectStatus>;

/// Call graph over the methods of one analysis session.
#[derive(Debug)]
pub struct CallGraph {
    methods: Vec<MethodKey>,
    index: BTreeMap<MethodKey, usize>,
    callers: Vec<Vec<usize>>,
    /// Methods invoking at least one callee outside the graph.
    calls_unknown: Vec<bool>,
}

impl CallGraph {
    /// Build the graph from the session's method bodies. Call sites
    /// whose target is not among the keys are recorded as unknown.
    pub fn build(methods: &BTreeMap<MethodKey, MethodBody>) -> CallGraph {
        let keys: Vec<MethodKey> = methods.keys().cloned().collect();
        let index: BTreeMap<MethodKey, usize> = keys
            .iter()
            .enumerate()
            .map(|(position, key)| (key.clone(), position))
            .collect();

        let mut callers = vec![Vec::new(); keys.len()];
        let mut calls_unknown = vec![false; keys.len()];
        for (caller, body) in methods.values().enumerate() {
            for insn in &body.insns {
                if let InsnKind::Invoke(call) = &insn.kind {
                    match index.get(&call.key()) {
                        Some(callee) => {
                            if !callers[*callee].contains(&caller) {
                                callers[*callee].push(caller);
                            }
                        }
                        None => calls_unknown[caller] = true,
                    }
                }
            }
        }

        CallGraph {
            methods: keys,
            index,
            callers,
            calls_unknown,
        }
    }

    pub fn methods(&self) -> &[MethodKey] {
        &self.methods
    }

    pub fn contains(&self, key: &MethodKey) -> bool {
        self.index.contains_key(key)
    }
}

/// Side-effect accumulator with explicit phases: an incremental
/// `record` pass over individual methods, then a consuming `finalize`
/// closure pass over the call graph. Owned by the analysis session and
/// passed by reference, never ambient state.
#[derive(Debug, Default)]
pub struct SideEffectAccumulator {
    own: BTreeMap<MethodKey, SideEffectStatus>,
}

impl SideEffectAccumulator {
    pub fn new() -> Self {
        SideEffectAccumulator::default()
    }

    /// Record the intraprocedural status of one method. Repeated
    /// records join.
    pub fn record(&mut self, key: MethodKey, status: SideEffectStatus) {
        self.own
            .entry(key)
            .and_modify(|existing| *existing = (*existing).max(status))
            .or_insert(status);
    }

    /// Close the recorded statuses over the call graph: a method's
    /// final status is the join of its own and every callee's, with
    /// unknown callees pinned to `Any`.
    pub fn finalize(self, graph: &CallGraph, config: &AnalysisConfig) -> Result<SideEffectMap> {
        let node_count = graph.methods.len();
        let mut seeds = Vec::with_capacity(node_count);
        for (position, key) in graph.methods.iter().enumerate() {
            let mut status = self
                .own
                .get(key)
                .copied()
                .unwrap_or(SideEffectStatus::Any);
            if graph.calls_unknown[position] {
                status = SideEffectStatus::Any;
            }
            seeds.push((position, status));
        }

        let statuses = solve(
            node_count,
            seeds,
            SideEffectStatus::None,
            |node, status| {
                graph.callers[node]
                    .iter()
                    .map(|caller| (*caller, *status))
                    .collect()
            },
            |a, b| (*a).max(*b),
            config.max_block_visits,
            "side-effect-closure",
        )?;
        debug!("side-effect closure over {node_count} methods");

        Ok(graph
            .methods
            .iter()
            .cloned()
            .zip(statuses)
            .collect())
    }
}
