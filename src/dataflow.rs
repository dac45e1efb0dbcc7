use std::cell::RefCell;
use std::fmt::Debug;

use log::{debug, error};

use crate::cfg::{Cfg, Edge, EdgeId, Location};
use crate::ir::Instruction;
use crate::solver::solve;
use crate::Result;

/// Default bound on block visits before a run is declared diverged.
/// Generous: a diverging run signals a lattice or monotonicity defect
/// in the domain, never ordinary slow convergence.
pub const DEFAULT_MAX_BLOCK_VISITS: usize = 10_000;

/// Tunable analysis limits.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisConfig {
    pub max_block_visits: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_block_visits: DEFAULT_MAX_BLOCK_VISITS,
        }
    }
}

/// Direction of a dataflow analysis.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Facts propagate from entry to exit (e.g. value numbering,
    /// resource state).
    Forward,
    /// Facts propagate from exit to entry (e.g. liveness).
    Backward,
}

/// A dataflow specialization: a fact lattice with its transfer and join
/// operators. The engine owns iteration; the domain owns meaning.
///
/// Contract: `join` is the least upper bound (commutative, associative,
/// idempotent), `bottom` is its identity, `transfer` is monotonic, and
/// the lattice has finite height. The engine does not verify these; a
/// violated contract surfaces as [`crate::Error::Diverged`].
pub trait Domain {
    type Fact: Clone + PartialEq + Debug;

    /// Analysis name used in diagnostics.
    fn name(&self) -> &'static str;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    /// Join identity used for not-yet-reached program points.
    fn bottom(&self, cfg: &Cfg) -> Self::Fact;

    /// Fact at the CFG boundary: entry for forward analyses, the
    /// synthetic exit for backward ones.
    fn initial(&self, cfg: &Cfg) -> Self::Fact;

    /// Fact after (forward) or before (backward) one instruction.
    fn transfer(
        &self,
        fact: &Self::Fact,
        insn: &Instruction,
        location: Location,
    ) -> Result<Self::Fact>;

    fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact;

    /// Refinement applied to the fact flowing along one edge, before
    /// the join at its target. Branch condition and exception-path
    /// adjustments hook in here.
    fn edge(&self, fact: &Self::Fact, _edge: &Edge, _cfg: &Cfg) -> Result<Self::Fact> {
        Ok(fact.clone())
    }
}

/// Precomputed facts for every program point and edge of one CFG.
/// Immutable; all lookups are pure.
#[derive(Clone, Debug, PartialEq)]
pub struct DataflowResult<F> {
    /// Per block: fact at the point before instruction `i` at index
    /// `i`, plus the fact after the last instruction at index `len`.
    /// Program-order points for both directions.
    points: Vec<Vec<F>>,
    edge_facts: Vec<F>,
    direction: Direction,
}

impl<F: Clone + PartialEq + Debug> DataflowResult<F> {
    /// Fact at the program point before the instruction.
    ///
    /// Panics when the location does not belong to the analyzed CFG;
    /// silently answering with bottom would mask detector bugs.
    pub fn fact_before(&self, location: Location) -> &F {
        let points = self.block_points(location);
        &points[location.index]
    }

    /// Fact at the program point after the instruction.
    pub fn fact_after(&self, location: Location) -> &F {
        let points = self.block_points(location);
        &points[location.index + 1]
    }

    /// Fact flowing along an edge: post-transfer and post-refinement,
    /// pre-join at the target.
    pub fn fact_on_edge(&self, edge: EdgeId) -> &F {
        self.edge_facts
            .get(edge.0 as usize)
            .unwrap_or_else(|| panic!("edge {edge:?} is not part of the analyzed CFG"))
    }

    /// Fact at a block's program-order entry point.
    pub fn block_entry(&self, block: crate::cfg::BlockId) -> &F {
        let points = &self.points[block.0 as usize];
        &points[0]
    }

    /// Fact at a block's program-order exit point.
    pub fn block_exit(&self, block: crate::cfg::BlockId) -> &F {
        let points = &self.points[block.0 as usize];
        &points[points.len() - 1]
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn block_points(&self, location: Location) -> &[F] {
        let points = self
            .points
            .get(location.block.0 as usize)
            .unwrap_or_else(|| panic!("location {location:?} is not part of the analyzed CFG"));
        assert!(
            location.index + 1 < points.len(),
            "location {location:?} is not part of the analyzed CFG"
        );
        points
    }
}

/// Run a dataflow analysis over one CFG to a fixed point.
pub fn analyze<D: Domain>(
    cfg: &Cfg,
    domain: &D,
    config: &AnalysisConfig,
) -> Result<DataflowResult<D::Fact>> {
    let block_count = cfg.blocks().len();
    let bottom = domain.bottom(cfg);
    let initial = domain.initial(cfg);
    let direction = domain.direction();

    let boundary = match direction {
        Direction::Forward => cfg.entry(),
        Direction::Backward => cfg.exit(),
    };

    // The solver cannot carry transfer errors through its closure, so
    // park the first one here and surface it after the run.
    let failure: RefCell<Option<crate::Error>> = RefCell::new(None);
    let solved = solve(
        block_count,
        vec![(boundary.0 as usize, initial)],
        bottom,
        |node, fact| {
            if failure.borrow().is_some() {
                return Vec::new();
            }
            match flow_block(cfg, domain, direction, node, fact) {
                Ok(contributions) => contributions,
                Err(error) => {
                    *failure.borrow_mut() = Some(error);
                    Vec::new()
                }
            }
        },
        |a, b| domain.join(a, b),
        config.max_block_visits,
        domain.name(),
    );
    if let Some(error) = failure.into_inner() {
        return Err(error);
    }
    let solved = match solved {
        Ok(facts) => facts,
        Err(error) => {
            error!("{} failed to converge: {error}", domain.name());
            return Err(error);
        }
    };
    debug!("{}: solved {} blocks", domain.name(), block_count);

    materialize(cfg, domain, direction, solved)
}

/// One solver step: push a block's joined input through its
/// instructions and hand the refined result to each neighbor.
fn flow_block<D: Domain>(
    cfg: &Cfg,
    domain: &D,
    direction: Direction,
    node: usize,
    fact: &D::Fact,
) -> Result<Vec<(usize, D::Fact)>> {
    let block = crate::cfg::BlockId(node as u32);
    let mut contributions = Vec::new();
    match direction {
        Direction::Forward => {
            let out = transfer_forward(cfg, domain, block, fact)?;
            for edge in cfg.outgoing(block) {
                let refined = domain.edge(&out, edge, cfg)?;
                contributions.push((edge.target.0 as usize, refined));
            }
        }
        Direction::Backward => {
            let entry = transfer_backward(cfg, domain, block, fact)?;
            for edge in cfg.incoming(block) {
                let refined = domain.edge(&entry, edge, cfg)?;
                contributions.push((edge.source.0 as usize, refined));
            }
        }
    }
    Ok(contributions)
}

fn transfer_forward<D: Domain>(
    cfg: &Cfg,
    domain: &D,
    block: crate::cfg::BlockId,
    entry: &D::Fact,
) -> Result<D::Fact> {
    let mut fact = entry.clone();
    for (index, insn) in cfg.block_insns(block).iter().enumerate() {
        fact = domain.transfer(&fact, insn, Location { block, index })?;
    }
    Ok(fact)
}

fn transfer_backward<D: Domain>(
    cfg: &Cfg,
    domain: &D,
    block: crate::cfg::BlockId,
    exit: &D::Fact,
) -> Result<D::Fact> {
    let mut fact = exit.clone();
    let insns = cfg.block_insns(block);
    for (index, insn) in insns.iter().enumerate().rev() {
        fact = domain.transfer(&fact, insn, Location { block, index })?;
    }
    Ok(fact)
}

/// Expand per-block fixed-point facts into per-point and per-edge facts
/// with one more deterministic pass.
fn materialize<D: Domain>(
    cfg: &Cfg,
    domain: &D,
    direction: Direction,
    solved: Vec<D::Fact>,
) -> Result<DataflowResult<D::Fact>> {
    let mut points = Vec::with_capacity(cfg.blocks().len());
    for block in cfg.blocks() {
        let insns = cfg.block_insns(block.id);
        let mut block_points = Vec::with_capacity(insns.len() + 1);
        match direction {
            Direction::Forward => {
                let mut fact = solved[block.id.0 as usize].clone();
                block_points.push(fact.clone());
                for (index, insn) in insns.iter().enumerate() {
                    fact = domain.transfer(
                        &fact,
                        insn,
                        Location {
                            block: block.id,
                            index,
                        },
                    )?;
                    block_points.push(fact.clone());
                }
            }
            Direction::Backward => {
                let mut fact = solved[block.id.0 as usize].clone();
                block_points.push(fact.clone());
                for (index, insn) in insns.iter().enumerate().rev() {
                    fact = domain.transfer(
                        &fact,
                        insn,
                        Location {
                            block: block.id,
                            index,
                        },
                    )?;
                    block_points.push(fact.clone());
                }
                block_points.reverse();
            }
        }
        points.push(block_points);
    }

    let mut edge_facts = Vec::with_capacity(cfg.edges().len());
    for edge in cfg.edges() {
        let carried = match direction {
            Direction::Forward => {
                let source_points = &points[edge.source.0 as usize];
                &source_points[source_points.len() - 1]
            }
            Direction::Backward => &points[edge.target.0 as usize][0],
        };
        edge_facts.push(domain.edge(carried, edge, cfg)?);
    }

    Ok(DataflowResult {
        points,
        edge_facts,
        direction,
    })
}
