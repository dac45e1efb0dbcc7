use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::ir::{InsnKind, Instruction, MethodBody, Pc};
use crate::{Error, Result};

/// Identity of a basic block, distinct from its contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub u32);

/// Identity of a control-flow edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EdgeId(pub u32);

/// Basic block covering a contiguous run of instructions. Owns no
/// instructions; `insns` indexes into the method's instruction list.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub insns: Range<usize>,
    pub start_pc: Pc,
    pub end_pc: Pc,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// Edge between basic blocks.
#[derive(Clone, Debug)]
pub struct Edge {
    pub id: EdgeId,
    pub source: BlockId,
    pub target: BlockId,
    pub kind: EdgeKind,
}

/// Edge classification. Switch dispatch and the return/throw edges into
/// the synthetic exit are `Unconditional`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum EdgeKind {
    FallThrough,
    IfTrue,
    IfFalse,
    Goto,
    Exception,
    Unconditional,
}

/// Addressable program point: an instruction position within a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Location {
    pub block: BlockId,
    /// Index of the instruction within its block.
    pub index: usize,
}

/// Control flow graph for one method body. Immutable once built.
#[derive(Clone, Debug)]
pub struct Cfg {
    insns: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    successors: Vec<Vec<EdgeId>>,
    predecessors: Vec<Vec<EdgeId>>,
    entry: BlockId,
    exit: BlockId,
    max_locals: u16,
    param_slots: u16,
}

impl Cfg {
    /// Build the CFG for a method body.
    ///
    /// Fails with [`Error::UnresolvedControlFlow`] when the body has no
    /// code (abstract/native methods; callers should skip those) or an
    /// exception handler references an undefined offset, and with
    /// [`Error::MalformedBytecode`] when a branch target does not align
    /// with an instruction boundary.
    pub fn build(body: &MethodBody) -> Result<Cfg> {
        if body.insns.is_empty() {
            return Err(Error::UnresolvedControlFlow(
                "method has no code".to_string(),
            ));
        }

        let mut pc_to_index = BTreeMap::new();
        for (index, insn) in body.insns.iter().enumerate() {
            pc_to_index.insert(insn.pc, index);
        }

        let leaders = collect_leaders(body, &pc_to_index)?;
        let mut blocks = build_blocks(&body.insns, &leaders, &pc_to_index);

        let mut block_at_pc = BTreeMap::new();
        for block in &blocks {
            block_at_pc.insert(block.start_pc, block.id);
        }

        // Synthetic exit sink fed by every return/throw block.
        let exit = BlockId(blocks.len() as u32);
        let end_pc = body
            .insns
            .last()
            .map(|insn| insn.pc + 1)
            .unwrap_or_default();
        blocks.push(BasicBlock {
            id: exit,
            insns: body.insns.len()..body.insns.len(),
            start_pc: end_pc,
            end_pc,
        });

        let mut edges = Vec::new();
        for block in &blocks {
            if block.id == exit {
                continue;
            }
            let last = &body.insns[block.insns.end - 1];
            build_block_edges(block, last, &blocks, &block_at_pc, exit, &mut edges)?;
        }
        add_exception_edges(body, &blocks, &block_at_pc, exit, &mut edges)?;

        let mut successors = vec![Vec::new(); blocks.len()];
        let mut predecessors = vec![Vec::new(); blocks.len()];
        for edge in &edges {
            successors[edge.source.0 as usize].push(edge.id);
            predecessors[edge.target.0 as usize].push(edge.id);
        }

        Ok(Cfg {
            insns: body.insns.clone(),
            blocks,
            edges,
            successors,
            predecessors,
            entry: BlockId(0),
            exit,
            max_locals: body.max_locals,
            param_slots: body.param_slots,
        })
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// Leading local slots holding parameters (receiver included).
    pub fn param_slots(&self) -> u16 {
        self.param_slots
    }

    /// The synthetic exit sink. It holds no instructions.
    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    /// Instructions of one block, in program order.
    pub fn block_insns(&self, id: BlockId) -> &[Instruction] {
        &self.insns[self.block(id).insns.clone()]
    }

    /// The instruction at a location.
    ///
    /// Panics if the location does not address an instruction of this
    /// CFG; querying a foreign location is a programming error.
    pub fn instruction(&self, location: Location) -> &Instruction {
        let block = self.block(location.block);
        assert!(
            location.index < block.len(),
            "location {location:?} is out of range for block {:?}",
            block.id
        );
        &self.insns[block.insns.start + location.index]
    }

    pub fn outgoing(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.successors[id.0 as usize]
            .iter()
            .map(|edge| self.edge(*edge))
    }

    pub fn incoming(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.predecessors[id.0 as usize]
            .iter()
            .map(|edge| self.edge(*edge))
    }

    /// Location of the instruction at a byte offset, if any.
    pub fn location_of_pc(&self, pc: Pc) -> Option<Location> {
        for block in &self.blocks {
            if pc >= block.start_pc && pc < block.end_pc {
                for (index, insn) in self.block_insns(block.id).iter().enumerate() {
                    if insn.pc == pc {
                        return Some(Location {
                            block: block.id,
                            index,
                        });
                    }
                }
            }
        }
        None
    }

    /// Deterministic preorder traversal of every (block, instruction)
    /// pair: depth-first from the entry following edge insertion order,
    /// then any unreached blocks in id order. Every instruction appears
    /// exactly once; this is the primary detector iteration order.
    pub fn ordered_locations(&self) -> Vec<Location> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            if visited[block.0 as usize] {
                continue;
            }
            visited[block.0 as usize] = true;
            order.push(block);
            let succs: Vec<BlockId> = self.outgoing(block).map(|edge| edge.target).collect();
            for succ in succs.into_iter().rev() {
                if !visited[succ.0 as usize] {
                    stack.push(succ);
                }
            }
        }
        for block in &self.blocks {
            if !visited[block.id.0 as usize] {
                order.push(block.id);
            }
        }

        let mut locations = Vec::with_capacity(self.insns.len());
        for block in order {
            for index in 0..self.block(block).len() {
                locations.push(Location { block, index });
            }
        }
        locations
    }
}

/// Block leaders: first pc, every branch/switch/handler target, and
/// every pc following a branch, return or throw.
fn collect_leaders(body: &MethodBody, pc_to_index: &BTreeMap<Pc, usize>) -> Result<BTreeSet<Pc>> {
    let mut leaders = BTreeSet::new();
    leaders.insert(body.insns[0].pc);

    for handler in &body.handlers {
        if !pc_to_index.contains_key(&handler.handler_pc) {
            return Err(Error::UnresolvedControlFlow(format!(
                "exception handler references undefined offset {}",
                handler.handler_pc
            )));
        }
        leaders.insert(handler.handler_pc);
    }

    for (index, insn) in body.insns.iter().enumerate() {
        let targets = insn.kind.branch_targets();
        for target in &targets {
            if !pc_to_index.contains_key(target) {
                return Err(Error::MalformedBytecode(format!(
                    "branch target {target} at pc {} is not an instruction boundary",
                    insn.pc
                )));
            }
            leaders.insert(*target);
        }
        if (!targets.is_empty() || insn.kind.is_exit())
            && let Some(next) = body.insns.get(index + 1)
        {
            leaders.insert(next.pc);
        }
    }

    Ok(leaders)
}

fn build_blocks(
    insns: &[Instruction],
    leaders: &BTreeSet<Pc>,
    pc_to_index: &BTreeMap<Pc, usize>,
) -> Vec<BasicBlock> {
    let leader_list: Vec<Pc> = leaders.iter().copied().collect();
    let mut blocks = Vec::with_capacity(leader_list.len());
    for (ordinal, window) in leader_list.windows(2).enumerate() {
        let start = pc_to_index[&window[0]];
        let end = pc_to_index[&window[1]];
        blocks.push(BasicBlock {
            id: BlockId(ordinal as u32),
            insns: start..end,
            start_pc: window[0],
            end_pc: window[1],
        });
    }
    if let Some(last_leader) = leader_list.last() {
        let start = pc_to_index[last_leader];
        blocks.push(BasicBlock {
            id: BlockId(blocks.len() as u32),
            insns: start..insns.len(),
            start_pc: *last_leader,
            end_pc: insns.last().map(|insn| insn.pc + 1).unwrap_or_default(),
        });
    }
    blocks
}

fn build_block_edges(
    block: &BasicBlock,
    last: &Instruction,
    blocks: &[BasicBlock],
    block_at_pc: &BTreeMap<Pc, BlockId>,
    exit: BlockId,
    edges: &mut Vec<Edge>,
) -> Result<()> {
    let mut push = |source: BlockId, target: BlockId, kind: EdgeKind| {
        edges.push(Edge {
            id: EdgeId(edges.len() as u32),
            source,
            target,
            kind,
        });
    };

    match &last.kind {
        InsnKind::Branch { target, .. } => {
            push(block.id, block_at_pc[target], EdgeKind::IfTrue);
            let next = next_block(blocks, block).ok_or_else(|| fall_off_end(last.pc))?;
            push(block.id, next, EdgeKind::IfFalse);
        }
        InsnKind::Goto { target } => {
            push(block.id, block_at_pc[target], EdgeKind::Goto);
        }
        InsnKind::Switch { targets, default } => {
            let mut seen = BTreeSet::new();
            for target in targets.iter().chain(std::iter::once(default)) {
                if seen.insert(*target) {
                    push(block.id, block_at_pc[target], EdgeKind::Unconditional);
                }
            }
        }
        InsnKind::Return { .. } | InsnKind::Throw => {
            push(block.id, exit, EdgeKind::Unconditional);
        }
        _ => {
            let next = next_block(blocks, block).ok_or_else(|| fall_off_end(last.pc))?;
            push(block.id, next, EdgeKind::FallThrough);
        }
    }
    Ok(())
}

fn add_exception_edges(
    body: &MethodBody,
    blocks: &[BasicBlock],
    block_at_pc: &BTreeMap<Pc, BlockId>,
    exit: BlockId,
    edges: &mut Vec<Edge>,
) -> Result<()> {
    let mut seen: BTreeSet<(BlockId, BlockId)> = BTreeSet::new();
    for handler in &body.handlers {
        let target = *block_at_pc.get(&handler.handler_pc).ok_or_else(|| {
            Error::UnresolvedControlFlow(format!(
                "exception handler references undefined offset {}",
                handler.handler_pc
            ))
        })?;
        for block in blocks {
            if block.id == exit || block.is_empty() {
                continue;
            }
            let covered = block.start_pc < handler.end_pc && block.end_pc > handler.start_pc;
            if covered && seen.insert((block.id, target)) {
                edges.push(Edge {
                    id: EdgeId(edges.len() as u32),
                    source: block.id,
                    target,
                    kind: EdgeKind::Exception,
                });
            }
        }
    }
    Ok(())
}

fn next_block(blocks: &[BasicBlock], block: &BasicBlock) -> Option<BlockId> {
    blocks
        .get(block.id.0 as usize + 1)
        .filter(|next| !next.is_empty())
        .map(|next| next.id)
}

fn fall_off_end(pc: Pc) -> Error {
    Error::MalformedBytecode(format!("control falls off the end of the method at pc {pc}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Cmp;
    use crate::testkit::{branch, goto, iconst, load, method, ret, store};

    // if (x != 0) { y = 1; } else { y = 2; } return y;
    fn diamond() -> MethodBody {
        method(vec![
            load(0),            // 0
            branch(Cmp::Ne, 4), // 1
            iconst(2),          // 2: else arm
            goto(6),            // 3
            iconst(1),          // 4: then arm
            store(1),           // 5
            load(1),            // 6: join
            ret(true),          // 7
        ])
    }

    #[test]
    fn diamond_blocks_and_edges() {
        let cfg = Cfg::build(&diamond()).expect("build cfg");

        // entry, else, then, join, synthetic exit
        assert_eq!(5, cfg.blocks().len());
        assert_eq!(BlockId(0), cfg.entry());
        assert!(cfg.block(cfg.exit()).is_empty());

        let entry_kinds: Vec<EdgeKind> = cfg.outgoing(cfg.entry()).map(|edge| edge.kind).collect();
        assert_eq!(vec![EdgeKind::IfTrue, EdgeKind::IfFalse], entry_kinds);
    }

    #[test]
    fn every_non_exit_block_has_an_outgoing_edge() {
        let cfg = Cfg::build(&diamond()).expect("build cfg");
        for block in cfg.blocks() {
            if block.id == cfg.exit() {
                assert_eq!(0, cfg.outgoing(block.id).count());
            } else {
                assert!(cfg.outgoing(block.id).count() >= 1);
            }
        }
        for block in cfg.blocks() {
            if block.id != cfg.entry() {
                assert!(cfg.incoming(block.id).count() >= 1);
            }
        }
    }

    #[test]
    fn ordered_locations_cover_every_instruction_once() {
        let body = diamond();
        let cfg = Cfg::build(&body).expect("build cfg");

        let locations = cfg.ordered_locations();
        assert_eq!(body.insns.len(), locations.len());

        let mut pcs: Vec<Pc> = locations
            .iter()
            .map(|location| cfg.instruction(*location).pc)
            .collect();
        pcs.sort();
        pcs.dedup();
        assert_eq!(body.insns.len(), pcs.len());

        // Within each block the order follows the instruction sequence.
        for window in locations.windows(2) {
            if window[0].block == window[1].block {
                assert_eq!(window[0].index + 1, window[1].index);
            }
        }
    }

    #[test]
    fn single_instruction_method_builds() {
        let cfg = Cfg::build(&method(vec![ret(false)])).expect("build cfg");
        assert_eq!(2, cfg.blocks().len());
        assert_eq!(1, cfg.block(cfg.entry()).len());
        let kinds: Vec<EdgeKind> = cfg.outgoing(cfg.entry()).map(|edge| edge.kind).collect();
        assert_eq!(vec![EdgeKind::Unconditional], kinds);
    }

    #[test]
    fn misaligned_branch_target_is_malformed() {
        let body = method(vec![load(0), branch(Cmp::Eq, 99), ret(false)]);
        let error = Cfg::build(&body).expect_err("misaligned target");
        assert!(matches!(error, Error::MalformedBytecode(_)));
    }

    #[test]
    fn empty_body_is_unresolved() {
        let body = method(Vec::new());
        let error = Cfg::build(&body).expect_err("no code");
        assert!(matches!(error, Error::UnresolvedControlFlow(_)));
    }

    #[test]
    fn undefined_handler_offset_is_unresolved() {
        let mut body = method(vec![load(0), ret(true)]);
        body.handlers.push(crate::ir::ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 42,
            catch_type: None,
        });
        let error = Cfg::build(&body).expect_err("bad handler");
        assert!(matches!(error, Error::UnresolvedControlFlow(_)));
    }

    #[test]
    fn handler_range_produces_exception_edges() {
        let mut body = method(vec![
            load(0),    // 0 covered
            store(1),   // 1 covered
            ret(false), // 2 handler entry
        ]);
        body.handlers.push(crate::ir::ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: Some("java/io/IOException".to_string()),
        });
        let cfg = Cfg::build(&body).expect("build cfg");

        let exceptional: Vec<(BlockId, BlockId)> = cfg
            .edges()
            .iter()
            .filter(|edge| edge.kind == EdgeKind::Exception)
            .map(|edge| (edge.source, edge.target))
            .collect();
        assert_eq!(1, exceptional.len());
        let handler_block = cfg.location_of_pc(2).expect("handler location").block;
        assert_eq!(handler_block, exceptional[0].1);
    }

    #[test]
    fn cycles_are_allowed() {
        // while (x != 0) { x = x - 1; } return;
        let body = method(vec![
            load(0),            // 0: loop head
            branch(Cmp::Eq, 6), // 1
            load(0),            // 2
            iconst(1),          // 3
            store(0),           // 4  (decrement elided to a store)
            goto(0),            // 5
            ret(false),         // 6
        ]);
        let cfg = Cfg::build(&body).expect("build cfg");
        let back_edges = cfg
            .edges()
            .iter()
            .filter(|edge| edge.target == cfg.entry())
            .count();
        assert_eq!(1, back_edges);
    }
}
