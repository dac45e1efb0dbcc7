//! Integer range analysis over value numbers, specialized for array
//! index checking. Ranges come from two places: the syntactic origin of
//! a number (constants, `arraylength` results) and branch-condition
//! refinements applied along `IfTrue`/`IfFalse` edges.

use std::collections::BTreeMap;

use crate::cfg::{Cfg, Edge, EdgeKind, Location};
use crate::dataflow::{DataflowResult, Domain};
use crate::ir::{Cmp, ConstValue, InsnKind, Instruction};
use crate::valnum::{Frame, ValueNumber, ValueNumbering, ValueOrigin};
use crate::Result;

/// Closed interval of possible runtime values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
}

impl IntRange {
    pub const TOP: IntRange = IntRange {
        min: i64::MIN,
        max: i64::MAX,
    };

    pub fn new(min: i64, max: i64) -> IntRange {
        IntRange { min, max }
    }

    pub fn constant(value: i64) -> IntRange {
        IntRange {
            min: value,
            max: value,
        }
    }

    /// Empty ranges mark infeasible refinements and are never stored.
    pub fn is_empty(self) -> bool {
        self.min > self.max
    }

    pub fn intersect(self, other: IntRange) -> IntRange {
        IntRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Smallest range covering both operands, the join of the lattice.
    pub fn cover(self, other: IntRange) -> IntRange {
        IntRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Verdict for one array access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BoundsStatus {
    /// The index provably fits every possible length.
    Safe,
    /// The index provably misses every possible length.
    OutOfBounds,
    Unknown,
}

/// Refined ranges per value number. Absent numbers are unconstrained;
/// their range still follows from the number's origin at query time.
pub type RangeMap = BTreeMap<ValueNumber, IntRange>;

/// Range-tracking dataflow domain. Borrows the value numbering and its
/// per-point frames for the same CFG, so branch operands and array
/// accesses resolve to stable numbers.
pub struct ArrayBounds<'a> {
    values: &'a ValueNumbering,
    frames: &'a DataflowResult<Option<Frame>>,
}

impl<'a> ArrayBounds<'a> {
    pub fn new(
        values: &'a ValueNumbering,
        frames: &'a DataflowResult<Option<Frame>>,
    ) -> ArrayBounds<'a> {
        ArrayBounds { values, frames }
    }

    /// Range a number may take, combining its origin with the refined
    /// map. Lengths are never negative; constants are themselves.
    fn resolved(&self, map: &RangeMap, number: ValueNumber) -> IntRange {
        let base = match self.values.origin(number) {
            ValueOrigin::Constant(ConstValue::Int(value)) => IntRange::constant(value),
            ValueOrigin::ArrayLength(_) => IntRange::new(0, i64::MAX),
            _ => IntRange::TOP,
        };
        match map.get(&number) {
            Some(refined) => base.intersect(*refined),
            None => base,
        }
    }

    /// Narrow `number` by `number cmp against`, keeping the map sound:
    /// an infeasible (empty) narrowing is dropped rather than stored.
    fn refine(&self, map: &mut RangeMap, number: ValueNumber, cmp: Cmp, against: IntRange) {
        let bound = match cmp {
            Cmp::Lt => IntRange::new(i64::MIN, against.max.saturating_sub(1)),
            Cmp::Le => IntRange::new(i64::MIN, against.max),
            Cmp::Gt => IntRange::new(against.min.saturating_add(1), i64::MAX),
            Cmp::Ge => IntRange::new(against.min, i64::MAX),
            Cmp::Eq => against,
            Cmp::Ne => return,
        };
        let narrowed = self.resolved(map, number).intersect(bound);
        if !narrowed.is_empty() {
            map.insert(number, narrowed);
        }
    }

    /// Range of a number at a program point, for detectors that reason
    /// about values beyond array indices.
    pub fn range_at(
        &self,
        ranges: &DataflowResult<Option<RangeMap>>,
        location: Location,
        number: ValueNumber,
    ) -> IntRange {
        match ranges.fact_before(location).as_ref() {
            Some(map) => self.resolved(map, number),
            None => IntRange::TOP,
        }
    }

    /// Classify the array access at `location`, which must hold an
    /// `ArrayLoad` or `ArrayStore`; any other instruction is `Unknown`.
    pub fn check_access(
        &self,
        cfg: &Cfg,
        ranges: &DataflowResult<Option<RangeMap>>,
        location: Location,
    ) -> BoundsStatus {
        let (index_depth, array_depth) = match cfg.instruction(location).kind {
            InsnKind::ArrayLoad => (0, 1),
            InsnKind::ArrayStore => (1, 2),
            _ => return BoundsStatus::Unknown,
        };
        let Some(frame) = self.frames.fact_before(location).as_ref() else {
            return BoundsStatus::Unknown;
        };
        let (Some(index), Some(array)) = (
            frame.stack_value(index_depth),
            frame.stack_value(array_depth),
        ) else {
            return BoundsStatus::Unknown;
        };
        let Some(length) = self.values.length_of(array) else {
            return BoundsStatus::Unknown;
        };
        let Some(map) = ranges.fact_before(location).as_ref() else {
            return BoundsStatus::Unknown;
        };

        let index_range = self.resolved(map, index);
        let length_range = self.resolved(map, length);
        if index_range.min >= 0 && index_range.max < length_range.min {
            return BoundsStatus::Safe;
        }
        if index_range.max < 0 || index_range.min >= length_range.max {
            return BoundsStatus::OutOfBounds;
        }
        BoundsStatus::Unknown
    }
}

impl Domain for ArrayBounds<'_> {
    /// `None` marks a not-yet-reached point.
    type Fact = Option<RangeMap>;

    fn name(&self) -> &'static str {
        "array-bounds"
    }

    fn bottom(&self, _cfg: &Cfg) -> Self::Fact {
        None
    }

    fn initial(&self, _cfg: &Cfg) -> Self::Fact {
        Some(RangeMap::new())
    }

    /// Ranges attach to value numbers, and a redefinition produces a
    /// fresh number, so instructions never invalidate entries.
    fn transfer(
        &self,
        fact: &Self::Fact,
        _insn: &Instruction,
        _location: Location,
    ) -> Result<Self::Fact> {
        Ok(fact.clone())
    }

    fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact {
        let (a, b) = match (a, b) {
            (None, other) | (other, None) => return other.clone(),
            (Some(a), Some(b)) => (a, b),
        };
        let mut joined = RangeMap::new();
        // Absent means unconstrained, so only numbers refined on both
        // paths survive the merge.
        for (number, range) in a {
            if let Some(other) = b.get(number) {
                joined.insert(*number, range.cover(*other));
            }
        }
        Some(joined)
    }

    /// Branch conditions refine both operands on the taken and
    /// not-taken edges.
    fn edge(&self, fact: &Self::Fact, edge: &Edge, cfg: &Cfg) -> Result<Self::Fact> {
        let Some(map) = fact else {
            return Ok(None);
        };
        let holds = match edge.kind {
            EdgeKind::IfTrue => true,
            EdgeKind::IfFalse => false,
            _ => return Ok(fact.clone()),
        };
        let insns = cfg.block_insns(edge.source);
        let Some(InsnKind::Branch {
            cmp, with_zero, ..
        }) = insns.last().map(|insn| &insn.kind)
        else {
            return Ok(fact.clone());
        };
        let cmp = if holds { *cmp } else { cmp.negate() };
        let location = Location {
            block: edge.source,
            index: insns.len() - 1,
        };
        let Some(frame) = self.frames.fact_before(location).as_ref() else {
            return Ok(fact.clone());
        };

        let mut refined = map.clone();
        if *with_zero {
            if let Some(operand) = frame.top() {
                self.refine(&mut refined, operand, cmp, IntRange::constant(0));
            }
        } else if let (Some(left), Some(right)) = (frame.stack_value(1), frame.stack_value(0)) {
            let left_range = self.resolved(&refined, left);
            let right_range = self.resolved(&refined, right);
            self.refine(&mut refined, left, cmp, right_range);
            self.refine(&mut refined, right, cmp.swap(), left_range);
        }
        Ok(Some(refined))
    }
}
