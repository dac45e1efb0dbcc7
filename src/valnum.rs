//! Value numbering: canonical identifiers for the runtime values a
//! method manipulates, so detectors can recognize "the same value"
//! reappearing at different locations.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use crate::callgraph::{SideEffectMap, SideEffectStatus};
use crate::cfg::{Cfg, Location};
use crate::dataflow::Domain;
use crate::ir::{ArithOp, ConstValue, FieldRef, InsnKind, Instruction, Pc};
use crate::Result;

/// Canonical identifier for a symbolically-tracked runtime value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueNumber(pub u32);

/// Syntactic source of a value number, for bug messages and pattern
/// matching.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueOrigin {
    /// Incoming parameter slot.
    Parameter(u16),
    /// Initial content of a non-parameter local slot.
    Local(u16),
    Constant(ConstValue),
    /// Field load still valid at the point the number was observed.
    Field(FieldRef),
    /// Length of the array with the given number.
    ArrayLength(ValueNumber),
    /// Opaque result produced at an instruction.
    Result(Pc),
    /// Arithmetic over other numbered values.
    Expression(ArithOp),
    /// Control-flow merge of diverging values.
    Merge,
}

/// Available field loads are keyed by receiver number and field, so
/// `a.f` and `b.f` stay distinct.
type FieldKey = (Option<ValueNumber>, FieldRef);

/// Value numbers covering the operand stack and all local slots at one
/// program point.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    locals: Vec<ValueNumber>,
    stack: Vec<ValueNumber>,
    fields: BTreeMap<FieldKey, ValueNumber>,
}

impl Frame {
    pub fn local(&self, slot: u16) -> Option<ValueNumber> {
        self.locals.get(slot as usize).copied()
    }

    /// Stack value at `depth`, where depth 0 is the top.
    pub fn stack_value(&self, depth: usize) -> Option<ValueNumber> {
        if depth < self.stack.len() {
            Some(self.stack[self.stack.len() - 1 - depth])
        } else {
            None
        }
    }

    pub fn top(&self) -> Option<ValueNumber> {
        self.stack_value(0)
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }
}

#[derive(Default)]
struct Cache {
    origins: Vec<ValueOrigin>,
    constants: BTreeMap<ConstValue, ValueNumber>,
    slots: BTreeMap<u16, ValueNumber>,
    results: BTreeMap<Pc, ValueNumber>,
    arith: BTreeMap<(ArithOp, ValueNumber, ValueNumber), ValueNumber>,
    lengths: BTreeMap<ValueNumber, ValueNumber>,
    merges: BTreeMap<BTreeSet<ValueNumber>, ValueNumber>,
    /// Leaf numbers behind each merge number, for flattened re-merging.
    merge_sources: BTreeMap<ValueNumber, BTreeSet<ValueNumber>>,
}

impl Cache {
    fn intern(&mut self, origin: ValueOrigin) -> ValueNumber {
        let number = ValueNumber(self.origins.len() as u32);
        self.origins.push(origin);
        number
    }
}

/// Value-numbering dataflow domain. One instance per method: the
/// numbering cache keys numbers by constant, slot, creation pc and
/// operand numbers, so re-running the transfer during fixpoint
/// iteration hands out identical numbers.
pub struct ValueNumbering {
    cache: RefCell<Cache>,
    side_effects: Option<SideEffectMap>,
}

impl Default for ValueNumbering {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueNumbering {
    pub fn new() -> Self {
        ValueNumbering {
            cache: RefCell::new(Cache::default()),
            side_effects: None,
        }
    }

    /// Use an interprocedural side-effect map to keep field loads alive
    /// across calls into methods known not to touch the heap.
    pub fn with_side_effects(side_effects: SideEffectMap) -> Self {
        ValueNumbering {
            cache: RefCell::new(Cache::default()),
            side_effects: Some(side_effects),
        }
    }

    /// The syntactic source that produced a value number.
    ///
    /// Panics on a number from a different `ValueNumbering` instance.
    pub fn origin(&self, number: ValueNumber) -> ValueOrigin {
        self.cache.borrow().origins[number.0 as usize].clone()
    }

    /// The number standing for the length of the given array, once an
    /// `arraylength` on it has been observed.
    pub fn length_of(&self, array: ValueNumber) -> Option<ValueNumber> {
        self.cache.borrow().lengths.get(&array).copied()
    }

    fn constant(&self, value: &ConstValue) -> ValueNumber {
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.constants.get(value) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::Constant(value.clone()));
        cache.constants.insert(value.clone(), number);
        number
    }

    fn initial_slot(&self, slot: u16, is_param: bool) -> ValueNumber {
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.slots.get(&slot) {
            return *number;
        }
        let origin = if is_param {
            ValueOrigin::Parameter(slot)
        } else {
            ValueOrigin::Local(slot)
        };
        let number = cache.intern(origin);
        cache.slots.insert(slot, number);
        number
    }

    /// Opaque result of the instruction at `pc`: calls, array loads and
    /// recovery from stack underflow all key on the creation site.
    fn result_at(&self, pc: Pc) -> ValueNumber {
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.results.get(&pc) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::Result(pc));
        cache.results.insert(pc, number);
        number
    }

    fn field_load(&self, field: &FieldRef, pc: Pc) -> ValueNumber {
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.results.get(&pc) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::Field(field.clone()));
        cache.results.insert(pc, number);
        number
    }

    fn arith(&self, op: ArithOp, a: ValueNumber, b: ValueNumber) -> ValueNumber {
        let (a, b) = match op {
            // Commutative ops ignore operand order.
            ArithOp::Add | ArithOp::Mul | ArithOp::And | ArithOp::Or | ArithOp::Xor => {
                (a.min(b), a.max(b))
            }
            _ => (a, b),
        };
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.arith.get(&(op, a, b)) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::Expression(op));
        cache.arith.insert((op, a, b), number);
        number
    }

    fn array_length(&self, array: ValueNumber) -> ValueNumber {
        let mut cache = self.cache.borrow_mut();
        if let Some(number) = cache.lengths.get(&array) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::ArrayLength(array));
        cache.lengths.insert(array, number);
        number
    }

    /// Merge two numbers at a control-flow join. Keyed by the flattened
    /// leaf set, so the merge is idempotent, commutative and
    /// associative, and the fixpoint terminates.
    fn merge(&self, a: ValueNumber, b: ValueNumber) -> ValueNumber {
        if a == b {
            return a;
        }
        let mut cache = self.cache.borrow_mut();
        let mut leaves = BTreeSet::new();
        for number in [a, b] {
            match cache.merge_sources.get(&number) {
                Some(sources) => leaves.extend(sources.iter().copied()),
                None => {
                    leaves.insert(number);
                }
            }
        }
        if let Some(number) = cache.merges.get(&leaves) {
            return *number;
        }
        let number = cache.intern(ValueOrigin::Merge);
        cache.merges.insert(leaves.clone(), number);
        cache.merge_sources.insert(number, leaves);
        number
    }

    fn callee_preserves_heap(&self, insn: &InsnKind) -> bool {
        let InsnKind::Invoke(call) = insn else {
            return false;
        };
        let Some(side_effects) = &self.side_effects else {
            return false;
        };
        matches!(
            side_effects.get(&call.key()),
            Some(SideEffectStatus::None | SideEffectStatus::Local)
        )
    }

    fn pop_or_recover(&self, frame: &mut Frame, pc: Pc) -> ValueNumber {
        frame.stack.pop().unwrap_or_else(|| self.result_at(pc))
    }

    fn exec(&self, frame: &mut Frame, insn: &Instruction) -> Result<()> {
        let pc = insn.pc;
        match &insn.kind {
            InsnKind::Const(value) => {
                let number = self.constant(value);
                frame.stack.push(number);
            }
            InsnKind::LoadLocal { slot } => {
                let number = frame
                    .local(*slot)
                    .unwrap_or_else(|| self.result_at(pc));
                frame.stack.push(number);
            }
            InsnKind::StoreLocal { slot } => {
                let number = self.pop_or_recover(frame, pc);
                if let Some(local) = frame.locals.get_mut(*slot as usize) {
                    *local = number;
                }
            }
            InsnKind::GetField(field) => {
                let receiver = if field.is_static {
                    None
                } else {
                    Some(self.pop_or_recover(frame, pc))
                };
                let key = (receiver, field.clone());
                let number = match frame.fields.get(&key) {
                    Some(available) => *available,
                    None => {
                        let loaded = self.field_load(field, pc);
                        frame.fields.insert(key, loaded);
                        loaded
                    }
                };
                frame.stack.push(number);
            }
            InsnKind::PutField(field) => {
                let value = self.pop_or_recover(frame, pc);
                let receiver = if field.is_static {
                    None
                } else {
                    Some(self.pop_or_recover(frame, pc))
                };
                // A store invalidates every load of this field; other
                // receivers may alias ours.
                frame
                    .fields
                    .retain(|(_, loaded), _| loaded.owner != field.owner || loaded.name != field.name);
                frame.fields.insert((receiver, field.clone()), value);
            }
            InsnKind::ArrayLoad => {
                let _index = self.pop_or_recover(frame, pc);
                let _array = self.pop_or_recover(frame, pc);
                frame.stack.push(self.result_at(pc));
            }
            InsnKind::ArrayStore => {
                for _ in 0..3 {
                    self.pop_or_recover(frame, pc);
                }
            }
            InsnKind::ArrayLength => {
                let array = self.pop_or_recover(frame, pc);
                frame.stack.push(self.array_length(array));
            }
            InsnKind::Arith(op) => {
                if *op == ArithOp::Neg {
                    let operand = self.pop_or_recover(frame, pc);
                    frame.stack.push(self.arith(*op, operand, operand));
                } else {
                    let right = self.pop_or_recover(frame, pc);
                    let left = self.pop_or_recover(frame, pc);
                    frame.stack.push(self.arith(*op, left, right));
                }
            }
            InsnKind::Branch { with_zero, .. } => {
                let pops = if *with_zero { 1 } else { 2 };
                for _ in 0..pops {
                    self.pop_or_recover(frame, pc);
                }
            }
            InsnKind::Goto { .. } | InsnKind::Nop => {}
            InsnKind::Switch { .. } => {
                self.pop_or_recover(frame, pc);
            }
            InsnKind::Invoke(call) => {
                for _ in 0..call.popped_args()? {
                    self.pop_or_recover(frame, pc);
                }
                if !self.callee_preserves_heap(&insn.kind) {
                    frame.fields.clear();
                }
                if call.pushes_result()? {
                    frame.stack.push(self.result_at(pc));
                }
            }
            InsnKind::Return { has_value } => {
                if *has_value {
                    self.pop_or_recover(frame, pc);
                }
            }
            InsnKind::Throw | InsnKind::Pop => {
                self.pop_or_recover(frame, pc);
            }
            InsnKind::Dup => {
                let top = self.pop_or_recover(frame, pc);
                frame.stack.push(top);
                frame.stack.push(top);
            }
        }
        Ok(())
    }
}

impl Domain for ValueNumbering {
    /// `None` marks a not-yet-reached point.
    type Fact = Option<Frame>;

    fn name(&self) -> &'static str {
        "value-numbering"
    }

    fn bottom(&self, _cfg: &Cfg) -> Self::Fact {
        None
    }

    fn initial(&self, cfg: &Cfg) -> Self::Fact {
        let locals = (0..cfg.max_locals())
            .map(|slot| self.initial_slot(slot, slot < cfg.param_slots()))
            .collect();
        Some(Frame {
            locals,
            stack: Vec::new(),
            fields: BTreeMap::new(),
        })
    }

    fn transfer(
        &self,
        fact: &Self::Fact,
        insn: &Instruction,
        _location: Location,
    ) -> Result<Self::Fact> {
        let Some(frame) = fact else {
            return Ok(None);
        };
        let mut next = frame.clone();
        self.exec(&mut next, insn)?;
        Ok(Some(next))
    }

    fn join(&self, a: &Self::Fact, b: &Self::Fact) -> Self::Fact {
        let (a, b) = match (a, b) {
            (None, other) | (other, None) => return other.clone(),
            (Some(a), Some(b)) => (a, b),
        };
        if a == b {
            return Some(a.clone());
        }

        let locals = a
            .locals
            .iter()
            .zip(b.locals.iter())
            .map(|(left, right)| self.merge(*left, *right))
            .collect();

        // Mismatched depths only occur on malformed stacks; keep the
        // common lower portion.
        let depth = a.stack.len().min(b.stack.len());
        let stack = a.stack[..depth]
            .iter()
            .zip(b.stack[..depth].iter())
            .map(|(left, right)| self.merge(*left, *right))
            .collect();

        let mut fields = BTreeMap::new();
        for (key, number) in &a.fields {
            if b.fields.get(key) == Some(number) {
                fields.insert(key.clone(), *number);
            }
        }

        Some(Frame {
            locals,
            stack,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::dataflow::{analyze, AnalysisConfig};
    use crate::ir::{Cmp, MethodBody};
    use crate::ir::MethodKey;
    use crate::testkit::{
        branch, getfield, goto, iconst, invoke_static, invoke_virtual, load, method, putfield,
        ret, store,
    };

    fn run(body: &MethodBody) -> (Cfg, ValueNumbering, crate::dataflow::DataflowResult<Option<Frame>>) {
        let cfg = Cfg::build(body).expect("build cfg");
        let numbering = ValueNumbering::new();
        let result = analyze(&cfg, &numbering, &AnalysisConfig::default()).expect("analyze");
        (cfg, numbering, result)
    }

    fn top_after(
        cfg: &Cfg,
        result: &crate::dataflow::DataflowResult<Option<Frame>>,
        pc: u32,
    ) -> ValueNumber {
        let location = cfg.location_of_pc(pc).expect("location");
        result
            .fact_after(location)
            .as_ref()
            .expect("reachable frame")
            .top()
            .expect("stack value")
    }

    #[test]
    fn repeated_local_loads_share_a_number() {
        let body = method(vec![
            load(0), // 0
            store(1),
            load(0), // 2
            ret(true),
        ]);
        let (cfg, _, result) = run(&body);
        assert_eq!(top_after(&cfg, &result, 0), top_after(&cfg, &result, 2));
    }

    #[test]
    fn load_after_store_gets_a_fresh_number() {
        let body = method(vec![
            load(0),    // 0: original value
            iconst(7),  // 1
            store(0),   // 2: overwrite slot 0
            load(0),    // 3: now the constant
            ret(true),
        ]);
        let (cfg, numbering, result) = run(&body);
        let before = top_after(&cfg, &result, 0);
        let after = top_after(&cfg, &result, 3);
        assert_ne!(before, after);
        assert_eq!(
            ValueOrigin::Constant(ConstValue::Int(7)),
            numbering.origin(after)
        );
        assert_eq!(ValueOrigin::Parameter(0), numbering.origin(before));
    }

    #[test]
    fn same_constant_shares_a_number() {
        let body = method(vec![iconst(42), store(1), iconst(42), ret(true)]);
        let (cfg, _, result) = run(&body);
        assert_eq!(top_after(&cfg, &result, 0), top_after(&cfg, &result, 2));
    }

    #[test]
    fn array_length_is_keyed_by_the_array() {
        let body = method(vec![
            load(0),
            InsnKind::ArrayLength, // 1
            store(1),
            load(0),
            InsnKind::ArrayLength, // 4
            ret(true),
        ]);
        let (cfg, numbering, result) = run(&body);
        let first = top_after(&cfg, &result, 1);
        let second = top_after(&cfg, &result, 4);
        assert_eq!(first, second);

        let array = top_after(&cfg, &result, 0);
        assert_eq!(ValueOrigin::ArrayLength(array), numbering.origin(first));
    }

    #[test]
    fn field_load_is_reused_until_invalidated() {
        let owner = "com/example/Holder";
        let body = method(vec![
            load(0),
            getfield(owner, "count"), // 1
            store(1),
            load(0),
            getfield(owner, "count"), // 4: same receiver, still available
            store(2),
            load(0),
            iconst(0),
            putfield(owner, "count"), // 8: invalidates
            load(0),
            getfield(owner, "count"), // 10
            ret(true),
        ]);
        let (cfg, _, result) = run(&body);
        let first = top_after(&cfg, &result, 1);
        let second = top_after(&cfg, &result, 4);
        let third = top_after(&cfg, &result, 10);
        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn calls_conservatively_invalidate_field_loads() {
        let owner = "com/example/Holder";
        let body = method(vec![
            load(0),
            getfield(owner, "count"), // 1
            store(1),
            invoke_static("com/example/Util", "touch", "()V"), // 3
            load(0),
            getfield(owner, "count"), // 5
            ret(true),
        ]);
        let (cfg, _, result) = run(&body);
        assert_ne!(top_after(&cfg, &result, 1), top_after(&cfg, &result, 5));
    }

    #[test]
    fn pure_callees_keep_field_loads_alive() {
        let owner = "com/example/Holder";
        let pure = MethodKey {
            owner: "com/example/Util".to_string(),
            name: "max".to_string(),
            descriptor: "(II)I".to_string(),
        };
        let mut side_effects = SideEffectMap::new();
        side_effects.insert(pure, SideEffectStatus::None);

        let body = method(vec![
            load(0),
            getfield(owner, "count"), // 1
            store(1),
            iconst(1),
            iconst(2),
            invoke_static("com/example/Util", "max", "(II)I"), // 5
            store(2),
            load(0),
            getfield(owner, "count"), // 8
            ret(true),
        ]);
        let cfg = Cfg::build(&body).expect("build cfg");
        let numbering = ValueNumbering::with_side_effects(side_effects);
        let result = analyze(&cfg, &numbering, &AnalysisConfig::default()).expect("analyze");
        assert_eq!(top_after(&cfg, &result, 1), top_after(&cfg, &result, 8));
    }

    #[test]
    fn diverging_values_merge_to_a_stable_number() {
        // y = p != 0 ? 1 : 2; use y twice.
        let body = method(vec![
            load(0),            // 0
            branch(Cmp::Ne, 5), // 1
            iconst(2),          // 2
            goto(7),            // 3
            InsnKind::Nop,      // 4: unreachable padding
            iconst(1),          // 5
            InsnKind::Nop,      // 6
            store(1),           // 7
            load(1),            // 8
            store(2),
            load(1),            // 10
            ret(true),
        ]);
        let (cfg, numbering, result) = run(&body);
        let merged = top_after(&cfg, &result, 8);
        assert_eq!(merged, top_after(&cfg, &result, 10));
        assert_eq!(ValueOrigin::Merge, numbering.origin(merged));
        assert_ne!(merged, top_after(&cfg, &result, 2));
        assert_ne!(merged, top_after(&cfg, &result, 5));
    }

    #[test]
    fn merge_of_equal_values_is_identity() {
        // Both arms leave the same constant.
        let body = method(vec![
            load(0),            // 0
            branch(Cmp::Ne, 4), // 1
            iconst(9),          // 2
            goto(6),            // 3
            iconst(9),          // 4
            InsnKind::Nop,      // 5
            store(1),           // 6
            load(1),            // 7
            ret(true),
        ]);
        let (cfg, numbering, result) = run(&body);
        let joined = top_after(&cfg, &result, 7);
        assert_eq!(
            ValueOrigin::Constant(ConstValue::Int(9)),
            numbering.origin(joined)
        );
    }

    #[test]
    fn receiver_calls_produce_per_site_results() {
        let body = method(vec![
            load(0),
            invoke_virtual("java/util/List", "size", "()I"), // 1
            store(1),
            load(0),
            invoke_virtual("java/util/List", "size", "()I"), // 4
            ret(true),
        ]);
        let (cfg, _, result) = run(&body);
        // Two call sites, two numbers: calls are never assumed pure
        // without an interprocedural verdict.
        assert_ne!(top_after(&cfg, &result, 1), top_after(&cfg, &result, 4));
    }
}
