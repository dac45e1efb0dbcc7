use std::fmt;

use crate::descriptor::{method_param_count, returns_value};
use crate::Result;

/// Byte offset of an instruction within a method body.
pub type Pc = u32;

/// Bytecode instruction captured for analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub pc: Pc,
    pub kind: InsnKind,
}

/// Semantic instruction classes covering the opcode families the
/// substrate distinguishes. One variant per family, consumed by
/// exhaustive matches in the transfer functions.
#[derive(Clone, Debug, PartialEq)]
pub enum InsnKind {
    /// Push a constant onto the operand stack.
    Const(ConstValue),
    /// Load a local variable slot onto the stack.
    LoadLocal { slot: u16 },
    /// Pop the stack top into a local variable slot.
    StoreLocal { slot: u16 },
    /// Read an instance or static field.
    GetField(FieldRef),
    /// Write an instance or static field.
    PutField(FieldRef),
    /// Load an array element (pops arrayref, index).
    ArrayLoad,
    /// Store an array element (pops arrayref, index, value).
    ArrayStore,
    /// Pop an arrayref, push its length.
    ArrayLength,
    /// Binary or unary arithmetic on stack operands.
    Arith(ArithOp),
    /// Conditional branch. `with_zero` compares the stack top against
    /// zero/null; otherwise the top two operands are compared, with the
    /// deeper operand on the left (`second cmp top`, as in `if_icmp*`).
    Branch { cmp: Cmp, with_zero: bool, target: Pc },
    /// Unconditional jump.
    Goto { target: Pc },
    /// Table/lookup switch dispatch.
    Switch { targets: Vec<Pc>, default: Pc },
    /// Method invocation.
    Invoke(CallSite),
    /// Method return, with or without a value on the stack.
    Return { has_value: bool },
    /// Throw the exception reference on the stack top.
    Throw,
    /// Duplicate the stack top.
    Dup,
    /// Discard the stack top.
    Pop,
    /// No effect on the frame.
    Nop,
}

/// Constant operand pushed by a `Const` instruction.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ConstValue {
    Int(i64),
    Str(String),
    Null,
}

/// Arithmetic opcode families. `Neg` is unary; the rest pop two operands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Comparison operator of a conditional branch, phrased for the taken edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cmp {
    /// The operator that holds on the not-taken edge.
    pub fn negate(self) -> Cmp {
        match self {
            Cmp::Eq => Cmp::Ne,
            Cmp::Ne => Cmp::Eq,
            Cmp::Lt => Cmp::Ge,
            Cmp::Ge => Cmp::Lt,
            Cmp::Gt => Cmp::Le,
            Cmp::Le => Cmp::Gt,
        }
    }

    /// The operator with its operands swapped.
    pub fn swap(self) -> Cmp {
        match self {
            Cmp::Eq => Cmp::Eq,
            Cmp::Ne => Cmp::Ne,
            Cmp::Lt => Cmp::Gt,
            Cmp::Ge => Cmp::Le,
            Cmp::Gt => Cmp::Lt,
            Cmp::Le => Cmp::Ge,
        }
    }
}

/// Field reference operand.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub is_static: bool,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: CallKind,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallSite {
    /// Constructor invocations are handed over by the decoder with the
    /// `new`/`dup`/`invokespecial` triple folded into one allocation-style
    /// call: no receiver operand, and the fresh instance as the result.
    pub fn is_constructor(&self) -> bool {
        self.kind == CallKind::Special && self.name == "<init>"
    }

    /// Number of stack operands consumed: declared parameters plus the
    /// receiver for non-allocating instance calls.
    pub fn popped_args(&self) -> Result<usize> {
        let params = method_param_count(&self.descriptor)?;
        Ok(match self.kind {
            CallKind::Static => params,
            _ if self.is_constructor() => params,
            _ => params + 1,
        })
    }

    /// Whether the invocation pushes a result.
    pub fn pushes_result(&self) -> Result<bool> {
        if self.is_constructor() {
            return Ok(true);
        }
        returns_value(&self.descriptor)
    }

    pub fn key(&self) -> MethodKey {
        MethodKey {
            owner: self.owner.clone(),
            name: self.name.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl InsnKind {
    /// Operand-stack effect as (popped, pushed) slot counts.
    pub fn stack_effect(&self) -> Result<(usize, usize)> {
        Ok(match self {
            InsnKind::Const(_) => (0, 1),
            InsnKind::LoadLocal { .. } => (0, 1),
            InsnKind::StoreLocal { .. } => (1, 0),
            InsnKind::GetField(field) => (if field.is_static { 0 } else { 1 }, 1),
            InsnKind::PutField(field) => (if field.is_static { 1 } else { 2 }, 0),
            InsnKind::ArrayLoad => (2, 1),
            InsnKind::ArrayStore => (3, 0),
            InsnKind::ArrayLength => (1, 1),
            InsnKind::Arith(ArithOp::Neg) => (1, 1),
            InsnKind::Arith(_) => (2, 1),
            InsnKind::Branch { with_zero, .. } => (if *with_zero { 1 } else { 2 }, 0),
            InsnKind::Goto { .. } => (0, 0),
            InsnKind::Switch { .. } => (1, 0),
            InsnKind::Invoke(call) => {
                let pushed = usize::from(call.pushes_result()?);
                (call.popped_args()?, pushed)
            }
            InsnKind::Return { has_value } => (usize::from(*has_value), 0),
            InsnKind::Throw => (1, 0),
            InsnKind::Dup => (1, 2),
            InsnKind::Pop => (1, 0),
            InsnKind::Nop => (0, 0),
        })
    }

    /// Branch targets of this instruction, excluding fall-through.
    pub fn branch_targets(&self) -> Vec<Pc> {
        match self {
            InsnKind::Branch { target, .. } | InsnKind::Goto { target } => vec![*target],
            InsnKind::Switch { targets, default } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn ends_control_flow(&self) -> bool {
        matches!(
            self,
            InsnKind::Goto { .. }
                | InsnKind::Switch { .. }
                | InsnKind::Return { .. }
                | InsnKind::Throw
        )
    }

    /// Whether this instruction leaves the method.
    pub fn is_exit(&self) -> bool {
        matches!(self, InsnKind::Return { .. } | InsnKind::Throw)
    }
}

/// Exception handler metadata from the Code attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionHandler {
    pub start_pc: Pc,
    pub end_pc: Pc,
    pub handler_pc: Pc,
    pub catch_type: Option<String>,
}

/// Decoded method body handed over by the class-file layer.
#[derive(Clone, Debug)]
pub struct MethodBody {
    pub insns: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
    /// Local variable slots, parameters included.
    pub max_locals: u16,
    /// Leading local slots holding parameters, the receiver included
    /// for instance methods.
    pub param_slots: u16,
    pub is_static: bool,
}

/// Method identity used for call graphs and diagnostics.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MethodKey {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}
