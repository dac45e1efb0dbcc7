//! Shared builders for in-memory method bodies used across test modules.

use crate::ir::{
    CallKind, CallSite, Cmp, ConstValue, ExceptionHandler, FieldRef, InsnKind, Instruction,
    MethodBody, Pc,
};

/// A static single-parameter method whose instruction pcs are their
/// list indices.
pub(crate) fn method(kinds: Vec<InsnKind>) -> MethodBody {
    MethodBody {
        insns: kinds
            .into_iter()
            .enumerate()
            .map(|(index, kind)| Instruction {
                pc: index as Pc,
                kind,
            })
            .collect(),
        handlers: Vec::new(),
        max_locals: 8,
        param_slots: 1,
        is_static: true,
    }
}

pub(crate) fn method_with_handlers(
    kinds: Vec<InsnKind>,
    handlers: Vec<ExceptionHandler>,
) -> MethodBody {
    let mut body = method(kinds);
    body.handlers = handlers;
    body
}

pub(crate) fn handler(start_pc: Pc, end_pc: Pc, handler_pc: Pc) -> ExceptionHandler {
    ExceptionHandler {
        start_pc,
        end_pc,
        handler_pc,
        catch_type: Some("java/io/IOException".to_string()),
    }
}

pub(crate) fn load(slot: u16) -> InsnKind {
    InsnKind::LoadLocal { slot }
}

pub(crate) fn store(slot: u16) -> InsnKind {
    InsnKind::StoreLocal { slot }
}

pub(crate) fn iconst(value: i64) -> InsnKind {
    InsnKind::Const(ConstValue::Int(value))
}

/// Single-operand branch comparing the stack top against zero.
pub(crate) fn branch(cmp: Cmp, target: Pc) -> InsnKind {
    InsnKind::Branch {
        cmp,
        with_zero: true,
        target,
    }
}

/// Two-operand branch (`if_icmp*` style).
pub(crate) fn branch2(cmp: Cmp, target: Pc) -> InsnKind {
    InsnKind::Branch {
        cmp,
        with_zero: false,
        target,
    }
}

pub(crate) fn goto(target: Pc) -> InsnKind {
    InsnKind::Goto { target }
}

pub(crate) fn ret(has_value: bool) -> InsnKind {
    InsnKind::Return { has_value }
}

pub(crate) fn getfield(owner: &str, name: &str) -> InsnKind {
    InsnKind::GetField(FieldRef {
        owner: owner.to_string(),
        name: name.to_string(),
        is_static: false,
    })
}

pub(crate) fn putfield(owner: &str, name: &str) -> InsnKind {
    InsnKind::PutField(FieldRef {
        owner: owner.to_string(),
        name: name.to_string(),
        is_static: false,
    })
}

pub(crate) fn call_site(kind: CallKind, owner: &str, name: &str, descriptor: &str) -> CallSite {
    CallSite {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        kind,
    }
}

pub(crate) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> InsnKind {
    InsnKind::Invoke(call_site(CallKind::Virtual, owner, name, descriptor))
}

pub(crate) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> InsnKind {
    InsnKind::Invoke(call_site(CallKind::Static, owner, name, descriptor))
}

/// Constructor call modeled as a special invocation that leaves the new
/// instance on the stack.
pub(crate) fn invoke_ctor(owner: &str, descriptor: &str) -> InsnKind {
    InsnKind::Invoke(call_site(CallKind::Special, owner, "<init>", descriptor))
}
