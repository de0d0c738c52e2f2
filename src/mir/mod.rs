// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The mid-level IR object model (§3, C9): `Module`/`Function`/`BasicBlock`/
//! `Instruction`, plus the control-flow adjacency the analyses in
//! [`crate::mir::dominator`], [`crate::mir::reaching_def`], and
//! [`crate::mir::wellformed`] are computed over.
//!
//! This module assumes the frontend (out of scope per §1) has already
//! produced well-scoped single-assignment code; it expresses the shape that
//! code must have, not how to build it from bytecode.

pub mod dominator;
pub mod pass;
pub mod reaching_def;
pub mod simplify;
pub mod wellformed;

use cranelift_entity::{PrimaryMap, entity_impl};
use smallvec::SmallVec;

use crate::types::ValType;
use crate::vm::artifact::{MemoryType, TableType};
use crate::vm::{FunctionIndex, GlobalIndex, MemoryIndex, TableIndex};

pub use pass::{Pass, PassResult, SimpleFunctionPassDriver, SimpleModulePassDriver};

/// A basic block, addressed by position in [`Function::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);
entity_impl!(Block);

/// An instruction result: every instruction defines at most one `Value`,
/// per the at-most-one-definition invariant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Value(u32);
entity_impl!(Value);

/// A typed local slot, distinct from SSA `Value`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Local(u32);
entity_impl!(Local);

/// The numeric/comparison operator an `IntUnaryOp`/`IntBinaryOp`/`FpUnaryOp`/
/// `FpBinaryOp` instruction applies. Closed per this engine's scope; no
/// `validate`-style range check is needed for a Rust enum (§9 design notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    Clz,
    Ctz,
    Popcnt,
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    FCopysign,
    FAbs,
    FNeg,
    FSqrt,
    FCeil,
    FFloor,
    FTrunc,
    FNearest,
    FEq,
    FNe,
    FLt,
    FGt,
    FLe,
    FGe,
}

/// The numeric conversion an `Extend`/`Cast`/`Pack`/`Unpack` instruction
/// performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CastMode {
    Reinterpret,
    Truncate,
    Convert,
}

/// A tagged MIR instruction (§3's `Instruction` sum type). Carries its own
/// result `Value` (when it defines one) and declared operand/result types
/// inline, so well-formedness checking never needs a separate global type
/// environment.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Unreachable,
    Branch {
        cond: Option<Value>,
        true_target: Block,
        false_target: Option<Block>,
    },
    BranchTable {
        operand: Value,
        default_target: Block,
        targets: Vec<Block>,
    },
    Return {
        operand: Option<Value>,
    },
    Call {
        result: Option<Value>,
        target: FunctionIndex,
        args: Vec<Value>,
    },
    CallIndirect {
        result: Option<Value>,
        table: TableIndex,
        signature: String,
        operand: Value,
        args: Vec<Value>,
    },
    Select {
        result: Value,
        cond: Value,
        if_true: Value,
        if_false: Value,
    },
    LocalGet {
        result: Value,
        local: Local,
    },
    LocalSet {
        local: Local,
        value: Value,
    },
    GlobalGet {
        result: Value,
        global: GlobalIndex,
    },
    GlobalSet {
        global: GlobalIndex,
        value: Value,
    },
    Constant {
        result: Value,
        ty: ValType,
        bits: i64,
    },
    IntUnaryOp {
        result: Value,
        op: Opcode,
        ty: ValType,
        operand: Value,
    },
    IntBinaryOp {
        result: Value,
        op: Opcode,
        ty: ValType,
        lhs: Value,
        rhs: Value,
    },
    FpUnaryOp {
        result: Value,
        op: Opcode,
        ty: ValType,
        operand: Value,
    },
    FpBinaryOp {
        result: Value,
        op: Opcode,
        ty: ValType,
        lhs: Value,
        rhs: Value,
    },
    Load {
        result: Value,
        memory: MemoryIndex,
        offset: u32,
        ty: ValType,
        operand: Value,
    },
    Store {
        memory: MemoryIndex,
        offset: u32,
        operand: Value,
        value: Value,
    },
    MemoryGuard {
        memory: MemoryIndex,
        operand: Value,
    },
    MemoryGrow {
        result: Value,
        memory: MemoryIndex,
        delta: Value,
    },
    MemorySize {
        result: Value,
        memory: MemoryIndex,
    },
    Cast {
        result: Value,
        mode: CastMode,
        ty: ValType,
        operand: Value,
    },
    Extend {
        result: Value,
        signed: bool,
        ty: ValType,
        operand: Value,
    },
    Pack {
        result: Value,
        ty: ValType,
        operand: Value,
    },
    Unpack {
        result: Value,
        ty: ValType,
        operand: Value,
    },
    /// Candidates are `(value, incoming block)` pairs; legality requires
    /// phis to form a prefix of their block and each `value` to dominate
    /// the corresponding incoming block (§4.10).
    Phi {
        result: Value,
        candidates: Vec<(Value, Block)>,
    },
}

impl Instruction {
    /// The `Value` this instruction defines, if any.
    pub fn result(&self) -> Option<Value> {
        match self {
            Instruction::Unreachable
            | Instruction::Branch { .. }
            | Instruction::BranchTable { .. }
            | Instruction::Return { .. }
            | Instruction::LocalSet { .. }
            | Instruction::GlobalSet { .. }
            | Instruction::Store { .. }
            | Instruction::MemoryGuard { .. } => None,
            Instruction::Call { result, .. } | Instruction::CallIndirect { result, .. } => *result,
            Instruction::Select { result, .. }
            | Instruction::LocalGet { result, .. }
            | Instruction::GlobalGet { result, .. }
            | Instruction::Constant { result, .. }
            | Instruction::IntUnaryOp { result, .. }
            | Instruction::IntBinaryOp { result, .. }
            | Instruction::FpUnaryOp { result, .. }
            | Instruction::FpBinaryOp { result, .. }
            | Instruction::Load { result, .. }
            | Instruction::MemoryGrow { result, .. }
            | Instruction::MemorySize { result, .. }
            | Instruction::Cast { result, .. }
            | Instruction::Extend { result, .. }
            | Instruction::Pack { result, .. }
            | Instruction::Unpack { result, .. }
            | Instruction::Phi { result, .. } => Some(*result),
        }
    }

    /// Every `Value` this instruction reads, in no particular order. Phi
    /// candidates' values are included; their incoming blocks are not
    /// operands in the use-before-def sense.
    pub fn value_operands(&self) -> SmallVec<[Value; 4]> {
        let mut out = SmallVec::new();
        match self {
            Instruction::Unreachable => {}
            Instruction::Branch { cond, .. } => out.extend(*cond),
            Instruction::BranchTable { operand, .. } => out.push(*operand),
            Instruction::Return { operand } => out.extend(*operand),
            Instruction::Call { args, .. } => out.extend(args.iter().copied()),
            Instruction::CallIndirect { operand, args, .. } => {
                out.push(*operand);
                out.extend(args.iter().copied());
            }
            Instruction::Select { cond, if_true, if_false, .. } => {
                out.push(*cond);
                out.push(*if_true);
                out.push(*if_false);
            }
            Instruction::LocalGet { .. } | Instruction::Constant { .. } | Instruction::MemorySize { .. } => {}
            Instruction::LocalSet { value, .. } => out.push(*value),
            Instruction::GlobalGet { .. } => {}
            Instruction::GlobalSet { value, .. } => out.push(*value),
            Instruction::IntUnaryOp { operand, .. } | Instruction::FpUnaryOp { operand, .. } => out.push(*operand),
            Instruction::IntBinaryOp { lhs, rhs, .. } | Instruction::FpBinaryOp { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            Instruction::Load { operand, .. } | Instruction::MemoryGuard { operand, .. } => out.push(*operand),
            Instruction::Store { operand, value, .. } => {
                out.push(*operand);
                out.push(*value);
            }
            Instruction::MemoryGrow { delta, .. } => out.push(*delta),
            Instruction::Cast { operand, .. }
            | Instruction::Extend { operand, .. }
            | Instruction::Pack { operand, .. }
            | Instruction::Unpack { operand, .. } => out.push(*operand),
            Instruction::Phi { candidates, .. } => out.extend(candidates.iter().map(|(v, _)| *v)),
        }
        out
    }

    /// Rewrite every `Value` operand equal to `from` to `to`. Used by
    /// [`crate::mir::simplify::CfgSimplifier`]'s trivial phi elimination.
    pub fn replace_value(&mut self, from: Value, to: Value) {
        let mut replace = |v: &mut Value| {
            if *v == from {
                *v = to;
            }
        };
        match self {
            Instruction::Branch { cond: Some(c), .. } => replace(c),
            Instruction::BranchTable { operand, .. } => replace(operand),
            Instruction::Return { operand: Some(o) } => replace(o),
            Instruction::Call { args, .. } => args.iter_mut().for_each(&mut replace),
            Instruction::CallIndirect { operand, args, .. } => {
                replace(operand);
                args.iter_mut().for_each(&mut replace);
            }
            Instruction::Select { cond, if_true, if_false, .. } => {
                replace(cond);
                replace(if_true);
                replace(if_false);
            }
            Instruction::LocalSet { value, .. } | Instruction::GlobalSet { value, .. } => replace(value),
            Instruction::IntUnaryOp { operand, .. } | Instruction::FpUnaryOp { operand, .. } => replace(operand),
            Instruction::IntBinaryOp { lhs, rhs, .. } | Instruction::FpBinaryOp { lhs, rhs, .. } => {
                replace(lhs);
                replace(rhs);
            }
            Instruction::Load { operand, .. } | Instruction::MemoryGuard { operand, .. } => replace(operand),
            Instruction::Store { operand, value, .. } => {
                replace(operand);
                replace(value);
            }
            Instruction::MemoryGrow { delta, .. } => replace(delta),
            Instruction::Cast { operand, .. }
            | Instruction::Extend { operand, .. }
            | Instruction::Pack { operand, .. }
            | Instruction::Unpack { operand, .. } => replace(operand),
            Instruction::Phi { candidates, .. } => candidates.iter_mut().for_each(|(v, _)| replace(v)),
            _ => {}
        }
    }

    /// `true` for the one instruction kind a block's terminator must be.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Unreachable | Instruction::Branch { .. } | Instruction::BranchTable { .. } | Instruction::Return { .. }
        )
    }

    /// `true` for `Phi`, the only instruction kind permitted to precede
    /// other phis at the head of a block.
    pub fn is_phi(&self) -> bool {
        matches!(self, Instruction::Phi { .. })
    }

    /// The block targets this instruction may transfer control to.
    pub fn successors(&self) -> SmallVec<[Block; 2]> {
        let mut out = SmallVec::new();
        match self {
            Instruction::Branch { true_target, false_target, .. } => {
                out.push(*true_target);
                out.extend(*false_target);
            }
            Instruction::BranchTable { default_target, targets, .. } => {
                out.push(*default_target);
                out.extend(targets.iter().copied());
            }
            _ => {}
        }
        out
    }
}

/// An ordered list of instructions, well-formed only if it ends with a
/// terminator (§3).
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn push(&mut self, inst: Instruction) -> &mut Self {
        self.instructions.push(inst);
        self
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// A function's basic-block adjacency, derived from terminator targets
/// rather than stored redundantly on `BasicBlock` (§3's `inwardFlow`/
/// `outwardFlow`).
pub struct ControlFlowGraph {
    preds: cranelift_entity::SecondaryMap<Block, Vec<Block>>,
    succs: cranelift_entity::SecondaryMap<Block, Vec<Block>>,
}

impl ControlFlowGraph {
    pub fn compute(function: &Function) -> Self {
        let mut preds = cranelift_entity::SecondaryMap::new();
        let mut succs = cranelift_entity::SecondaryMap::new();
        for (block, data) in function.blocks.iter() {
            let Some(terminator) = data.terminator() else {
                continue;
            };
            let targets = terminator.successors();
            succs[block] = targets.to_vec();
            for target in targets {
                preds[target].push(block);
            }
        }
        Self { preds, succs }
    }

    pub fn predecessors(&self, block: Block) -> &[Block] {
        &self.preds[block]
    }

    pub fn successors(&self, block: Block) -> &[Block] {
        &self.succs[block]
    }
}

/// A function: typed locals, an ordered list of basic blocks, and the
/// import/export/body-present flags §4.10 cross-checks.
#[derive(Clone, Debug)]
pub struct Function {
    pub index: FunctionIndex,
    pub signature: String,
    pub locals: PrimaryMap<Local, ValType>,
    pub blocks: PrimaryMap<Block, BasicBlock>,
    pub entry: Block,
    pub imported: bool,
    pub exported: bool,
}

impl Function {
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// A memory declaration as it appears in the module (§3's `imported`/
/// `exported` cross-checks, in addition to its `MemoryType` shape).
#[derive(Clone, Debug)]
pub struct MemoryDecl {
    pub ty: MemoryType,
    pub imported: bool,
    pub exported: bool,
}

#[derive(Clone, Debug)]
pub struct TableDecl {
    pub ty: TableType,
    pub imported: bool,
    pub exported: bool,
}

/// A constant-expression global initializer: either an immediate value or
/// a reference to another (necessarily already-defined) global.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GlobalInit {
    Const(i64),
    GlobalRef(GlobalIndex),
}

#[derive(Clone, Debug)]
pub struct GlobalDecl {
    pub ty: ValType,
    pub imported: bool,
    pub exported: bool,
    pub initializer: Option<GlobalInit>,
}

#[derive(Clone, Debug)]
pub struct DataSegment {
    pub memory: MemoryIndex,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ElementSegment {
    pub table: TableIndex,
    pub offset: u32,
    pub funcs: Vec<FunctionIndex>,
}

/// A module: the declared entities plus their initializers and segments
/// (§3). Functions carry their own body directly; no separate code section
/// indirection is modeled since the frontend (out of scope) already
/// resolves that.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub functions: PrimaryMap<FunctionIndex, Function>,
    pub memories: PrimaryMap<MemoryIndex, MemoryDecl>,
    pub tables: PrimaryMap<TableIndex, TableDecl>,
    pub globals: PrimaryMap<GlobalIndex, GlobalDecl>,
    pub data_segments: Vec<DataSegment>,
    pub element_segments: Vec<ElementSegment>,
}
