// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reaching-definition analysis (§4.9, C12): because the MIR is already in
//! SSA, every instruction is its own definition, so this reduces to
//! forward propagation of per-block definition sets to a fixpoint. Used
//! only as an optional cross-check against the cheaper dominance-based
//! validator (see [`crate::mir::wellformed::WellFormednessConfig`]), never
//! as input to an optimization.

use std::collections::BTreeSet;

use cranelift_entity::SecondaryMap;

use crate::mir::{Block, ControlFlowGraph, Function, Value};

/// `Out(B)` for every block `B`: the set of `Value`s defined in `B` or any
/// of its (transitive) predecessors.
pub struct ReachingDefs {
    out: SecondaryMap<Block, BTreeSet<Value>>,
}

impl ReachingDefs {
    pub fn compute(function: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut out: SecondaryMap<Block, BTreeSet<Value>> = SecondaryMap::new();
        for (block, data) in function.blocks.iter() {
            out[block] = data.instructions.iter().filter_map(super::Instruction::result).collect();
        }

        let mut changed = true;
        while changed {
            changed = false;
            for (block, _) in function.blocks.iter() {
                let incoming: Vec<Value> = cfg
                    .predecessors(block)
                    .iter()
                    .flat_map(|&pred| out[pred].iter().copied())
                    .collect();
                let before = out[block].len();
                out[block].extend(incoming);
                if out[block].len() != before {
                    changed = true;
                }
            }
        }

        Self { out }
    }

    /// `true` iff `value`'s definition reaches the end of `block`.
    pub fn reaches(&self, value: Value, block: Block) -> bool {
        self.out[block].contains(&value)
    }

    pub fn out_set(&self, block: Block) -> impl Iterator<Item = Value> + '_ {
        self.out[block].iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use cranelift_entity::PrimaryMap;

    use super::*;
    use crate::mir::{BasicBlock, Instruction, Opcode};
    use crate::types::ValType;
    use crate::vm::FunctionIndex;

    #[test]
    fn definitions_propagate_to_every_successor() {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::default());
        let next = blocks.push(BasicBlock::default());

        let defined = Value::from_u32(0);
        blocks[entry].push(Instruction::Constant {
            result: defined,
            ty: ValType::I32,
            bits: 1,
        });
        blocks[entry].push(Instruction::Branch {
            cond: None,
            true_target: next,
            false_target: None,
        });
        blocks[next].push(Instruction::IntUnaryOp {
            result: Value::from_u32(1),
            op: Opcode::Clz,
            ty: ValType::I32,
            operand: defined,
        });
        blocks[next].push(Instruction::Return { operand: None });

        let function = Function {
            index: FunctionIndex::from_u32(0),
            signature: ":".to_string(),
            locals: PrimaryMap::new(),
            blocks,
            entry,
            imported: false,
            exported: false,
        };

        let cfg = ControlFlowGraph::compute(&function);
        let reaching = ReachingDefs::compute(&function, &cfg);

        assert!(reaching.reaches(defined, entry));
        assert!(reaching.reaches(defined, next));
    }
}
