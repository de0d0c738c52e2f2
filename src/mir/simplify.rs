// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The CFG simplifier (§4.11, C14): a function pass that runs two
//! reductions to a fixpoint — trivial phi elimination, then straight-line
//! predecessor merging — scanning all of a block's phis before considering
//! any merge.

use crate::mir::pass::{Pass, PassResult};
use crate::mir::{Block, ControlFlowGraph, Function, Instruction};

/// Collapses redundant phis and straight-line block chains. Neither
/// reduction changes observable behavior; both only shrink the CFG the
/// well-formedness checker and any downstream consumer has to walk.
#[derive(Default)]
pub struct CfgSimplifier;

impl CfgSimplifier {
    pub fn new() -> Self {
        Self
    }

    /// A phi is trivial when every candidate value is either the phi's own
    /// result (a self-loop) or one other single value repeated; such a phi
    /// can be replaced everywhere by that one value.
    fn trivial_phi_target(phi_result: crate::mir::Value, candidates: &[(crate::mir::Value, Block)]) -> Option<crate::mir::Value> {
        let mut target = None;
        for &(value, _) in candidates {
            if value == phi_result {
                continue;
            }
            match target {
                None => target = Some(value),
                Some(existing) if existing == value => {}
                Some(_) => return None,
            }
        }
        target
    }

    fn eliminate_trivial_phis(&self, function: &mut Function) -> bool {
        let mut changed = false;
        let blocks: Vec<Block> = function.blocks.keys().collect();

        for &block in &blocks {
            let mut rewrites = Vec::new();
            for inst in &function.blocks[block].instructions {
                if let Instruction::Phi { result, candidates } = inst {
                    if let Some(target) = Self::trivial_phi_target(*result, candidates) {
                        rewrites.push((*result, target));
                    }
                }
            }
            if rewrites.is_empty() {
                continue;
            }

            function.blocks[block].instructions.retain(|inst| {
                !matches!(inst, Instruction::Phi { result, .. } if rewrites.iter().any(|&(from, _)| from == *result))
            });

            for &(from, to) in &rewrites {
                for (_, data) in function.blocks.iter_mut() {
                    for inst in &mut data.instructions {
                        inst.replace_value(from, to);
                    }
                }
            }
            changed = true;
        }

        changed
    }

    /// `pred -> succ` merges when `pred` has exactly one successor, `succ`
    /// has exactly one predecessor, and `succ` is not the function entry
    /// (merging into the entry would require retargeting callers, which is
    /// out of scope for a same-function reduction).
    fn merge_straight_line_blocks(&self, function: &mut Function, cfg: &ControlFlowGraph) -> bool {
        let blocks: Vec<Block> = function.blocks.keys().collect();

        for &pred in &blocks {
            let succs = cfg.successors(pred);
            let [succ] = succs else { continue };
            let succ = *succ;
            if succ == function.entry {
                continue;
            }
            let succ_preds = cfg.predecessors(succ);
            if succ_preds.len() != 1 || succ_preds[0] != pred {
                continue;
            }
            if succ == pred {
                continue;
            }

            let tail = std::mem::take(&mut function.blocks[succ]).instructions;
            function.blocks[pred].instructions.pop();
            function.blocks[pred].instructions.extend(tail);
            retarget_block(function, succ, pred);
            return true;
        }

        false
    }
}

/// Every instruction's `Block` operand equal to `from` is rewritten to `to`.
/// Unlike `Instruction::replace_value`, which rewrites SSA `Value`
/// operands, this walks branch/branch-table/phi targets.
fn retarget_block(function: &mut Function, from: Block, to: Block) {
    for (_, data) in function.blocks.iter_mut() {
        for inst in &mut data.instructions {
            match inst {
                Instruction::Branch {
                    true_target,
                    false_target,
                    ..
                } => {
                    if *true_target == from {
                        *true_target = to;
                    }
                    if *false_target == Some(from) {
                        *false_target = Some(to);
                    }
                }
                Instruction::BranchTable {
                    default_target,
                    targets,
                    ..
                } => {
                    if *default_target == from {
                        *default_target = to;
                    }
                    for target in targets.iter_mut() {
                        if *target == from {
                            *target = to;
                        }
                    }
                }
                Instruction::Phi { candidates, .. } => {
                    for (_, incoming) in candidates.iter_mut() {
                        if *incoming == from {
                            *incoming = to;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if function.entry == from {
        function.entry = to;
    }
}

impl Pass for CfgSimplifier {
    type Item = Function;
    type Output = ();

    fn run(&mut self, function: &mut Function) -> PassResult {
        let phis_changed = self.eliminate_trivial_phis(function);
        let cfg = ControlFlowGraph::compute(function);
        let merged = self.merge_straight_line_blocks(function, &cfg);

        if phis_changed || merged {
            PassResult::InProgress
        } else {
            PassResult::Converged
        }
    }

    fn into_result(self) {}
}

#[cfg(test)]
mod tests {
    use cranelift_entity::PrimaryMap;

    use super::*;
    use crate::mir::pass::SimpleFunctionPassDriver;
    use crate::mir::{BasicBlock, Value};
    use crate::types::ValType;
    use crate::vm::FunctionIndex;

    fn function_with_blocks(blocks: PrimaryMap<Block, BasicBlock>, entry: Block) -> Function {
        Function {
            index: FunctionIndex::from_u32(0),
            signature: ":".to_string(),
            locals: PrimaryMap::new(),
            blocks,
            entry,
            imported: false,
            exported: false,
        }
    }

    #[test]
    fn trivial_phi_is_replaced_by_its_single_source() {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::default());
        let merge = blocks.push(BasicBlock::default());

        let defined = Value::from_u32(0);
        blocks[entry].push(Instruction::Constant {
            result: defined,
            ty: ValType::I32,
            bits: 7,
        });
        blocks[entry].push(Instruction::Branch {
            cond: None,
            true_target: merge,
            false_target: None,
        });

        let phi_result = Value::from_u32(1);
        blocks[merge].push(Instruction::Phi {
            result: phi_result,
            candidates: vec![(defined, entry)],
        });
        blocks[merge].push(Instruction::IntUnaryOp {
            result: Value::from_u32(2),
            op: crate::mir::Opcode::Clz,
            ty: ValType::I32,
            operand: phi_result,
        });
        blocks[merge].push(Instruction::Return { operand: None });

        let mut function = function_with_blocks(blocks, entry);
        SimpleFunctionPassDriver::drive(CfgSimplifier::new(), &mut function);

        let merged_block = &function.blocks[function.entry];
        assert!(!merged_block.instructions.iter().any(Instruction::is_phi));
        assert!(merged_block.instructions.iter().any(|inst| matches!(
            inst,
            Instruction::IntUnaryOp { operand, .. } if *operand == defined
        )));
    }

    #[test]
    fn straight_line_chain_collapses_into_one_block() {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::default());
        let middle = blocks.push(BasicBlock::default());
        let tail = blocks.push(BasicBlock::default());

        blocks[entry].push(Instruction::Branch {
            cond: None,
            true_target: middle,
            false_target: None,
        });
        blocks[middle].push(Instruction::Branch {
            cond: None,
            true_target: tail,
            false_target: None,
        });
        blocks[tail].push(Instruction::Return { operand: None });

        let mut function = function_with_blocks(blocks, entry);
        SimpleFunctionPassDriver::drive(CfgSimplifier::new(), &mut function);

        assert_eq!(function.blocks[function.entry].instructions.len(), 1);
        assert!(matches!(
            function.blocks[function.entry].instructions[0],
            Instruction::Return { operand: None }
        ));
    }

    #[test]
    fn already_simplified_function_converges_without_changes() {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::default());
        blocks[entry].push(Instruction::Return { operand: None });

        let mut function = function_with_blocks(blocks, entry);
        let before = function.clone();
        SimpleFunctionPassDriver::drive(CfgSimplifier::new(), &mut function);

        assert_eq!(function.blocks.len(), before.blocks.len());
    }
}
