// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dominator analysis (§4.8, C11): the naive iterative intersection-of-
//! predecessors fixpoint, not Cooper's idom-chasing algorithm — each
//! block's dominator set is represented directly as a sorted `Vec<Block>`
//! rather than collapsed to a single immediate dominator, since the
//! well-formedness checker only ever needs set membership (`dominates`),
//! never the tree structure itself.

use cranelift_entity::{EntityRef, SecondaryMap};

use crate::mir::{Block, ControlFlowGraph, Function};

/// `Dom(B)` for every block `B` in a function, computed to a fixpoint.
pub struct DominatorTree {
    dominators: SecondaryMap<Block, Vec<Block>>,
}

impl DominatorTree {
    pub fn compute(function: &Function, cfg: &ControlFlowGraph) -> Self {
        let all_blocks: Vec<Block> = function.blocks.keys().collect();

        let mut dominators: SecondaryMap<Block, Vec<Block>> = SecondaryMap::new();
        for &block in &all_blocks {
            dominators[block] = if block == function.entry {
                vec![function.entry]
            } else {
                all_blocks.clone()
            };
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &block in &all_blocks {
                if block == function.entry {
                    continue;
                }

                let preds = cfg.predecessors(block);
                let mut new_set = match preds.split_first() {
                    None => Vec::new(),
                    Some((&first, rest)) => {
                        let mut acc = dominators[first].clone();
                        for &pred in rest {
                            acc = intersect_sorted(&acc, &dominators[pred]);
                        }
                        acc
                    }
                };

                if let Err(pos) = new_set.binary_search(&block) {
                    new_set.insert(pos, block);
                }

                if new_set != dominators[block] {
                    dominators[block] = new_set;
                    changed = true;
                }
            }
        }

        Self { dominators }
    }

    /// The sorted dominator set of `block`, including `block` itself
    /// (unless `block` is unreachable dead code with no predecessors).
    pub fn get(&self, block: Block) -> &[Block] {
        &self.dominators[block]
    }

    /// `true` iff `v` dominates `u`: every path from the entry to `u`
    /// passes through `v`. Reflexive: a block dominates itself.
    pub fn dominates(&self, v: Block, u: Block) -> bool {
        self.dominators[u].binary_search(&v).is_ok()
    }
}

fn intersect_sorted(a: &[Block], b: &[Block]) -> Vec<Block> {
    let mut result = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].index().cmp(&b[j].index()) {
            std::cmp::Ordering::Equal => {
                result.push(a[i]);
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use cranelift_entity::PrimaryMap;

    use super::*;
    use crate::mir::{BasicBlock, Instruction};
    use crate::vm::FunctionIndex;

    /// `E -> A, B`; `A, B -> M`.
    fn diamond() -> (Function, Block, Block, Block, Block) {
        let mut blocks = PrimaryMap::new();
        let e = blocks.push(BasicBlock::default());
        let a = blocks.push(BasicBlock::default());
        let b = blocks.push(BasicBlock::default());
        let m = blocks.push(BasicBlock::default());

        blocks[e].push(Instruction::Branch {
            cond: None,
            true_target: a,
            false_target: Some(b),
        });
        blocks[a].push(Instruction::Branch {
            cond: None,
            true_target: m,
            false_target: None,
        });
        blocks[b].push(Instruction::Branch {
            cond: None,
            true_target: m,
            false_target: None,
        });
        blocks[m].push(Instruction::Return { operand: None });

        let function = Function {
            index: FunctionIndex::from_u32(0),
            signature: ":".to_string(),
            locals: PrimaryMap::new(),
            blocks,
            entry: e,
            imported: false,
            exported: false,
        };
        (function, e, a, b, m)
    }

    #[test]
    fn diamond_dominator_sets() {
        let (function, e, a, b, m) = diamond();
        let cfg = ControlFlowGraph::compute(&function);
        let domtree = DominatorTree::compute(&function, &cfg);

        assert_eq!(domtree.get(e), &[e]);
        assert_eq!(domtree.get(a), &[e, a]);
        assert_eq!(domtree.get(b), &[e, b]);
        assert_eq!(domtree.get(m), &[e, m]);
    }

    #[test]
    fn dominates_is_reflexive_and_transitive_on_reachable_blocks() {
        let (function, e, a, _b, m) = diamond();
        let cfg = ControlFlowGraph::compute(&function);
        let domtree = DominatorTree::compute(&function, &cfg);

        assert!(domtree.dominates(e, e));
        assert!(domtree.dominates(e, a));
        assert!(domtree.dominates(e, m));
        assert!(!domtree.dominates(a, m));
        assert!(!domtree.dominates(a, e));
    }

    #[test]
    fn unreachable_block_dominates_only_itself() {
        let mut blocks = PrimaryMap::new();
        let e = blocks.push(BasicBlock::default());
        blocks[e].push(Instruction::Return { operand: None });
        let dead = blocks.push(BasicBlock::default());
        blocks[dead].push(Instruction::Return { operand: None });

        let function = Function {
            index: FunctionIndex::from_u32(0),
            signature: ":".to_string(),
            locals: PrimaryMap::new(),
            blocks,
            entry: e,
            imported: false,
            exported: false,
        };

        let cfg = ControlFlowGraph::compute(&function);
        let domtree = DominatorTree::compute(&function, &cfg);
        assert_eq!(domtree.get(dead), &[dead]);
    }
}
