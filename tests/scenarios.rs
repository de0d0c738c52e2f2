//! End-to-end scenarios exercising the public API: the MIR analyses against
//! small hand-built functions, and the instance runtime against small
//! hand-built artifacts. No compiled `.so` is involved — artifacts here are
//! an in-crate-independent fake, the same role `FakeArtifact` plays in the
//! library's own unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use cranelift_entity::PrimaryMap;

use waruntime::{
    Artifact, Block, CfgSimplifier, ControlFlowGraph, DominatorTree, EntityMetadata,
    ExportDescriptor, Function, FunctionIndex, FunctionMetadata, GlobalMetadata, HostContext,
    ImportDescriptor, Instance, InstanceBuilder, Instruction, LinearMemory, LinkError,
    MemoryMetadata, MemoryType, Opcode, Pass, PassResult, SimpleFunctionPassDriver,
    TableMetadata, Trap, ValType, Value, Wasi,
};
use waruntime::{BasicBlock, Module as MirModule};

fn empty_metadata<T>() -> EntityMetadata<T> {
    EntityMetadata {
        types: Vec::new(),
        imports: Vec::new(),
        exports: Vec::new(),
    }
}

/// A minimal [`Artifact`] for tests: metadata tables the caller supplies
/// directly, and an `initialize` that does nothing. Stands in for a real
/// compiled shared object, which this test suite never builds.
struct TestArtifact {
    memory: MemoryMetadata,
    table: TableMetadata,
    global: GlobalMetadata,
    function: FunctionMetadata,
}

impl Artifact for TestArtifact {
    fn memory_metadata(&self) -> &MemoryMetadata {
        &self.memory
    }

    fn table_metadata(&self) -> &TableMetadata {
        &self.table
    }

    fn global_metadata(&self) -> &GlobalMetadata {
        &self.global
    }

    fn function_metadata(&self) -> &FunctionMetadata {
        &self.function
    }

    unsafe fn initialize(&self, _storage: *mut *mut u8) -> waruntime::Result<()> {
        Ok(())
    }
}

fn artifact_with_memory(memory: MemoryMetadata) -> Box<dyn Artifact> {
    Box::new(TestArtifact {
        memory,
        table: empty_metadata(),
        global: empty_metadata(),
        function: empty_metadata(),
    })
}

fn diamond_function() -> (Function, Block, Block, Block, Block) {
    let mut blocks = PrimaryMap::new();
    let entry = blocks.push(BasicBlock::default());
    let left = blocks.push(BasicBlock::default());
    let right = blocks.push(BasicBlock::default());
    let merge = blocks.push(BasicBlock::default());

    blocks[entry].push(Instruction::Branch {
        cond: None,
        true_target: left,
        false_target: Some(right),
    });
    blocks[left].push(Instruction::Branch {
        cond: None,
        true_target: merge,
        false_target: None,
    });
    blocks[right].push(Instruction::Branch {
        cond: None,
        true_target: merge,
        false_target: None,
    });
    blocks[merge].push(Instruction::Return { operand: None });

    let function = Function {
        index: FunctionIndex::from_u32(0),
        signature: ":".to_string(),
        locals: PrimaryMap::new(),
        blocks,
        entry,
        imported: false,
        exported: true,
    };
    (function, entry, left, right, merge)
}

/// §8 scenario 1: a diamond's dominator sets are exactly the entry plus the
/// block itself at each arm, and the merge point.
#[test]
fn diamond_dominator_sets_match_the_textbook_shape() {
    let (function, entry, left, right, merge) = diamond_function();
    let cfg = ControlFlowGraph::compute(&function);
    let domtree = DominatorTree::compute(&function, &cfg);

    assert_eq!(domtree.get(entry), &[entry]);
    assert_eq!(domtree.get(left), &[entry, left]);
    assert_eq!(domtree.get(right), &[entry, right]);
    assert_eq!(domtree.get(merge), &[entry, merge]);

    assert!(domtree.dominates(entry, merge));
    assert!(!domtree.dominates(left, merge));
    assert!(!domtree.dominates(right, merge));
}

/// §8 scenario 2: a phi with one real source and a self-reference is
/// trivial and collapses away, and every use of its result is rewired to
/// that source.
#[test]
fn trivial_phi_collapses_and_merges_its_block_into_the_predecessor() {
    let mut blocks = PrimaryMap::new();
    let entry = blocks.push(BasicBlock::default());
    let merge = blocks.push(BasicBlock::default());

    let defined = Value::from_u32(0);
    blocks[entry].push(Instruction::Constant {
        result: defined,
        ty: ValType::I32,
        bits: 9,
    });
    blocks[entry].push(Instruction::Branch {
        cond: None,
        true_target: merge,
        false_target: None,
    });

    let phi_result = Value::from_u32(1);
    blocks[merge].push(Instruction::Phi {
        result: phi_result,
        candidates: vec![(defined, entry), (phi_result, merge)],
    });
    blocks[merge].push(Instruction::IntUnaryOp {
        result: Value::from_u32(2),
        op: Opcode::Clz,
        ty: ValType::I32,
        operand: phi_result,
    });
    blocks[merge].push(Instruction::Return { operand: None });

    let mut function = Function {
        index: FunctionIndex::from_u32(0),
        signature: ":".to_string(),
        locals: PrimaryMap::new(),
        blocks,
        entry,
        imported: false,
        exported: true,
    };

    SimpleFunctionPassDriver::drive(CfgSimplifier::new(), &mut function);

    let collapsed = &function.blocks[function.entry];
    assert!(!collapsed.instructions.iter().any(Instruction::is_phi));
    assert!(collapsed.instructions.iter().any(|inst| matches!(
        inst,
        Instruction::IntUnaryOp { operand, .. } if *operand == defined
    )));
    assert!(matches!(
        collapsed.instructions.last(),
        Some(Instruction::Return { operand: None })
    ));
}

/// §8 scenario 3: a memory grown after two instances share it through an
/// import keeps both instances' view of its base pointer and bounds in
/// sync — the externally observable half of the storage-slot re-addressing
/// the runtime performs internally (see `Instance`'s own unit tests for the
/// slot-rewrite mechanism itself).
#[test]
fn memory_grow_stays_consistent_across_instances_sharing_an_import() {
    let owner = InstanceBuilder::new(artifact_with_memory(MemoryMetadata {
        types: vec![MemoryType { min: 1, max: Some(8) }],
        imports: Vec::new(),
        exports: vec![ExportDescriptor {
            index: 0,
            name: "memory".to_string(),
        }],
    }))
    .build()
    .unwrap();

    let shared: Rc<RefCell<LinearMemory>> = owner.exported_memory("memory").unwrap().clone();

    let mut importer_builder = InstanceBuilder::new(artifact_with_memory(MemoryMetadata {
        types: vec![MemoryType { min: 1, max: Some(8) }],
        imports: vec![ImportDescriptor {
            index: 0,
            module: "env".to_string(),
            name: "memory".to_string(),
        }],
        exports: vec![ExportDescriptor {
            index: 0,
            name: "memory".to_string(),
        }],
    }));
    importer_builder.provide_memory("env", "memory", shared.clone());
    let importer = importer_builder.build().unwrap();

    let grown = shared.borrow_mut().grow(2);
    assert_eq!(grown, 3);

    let owner_view = owner.exported_memory("memory").unwrap().borrow();
    let importer_view = importer.exported_memory("memory").unwrap().borrow();
    assert_eq!(owner_view.size(), 3);
    assert_eq!(importer_view.size(), 3);
    assert_eq!(owner_view.base_ptr(), importer_view.base_ptr());
}

/// §8 scenario 4: a host-provided global whose type doesn't match the
/// artifact's declared import type is rejected at link time, not silently
/// coerced.
#[test]
fn mismatched_import_type_is_rejected_at_link_time() {
    let artifact: Box<dyn Artifact> = Box::new(TestArtifact {
        memory: empty_metadata(),
        table: empty_metadata(),
        global: GlobalMetadata {
            types: vec![ValType::I64],
            imports: vec![ImportDescriptor {
                index: 0,
                module: "env".to_string(),
                name: "counter".to_string(),
            }],
            exports: Vec::new(),
        },
        function: empty_metadata(),
    });

    let mismatched = Rc::new(RefCell::new(waruntime::Global::zeroed(ValType::I32)));
    let mut builder = InstanceBuilder::new(artifact);
    builder.provide_global("env", "counter", mismatched);

    let err = builder.build().unwrap_err();
    assert!(matches!(err, LinkError::ImportTypeMismatch { .. }));
}

/// §8 scenario 5: `fd_write` to stdout reports the byte count it wrote.
#[test]
fn fd_write_to_stdout_reports_bytes_written() {
    let instance: Box<Instance> = InstanceBuilder::new(artifact_with_memory(MemoryMetadata {
        types: vec![MemoryType { min: 1, max: Some(1) }],
        imports: Vec::new(),
        exports: vec![ExportDescriptor {
            index: 0,
            name: "memory".to_string(),
        }],
    }))
    .build()
    .unwrap();

    let memory = instance.exported_memory("memory").unwrap();
    let message = b"hello from a scenario test\n";
    {
        let mut mem = memory.borrow_mut();
        mem.get_range_mut(64, message.len() as u64)
            .unwrap()
            .copy_from_slice(message);
        // One ciovec at address 0: {buf: 64, len: message.len()}.
        mem.get_range_mut(0, 4).unwrap().copy_from_slice(&64u32.to_le_bytes());
        mem.get_range_mut(4, 4)
            .unwrap()
            .copy_from_slice(&(message.len() as u32).to_le_bytes());
    }

    let ctx = HostContext::new(&instance);
    let errno = Wasi::fd_write(&ctx, 1, 0, 1, 96);
    assert_eq!(errno, 0);

    let written = memory.borrow().get_range(96, 4).unwrap().to_vec();
    assert_eq!(u32::from_le_bytes(written.try_into().unwrap()), message.len() as u32);
}

/// §8 scenario 6: `proc_exit(42)` raises the out-of-band exit trap rather
/// than an errno.
#[test]
fn proc_exit_raises_the_exit_trap_with_its_code() {
    assert_eq!(Wasi::proc_exit(42), Trap::Exit(42));
}

/// A module-level sanity check that the well-formedness pass framework and
/// the exported MIR module type compose: an empty module is trivially
/// well-formed.
#[test]
fn empty_module_is_well_formed() {
    let module = MirModule::default();
    let mut checker = waruntime::WellFormedness::new(waruntime::WellFormednessConfig::default());
    assert!(checker.check(&module).is_empty());
    let _: PassResult = PassResult::Converged;
}
