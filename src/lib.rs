// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ahead-of-time WebAssembly execution engine core: a typed mid-level IR
//! analysis framework and the instance runtime that links and runs the
//! artifacts it verifies.

mod error;
mod host;
mod mir;
mod types;
mod vm;

pub type Result<T> = anyhow::Result<T>;

pub use error::{Errno, LinkError, Trap};
pub use host::{HostContext, Wasi};
pub use mir::{
    BasicBlock, Block, CastMode, ControlFlowGraph, DataSegment, ElementSegment, Function,
    GlobalDecl, GlobalInit, Instruction, Local, MemoryDecl, Module as MirModule, Opcode, Pass,
    PassResult, SimpleFunctionPassDriver, SimpleModulePassDriver, TableDecl, Value,
    dominator::DominatorTree,
    reaching_def::ReachingDefs,
    simplify::CfgSimplifier,
    wellformed::{Site, SiteKind, WellFormedness, WellFormednessConfig},
};
pub use types::{FuncType, ValType};
pub use vm::{
    AbiValue, Artifact, Callee, DlArtifact, FunctionIndex, Global, GlobalIndex, Instance,
    InstanceBuilder, LinearMemory, MemoryIndex, SignatureMismatch, Table, TableIndex,
    artifact::{
        EntityMetadata, ExportDescriptor, FunctionMetadata, GlobalMetadata, GlobalType,
        ImportDescriptor, MemoryMetadata, MemoryType, TableMetadata, TableType,
    },
};

/// The size, in bytes, of one WebAssembly page.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;
