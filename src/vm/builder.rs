// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builds an [`Instance`] from an opened [`Artifact`] and a set of
//! host-provided import bindings, per §4.3.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::LinkError;
use crate::types::ValType;
use crate::vm::artifact::{Artifact, DlArtifact, ImportDescriptor};
use crate::vm::global::Global;
use crate::vm::instance::Instance;
use crate::vm::memory::LinearMemory;
use crate::vm::table::Table;
use crate::vm::{FunctionIndex, GlobalIndex, MemoryIndex, TableIndex};

/// A host-provided binding for one import, keyed by `(module, name)`.
enum ImportValue {
    Memory(Rc<RefCell<LinearMemory>>),
    Global(Rc<RefCell<Global>>),
    Function { func_ptr: *const (), signature: Arc<str> },
}

/// The native OS page size used to size the guard region ahead of every
/// [`LinearMemory`]. 4 KiB matches every mainstream target this engine
/// runs on; a platform with a larger page size would need this threaded
/// through from `sysconf`, which this core core does not do (see
/// `DESIGN.md`).
const NATIVE_PAGE_SIZE: usize = 4096;

/// Accepts host-provided imports and builds the [`Instance`] for one
/// artifact. Mirrors the six-step process of §4.3: open artifact (done by
/// the caller, via [`InstanceBuilder::open`] or [`InstanceBuilder::new`]),
/// allocate `Storage`, resolve imports, build definitions, call
/// `initialize`, populate exports.
pub struct InstanceBuilder {
    artifact: Box<dyn Artifact>,
    imports: HashMap<(String, String), ImportValue>,
}

impl InstanceBuilder {
    pub fn new(artifact: Box<dyn Artifact>) -> Self {
        Self {
            artifact,
            imports: HashMap::new(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        Ok(Self::new(Box::new(DlArtifact::open(path)?)))
    }

    pub fn provide_memory(&mut self, module: &str, name: &str, memory: Rc<RefCell<LinearMemory>>) -> &mut Self {
        self.imports.insert(
            (module.to_string(), name.to_string()),
            ImportValue::Memory(memory),
        );
        self
    }

    pub fn provide_global(&mut self, module: &str, name: &str, global: Rc<RefCell<Global>>) -> &mut Self {
        self.imports.insert(
            (module.to_string(), name.to_string()),
            ImportValue::Global(global),
        );
        self
    }

    pub fn provide_function(&mut self, module: &str, name: &str, func_ptr: *const (), signature: &str) -> &mut Self {
        self.imports.insert(
            (module.to_string(), name.to_string()),
            ImportValue::Function {
                func_ptr,
                signature: Arc::from(signature),
            },
        );
        self
    }

    /// Try to resolve one import descriptor against the provided bindings,
    /// returning `Ok(None)` (rather than failing) only when the caller
    /// should treat a missing binding as "not yet satisfied" — this engine
    /// always requires every declared import to resolve, so in practice
    /// every `Ok(None)` becomes an `UnresolvedImport` at the call site.
    fn try_import<'a>(&'a self, desc: &ImportDescriptor) -> Option<&'a ImportValue> {
        self.imports.get(&(desc.module.clone(), desc.name.clone()))
    }

    pub fn build(self) -> Result<Box<Instance>, LinkError> {
        let artifact = self.artifact;

        let mem_meta = artifact.memory_metadata();
        let tbl_meta = artifact.table_metadata();
        let glb_meta = artifact.global_metadata();
        let fn_meta = artifact.function_metadata();

        let mem_isize = mem_meta.isize();
        let tbl_isize = tbl_meta.isize();
        let glb_isize = glb_meta.isize();
        let fn_isize = fn_meta.isize();

        // Memories: resolve imports, then build definitions.
        let mut memories: Vec<Option<Rc<RefCell<LinearMemory>>>> = vec![None; mem_meta.size() as usize];
        for desc in &mem_meta.imports {
            let declared = &mem_meta.types[desc.index as usize];
            match self.try_import(desc) {
                Some(ImportValue::Memory(mem)) => {
                    let (actual_size, actual_max) = {
                        let m = mem.borrow();
                        (m.size(), m.max())
                    };
                    let max_ok = match declared.max {
                        None => true,
                        Some(d) => actual_max.is_some_and(|m| m <= d),
                    };
                    if actual_size < declared.min || !max_ok {
                        return Err(LinkError::ImportTypeMismatch {
                            module: desc.module.clone(),
                            name: desc.name.clone(),
                            expected: format!("memory min={} max={:?}", declared.min, declared.max),
                            actual: format!("memory size={actual_size} max={actual_max:?}"),
                        });
                    }
                    memories[desc.index as usize] = Some(mem.clone());
                }
                Some(_) => {
                    return Err(LinkError::ImportTypeMismatch {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                        expected: "memory".to_string(),
                        actual: "non-memory import".to_string(),
                    });
                }
                None => {
                    return Err(LinkError::UnresolvedImport {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                    });
                }
            }
        }
        for (i, ty) in mem_meta.types.iter().enumerate() {
            if memories[i].is_none() {
                let memory = LinearMemory::new(ty.min, ty.max, NATIVE_PAGE_SIZE)
                    .expect("failed to allocate a defined linear memory");
                memories[i] = Some(Rc::new(RefCell::new(memory)));
            }
        }
        let memories: Vec<Rc<RefCell<LinearMemory>>> = memories.into_iter().map(Option::unwrap).collect();

        // Globals: resolve imports, then zero-initialize definitions.
        let mut globals: Vec<Option<Rc<RefCell<Global>>>> = vec![None; glb_meta.size() as usize];
        for desc in &glb_meta.imports {
            let declared: ValType = glb_meta.types[desc.index as usize];
            match self.try_import(desc) {
                Some(ImportValue::Global(g)) => {
                    let actual = g.borrow().ty();
                    if actual != declared {
                        return Err(LinkError::ImportTypeMismatch {
                            module: desc.module.clone(),
                            name: desc.name.clone(),
                            expected: declared.to_string(),
                            actual: actual.to_string(),
                        });
                    }
                    globals[desc.index as usize] = Some(g.clone());
                }
                Some(_) => {
                    return Err(LinkError::ImportTypeMismatch {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                        expected: "global".to_string(),
                        actual: "non-global import".to_string(),
                    });
                }
                None => {
                    return Err(LinkError::UnresolvedImport {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                    });
                }
            }
        }
        for (i, ty) in glb_meta.types.iter().enumerate() {
            if globals[i].is_none() {
                globals[i] = Some(Rc::new(RefCell::new(Global::zeroed(*ty))));
            }
        }
        let globals: Vec<Rc<RefCell<Global>>> = globals.into_iter().map(Option::unwrap).collect();

        // Functions: defer applying imports until the instance (and its
        // storage array) exists; collect resolved bindings now so a
        // mismatch still fails before anything is allocated.
        let mut function_imports = Vec::with_capacity(fn_meta.imports.len());
        for desc in &fn_meta.imports {
            let declared = &fn_meta.types[desc.index as usize];
            match self.try_import(desc) {
                Some(ImportValue::Function { func_ptr, signature }) => {
                    let sig_str: &str = signature;
                    if sig_str != declared.as_str() {
                        return Err(LinkError::ImportTypeMismatch {
                            module: desc.module.clone(),
                            name: desc.name.clone(),
                            expected: declared.clone(),
                            actual: signature.to_string(),
                        });
                    }
                    function_imports.push((desc.index, *func_ptr));
                }
                Some(_) => {
                    return Err(LinkError::ImportTypeMismatch {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                        expected: "function".to_string(),
                        actual: "non-function import".to_string(),
                    });
                }
                None => {
                    return Err(LinkError::UnresolvedImport {
                        module: desc.module.clone(),
                        name: desc.name.clone(),
                    });
                }
            }
        }

        // Tables: always fully defined (this core accepts no table
        // imports; see SPEC_FULL.md §4.3).
        let tables: Vec<Table> = tbl_meta
            .types
            .iter()
            .map(|ty| Table::new(ty.min, ty.max))
            .collect();

        let fn_count = fn_meta.size();

        let export_memories: HashMap<String, MemoryIndex> = mem_meta
            .exports
            .iter()
            .map(|e| (e.name.clone(), MemoryIndex::from_u32(e.index)))
            .collect();
        let export_tables: HashMap<String, TableIndex> = tbl_meta
            .exports
            .iter()
            .map(|e| (e.name.clone(), TableIndex::from_u32(e.index)))
            .collect();
        let export_globals: HashMap<String, GlobalIndex> = glb_meta
            .exports
            .iter()
            .map(|e| (e.name.clone(), GlobalIndex::from_u32(e.index)))
            .collect();
        let signatures: Vec<Arc<str>> = fn_meta.types.iter().map(|s| Arc::from(s.as_str())).collect();

        let export_functions: HashMap<String, (FunctionIndex, Arc<str>)> = fn_meta
            .exports
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    (FunctionIndex::from_u32(e.index), signatures[e.index as usize].clone()),
                )
            })
            .collect();

        let mut instance = Instance::from_parts(
            artifact,
            memories,
            mem_isize,
            tables,
            tbl_isize,
            globals,
            glb_isize,
            fn_isize,
            fn_count,
            export_memories,
            export_tables,
            export_globals,
            export_functions,
        );

        for (index, func_ptr) in function_imports {
            instance.set_function_slot(index, func_ptr);
        }

        let storage_ptr = instance.storage_ptr();
        unsafe {
            instance
                .call_initialize(storage_ptr)
                .map_err(|_| LinkError::MissingInitializer)?;
        }

        instance.finalize_functions(signatures);

        Ok(instance)
    }
}
