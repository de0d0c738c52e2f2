// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The instance: owns the loaded artifact handle, the live entity slots,
//! and the export maps built from the artifact's descriptors.
//!
//! `Storage` (§3/§4.4) is modeled as a boxed flat array of raw pointers
//! rather than the literal four-metadata-plus-entity-slots layout: a
//! pointer slot is the natural representation for a memory base address or
//! a function code pointer, but not for a [`crate::vm::TableSlot`] triple or
//! a typed [`crate::vm::Global`] cell, so those two classes are kept as
//! ordinary typed Rust collections instead. Slot 0 of the boxed array holds
//! the back-pointer to the owning `Instance`; slots `[1, 1+memSize)` are
//! memory base pointers kept live by [`LinearMemory::grow`]'s use-site
//! rewrite; slots `[1+memSize, 1+memSize+fnSize)` are function code
//! pointers, written by the builder for imports and by the artifact's
//! `initialize` for definitions.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use cranelift_entity::EntityRef;
use hashbrown::HashMap;

use crate::vm::artifact::Artifact;
use crate::vm::global::Global;
use crate::vm::memory::{LinearMemory, UseSite};
use crate::vm::table::Table;
use crate::vm::{FunctionIndex, GlobalIndex, MemoryIndex, TableIndex};

/// A defined or imported function binding: a type-erased code pointer
/// closed over its owning instance, plus the signature string it was
/// linked at.
#[derive(Clone)]
pub struct FunctionBinding {
    pub instance_closure: *mut u8,
    pub func_ptr: *const (),
    pub signature: Arc<str>,
}

// Safety: an inert bundle of addresses; never read or written concurrently
// (§5, single-threaded model).
unsafe impl Send for FunctionBinding {}

pub struct Instance {
    memories: Vec<Rc<RefCell<LinearMemory>>>,
    tables: Vec<RefCell<Table>>,
    globals: Vec<Rc<RefCell<Global>>>,
    functions: Vec<FunctionBinding>,

    storage: Box<[*mut u8]>,
    mem_count: u32,
    fn_count: u32,

    mem_isize: u32,
    tbl_isize: u32,
    glb_isize: u32,
    fn_isize: u32,

    export_memories: HashMap<String, MemoryIndex>,
    export_tables: HashMap<String, TableIndex>,
    export_globals: HashMap<String, GlobalIndex>,
    export_functions: HashMap<String, (FunctionIndex, Arc<str>)>,

    // Declared last so it drops (and its shared object is closed) after
    // every other field, per §4.4's teardown ordering.
    #[allow(dead_code)]
    artifact: Box<dyn Artifact>,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        artifact: Box<dyn Artifact>,
        memories: Vec<Rc<RefCell<LinearMemory>>>,
        mem_isize: u32,
        tables: Vec<Table>,
        tbl_isize: u32,
        globals: Vec<Rc<RefCell<Global>>>,
        glb_isize: u32,
        fn_isize: u32,
        fn_count: u32,
        export_memories: HashMap<String, MemoryIndex>,
        export_tables: HashMap<String, TableIndex>,
        export_globals: HashMap<String, GlobalIndex>,
        export_functions: HashMap<String, (FunctionIndex, Arc<str>)>,
    ) -> Box<Self> {
        let mem_count = memories.len() as u32;
        let storage_len = 1 + mem_count as usize + fn_count as usize;
        let mut storage = vec![std::ptr::null_mut::<u8>(); storage_len].into_boxed_slice();

        for (i, mem) in memories.iter().enumerate() {
            storage[1 + i] = mem.borrow().base_ptr();
        }

        let instance = Self {
            memories,
            tables: tables.into_iter().map(RefCell::new).collect(),
            globals,
            functions: Vec::new(),
            storage,
            mem_count,
            fn_count,
            mem_isize,
            tbl_isize,
            glb_isize,
            fn_isize,
            export_memories,
            export_tables,
            export_globals,
            export_functions,
            artifact,
        };

        let mut instance = Box::new(instance);

        let self_ptr: *mut Instance = &mut *instance;
        instance.storage[0] = self_ptr.cast();

        for i in 0..instance.mem_count as usize {
            let slot_ptr: *mut *mut u8 = &mut instance.storage[1 + i];
            instance.memories[i]
                .borrow_mut()
                .add_use_site(UseSite(NonNull::new(slot_ptr).expect("storage slot is non-null")));
        }

        instance
    }

    /// The pointer handed to the artifact's `initialize` and passed as the
    /// leading argument to every callee: the start of the memory-slot
    /// region (slot index 1 of the underlying array).
    pub fn storage_ptr(&mut self) -> *mut *mut u8 {
        unsafe { self.storage.as_mut_ptr().add(1) }
    }

    /// Recover the owning instance from a storage pointer previously
    /// returned by [`Instance::storage_ptr`], by following the back-pointer
    /// stored one slot before it. Documented recovery operation per the
    /// teacher's design notes; never relies on pointer-cast identity.
    ///
    /// # Safety
    ///
    /// `storage_ptr` must be a pointer previously returned by
    /// [`Instance::storage_ptr`] on a still-live instance.
    pub unsafe fn from_storage_ptr<'a>(storage_ptr: *mut *mut u8) -> &'a Instance {
        let back_pointer = unsafe { *storage_ptr.sub(1) };
        unsafe { &*(back_pointer as *const Instance) }
    }

    /// The `instance*` closure pointer passed as the leading argument to
    /// every [`crate::vm::Callee`] invocation and every host-import call
    /// (§4.5/§4.6): the instance's own address.
    pub fn closure_ptr(&self) -> *mut u8 {
        self.storage[0]
    }

    /// Recover the owning instance from an `instance*` closure pointer
    /// received as the leading argument of a host-import call. Unlike
    /// [`Instance::from_storage_ptr`], this pointer literally is the
    /// instance's own address, so recovery is a direct cast.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`Instance::closure_ptr`] on a
    /// still-live instance.
    pub unsafe fn from_closure_ptr<'a>(ptr: *mut u8) -> &'a Instance {
        unsafe { &*(ptr as *const Instance) }
    }

    /// Invoke the artifact's `initialize` against this instance's storage
    /// pointer. Called once by [`crate::vm::InstanceBuilder::build`] after
    /// imports are resolved and before exports are populated.
    ///
    /// # Safety
    ///
    /// See [`Artifact::initialize`].
    pub(crate) unsafe fn call_initialize(&self, storage_ptr: *mut *mut u8) -> crate::Result<()> {
        unsafe { self.artifact.initialize(storage_ptr) }
    }

    /// Write a function's code pointer into its storage slot. Used by
    /// [`crate::vm::InstanceBuilder`] for imports (`index < fn_isize`) and by
    /// the artifact's `initialize` for definitions (`index >= fn_isize`).
    pub fn set_function_slot(&mut self, index: u32, func_ptr: *const ()) {
        debug_assert!(index < self.fn_count);
        let slot = 1 + self.mem_count as usize + index as usize;
        self.storage[slot] = func_ptr as *mut u8;
    }

    /// Finalize `functions` from the storage array's function slots and
    /// the artifact's signature metadata. Called once, after `initialize`.
    pub(crate) fn finalize_functions(&mut self, signatures: Vec<Arc<str>>) {
        let base = 1 + self.mem_count as usize;
        let instance_closure = self.storage[0];
        self.functions = (0..self.fn_count as usize)
            .map(|i| FunctionBinding {
                instance_closure,
                func_ptr: self.storage[base + i] as *const (),
                signature: signatures[i].clone(),
            })
            .collect();
    }

    pub fn memory(&self, index: MemoryIndex) -> &Rc<RefCell<LinearMemory>> {
        &self.memories[index.index()]
    }

    pub fn table(&self, index: TableIndex) -> &RefCell<Table> {
        &self.tables[index.index()]
    }

    pub fn global(&self, index: GlobalIndex) -> &Rc<RefCell<Global>> {
        &self.globals[index.index()]
    }

    /// Read global `index` as an `i32`, attaching `index` to
    /// [`crate::Trap::GlobalTypeMismatch`] if it does not hold that type.
    pub fn global_i32(&self, index: GlobalIndex) -> Result<i32, crate::error::Trap> {
        self.global(index)
            .borrow()
            .get_i32()
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Read global `index` as an `i64`. See [`Instance::global_i32`].
    pub fn global_i64(&self, index: GlobalIndex) -> Result<i64, crate::error::Trap> {
        self.global(index)
            .borrow()
            .get_i64()
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Read global `index` as an `f32`. See [`Instance::global_i32`].
    pub fn global_f32(&self, index: GlobalIndex) -> Result<f32, crate::error::Trap> {
        self.global(index)
            .borrow()
            .get_f32()
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Read global `index` as an `f64`. See [`Instance::global_i32`].
    pub fn global_f64(&self, index: GlobalIndex) -> Result<f64, crate::error::Trap> {
        self.global(index)
            .borrow()
            .get_f64()
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Write `v` into global `index` as an `i32`. See [`Instance::global_i32`].
    pub fn set_global_i32(&self, index: GlobalIndex, v: i32) -> Result<(), crate::error::Trap> {
        self.global(index)
            .borrow_mut()
            .set_i32(v)
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Write `v` into global `index` as an `i64`. See [`Instance::global_i32`].
    pub fn set_global_i64(&self, index: GlobalIndex, v: i64) -> Result<(), crate::error::Trap> {
        self.global(index)
            .borrow_mut()
            .set_i64(v)
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Write `v` into global `index` as an `f32`. See [`Instance::global_i32`].
    pub fn set_global_f32(&self, index: GlobalIndex, v: f32) -> Result<(), crate::error::Trap> {
        self.global(index)
            .borrow_mut()
            .set_f32(v)
            .map_err(|err| Self::global_trap(index, err))
    }

    /// Write `v` into global `index` as an `f64`. See [`Instance::global_i32`].
    pub fn set_global_f64(&self, index: GlobalIndex, v: f64) -> Result<(), crate::error::Trap> {
        self.global(index)
            .borrow_mut()
            .set_f64(v)
            .map_err(|err| Self::global_trap(index, err))
    }

    fn global_trap(index: GlobalIndex, err: crate::vm::global::GlobalAccessError) -> crate::error::Trap {
        crate::error::Trap::GlobalTypeMismatch {
            global: index,
            expected: err.requested,
        }
    }

    pub fn function(&self, index: FunctionIndex) -> &FunctionBinding {
        &self.functions[index.index()]
    }

    pub fn mem_isize(&self) -> u32 {
        self.mem_isize
    }

    pub fn tbl_isize(&self) -> u32 {
        self.tbl_isize
    }

    pub fn glb_isize(&self) -> u32 {
        self.glb_isize
    }

    pub fn fn_isize(&self) -> u32 {
        self.fn_isize
    }

    pub fn exported_memory(&self, name: &str) -> Option<&Rc<RefCell<LinearMemory>>> {
        self.export_memories.get(name).map(|&i| self.memory(i))
    }

    pub fn exported_table(&self, name: &str) -> Option<&RefCell<Table>> {
        self.export_tables.get(name).map(|&i| self.table(i))
    }

    pub fn exported_global(&self, name: &str) -> Option<&Rc<RefCell<Global>>> {
        self.export_globals.get(name).map(|&i| self.global(i))
    }

    pub fn exported_function(&self, name: &str) -> Option<&FunctionBinding> {
        let (index, _) = self.export_functions.get(name)?;
        Some(self.function(*index))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Deregister this instance's use-sites before `storage` is freed;
        // the use-site addresses point into it.
        for i in 0..self.mem_count as usize {
            let slot_ptr: *mut *mut u8 = &mut self.storage[1 + i];
            if let Some(site) = NonNull::new(slot_ptr) {
                self.memories[i].borrow_mut().remove_use_site(UseSite(site));
            }
        }
    }
}
