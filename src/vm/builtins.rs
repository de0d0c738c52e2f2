// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The artifact callback table (§6): the nine symbols a compiled artifact
//! is linked against, called with the storage pointer as the leading
//! argument per the callee convention of §4.5. Each callback recovers its
//! instance through [`Instance::from_storage_ptr`], resolves the
//! referenced memory, table, or function, and raises the matching
//! [`Trap`] variant on failure.
//!
//! These are plain `extern "C"` functions rather than methods on
//! [`crate::vm::Artifact`] because the artifact's own compiled code is the
//! caller: the platform loader resolves these symbols against the host
//! process when the artifact's shared object is opened, the same
//! direction as the teacher's own `vm::builtins::raw` table. A failing
//! callback panics with its `Trap`, which unwinds back to the caller of
//! the guest invocation; this is only sound because no native code
//! generator exists in this crate for such a panic to cross a non-Rust
//! frame (§1) — a real codegen backend would catch these at the call
//! site and translate them into its own trap mechanism instead.

use std::ffi::{CStr, c_char};

use crate::error::Trap;
use crate::vm::instance::Instance;
use crate::vm::table::{CheckError, TableError, TableSlot};
use crate::vm::{FunctionIndex, MemoryIndex, TableIndex};

unsafe fn recover<'a>(storage: *mut *mut u8) -> &'a Instance {
    unsafe { Instance::from_storage_ptr(storage) }
}

fn raise(trap: Trap) -> ! {
    std::panic::panic_any(trap)
}

fn table_error_to_trap(table: TableIndex, err: TableError) -> Trap {
    match err {
        TableError::OutOfBound { index } => Trap::TableAccessOutOfBound { table, index },
        TableError::BadEntry { index } => Trap::BadTableEntry { table, index },
    }
}

fn memory_guard_inner(instance: &Instance, memory: MemoryIndex, offset: u64) -> Result<(), Trap> {
    instance
        .memory(memory)
        .borrow()
        .guard(offset)
        .map_err(|_| Trap::MemoryAccessOutOfBound { memory, offset })
}

fn table_guard_inner(instance: &Instance, table: TableIndex, index: u32) -> Result<(), Trap> {
    instance
        .table(table)
        .borrow()
        .guard(index)
        .map_err(|err| table_error_to_trap(table, err))
}

fn table_check_inner(instance: &Instance, table: TableIndex, index: u32, signature: &str) -> Result<(), Trap> {
    instance
        .table(table)
        .borrow()
        .check(index, signature)
        .map(|_| ())
        .map_err(|err| match err {
            CheckError::Access(access) => table_error_to_trap(table, access),
            CheckError::TypeMismatch { index, expected, actual } => Trap::TableTypeMismatch {
                table,
                index,
                expected,
                actual,
            },
        })
}

fn table_instance_closure_inner(instance: &Instance, table: TableIndex, index: u32) -> Result<*mut u8, Trap> {
    instance
        .table(table)
        .borrow()
        .get(index)
        .map(|slot| slot.instance_closure)
        .map_err(|err| table_error_to_trap(table, err))
}

fn table_function_ptr_inner(instance: &Instance, table: TableIndex, index: u32) -> Result<*const (), Trap> {
    instance
        .table(table)
        .borrow()
        .get(index)
        .map(|slot| slot.func_ptr)
        .map_err(|err| table_error_to_trap(table, err))
}

fn table_set_inner(
    instance: &Instance,
    table: TableIndex,
    instance_closure: *mut u8,
    start: u32,
    indices: &[u32],
) -> Result<(), Trap> {
    for (i, &func_index) in indices.iter().enumerate() {
        let binding = instance.function(FunctionIndex::from_u32(func_index));
        let slot_index = start + i as u32;
        instance
            .table(table)
            .borrow_mut()
            .set(
                slot_index,
                Some(TableSlot {
                    instance_closure,
                    func_ptr: binding.func_ptr,
                    signature: binding.signature.clone(),
                }),
            )
            .map_err(|err| table_error_to_trap(table, err))?;
    }
    Ok(())
}

/// `unreachable()`: the callback a compiled `unreachable` instruction
/// calls through. Always raises [`Trap::Unreachable`].
#[unsafe(no_mangle)]
unsafe extern "C" fn unreachable(_storage: *mut *mut u8) {
    raise(Trap::Unreachable)
}

/// `memory_size(m)`: current size of memory `m`, in pages.
#[unsafe(no_mangle)]
unsafe extern "C" fn memory_size(storage: *mut *mut u8, memory: u32) -> u32 {
    let instance = unsafe { recover(storage) };
    instance.memory(MemoryIndex::from_u32(memory)).borrow().size()
}

/// `memory_guard(m, offset)`: traps with [`Trap::MemoryAccessOutOfBound`]
/// unless `offset <= memory m's size in bytes`.
#[unsafe(no_mangle)]
unsafe extern "C" fn memory_guard(storage: *mut *mut u8, memory: u32, offset: u64) {
    let instance = unsafe { recover(storage) };
    if let Err(trap) = memory_guard_inner(instance, MemoryIndex::from_u32(memory), offset) {
        raise(trap);
    }
}

/// `memory_grow(m, delta)`: grows memory `m` by `delta` pages, returning
/// its new size or the failure sentinel. Growth failure is ordinary
/// control flow (§4.1), never a trap.
#[unsafe(no_mangle)]
unsafe extern "C" fn memory_grow(storage: *mut *mut u8, memory: u32, delta: u32) -> u32 {
    let instance = unsafe { recover(storage) };
    instance.memory(MemoryIndex::from_u32(memory)).borrow_mut().grow(delta)
}

/// `table_guard(t, i)`: traps with [`Trap::TableAccessOutOfBound`] unless
/// `i <= table t's size`.
#[unsafe(no_mangle)]
unsafe extern "C" fn table_guard(storage: *mut *mut u8, table: u32, index: u32) {
    let instance = unsafe { recover(storage) };
    if let Err(trap) = table_guard_inner(instance, TableIndex::from_u32(table), index) {
        raise(trap);
    }
}

/// `table_check(t, i, sig)`: traps with [`Trap::TableAccessOutOfBound`],
/// [`Trap::BadTableEntry`], or [`Trap::TableTypeMismatch`] unless slot `i`
/// of table `t` is occupied by a callee whose signature matches the
/// NUL-terminated string at `sig`.
///
/// # Safety
///
/// `sig` must point at a valid NUL-terminated string for the duration of
/// the call.
#[unsafe(no_mangle)]
unsafe extern "C" fn table_check(storage: *mut *mut u8, table: u32, index: u32, sig: *const c_char) {
    let instance = unsafe { recover(storage) };
    let signature = unsafe { CStr::from_ptr(sig) }.to_string_lossy();
    if let Err(trap) = table_check_inner(instance, TableIndex::from_u32(table), index, &signature) {
        raise(trap);
    }
}

/// `table_instance_closure(t, i)`: the instance-closure pointer of the
/// callee bound at slot `i` of table `t`.
#[unsafe(no_mangle)]
unsafe extern "C" fn table_instance_closure(storage: *mut *mut u8, table: u32, index: u32) -> *mut u8 {
    let instance = unsafe { recover(storage) };
    match table_instance_closure_inner(instance, TableIndex::from_u32(table), index) {
        Ok(ptr) => ptr,
        Err(trap) => raise(trap),
    }
}

/// `table_function_ptr(t, i)`: the raw code pointer of the callee bound
/// at slot `i` of table `t`.
#[unsafe(no_mangle)]
unsafe extern "C" fn table_function_ptr(storage: *mut *mut u8, table: u32, index: u32) -> *const () {
    let instance = unsafe { recover(storage) };
    match table_function_ptr_inner(instance, TableIndex::from_u32(table), index) {
        Ok(ptr) => ptr,
        Err(trap) => raise(trap),
    }
}

/// `table_set(t, instance, start, count, indices)`: populates
/// `count` consecutive slots of table `t` starting at `start`, each
/// bound to the function named by the matching entry of `indices` and
/// closed over `instance` — the operation an element segment's
/// initialization lowers to.
///
/// # Safety
///
/// `indices` must point at `count` valid `u32`s.
#[unsafe(no_mangle)]
unsafe extern "C" fn table_set(
    storage: *mut *mut u8,
    table: u32,
    instance_closure: *mut u8,
    start: u32,
    count: u32,
    indices: *const u32,
) {
    let instance = unsafe { recover(storage) };
    let indices = unsafe { std::slice::from_raw_parts(indices, count as usize) };
    if let Err(trap) = table_set_inner(instance, TableIndex::from_u32(table), instance_closure, start, indices) {
        raise(trap);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;

    use hashbrown::HashMap;

    use super::*;
    use crate::vm::artifact::{Artifact, FakeArtifact};
    use crate::vm::memory::LinearMemory;
    use crate::vm::table::Table;

    fn caught_trap<F: FnOnce() + std::panic::UnwindSafe>(f: F) -> Trap {
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let result = std::panic::catch_unwind(AssertUnwindSafe(f));
        std::panic::set_hook(prev_hook);
        *result.unwrap_err().downcast::<Trap>().expect("payload is a Trap")
    }

    fn fake_artifact() -> Box<dyn Artifact> {
        Box::new(FakeArtifact {
            memory: Default::default(),
            table: Default::default(),
            global: Default::default(),
            function: Default::default(),
            init: Box::new(|_| {}),
        })
    }

    #[test]
    fn memory_guard_traps_out_of_bound_offset() {
        let memory = std::rc::Rc::new(std::cell::RefCell::new(LinearMemory::new(1, Some(1), 4096).unwrap()));
        let mut instance = Instance::from_parts(
            fake_artifact(),
            vec![memory],
            0,
            vec![],
            0,
            vec![],
            0,
            0,
            0,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        let storage = instance.storage_ptr();

        let trap = caught_trap(|| unsafe { memory_guard(storage, 0, 1_000_000) });
        assert!(matches!(trap, Trap::MemoryAccessOutOfBound { memory, offset } if memory == MemoryIndex::from_u32(0) && offset == 1_000_000));
    }

    #[test]
    fn table_check_traps_bad_entry_then_type_mismatch() {
        let mut instance = Instance::from_parts(
            fake_artifact(),
            vec![],
            0,
            vec![Table::new(1, Some(1))],
            0,
            vec![],
            0,
            1,
            1,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        instance.set_function_slot(0, std::ptr::null());
        instance.finalize_functions(vec![std::sync::Arc::from("I:I")]);
        let storage = instance.storage_ptr();

        let sig_mismatch = std::ffi::CString::new("J:I").unwrap();
        let bad_entry_trap = caught_trap(|| unsafe { table_check(storage, 0, 0, sig_mismatch.as_ptr()) });
        assert!(matches!(bad_entry_trap, Trap::BadTableEntry { index: 0, .. }));

        unsafe {
            table_set(storage, 0, std::ptr::null_mut(), 0, 1, [0u32].as_ptr());
        }

        let type_trap = caught_trap(|| unsafe { table_check(storage, 0, 0, sig_mismatch.as_ptr()) });
        assert!(matches!(
            type_trap,
            Trap::TableTypeMismatch { index: 0, expected, actual, .. }
                if expected == "J:I" && actual == "I:I"
        ));
    }

    #[test]
    fn table_guard_passes_at_the_size_boundary() {
        let mut instance = Instance::from_parts(
            fake_artifact(),
            vec![],
            0,
            vec![Table::new(2, Some(2))],
            0,
            vec![],
            0,
            0,
            0,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        let storage = instance.storage_ptr();
        unsafe {
            table_guard(storage, 0, 2);
        }
    }
}
