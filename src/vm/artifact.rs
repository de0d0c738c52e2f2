// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The compiled artifact: a dynamically loaded shared object exposing four
//! read-only metadata tables and an `initialize` entry point (§6 of
//! `SPEC_FULL.md`).
//!
//! [`Artifact`] is a narrow trait rather than a concrete `libloading`
//! wrapper so [`crate::InstanceBuilder`] can be exercised in tests against
//! an in-memory fake, without a real compiled `.so` on disk. [`DlArtifact`]
//! is the production implementation.

use std::ffi::{CStr, c_void};
use std::path::Path;

use libloading::{Library, Symbol};

use crate::error::LinkError;
use crate::types::ValType;

/// A declared memory's shape: `min`/`max` in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub min: u32,
    pub max: Option<u32>,
}

impl MemoryType {
    /// `true` iff this type declares an upper bound.
    ///
    /// The source this engine is modeled on returns `max == NO_MAXIMUM`
    /// here, which is inverted relative to the name; this implementation
    /// does not copy that inversion (see `DESIGN.md`).
    pub fn has_max_size(&self) -> bool {
        self.max.is_some()
    }
}

/// A declared table's shape: `min`/`max` element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub min: u32,
    pub max: Option<u32>,
}

impl TableType {
    pub fn has_max_size(&self) -> bool {
        self.max.is_some()
    }
}

/// A declared global's value type.
pub type GlobalType = ValType;

/// One entry of an entity class's `ImportDescriptor[]`: the artifact-local
/// index of the entity, and the `(module, name)` pair it must be resolved
/// against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub index: u32,
    pub module: String,
    pub name: String,
}

/// One entry of an entity class's `ExportDescriptor[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub index: u32,
    pub name: String,
}

/// The four-field metadata section for one entity class: all declared
/// types (imports first, then definitions), the import descriptors, and
/// the export descriptors.
#[derive(Debug, Clone, Default)]
pub struct EntityMetadata<T> {
    pub types: Vec<T>,
    pub imports: Vec<ImportDescriptor>,
    pub exports: Vec<ExportDescriptor>,
}

impl<T> EntityMetadata<T> {
    /// Total entity count (`Size` in the spec).
    pub fn size(&self) -> u32 {
        self.types.len() as u32
    }

    /// Import count (`ISize`); slots `[0, isize)` are imported.
    pub fn isize(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Export count (`ESize`).
    pub fn esize(&self) -> u32 {
        self.exports.len() as u32
    }
}

pub type MemoryMetadata = EntityMetadata<MemoryType>;
pub type TableMetadata = EntityMetadata<TableType>;
pub type GlobalMetadata = EntityMetadata<GlobalType>;
/// Function metadata carries a signature string rather than a bare
/// `ValType`.
pub type FunctionMetadata = EntityMetadata<String>;

/// The five symbols every artifact must export, and the raw storage base
/// pointer the runtime-provided callbacks of §6 are invoked against.
pub trait Artifact {
    fn memory_metadata(&self) -> &MemoryMetadata;
    fn table_metadata(&self) -> &TableMetadata;
    fn global_metadata(&self) -> &GlobalMetadata;
    fn function_metadata(&self) -> &FunctionMetadata;

    /// Invoke the artifact's `initialize(storage)` once, after import
    /// binding, to populate defined table slots, defined function
    /// pointers, and run the module's start logic if present.
    ///
    /// # Safety
    ///
    /// `storage` must point at a fully allocated `Storage` array sized per
    /// `4 + memSize + tblSize + glbSize + fnSize` slots (plus the leading
    /// back-pointer slot), with every imported slot already bound.
    unsafe fn initialize(&self, storage: *mut *mut u8) -> crate::Result<()>;
}

/// The raw C ABI an artifact's metadata symbols are laid out as: a pointer
/// + length pair, read once at `open` and copied into owned `Vec`s so the
/// rest of the runtime never touches the shared object's address space
/// directly.
#[repr(C)]
struct RawSlice<T> {
    ptr: *const T,
    len: usize,
}

unsafe fn copy_raw_slice<T: Clone>(raw: &RawSlice<T>) -> Vec<T> {
    if raw.ptr.is_null() || raw.len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(raw.ptr, raw.len).to_vec()
}

type InitializeFn = unsafe extern "C" fn(*mut *mut u8);

/// A production [`Artifact`] backed by a `dlopen`ed shared object.
pub struct DlArtifact {
    // Kept alive for the lifetime of the loaded metadata and the
    // `initialize` function pointer; never touched again after `open`.
    _library: Library,
    memory: MemoryMetadata,
    table: TableMetadata,
    global: GlobalMetadata,
    function: FunctionMetadata,
    initialize: InitializeFn,
}

impl DlArtifact {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let library = unsafe { Library::new(path.as_ref()) }.map_err(|_| LinkError::MissingArtifact)?;

        // Metadata symbols are read as untyped raw-slice descriptors and
        // reinterpreted per entity class; the real element type is nailed
        // down by which symbol it came from, not by anything the loader
        // checks.
        let memory = unsafe {
            read_entity_metadata::<MemoryType>(&library, "memoryMetadata")?
        };
        let table = unsafe { read_entity_metadata::<TableType>(&library, "tableMetadata")? };
        let global = unsafe { read_entity_metadata::<GlobalType>(&library, "globalMetadata")? };
        let function = unsafe { read_entity_metadata::<String>(&library, "functionMetadata")? };

        let initialize: Symbol<InitializeFn> = unsafe {
            library
                .get(b"initialize")
                .map_err(|_| LinkError::MissingInitializer)?
        };
        let initialize = *initialize;

        Ok(Self {
            _library: library,
            memory,
            table,
            global,
            function,
            initialize,
        })
    }
}

unsafe fn read_entity_metadata<T: Clone>(
    library: &Library,
    symbol: &'static str,
) -> Result<EntityMetadata<T>, LinkError> {
    #[repr(C)]
    struct RawEntityMetadata {
        types: RawSlice<c_void>,
        import_indices: RawSlice<u32>,
        import_modules: RawSlice<*const CStr>,
        import_names: RawSlice<*const CStr>,
        export_indices: RawSlice<u32>,
        export_names: RawSlice<*const CStr>,
    }

    let raw: Symbol<*const RawEntityMetadata> = library
        .get(symbol.as_bytes())
        .map_err(|_| LinkError::MissingSymbol(symbol))?;
    let raw = &**raw;

    let types = copy_raw_slice(&RawSlice::<T> {
        ptr: raw.types.ptr.cast(),
        len: raw.types.len,
    });

    let import_indices = copy_raw_slice(&raw.import_indices);
    let import_modules = copy_raw_slice(&raw.import_modules);
    let import_names = copy_raw_slice(&raw.import_names);
    let imports = import_indices
        .into_iter()
        .zip(import_modules)
        .zip(import_names)
        .map(|((index, module), name)| ImportDescriptor {
            index,
            module: unsafe { (*module).to_string_lossy().into_owned() },
            name: unsafe { (*name).to_string_lossy().into_owned() },
        })
        .collect();

    let export_indices = copy_raw_slice(&raw.export_indices);
    let export_names = copy_raw_slice(&raw.export_names);
    let exports = export_indices
        .into_iter()
        .zip(export_names)
        .map(|(index, name)| ExportDescriptor {
            index,
            name: unsafe { (*name).to_string_lossy().into_owned() },
        })
        .collect();

    Ok(EntityMetadata {
        types,
        imports,
        exports,
    })
}

impl Artifact for DlArtifact {
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

    unsafe fn initialize(&self, storage: *mut *mut u8) -> crate::Result<()> {
        unsafe { (self.initialize)(storage) };
        Ok(())
    }
}

/// Entity class discriminant, used to pick which slot range of `Storage`
/// an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Memory,
    Table,
    Global,
    Function,
}

/// An in-memory fake used by the builder tests in `vm::builder`; not part
/// of the public API.
#[cfg(test)]
pub(crate) struct FakeArtifact {
    pub memory: MemoryMetadata,
    pub table: TableMetadata,
    pub global: GlobalMetadata,
    pub function: FunctionMetadata,
    pub init: Box<dyn Fn(*mut *mut u8) + Send + Sync>,
}

#[cfg(test)]
impl Artifact for FakeArtifact {
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
    unsafe fn initialize(&self, storage: *mut *mut u8) -> crate::Result<()> {
        (self.init)(storage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_type_has_max_matches_option() {
        assert!(MemoryType { min: 1, max: Some(4) }.has_max_size());
        assert!(!MemoryType { min: 1, max: None }.has_max_size());
    }

    #[test]
    fn entity_metadata_counts() {
        let meta: EntityMetadata<MemoryType> = EntityMetadata {
            types: vec![MemoryType { min: 1, max: None }; 3],
            imports: vec![ImportDescriptor {
                index: 0,
                module: "env".into(),
                name: "memory".into(),
            }],
            exports: vec![],
        };
        assert_eq!(meta.size(), 3);
        assert_eq!(meta.isize(), 1);
        assert_eq!(meta.esize(), 0);
    }
}
