// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An ordered sequence of indirect-call targets.

use std::sync::Arc;

/// One occupied table slot: a callee closed over its owning instance.
#[derive(Clone, Debug)]
pub struct TableSlot {
    /// Opaque pointer to the owning instance's `Storage`, passed as the
    /// leading argument on an indirect call.
    pub instance_closure: *mut u8,
    /// The raw, type-erased code pointer.
    pub func_ptr: *const (),
    /// This callee's canonical signature string.
    pub signature: Arc<str>,
}

// Safety: a `TableSlot` is an inert bundle of addresses; the single-threaded
// model (§5) means it is never read or written concurrently.
unsafe impl Send for TableSlot {}

/// Why an indexed table access failed, reported without the table's own
/// index (the owning instance attaches that when raising a [`crate::Trap`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// `index >= size`.
    OutOfBound { index: u32 },
    /// The slot at `index` is null.
    BadEntry { index: u32 },
}

/// An ordered sequence of table slots, each either null or a
/// [`TableSlot`]. `size <= max` always holds.
#[derive(Debug, Default)]
pub struct Table {
    slots: Vec<Option<TableSlot>>,
    max: Option<u32>,
}

impl Table {
    pub fn new(initial: u32, max: Option<u32>) -> Self {
        Self {
            slots: (0..initial).map(|_| None).collect(),
            max,
        }
    }

    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Succeed iff `index <= size` (matching [`crate::vm::LinearMemory::guard`]'s
    /// `<=` convention: the boundary itself is always a valid probe, even
    /// though indexing at `size` has no slot to read).
    pub fn guard(&self, index: u32) -> Result<(), TableError> {
        if index <= self.size() {
            Ok(())
        } else {
            Err(TableError::OutOfBound { index })
        }
    }

    pub fn is_null(&self, index: u32) -> Result<bool, TableError> {
        self.slots
            .get(index as usize)
            .map(Option::is_none)
            .ok_or(TableError::OutOfBound { index })
    }

    /// Fetch a callable slot; fails if the index is out of bounds or the
    /// slot is null.
    pub fn get(&self, index: u32) -> Result<&TableSlot, TableError> {
        match self.slots.get(index as usize) {
            None => Err(TableError::OutOfBound { index }),
            Some(None) => Err(TableError::BadEntry { index }),
            Some(Some(slot)) => Ok(slot),
        }
    }

    pub fn set(&mut self, index: u32, slot: Option<TableSlot>) -> Result<(), TableError> {
        let dst = self
            .slots
            .get_mut(index as usize)
            .ok_or(TableError::OutOfBound { index })?;
        *dst = slot;
        Ok(())
    }

    /// Check that the slot at `index` is non-null and its signature equals
    /// `requested`. Returns the mismatched (expected, actual) pair as owned
    /// strings on failure so the caller can build a
    /// [`crate::Trap::TableTypeMismatch`] without borrowing from `self`.
    pub fn check(&self, index: u32, requested: &str) -> Result<&TableSlot, CheckError> {
        let slot = self.get(index).map_err(CheckError::Access)?;
        if &*slot.signature == requested {
            Ok(slot)
        } else {
            Err(CheckError::TypeMismatch {
                index,
                expected: requested.to_string(),
                actual: slot.signature.to_string(),
            })
        }
    }
}

/// The outcome of [`Table::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    Access(TableError),
    TypeMismatch {
        index: u32,
        expected: String,
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(sig: &str) -> TableSlot {
        TableSlot {
            instance_closure: std::ptr::null_mut(),
            func_ptr: std::ptr::null(),
            signature: Arc::from(sig),
        }
    }

    #[test]
    fn null_slot_is_not_callable() {
        let table = Table::new(2, Some(4));
        assert!(matches!(table.get(0), Err(TableError::BadEntry { index: 0 })));
    }

    #[test]
    fn indirect_call_checks_signature() {
        let mut table = Table::new(1, Some(1));
        table.set(0, Some(slot("I:I"))).unwrap();

        assert!(table.check(0, "I:I").is_ok());
        assert!(matches!(
            table.check(0, "J:I"),
            Err(CheckError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn out_of_bound_index_is_distinguished_from_bad_entry() {
        let table = Table::new(1, Some(1));
        assert!(matches!(
            table.get(5),
            Err(TableError::OutOfBound { index: 5 })
        ));
    }
}
