// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single typed, zero-initialized storage cell.

use crate::types::ValType;

/// Mismatched accessor: the caller asked for `requested` but this global
/// holds `actual`. The owning instance attaches the [`crate::vm::GlobalIndex`]
/// when raising [`crate::Trap::GlobalTypeMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalAccessError {
    pub requested: ValType,
    pub actual: ValType,
}

/// A global variable cell: `(type, value)`. The value is stored as raw
/// bits and reinterpreted by the accessor matching `ty`; any other
/// accessor fails with [`GlobalAccessError`] rather than silently
/// reinterpreting bits across types.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    ty: ValType,
    bits: u64,
}

impl Global {
    /// A zero-initialized global of the given type.
    pub fn zeroed(ty: ValType) -> Self {
        Self { ty, bits: 0 }
    }

    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn get_i32(&self) -> Result<i32, GlobalAccessError> {
        self.check(ValType::I32)?;
        Ok(self.bits as u32 as i32)
    }

    pub fn get_i64(&self) -> Result<i64, GlobalAccessError> {
        self.check(ValType::I64)?;
        Ok(self.bits as i64)
    }

    pub fn get_f32(&self) -> Result<f32, GlobalAccessError> {
        self.check(ValType::F32)?;
        Ok(f32::from_bits(self.bits as u32))
    }

    pub fn get_f64(&self) -> Result<f64, GlobalAccessError> {
        self.check(ValType::F64)?;
        Ok(f64::from_bits(self.bits))
    }

    pub fn set_i32(&mut self, v: i32) -> Result<(), GlobalAccessError> {
        self.check(ValType::I32)?;
        self.bits = v as u32 as u64;
        Ok(())
    }

    pub fn set_i64(&mut self, v: i64) -> Result<(), GlobalAccessError> {
        self.check(ValType::I64)?;
        self.bits = v as u64;
        Ok(())
    }

    pub fn set_f32(&mut self, v: f32) -> Result<(), GlobalAccessError> {
        self.check(ValType::F32)?;
        self.bits = u64::from(v.to_bits());
        Ok(())
    }

    pub fn set_f64(&mut self, v: f64) -> Result<(), GlobalAccessError> {
        self.check(ValType::F64)?;
        self.bits = v.to_bits();
        Ok(())
    }

    fn check(&self, requested: ValType) -> Result<(), GlobalAccessError> {
        if self.ty == requested {
            Ok(())
        } else {
            Err(GlobalAccessError {
                requested,
                actual: self.ty,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_initialized() {
        let g = Global::zeroed(ValType::I64);
        assert_eq!(g.get_i64().unwrap(), 0);
    }

    #[test]
    fn wrong_type_accessor_fails() {
        let g = Global::zeroed(ValType::I32);
        assert!(g.get_i64().is_err());
        assert!(g.get_i32().is_ok());
    }

    #[test]
    fn roundtrips_float_bits() {
        let mut g = Global::zeroed(ValType::F64);
        g.set_f64(std::f64::consts::PI).unwrap();
        assert_eq!(g.get_f64().unwrap(), std::f64::consts::PI);
    }
}
