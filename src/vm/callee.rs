// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A callable function: an instance-closure pointer, a raw code pointer,
//! and the signature it was linked at. Invocation is parametric over the
//! caller's own `(Ret, Arg1..Argn)` type signature, rendered to the
//! canonical string and checked against the stored one before the call.

use std::sync::Arc;

use crate::types::{FuncType, ValType};
use crate::vm::instance::FunctionBinding;

/// The error raised when a caller's requested type signature does not
/// match the callee's linked signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMismatch {
    pub expected: String,
    pub requested: String,
}

impl std::fmt::Display for SignatureMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "callee signature mismatch: expected {}, requested {}",
            self.expected, self.requested
        )
    }
}

impl std::error::Error for SignatureMismatch {}

/// A type-erased ABI value: exactly the four scalar kinds [`ValType`] names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbiValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl AbiValue {
    fn ty(self) -> ValType {
        match self {
            AbiValue::I32(_) => ValType::I32,
            AbiValue::I64(_) => ValType::I64,
            AbiValue::F32(_) => ValType::F32,
            AbiValue::F64(_) => ValType::F64,
        }
    }
}

/// `(instance-pointer, signature-string, function-pointer)`, per §4.5.
///
/// The raw function pointer is called through a hand-rolled `extern "C"`
/// trampoline matched to the caller-requested arity, rather than generic
/// transmutation of the function pointer type, since arity is only known
/// at the call site. This crate exposes a single "up to 4 scalar
/// arguments" shape, matching the host-import ABI used throughout this
/// engine (§6); wider signatures are out of scope for this core.
#[derive(Clone)]
pub struct Callee {
    instance_closure: *mut u8,
    func_ptr: *const (),
    signature: Arc<str>,
}

unsafe impl Send for Callee {}

impl Callee {
    pub fn new(binding: &FunctionBinding) -> Self {
        Self {
            instance_closure: binding.instance_closure,
            func_ptr: binding.func_ptr,
            signature: binding.signature.clone(),
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Check `args`/`ret` against the stored signature without calling.
    pub fn check(&self, args: &[AbiValue], ret: Option<ValType>) -> Result<(), SignatureMismatch> {
        let requested = FuncType::new(args.iter().map(|a| a.ty()), ret).signature();
        if *self.signature == *requested {
            Ok(())
        } else {
            Err(SignatureMismatch {
                expected: self.signature.to_string(),
                requested,
            })
        }
    }

    /// Invoke the callee with up to four scalar arguments, having checked
    /// that the runtime signature the caller is requesting matches the one
    /// this callee was linked at.
    ///
    /// # Safety
    ///
    /// `func_ptr` must genuinely be callable with `instance_closure` as its
    /// leading argument followed by `args` of the checked types, returning
    /// `ret`.
    pub unsafe fn call(&self, args: &[AbiValue], ret: Option<ValType>) -> Result<Option<AbiValue>, SignatureMismatch> {
        self.check(args, ret)?;

        macro_rules! arg_bits {
            ($v:expr) => {
                match $v {
                    AbiValue::I32(v) => v as u64,
                    AbiValue::I64(v) => v as u64,
                    AbiValue::F32(v) => u64::from(v.to_bits()),
                    AbiValue::F64(v) => v.to_bits(),
                }
            };
        }

        let mut raw = [0u64; 4];
        for (slot, arg) in raw.iter_mut().zip(args) {
            *slot = arg_bits!(*arg);
        }

        type Trampoline = unsafe extern "C" fn(*mut u8, u64, u64, u64, u64) -> u64;
        let trampoline: Trampoline = unsafe { std::mem::transmute(self.func_ptr) };
        let result = unsafe { trampoline(self.instance_closure, raw[0], raw[1], raw[2], raw[3]) };

        Ok(ret.map(|ty| match ty {
            ValType::I32 => AbiValue::I32(result as i32),
            ValType::I64 => AbiValue::I64(result as i64),
            ValType::F32 => AbiValue::F32(f32::from_bits(result as u32)),
            ValType::F64 => AbiValue::F64(f64::from_bits(result)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn add_one(_instance: *mut u8, a: u64, _b: u64, _c: u64, _d: u64) -> u64 {
        (a as i32 + 1) as u32 as u64
    }

    #[test]
    fn checked_call_on_matching_signature() {
        let binding = FunctionBinding {
            instance_closure: std::ptr::null_mut(),
            func_ptr: add_one as *const (),
            signature: Arc::from("I:I"),
        };
        let callee = Callee::new(&binding);

        let result = unsafe { callee.call(&[AbiValue::I32(41)], Some(ValType::I32)) }.unwrap();
        assert_eq!(result, Some(AbiValue::I32(42)));
    }

    #[test]
    fn rejects_mismatched_signature() {
        let binding = FunctionBinding {
            instance_closure: std::ptr::null_mut(),
            func_ptr: add_one as *const (),
            signature: Arc::from("I:I"),
        };
        let callee = Callee::new(&binding);

        let err = unsafe { callee.call(&[AbiValue::I64(1)], Some(ValType::I32)) }.unwrap_err();
        assert_eq!(err.expected, "I:I");
        assert_eq!(err.requested, "J:I");
    }
}
