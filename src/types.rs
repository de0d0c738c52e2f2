// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The value type model and the canonical function-signature string.

use std::fmt;
use std::string::String;

/// A WebAssembly value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    /// The signature-string character for this type: `{I, J, F, D}`.
    const fn code(self) -> char {
        match self {
            ValType::I32 => 'I',
            ValType::I64 => 'J',
            ValType::F32 => 'F',
            ValType::F64 => 'D',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'I' => Some(ValType::I32),
            'J' => Some(ValType::I64),
            'F' => Some(ValType::F32),
            'D' => Some(ValType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        })
    }
}

/// A function type: parameters followed by an optional return type.
///
/// Signature-string equality is function-type equality: two `FuncType`s are
/// equal iff their [`FuncType::signature`] strings are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: String,
    ret: Option<ValType>,
    params_types: std::vec::Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl IntoIterator<Item = ValType>, ret: Option<ValType>) -> Self {
        let params_types: std::vec::Vec<ValType> = params.into_iter().collect();
        let params = params_types.iter().map(|p| p.code()).collect();
        Self {
            params,
            ret,
            params_types,
        }
    }

    pub fn params(&self) -> &[ValType] {
        &self.params_types
    }

    pub fn ret(&self) -> Option<ValType> {
        self.ret
    }

    /// The canonical signature string: `c(p1)...c(pn) ':' [c(r)]`.
    pub fn signature(&self) -> String {
        let mut s = self.params.clone();
        s.push(':');
        if let Some(ret) = self.ret {
            s.push(ret.code());
        }
        s
    }

    /// Parse a signature string produced by [`FuncType::signature`].
    ///
    /// The character set is exactly `{I, J, F, D, ':'}`; anything else is
    /// rejected.
    pub fn parse_signature(sig: &str) -> Option<Self> {
        let (params, ret) = sig.split_once(':')?;

        let mut params_types = std::vec::Vec::with_capacity(params.len());
        for c in params.chars() {
            params_types.push(ValType::from_code(c)?);
        }

        let ret = match ret.len() {
            0 => None,
            1 => Some(ValType::from_code(ret.chars().next().unwrap())?),
            _ => return None,
        };

        Some(Self::new(params_types, ret))
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}
