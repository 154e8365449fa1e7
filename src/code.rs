// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compile::unit::ExecutionTier;
use crate::indices::FuncIndex;

/// Native code for one function at one tier, as produced by the external
/// code generator.
#[derive(Debug)]
pub struct Code {
    func_index: FuncIndex,
    tier: ExecutionTier,
    body: Box<[u8]>,
}

impl Code {
    pub fn new(func_index: FuncIndex, tier: ExecutionTier, body: Box<[u8]>) -> Self {
        Self {
            func_index,
            tier,
            body,
        }
    }

    pub fn func_index(&self) -> FuncIndex {
        self.func_index
    }

    pub fn tier(&self) -> ExecutionTier {
        self.tier
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Address of the first instruction.
    pub fn instruction_start(&self) -> usize {
        self.body.as_ptr() as usize
    }
}

/// Native code for a JS->Wasm call adapter.
#[derive(Debug)]
pub struct WrapperCode {
    body: Box<[u8]>,
}

impl WrapperCode {
    pub fn new(body: Box<[u8]>) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
