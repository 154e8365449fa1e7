// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::Code;
use crate::codegen::CompilationEnv;
use crate::engine::Engine;
use crate::indices::FuncIndex;
use crate::module::NativeModule;
use crate::wire_bytes::WireBytesStorage;
use crate::{Error, Result};
use core::ops::Range;
use std::sync::Arc;
use wasmparser::WasmFeatures;

/// The tier of native code a unit produces.
///
/// Tiers are ordered: installed code is only ever replaced by code of the
/// same or a higher tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionTier {
    /// Fast to generate, slower to execute.
    Baseline,
    /// Slow to generate, faster to execute.
    Optimized,
}

impl Default for ExecutionTier {
    /// The tier a function compiles at when tiering is off.
    fn default() -> Self {
        Self::Optimized
    }
}

/// The compilation policy of one module, fixed at compile-state
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// One compilation per function, at the default tier.
    Regular,
    /// Two compilations per function: a Baseline one so execution can start
    /// early, and an Optimized one that replaces it in the background.
    Tiering,
}

/// One function's compilation work at one tier.
///
/// A unit lives in exactly one place at any time - the pending queue, a
/// worker, or the finished queue - which the move semantics of `Box` enforce
/// for free. Exactly one worker executes it, and the finisher destroys it.
pub(crate) struct CompilationUnit {
    func_index: FuncIndex,
    tier: ExecutionTier,
    /// Wire-byte range of the function body.
    body: Range<u32>,
    result: Option<Result<Arc<Code>, Error>>,
}

impl CompilationUnit {
    pub(crate) fn new(func_index: FuncIndex, tier: ExecutionTier, body: Range<u32>) -> Self {
        Self {
            func_index,
            tier,
            body,
            result: None,
        }
    }

    pub(crate) fn func_index(&self) -> FuncIndex {
        self.func_index
    }

    pub(crate) fn tier(&self) -> ExecutionTier {
        self.tier
    }

    /// Run the external code generator for this unit. Called with no locks
    /// held; the body bytes are copied out of `storage` first so the
    /// generator never touches shared state.
    pub(crate) fn execute(
        &mut self,
        engine: &Engine,
        env: &CompilationEnv,
        storage: &Arc<dyn WireBytesStorage>,
        detected: &mut WasmFeatures,
    ) {
        let body = storage.code(self.body.clone());
        let result = engine.generator().compile_function(
            env,
            self.func_index,
            self.tier,
            &body,
            self.body.start,
            detected,
        );
        if result.is_ok() {
            engine.metrics().function_compiled(self.tier, body.len());
        }
        self.result = Some(result.map(Arc::new));
    }

    pub(crate) fn result(&self) -> Option<&Result<Arc<Code>, Error>> {
        self.result.as_ref()
    }

    pub(crate) fn take_result(&mut self) -> Option<Result<Arc<Code>, Error>> {
        self.result.take()
    }
}

/// Builds compilation units into an internal buffer and publishes the whole
/// buffer to the compile-state at once when [`commit`](Self::commit) is
/// called, which also kicks off background compilation.
pub(crate) struct CompilationUnitBuilder {
    native_module: Arc<NativeModule>,
    baseline_units: Vec<Box<CompilationUnit>>,
    tiering_units: Vec<Box<CompilationUnit>>,
}

impl CompilationUnitBuilder {
    pub(crate) fn new(native_module: Arc<NativeModule>) -> Self {
        Self {
            native_module,
            baseline_units: Vec::new(),
            tiering_units: Vec::new(),
        }
    }

    /// Buffer the unit(s) for one function whose body lives at `body`. In
    /// tiering mode every function compiles at both tiers.
    pub(crate) fn add(&mut self, func_index: FuncIndex, body: Range<u32>) {
        match self.native_module.compilation_state().compile_mode() {
            CompileMode::Tiering => {
                self.tiering_units.push(Box::new(CompilationUnit::new(
                    func_index,
                    ExecutionTier::Optimized,
                    body.clone(),
                )));
                self.baseline_units.push(Box::new(CompilationUnit::new(
                    func_index,
                    ExecutionTier::Baseline,
                    body,
                )));
            }
            CompileMode::Regular => {
                self.baseline_units.push(Box::new(CompilationUnit::new(
                    func_index,
                    ExecutionTier::default(),
                    body,
                )));
            }
        }
    }

    /// Publish the buffered units. Returns `false` (and changes nothing) if
    /// the buffer is empty.
    pub(crate) fn commit(&mut self) -> bool {
        if self.baseline_units.is_empty() && self.tiering_units.is_empty() {
            return false;
        }
        self.native_module.compilation_state().add_units(
            core::mem::take(&mut self.baseline_units),
            core::mem::take(&mut self.tiering_units),
        );
        true
    }

    /// Discard the buffered units without publishing them.
    pub(crate) fn clear(&mut self) {
        self.baseline_units.clear();
        self.tiering_units.clear();
    }
}

impl Drop for CompilationUnitBuilder {
    fn drop(&mut self) {
        debug_assert!(
            self.baseline_units.is_empty() && self.tiering_units.is_empty(),
            "compilation unit builder dropped with uncommitted units"
        );
    }
}
