// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Contracts for the external code generators.
//!
//! The pipeline orchestrates *when* and *where* functions compile; the
//! translation of a single function body into native code is somebody
//! else's problem, reached through [`CodeGenerator`]. Likewise the JS<->Wasm
//! call adapters come from a [`WrapperGenerator`].

use crate::code::{Code, WrapperCode};
use crate::compile::unit::ExecutionTier;
use crate::indices::FuncIndex;
use crate::translate::{FuncType, TranslatedModule};
use crate::Result;
use std::sync::Arc;
use wasmparser::WasmFeatures;

/// Everything a code generator may look at while compiling one function.
///
/// The environment is immutable and detached from host-heap objects, so
/// workers can carry one across threads.
#[derive(Clone)]
pub struct CompilationEnv {
    pub module: Arc<TranslatedModule>,
    pub enabled_features: WasmFeatures,
    /// Whether out-of-bounds accesses may rely on guard regions instead of
    /// explicit bounds checks.
    pub trap_handler_enabled: bool,
}

/// The function-level code generator.
///
/// Implementations must be thread-safe: `compile_function` is called from
/// worker threads, in parallel, with no locks held. It must not touch
/// host-managed heap objects.
pub trait CodeGenerator: Send + Sync {
    /// Compile the body of the function `func_index` at `tier`.
    ///
    /// `body` holds the function body bytes (locals declarations included)
    /// and `body_offset` their offset within the module, for error
    /// attribution. Optional features the body uses are accumulated into
    /// `detected`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function body fails to translate.
    fn compile_function(
        &self,
        env: &CompilationEnv,
        func_index: FuncIndex,
        tier: ExecutionTier,
        body: &[u8],
        body_offset: u32,
        detected: &mut WasmFeatures,
    ) -> Result<Code>;

    /// Compile the universal trampoline installed for every function of a
    /// lazily-compiled module. The trampoline tail-calls into
    /// [`compile_lazy`](crate::compile_lazy) on first execution.
    fn compile_lazy_stub(&self, env: &CompilationEnv) -> Result<Code>;
}

/// Generator for the JS->Wasm call adapters of exported functions.
pub trait WrapperGenerator: Send + Sync {
    /// Compile an adapter for calling a function of type `ty` from the host.
    /// Calling an imported function takes different code than calling a
    /// function defined in this module, hence `is_import`.
    fn compile_js_to_wasm(&self, ty: &FuncType, is_import: bool) -> WrapperCode;
}

/// Sink for compilation telemetry. All methods default to doing nothing.
pub trait CompileMetrics: Send + Sync {
    fn function_compiled(&self, _tier: ExecutionTier, _body_len: usize) {}
    fn lazy_function_compiled(&self, _body_len: usize, _micros: u128) {}
    /// Reports the union of optional features the module was observed using.
    fn features_used(&self, _features: WasmFeatures) {}
}

/// The default [`CompileMetrics`] sink.
pub struct NoopMetrics;

impl CompileMetrics for NoopMetrics {}
