// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compile::unit::CompileMode;
use wasmparser::WasmFeatures;

/// Where a module binary came from. Asm.js-origin modules are valid by
/// construction and take slightly different compilation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    Wasm,
    AsmJs,
}

/// Whether out-of-bounds memory accesses should be caught with guard regions
/// and a signal handler, or with explicit bounds checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapHandlerMode {
    /// Use guard regions where the platform can allocate them; the instance
    /// builder falls back to a bounds-checked recompile where it cannot.
    Preferred,
    /// Always emit explicit bounds checks.
    Disabled,
}

/// Compilation configuration, fixed at [`Engine`](crate::Engine)
/// construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// The WebAssembly proposals the engine accepts.
    pub enabled_features: WasmFeatures,
    /// Compile each function at both tiers, so execution can start early on
    /// Baseline code and upgrade to Optimized code in the background. Only
    /// applies to modules with [`ModuleOrigin::Wasm`].
    pub tier_up: bool,
    /// Skip bulk compilation entirely and compile each function on first
    /// call.
    pub lazy_compilation: bool,
    /// Upper bound on concurrent background compilation tasks. Zero posts
    /// all background work to the foreground runner instead, which makes
    /// compilation deterministic for testing.
    pub num_compilation_tasks: usize,
    pub trap_handler: TrapHandlerMode,
    /// Report every finished code object through the code-logging task.
    pub log_code: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled_features: WasmFeatures::default(),
            tier_up: true,
            lazy_compilation: false,
            num_compilation_tasks: 8,
            trap_handler: TrapHandlerMode::Preferred,
            log_code: false,
        }
    }
}

impl Config {
    /// The compile mode used for a module of the given origin.
    pub(crate) fn compile_mode(&self, origin: ModuleOrigin) -> CompileMode {
        if self.tier_up && origin == ModuleOrigin::Wasm {
            CompileMode::Tiering
        } else {
            CompileMode::Regular
        }
    }
}
