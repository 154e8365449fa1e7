// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::code::{Code, WrapperCode};
use crate::codegen::CompilationEnv;
use crate::compile::state::CompilationState;
use crate::config::TrapHandlerMode;
use crate::engine::Engine;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::translate::{EntityIndex, Import, TranslatedModule};
use core::fmt;
use cranelift_entity::PrimaryMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use wasmparser::WasmFeatures;

/// The native-code side of a module: the code table, the wire bytes and the
/// per-module compilation coordinator.
pub(crate) struct NativeModule {
    engine: Engine,
    /// The decoded module description. Streaming compilation starts from a
    /// snapshot taken at the code-section header and swaps in the complete
    /// description once the stream has finished.
    module: Mutex<Arc<TranslatedModule>>,
    enabled_features: WasmFeatures,
    /// The complete module binary. Set at creation for bulk compilation, at
    /// stream end for streaming compilation.
    wire_bytes: Mutex<Option<Arc<[u8]>>>,
    code: Mutex<PrimaryMap<DefinedFuncIndex, Option<Arc<Code>>>>,
    export_wrappers: Mutex<Vec<Arc<WrapperCode>>>,
    /// The universal trampoline installed when lazy compilation is on.
    lazy_stub: Mutex<Option<Arc<Code>>>,
    trap_handler_enabled: AtomicBool,
    compilation_state: CompilationState,
}

impl NativeModule {
    pub(crate) fn new(engine: &Engine, module: Arc<TranslatedModule>) -> Arc<Self> {
        let compile_mode = engine.config().compile_mode(module.origin);
        let mut code = PrimaryMap::with_capacity(module.num_declared_functions() as usize);
        for _ in 0..module.num_declared_functions() {
            code.push(None);
        }

        Arc::new_cyclic(|weak| Self {
            engine: engine.clone(),
            enabled_features: engine.config().enabled_features,
            wire_bytes: Mutex::new(None),
            code: Mutex::new(code),
            export_wrappers: Mutex::new(Vec::new()),
            lazy_stub: Mutex::new(None),
            trap_handler_enabled: AtomicBool::new(
                engine.config().trap_handler == TrapHandlerMode::Preferred,
            ),
            compilation_state: CompilationState::new(
                engine.clone(),
                weak.clone(),
                compile_mode,
                engine.max_workers(),
            ),
            module: Mutex::new(module),
        })
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn module(&self) -> Arc<TranslatedModule> {
        Arc::clone(&self.module.lock())
    }

    /// Swap in the fully decoded module description once streaming has seen
    /// the whole binary.
    pub(crate) fn update_module(&self, module: Arc<TranslatedModule>) {
        let mut slot = self.module.lock();
        debug_assert_eq!(
            slot.num_declared_functions(),
            module.num_declared_functions()
        );
        *slot = module;
    }

    pub(crate) fn compilation_state(&self) -> &CompilationState {
        &self.compilation_state
    }

    pub(crate) fn compilation_env(&self) -> CompilationEnv {
        CompilationEnv {
            module: self.module(),
            enabled_features: self.enabled_features,
            trap_handler_enabled: self.trap_handler_enabled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_wire_bytes(&self, bytes: Arc<[u8]>) {
        *self.wire_bytes.lock() = Some(bytes);
    }

    pub(crate) fn wire_bytes(&self) -> Option<Arc<[u8]>> {
        self.wire_bytes.lock().clone()
    }

    /// Install `code` into the code table.
    ///
    /// Code replaces an existing entry only at the same or a higher tier: an
    /// Optimized result may replace a Baseline result, never the reverse.
    /// Returns whether the table changed.
    pub(crate) fn install_code(&self, code: Arc<Code>) -> bool {
        let module = self.module();
        let def_index = module
            .defined_func_index(code.func_index())
            .expect("cannot install code for an imported function");
        let mut table = self.code.lock();
        match &table[def_index] {
            Some(existing) if existing.tier() > code.tier() => false,
            _ => {
                table[def_index] = Some(code);
                true
            }
        }
    }

    pub(crate) fn has_code(&self, index: DefinedFuncIndex) -> bool {
        self.code.lock()[index].is_some()
    }

    pub(crate) fn code(&self, index: DefinedFuncIndex) -> Option<Arc<Code>> {
        self.code.lock()[index].clone()
    }

    pub(crate) fn set_export_wrappers(&self, wrappers: Vec<Arc<WrapperCode>>) {
        *self.export_wrappers.lock() = wrappers;
    }

    pub(crate) fn export_wrappers(&self) -> Vec<Arc<WrapperCode>> {
        self.export_wrappers.lock().clone()
    }

    pub(crate) fn set_lazy_stub(&self, stub: Arc<Code>) {
        *self.lazy_stub.lock() = Some(stub);
    }

    pub(crate) fn lazy_stub(&self) -> Option<Arc<Code>> {
        self.lazy_stub.lock().clone()
    }

    pub(crate) fn uses_trap_handler(&self) -> bool {
        self.trap_handler_enabled.load(Ordering::Relaxed)
    }

    /// Downgrade to explicit bounds checks; the caller is expected to
    /// recompile all functions afterwards.
    pub(crate) fn disable_trap_handler(&self) {
        self.trap_handler_enabled.store(false, Ordering::Relaxed);
    }
}

/// A compiled WebAssembly module, ready to be instantiated.
///
/// This is a cheaply cloneable handle; the underlying module is deallocated
/// once all handles and in-flight compilation tasks have gone away.
#[derive(Clone)]
pub struct Module(Arc<NativeModule>);

impl Module {
    pub(crate) fn from_native(native: Arc<NativeModule>) -> Self {
        Self(native)
    }

    pub(crate) fn native(&self) -> &Arc<NativeModule> {
        &self.0
    }

    /// The module name, if the binary carries one.
    pub fn name(&self) -> Option<String> {
        self.0.module().name.clone()
    }

    pub fn imports(&self) -> Vec<Import> {
        self.0.module().imports.clone()
    }

    pub fn exports(&self) -> Vec<(String, EntityIndex)> {
        self.0.module().exports.clone()
    }

    pub fn num_functions(&self) -> u32 {
        self.0.module().num_functions()
    }

    pub fn num_declared_functions(&self) -> u32 {
        self.0.module().num_declared_functions()
    }

    /// The installed code for `index`, if any. Returns the highest-tier code
    /// seen so far; for lazily-compiled modules this is `None` until the
    /// function's first call.
    pub fn code(&self, index: FuncIndex) -> Option<Arc<Code>> {
        let def_index = self.0.module().defined_func_index(index)?;
        self.0.code(def_index)
    }

    /// The JS->Wasm call adapters for the module's exports, in export order.
    pub fn export_wrappers(&self) -> Vec<Arc<WrapperCode>> {
        self.0.export_wrappers()
    }

    /// The per-module compilation coordinator.
    pub fn compilation_state(&self) -> &CompilationState {
        self.0.compilation_state()
    }

    /// Whether this module relies on guard regions for bounds checks.
    pub fn uses_trap_handler(&self) -> bool {
        self.0.uses_trap_handler()
    }

    /// The universal lazy-compilation trampoline, if lazy mode installed
    /// one.
    pub fn lazy_stub(&self) -> Option<Arc<Code>> {
        self.0.lazy_stub()
    }

    /// Switch the module to explicit bounds checks and recompile every
    /// function accordingly. The instance builder calls this when guarded
    /// memory cannot be provided for an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if recompilation fails.
    pub fn recompile_with_bounds_checks(&self) -> crate::Result<()> {
        self.0.disable_trap_handler();
        let engine = self.0.engine().clone();
        crate::compile::compile_native_module(&engine, &self.0)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.0.module().name)
            .field("functions", &self.0.module().num_functions())
            .finish_non_exhaustive()
    }
}
