// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compilation drivers.
//!
//! The blocking entry point lives here: sequential compilation for tiny
//! modules and hosts without worker threads, parallel compilation where the
//! calling thread doubles as an extra worker and as the finisher, and the
//! lazy path that installs a universal trampoline instead of compiling
//! anything up front. The asynchronous and streaming drivers build on the
//! same pieces from [`job`] and [`streaming`].

pub(crate) mod job;
pub(crate) mod state;
pub(crate) mod streaming;
pub(crate) mod unit;

use crate::compile::state::fetch_and_execute_unit;
use crate::compile::unit::{CompilationUnit, CompilationUnitBuilder, CompileMode, ExecutionTier};
use crate::engine::Engine;
use crate::indices::{DefinedFuncIndex, FuncIndex};
use crate::module::{Module, NativeModule};
use crate::translate::{self, EntityIndex, FuncType, ModuleTranslator};
use crate::wire_bytes::OwnedWireBytes;
use crate::{Error, ModuleOrigin, Result, WrapperCode};
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Instant;
use wasmparser::WasmFeatures;

/// Decode and compile a complete module binary on the calling thread.
pub(crate) fn compile_to_native_module(
    engine: &Engine,
    bytes: &[u8],
    origin: ModuleOrigin,
) -> Result<Module> {
    let features = engine.config().enabled_features;
    let module = ModuleTranslator::new(features, origin).translate(bytes)?;
    tracing::debug!(
        target: "riptide::compile",
        functions = module.num_declared_functions(),
        "module decoded"
    );

    let native_module = NativeModule::new(engine, Arc::new(module));
    let bytes: Arc<[u8]> = Arc::from(bytes);
    native_module.set_wire_bytes(Arc::clone(&bytes));
    native_module
        .compilation_state()
        .set_wire_bytes_storage(Arc::new(OwnedWireBytes::new(bytes)));

    compile_native_module(engine, &native_module)?;
    compile_js_to_wasm_wrappers(engine, &native_module);

    Ok(Module::from_native(native_module))
}

/// Compile every function of `native_module` according to the engine
/// configuration: lazily, in parallel, or sequentially.
///
/// Re-entrant: the instance builder calls this again to recompile with
/// explicit bounds checks when trap-handler memory cannot be provided.
pub(crate) fn compile_native_module(
    engine: &Engine,
    native_module: &Arc<NativeModule>,
) -> Result<()> {
    let module = native_module.module();
    let state = native_module.compilation_state();

    if engine.config().lazy_compilation {
        if module.origin == ModuleOrigin::Wasm {
            // Validate wasm modules before lazy compilation; asm.js modules
            // are valid by construction. Without this, a compile error at
            // first call would be unrecoverable.
            let bytes = native_module
                .wire_bytes()
                .expect("wire bytes must be set before compilation");
            translate::validate_functions(&module, &bytes, engine.config().enabled_features)?;
        }
        let stub = engine
            .generator()
            .compile_lazy_stub(&native_module.compilation_env())?;
        native_module.set_lazy_stub(Arc::new(stub));
        tracing::debug!(target: "riptide::lazy", "installed lazy compilation stub");
        return Ok(());
    }

    let funcs_to_compile = module.num_declared_functions();
    let compile_parallel = engine.config().num_compilation_tasks > 0
        && funcs_to_compile > 1
        && engine.runner().num_worker_threads() > 0;

    if compile_parallel {
        compile_in_parallel(native_module);
    } else {
        compile_sequentially(native_module);
    }

    if state.failed() {
        return Err(state.get_compile_error());
    }
    Ok(())
}

/// Build one unit per defined function and publish them all at once.
pub(crate) fn initialize_compilation_units(native_module: &Arc<NativeModule>) {
    let module = native_module.module();
    let mut builder = CompilationUnitBuilder::new(Arc::clone(native_module));
    for index in 0..module.num_declared_functions() {
        let func_index = module.func_index(DefinedFuncIndex::from_u32(index));
        builder.add(func_index, module.function_body_range(func_index));
    }
    builder.commit();
}

/// Drain the active finished queue, installing code and counting down, until
/// it is empty or compilation failed.
fn finish_compilation_units(native_module: &Arc<NativeModule>) {
    let state = native_module.compilation_state();
    while !state.failed() {
        let Some(mut unit) = state.next_finished() else {
            break;
        };
        if let Some(Ok(code)) = unit.take_result() {
            native_module.install_code(code);
        }
        state.on_finished_unit();
    }
}

/// Parallel compilation:
///
/// 1. The calling thread builds one unit per function and publishes them,
///    which spawns background workers.
/// 2. The calling thread joins in, alternating between executing units
///    itself and finishing executed ones, so results convert to installed
///    code as they appear.
/// 3. Once nothing is left to execute, the calling thread keeps finishing
///    until baseline compilation is counted down.
/// 4. In tiering mode the finisher flag is released at the end so the
///    remaining top-tier units finish through foreground tasks.
pub(crate) fn compile_in_parallel(native_module: &Arc<NativeModule>) {
    let engine = native_module.engine();
    let state = native_module.compilation_state();

    // This thread is the finisher; no finisher task must be spawned while it
    // drains results itself.
    state.set_finisher_is_running(true);
    state.set_total(native_module.module().num_declared_functions() as usize);
    initialize_compilation_units(native_module);

    let env = native_module.compilation_env();
    let mut detected = WasmFeatures::empty();
    while fetch_and_execute_unit(engine, state, &env, &mut detected)
        && !state.baseline_compilation_finished()
    {
        finish_compilation_units(native_module);
        if state.failed() {
            break;
        }
    }

    loop {
        if state.failed() {
            break;
        }
        finish_compilation_units(native_module);
        if state.baseline_compilation_finished() {
            break;
        }
        state.wait_for_finisher_progress();
    }

    // Fold in features seen by this thread and everything reported by
    // stopped workers.
    state.publish_features(detected);

    if !state.failed() && state.compile_mode() == CompileMode::Tiering {
        state.set_finisher_is_running(false);
        // Units that finished while this thread held the flag have no
        // finisher task; mirror the finisher's own exit re-check.
        if state.has_unit_to_finish() && state.set_finisher_is_running(true) {
            state.schedule_finisher_task();
        }
    }
}

/// Sequential compilation: one function at a time, in module order, on the
/// calling thread. The first failure latches the error and stops.
pub(crate) fn compile_sequentially(native_module: &Arc<NativeModule>) {
    let engine = native_module.engine();
    let state = native_module.compilation_state();
    let env = native_module.compilation_env();
    let module = Arc::clone(&env.module);
    let storage = state
        .wire_bytes_storage()
        .expect("wire bytes storage must be set before compilation");
    let mut detected = WasmFeatures::empty();

    for index in 0..module.num_declared_functions() {
        let func_index = module.func_index(DefinedFuncIndex::from_u32(index));
        let mut unit = CompilationUnit::new(
            func_index,
            ExecutionTier::default(),
            module.function_body_range(func_index),
        );
        unit.execute(engine, &env, &storage, &mut detected);
        match unit.take_result() {
            Some(Ok(code)) => {
                native_module.install_code(code);
            }
            Some(Err(error)) => {
                state.set_error(func_index, error);
                break;
            }
            None => unreachable!("unit executed without a result"),
        }
    }

    state.publish_features(detected);
}

/// Compile `func_index` on its first call and install the result.
///
/// Returns the address of the generated code. Must not fail: the module was
/// validated before execution started with lazy compilation enabled, so a
/// compile error here is a contract violation, and an out-of-memory
/// condition cannot be recovered from either way.
///
/// # Panics
///
/// Panics if the generator rejects a function of the validated module.
pub fn compile_lazy(module: &Module, func_index: FuncIndex) -> usize {
    let native_module = module.native();
    let translated = native_module.module();
    let def_index = translated
        .defined_func_index(func_index)
        .expect("cannot lazily compile an imported function");
    debug_assert!(!native_module.has_code(def_index));

    let timer = Instant::now();
    tracing::debug!(target: "riptide::lazy", func = func_index.as_u32(), "compiling lazily");

    let engine = native_module.engine();
    let state = native_module.compilation_state();
    let env = native_module.compilation_env();
    let body = translated.function_body_range(func_index);
    let bytes = state
        .wire_bytes_storage()
        .expect("wire bytes storage must be set before compilation")
        .code(body.clone());

    let mut detected = WasmFeatures::empty();
    let result = engine.generator().compile_function(
        &env,
        func_index,
        ExecutionTier::default(),
        &bytes,
        body.start,
        &mut detected,
    );
    let code = match result {
        Ok(code) => Arc::new(code),
        Err(Error::Resource(message)) => {
            tracing::error!(target: "riptide::lazy", "out of memory during lazy compilation: {message}");
            std::process::abort();
        }
        Err(error) => panic!("lazy compilation failed on a validated module: {error}"),
    };

    native_module.install_code(Arc::clone(&code));
    state.schedule_code_logging(Arc::clone(&code));
    state.publish_features(detected);
    engine
        .metrics()
        .lazy_function_compiled(bytes.len(), timer.elapsed().as_micros());

    code.instruction_start()
}

/// Memoizes call adapters per signature. Calling an import takes different
/// code than calling a module-local function, so both are cached separately.
#[derive(Default)]
struct JsToWasmWrapperCache {
    cache: HashMap<(bool, FuncType), Arc<WrapperCode>>,
}

impl JsToWasmWrapperCache {
    fn get_or_compile(
        &mut self,
        engine: &Engine,
        ty: &FuncType,
        is_import: bool,
    ) -> Arc<WrapperCode> {
        Arc::clone(
            self.cache
                .entry((is_import, ty.clone()))
                .or_insert_with(|| {
                    Arc::new(
                        engine
                            .wrapper_generator()
                            .compile_js_to_wasm(ty, is_import),
                    )
                }),
        )
    }
}

/// Compile the JS->Wasm call adapters for all exported functions and attach
/// them to the module, in export order.
pub(crate) fn compile_js_to_wasm_wrappers(engine: &Engine, native_module: &Arc<NativeModule>) {
    tracing::debug!(target: "riptide::compile", "(5) compiling export wrappers");
    let module = native_module.module();
    let mut cache = JsToWasmWrapperCache::default();
    let mut wrappers = Vec::new();
    for (_, index) in &module.exports {
        let EntityIndex::Function(func_index) = index else {
            continue;
        };
        let ty = module.function_type(*func_index);
        let is_import = module.is_imported_function(*func_index);
        wrappers.push(cache.get_or_compile(engine, ty, is_import));
    }
    native_module.set_export_wrappers(wrappers);
}
