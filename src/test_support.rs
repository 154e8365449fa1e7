// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test doubles shared by the crate's unit tests.

use crate::code::{Code, WrapperCode};
use crate::codegen::{CodeGenerator, CompilationEnv, WrapperGenerator};
use crate::compile::unit::ExecutionTier;
use crate::config::Config;
use crate::engine::Engine;
use crate::indices::FuncIndex;
use crate::task::PumpRunner;
use crate::translate::FuncType;
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wasmparser::WasmFeatures;

/// A code generator that copies the function body into the "native" code.
/// Can be told to fail on one function or to dawdle on every one.
#[derive(Default)]
pub(crate) struct MockGenerator {
    pub fail_on: Option<u32>,
    pub delay: Option<Duration>,
    pub invocations: AtomicUsize,
}

impl CodeGenerator for MockGenerator {
    fn compile_function(
        &self,
        _env: &CompilationEnv,
        func_index: FuncIndex,
        tier: ExecutionTier,
        body: &[u8],
        body_offset: u32,
        _detected: &mut WasmFeatures,
    ) -> Result<Code> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_on == Some(func_index.as_u32()) {
            return Err(Error::Compile {
                func_index: func_index.as_u32(),
                name: None,
                offset: body_offset as usize,
                message: "mock failure".to_string(),
            });
        }
        Ok(Code::new(func_index, tier, body.into()))
    }

    fn compile_lazy_stub(&self, _env: &CompilationEnv) -> Result<Code> {
        Ok(Code::new(
            FuncIndex::from_u32(0),
            ExecutionTier::Baseline,
            Box::new([0xCC]),
        ))
    }
}

pub(crate) struct MockWrappers;

impl WrapperGenerator for MockWrappers {
    fn compile_js_to_wasm(&self, ty: &FuncType, is_import: bool) -> WrapperCode {
        WrapperCode::new(Box::new([ty.params.len() as u8, u8::from(is_import)]))
    }
}

/// Decode `wat` and wrap it into a native module ready for compilation.
pub(crate) fn native_module(engine: &Engine, wat: &str) -> Arc<crate::module::NativeModule> {
    let bytes = wat::parse_str(wat).unwrap();
    let module = crate::translate::ModuleTranslator::new(
        engine.config().enabled_features,
        crate::ModuleOrigin::Wasm,
    )
    .translate(&bytes)
    .unwrap();
    let native_module = crate::module::NativeModule::new(engine, Arc::new(module));
    let bytes: Arc<[u8]> = Arc::from(bytes);
    native_module.set_wire_bytes(Arc::clone(&bytes));
    native_module
        .compilation_state()
        .set_wire_bytes_storage(Arc::new(crate::OwnedWireBytes::new(bytes)));
    native_module
}

/// Pump the foreground until `pred` holds, panicking after five seconds.
pub(crate) fn pump_until(runner: &PumpRunner, mut pred: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        runner.pump();
        if pred() {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for condition"
        );
        runner.wait_for_foreground_task(Duration::from_millis(10));
    }
}

pub(crate) fn test_engine(config: Config) -> (Engine, Arc<PumpRunner>) {
    test_engine_with(config, Arc::new(MockGenerator::default()))
}

pub(crate) fn test_engine_with(
    config: Config,
    generator: Arc<MockGenerator>,
) -> (Engine, Arc<PumpRunner>) {
    let runner = Arc::new(PumpRunner::new(2));
    let engine = Engine::new(
        config,
        generator,
        Arc::new(MockWrappers),
        Arc::clone(&runner) as Arc<dyn crate::TaskRunner>,
    );
    (engine, runner)
}
