// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![allow(dead_code)]

use parking_lot::Mutex;
use riptide::translate::FuncType;
use riptide::{
    Code, CodeGenerator, CompilationEnv, CompilationResultResolver, Config, Engine, Error,
    ExecutionTier, FuncIndex, Module, PumpRunner, Result, TaskRunner, WrapperCode,
    WrapperGenerator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wasmparser::WasmFeatures;

/// Code generator double: the "native code" is a copy of the function body.
#[derive(Default)]
pub struct TestGenerator {
    /// Fail compilation of this function (module index space).
    pub fail_on: Option<u32>,
    /// Sleep this long per function, to give tests a window to interfere.
    pub delay: Option<Duration>,
    pub invocations: AtomicUsize,
}

impl TestGenerator {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for TestGenerator {
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
                message: "unsupported opcode".to_string(),
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

pub struct TestWrappers {
    pub invocations: AtomicUsize,
}

impl Default for TestWrappers {
    fn default() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
        }
    }
}

impl WrapperGenerator for TestWrappers {
    fn compile_js_to_wasm(&self, ty: &FuncType, is_import: bool) -> WrapperCode {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        WrapperCode::new(Box::new([ty.params.len() as u8, u8::from(is_import)]))
    }
}

/// Records the single verdict a compile job delivers.
#[derive(Default)]
pub struct TestResolver {
    outcome: Mutex<Option<Result<Module, Error>>>,
}

impl TestResolver {
    pub fn is_resolved(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub fn module(&self) -> Option<Module> {
        match &*self.outcome.lock() {
            Some(Ok(module)) => Some(module.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Error> {
        match &*self.outcome.lock() {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }
}

impl CompilationResultResolver for TestResolver {
    fn on_compilation_succeeded(&self, module: Module) {
        let mut outcome = self.outcome.lock();
        assert!(outcome.is_none(), "resolver heard two verdicts");
        *outcome = Some(Ok(module));
    }

    fn on_compilation_failed(&self, error: Error) {
        let mut outcome = self.outcome.lock();
        assert!(outcome.is_none(), "resolver heard two verdicts");
        *outcome = Some(Err(error));
    }
}

pub struct TestHost {
    pub engine: Engine,
    pub runner: Arc<PumpRunner>,
    pub generator: Arc<TestGenerator>,
    pub wrappers: Arc<TestWrappers>,
}

pub fn host(config: Config) -> TestHost {
    host_with(config, TestGenerator::default())
}

pub fn host_with(config: Config, generator: TestGenerator) -> TestHost {
    let runner = Arc::new(PumpRunner::new(2));
    let generator = Arc::new(generator);
    let wrappers = Arc::new(TestWrappers::default());
    let engine = Engine::new(
        config,
        Arc::clone(&generator) as Arc<dyn CodeGenerator>,
        Arc::clone(&wrappers) as Arc<dyn WrapperGenerator>,
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
    );
    TestHost {
        engine,
        runner,
        generator,
        wrappers,
    }
}

/// Pump the foreground until `pred` holds; panics after five seconds.
pub fn pump_until(runner: &PumpRunner, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        runner.pump();
        if pred() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        runner.wait_for_foreground_task(Duration::from_millis(10));
    }
}

/// Wait (without pumping) until `pred` holds; panics after five seconds.
pub fn wait_until(mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A module with `n` exported functions returning their own index.
pub fn module_with_funcs(n: usize) -> Vec<u8> {
    let mut wat = String::from("(module\n");
    for i in 0..n {
        wat.push_str(&format!(
            "  (func (export \"f{i}\") (result i32) i32.const {i})\n"
        ));
    }
    wat.push(')');
    wat::parse_str(&wat).unwrap()
}

/// A structurally well-formed module whose single function body fails
/// validation: the `() -> i32` function falls off the end without a value.
pub fn module_with_invalid_body() -> Vec<u8> {
    vec![
        0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7F, // type: () -> i32
        0x03, 0x02, 0x01, 0x00, // function: type 0
        0x0A, 0x04, 0x01, 0x02, 0x00, 0x0B, // code: locals 0, end
    ]
}

/// Every defined function has installed code at `tier`.
pub fn all_code_at_tier(module: &Module, tier: ExecutionTier) -> bool {
    let imported = module.num_functions() - module.num_declared_functions();
    (0..module.num_declared_functions()).all(|i| {
        module
            .code(FuncIndex::from_u32(imported + i))
            .is_some_and(|code| code.tier() == tier)
    })
}
