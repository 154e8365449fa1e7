// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use riptide::{
    compile_lazy, Config, Error, ExecutionTier, FuncIndex, ModuleOrigin, TrapHandlerMode,
};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn sync_regular_compiles_every_function() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&module_with_funcs(2), ModuleOrigin::Wasm)
        .unwrap();

    assert_eq!(module.num_declared_functions(), 2);
    assert!(all_code_at_tier(&module, ExecutionTier::Optimized));
    assert_eq!(module.export_wrappers().len(), 2);
    assert_eq!(host.generator.invocations(), 2);
}

#[test]
fn sync_empty_module_compiles_immediately() {
    let host = host(Config::default());
    let module = host
        .engine
        .compile_sync(&module_with_funcs(0), ModuleOrigin::Wasm)
        .unwrap();

    assert_eq!(module.num_functions(), 0);
    assert!(module.export_wrappers().is_empty());
    assert_eq!(host.generator.invocations(), 0);
}

#[test]
fn sync_tiering_finishes_baseline_then_tops_up() {
    let host = host(Config {
        tier_up: true,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&module_with_funcs(3), ModuleOrigin::Wasm)
        .unwrap();

    // Baseline compilation is done when the call returns; every function is
    // runnable at some tier.
    for i in 0..3 {
        assert!(module.code(FuncIndex::from_u32(i)).is_some());
    }

    // Top-tier results keep landing through foreground finisher tasks.
    let probe = module.clone();
    pump_until(&host.runner, || {
        all_code_at_tier(&probe, ExecutionTier::Optimized)
    });
    assert_eq!(host.generator.invocations(), 6);
}

#[test]
fn sync_error_is_formatted_with_function_placeholder_name() {
    // Three unexported (hence unnamed) functions; function #2 fails.
    let wat = r"(module
        (func (result i32) i32.const 0)
        (func (result i32) i32.const 1)
        (func (result i32) i32.const 2)
    )";
    let host = host_with(
        Config {
            tier_up: false,
            num_compilation_tasks: 0,
            ..Config::default()
        },
        TestGenerator {
            fail_on: Some(2),
            ..TestGenerator::default()
        },
    );
    let error = host
        .engine
        .compile_sync(&wat::parse_str(wat).unwrap(), ModuleOrigin::Wasm)
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "Compiling wasm function \"wasm-function[2]\" failed: unsupported opcode"
    );
    // Sequential compilation stops at the first failure.
    assert_eq!(host.generator.invocations(), 3);
}

#[test]
fn sync_error_uses_the_exported_name() {
    let host = host_with(
        Config {
            tier_up: false,
            ..Config::default()
        },
        TestGenerator {
            fail_on: Some(1),
            ..TestGenerator::default()
        },
    );
    let error = host
        .engine
        .compile_sync(&module_with_funcs(2), ModuleOrigin::Wasm)
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "Compiling wasm function \"f1\" failed: unsupported opcode"
    );
}

#[test]
fn async_regular_resolves_and_leaves_the_registry() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(module_with_funcs(2), Arc::clone(&resolver) as _);
    assert_eq!(host.engine.compile_job_count(), 1);

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert!(all_code_at_tier(&module, ExecutionTier::Optimized));
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn async_tiering_resolves_after_baseline_and_unregisters_after_top_tier() {
    let host = host(Config {
        tier_up: true,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(module_with_funcs(2), Arc::clone(&resolver) as _);

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");

    // The job sticks around until the top tier lands, then removes itself.
    pump_until(&host.runner, || host.engine.compile_job_count() == 0);
    let probe = module.clone();
    pump_until(&host.runner, || {
        all_code_at_tier(&probe, ExecutionTier::Optimized)
    });
}

#[test]
fn async_empty_module_resolves_without_units() {
    let host = host(Config::default());
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(module_with_funcs(0), Arc::clone(&resolver) as _);

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert_eq!(module.num_functions(), 0);
    assert_eq!(host.generator.invocations(), 0);
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn async_decode_failure_rejects() {
    let host = host(Config::default());
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(b"not wasm".to_vec(), Arc::clone(&resolver) as _);

    pump_until(&host.runner, || resolver.is_resolved());
    let error = resolver.error().expect("compilation should fail");
    assert!(matches!(error, Error::InvalidWebAssembly { .. }));
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn async_compile_failure_rejects_with_formatted_error() {
    let host = host_with(
        Config {
            tier_up: false,
            ..Config::default()
        },
        TestGenerator {
            fail_on: Some(1),
            ..TestGenerator::default()
        },
    );
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(module_with_funcs(3), Arc::clone(&resolver) as _);

    pump_until(&host.runner, || resolver.is_resolved());
    let error = resolver.error().expect("compilation should fail");
    assert_eq!(
        error.to_string(),
        "Compiling wasm function \"f1\" failed: unsupported opcode"
    );
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn abort_rejects_and_joins_all_workers() {
    let host = host_with(
        Config {
            tier_up: false,
            ..Config::default()
        },
        TestGenerator {
            delay: Some(Duration::from_millis(5)),
            ..TestGenerator::default()
        },
    );
    let resolver = Arc::new(TestResolver::default());
    let handle = host
        .engine
        .compile_async(module_with_funcs(100), Arc::clone(&resolver) as _);

    // Let decoding finish and compilation start before pulling the plug.
    pump_until(&host.runner, || host.generator.invocations() > 0);
    handle.abort();

    // Every worker was joined before abort returned; nothing compiles
    // afterwards.
    let compiled_before_abort = host.generator.invocations();

    // The rejection arrives through the failure event on the foreground.
    pump_until(&host.runner, || resolver.is_resolved());
    assert_eq!(resolver.error(), Some(Error::Aborted));
    assert_eq!(host.engine.compile_job_count(), 0);
    assert_eq!(host.generator.invocations(), compiled_before_abort);

    // A second abort is a no-op.
    handle.abort();
    host.runner.pump();
    assert_eq!(resolver.error(), Some(Error::Aborted));
}

#[test]
fn zero_compilation_tasks_runs_entirely_on_the_foreground() {
    let host = host(Config {
        tier_up: false,
        num_compilation_tasks: 0,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let _handle = host
        .engine
        .compile_async(module_with_funcs(2), Arc::clone(&resolver) as _);

    // Nothing happens until the embedder pumps; even "background" decoding
    // and compilation run on the foreground queue.
    std::thread::sleep(Duration::from_millis(10));
    assert!(!resolver.is_resolved());
    assert_eq!(host.generator.invocations(), 0);

    pump_until(&host.runner, || resolver.is_resolved());
    assert!(resolver.module().is_some());
    assert_eq!(host.generator.invocations(), 2);
}

#[test]
fn lazy_compilation_defers_until_first_call() {
    let host = host(Config {
        lazy_compilation: true,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&module_with_funcs(2), ModuleOrigin::Wasm)
        .unwrap();

    assert_eq!(host.generator.invocations(), 0);
    assert!(module.code(FuncIndex::from_u32(0)).is_none());

    let address = compile_lazy(&module, FuncIndex::from_u32(0));
    assert_ne!(address, 0);
    assert!(module.code(FuncIndex::from_u32(0)).is_some());
    assert!(module.code(FuncIndex::from_u32(1)).is_none());
    assert_eq!(host.generator.invocations(), 1);
}

#[test]
fn lazy_compilation_still_validates_wasm_modules() {
    let host = host(Config {
        lazy_compilation: true,
        ..Config::default()
    });
    let bytes = module_with_invalid_body();
    let error = host
        .engine
        .compile_sync(&bytes, ModuleOrigin::Wasm)
        .unwrap_err();

    // Pre-validation failures carry the index-prefixed message with the
    // bytecode offset appended, not the per-function compile-failure form.
    let raw = wasmparser::Validator::new_with_features(wasmparser::WasmFeatures::default())
        .validate_all(&bytes)
        .map(|_| ())
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        format!(
            "Compiling function #0: failed: {} @+{}",
            raw.message(),
            raw.offset()
        )
    );
    assert_eq!(host.generator.invocations(), 0);
}

#[test]
fn lazy_compilation_skips_validation_for_asm_js() {
    let host = host(Config {
        lazy_compilation: true,
        ..Config::default()
    });
    // Asm.js-origin modules are valid by construction, so the invalid body
    // sails through module creation.
    let module = host
        .engine
        .compile_sync(&module_with_invalid_body(), ModuleOrigin::AsmJs)
        .unwrap();
    assert_eq!(module.num_declared_functions(), 1);
    assert_eq!(host.generator.invocations(), 0);
}

#[test]
fn export_wrappers_are_memoized_per_signature() {
    let wat = r#"(module
        (func (export "a") (result i32) i32.const 0)
        (func (export "b") (result i32) i32.const 1)
        (func (export "c") (param i64) nop)
    )"#;
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&wat::parse_str(wat).unwrap(), ModuleOrigin::Wasm)
        .unwrap();

    let wrappers = module.export_wrappers();
    assert_eq!(wrappers.len(), 3);
    // Two exports share `() -> i32` and hence one wrapper.
    assert!(Arc::ptr_eq(&wrappers[0], &wrappers[1]));
    assert!(!Arc::ptr_eq(&wrappers[0], &wrappers[2]));
    assert_eq!(host.wrappers.invocations.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[test]
fn trap_handler_mode_reaches_the_module() {
    let preferred = host(Config::default());
    let module = preferred
        .engine
        .compile_sync(&module_with_funcs(1), ModuleOrigin::Wasm)
        .unwrap();
    assert!(module.uses_trap_handler());

    let disabled = host(Config {
        trap_handler: TrapHandlerMode::Disabled,
        ..Config::default()
    });
    let module = disabled
        .engine
        .compile_sync(&module_with_funcs(1), ModuleOrigin::Wasm)
        .unwrap();
    assert!(!module.uses_trap_handler());
}

#[test]
fn bounds_check_fallback_recompiles_the_module() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&module_with_funcs(2), ModuleOrigin::Wasm)
        .unwrap();
    assert!(module.uses_trap_handler());
    assert_eq!(host.generator.invocations(), 2);

    module.recompile_with_bounds_checks().unwrap();
    assert!(!module.uses_trap_handler());
    assert!(all_code_at_tier(&module, ExecutionTier::Optimized));
    assert_eq!(host.generator.invocations(), 4);
}

#[test]
fn optimized_code_replaces_baseline_but_not_the_reverse() {
    let host = host(Config {
        tier_up: true,
        ..Config::default()
    });
    let module = host
        .engine
        .compile_sync(&module_with_funcs(2), ModuleOrigin::Wasm)
        .unwrap();

    let probe = module.clone();
    pump_until(&host.runner, || {
        all_code_at_tier(&probe, ExecutionTier::Optimized)
    });
    // Once every function is Optimized it stays Optimized; pumping more
    // foreground tasks never downgrades.
    host.runner.pump();
    assert!(all_code_at_tier(&module, ExecutionTier::Optimized));
}
