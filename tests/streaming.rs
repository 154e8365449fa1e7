// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use common::*;
use riptide::{Config, Error, ExecutionTier, FuncIndex};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn streaming_single_function_split_across_two_chunks() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    // Split mid-way through the function body so the second chunk completes
    // it.
    let bytes = module_with_funcs(1);
    let split = bytes.len() - 3;
    stream.process_bytes(&bytes[..split]);
    stream.process_bytes(&bytes[split..]);
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert_eq!(module.num_declared_functions(), 1);
    assert!(module.code(FuncIndex::from_u32(0)).is_some());
    // Regular mode: exactly one unit was compiled.
    assert_eq!(host.generator.invocations(), 1);
    pump_until(&host.runner, || host.engine.compile_job_count() == 0);
}

#[test]
fn streaming_commits_units_at_chunk_boundaries() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    // Deliver everything up to (and including) the first of two function
    // bodies; workers must start on it before the stream is done.
    let bytes = module_with_funcs(2);
    let split = bytes.len() - 5;
    stream.process_bytes(&bytes[..split]);
    wait_until(|| host.generator.invocations() >= 1);

    stream.process_bytes(&bytes[split..]);
    stream.finish();
    pump_until(&host.runner, || resolver.is_resolved());
    assert!(resolver.module().is_some());
    assert_eq!(host.generator.invocations(), 2);
}

#[test]
fn streaming_byte_by_byte_still_compiles() {
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    for byte in module_with_funcs(2) {
        stream.process_bytes(&[byte]);
    }
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert_eq!(module.num_declared_functions(), 2);
}

#[test]
fn streaming_tiering_upgrades_in_the_background() {
    let host = host(Config {
        tier_up: true,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(&module_with_funcs(2));
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    let probe = module.clone();
    pump_until(&host.runner, || {
        all_code_at_tier(&probe, ExecutionTier::Optimized)
    });
    // The top-tier event retires the job.
    pump_until(&host.runner, || host.engine.compile_job_count() == 0);
}

#[test]
fn streaming_module_without_code_section() {
    let host = host(Config::default());
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(&module_with_funcs(0));
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert_eq!(module.num_functions(), 0);
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn streaming_reprocesses_sections_after_the_code_section() {
    // The data section follows the code section, forcing the unit builder to
    // be committed and discarded before section decoding resumes.
    let wat = r#"(module
        (memory 1)
        (func (export "f") (result i32) i32.const 1)
        (data (i32.const 0) "hello")
    )"#;
    let host = host(Config {
        tier_up: false,
        ..Config::default()
    });
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(&wat::parse_str(wat).unwrap());
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let module = resolver.module().expect("compilation should succeed");
    assert!(module.code(FuncIndex::from_u32(0)).is_some());
}

#[test]
fn streaming_decode_error_rejects() {
    let host = host(Config::default());
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(b"\0asm\x02\0\0\0");
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    assert!(matches!(
        resolver.error(),
        Some(Error::InvalidWebAssembly { .. })
    ));
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn streaming_compile_error_rejects_with_formatted_error() {
    let host = host_with(
        Config {
            tier_up: false,
            ..Config::default()
        },
        TestGenerator {
            fail_on: Some(0),
            ..TestGenerator::default()
        },
    );
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(&module_with_funcs(1));
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    let error = resolver.error().expect("compilation should fail");
    assert_eq!(
        error.to_string(),
        "Compiling wasm function \"f0\" failed: unsupported opcode"
    );
    assert_eq!(host.engine.compile_job_count(), 0);
}

#[test]
fn streaming_abort_tears_the_job_down() {
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
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(&module_with_funcs(50));
    stream.abort();

    // Compilation had started, so the rejection flows through the failure
    // event once the foreground turns.
    pump_until(&host.runner, || resolver.is_resolved());
    assert_eq!(resolver.error(), Some(Error::Aborted));
    assert_eq!(host.engine.compile_job_count(), 0);
    // Whatever tasks are still queued are no-ops now.
    host.runner.pump();
    assert_eq!(resolver.error(), Some(Error::Aborted));
}

#[test]
fn streaming_ignores_bytes_after_an_error() {
    let host = host(Config::default());
    let resolver = Arc::new(TestResolver::default());
    let mut stream = host.engine.compile_streaming(Arc::clone(&resolver) as _);

    stream.process_bytes(b"junk");
    stream.process_bytes(&module_with_funcs(1));
    stream.finish();

    pump_until(&host.runner, || resolver.is_resolved());
    assert!(resolver.error().is_some());
}
