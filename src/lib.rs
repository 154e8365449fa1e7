// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Riptide - a parallel WebAssembly module compilation pipeline
//!
//! This crate turns a WebAssembly binary into a native-code module ready for
//! execution. It supports three ingestion modes - synchronous bulk
//! compilation, asynchronous bulk compilation and byte-by-byte streaming
//! compilation - and three compilation policies - eager single-tier, eager
//! two-tier ("tiering") and lazy per-function.
//!
//! The pipeline itself is host-agnostic: the function-level code generator,
//! the JS<->Wasm call-adapter generator and the task runners that provide the
//! foreground event loop and the worker-thread pool are external
//! collaborators supplied through traits at [`Engine`] construction.

mod code;
mod codegen;
mod compile;
mod config;
mod engine;
mod errors;
mod indices;
mod module;
mod task;
#[cfg(test)]
pub(crate) mod test_support;
pub mod translate;
mod wire_bytes;

pub use code::{Code, WrapperCode};
pub use codegen::{CodeGenerator, CompilationEnv, CompileMetrics, NoopMetrics, WrapperGenerator};
pub use compile::job::JobHandle;
pub use compile::state::{CompilationCallback, CompilationEvent, CompilationState};
pub use compile::streaming::StreamingDecoder;
pub use compile::unit::{CompileMode, ExecutionTier};
pub use compile::compile_lazy;
pub use config::{Config, ModuleOrigin, TrapHandlerMode};
pub use engine::{CompilationResultResolver, Engine};
pub use errors::Error;
pub use indices::{DefinedFuncIndex, FuncIndex, TypeIndex};
pub use module::Module;
pub use task::{PumpRunner, Task, TaskManager, TaskRunner};
pub use wire_bytes::{OwnedWireBytes, StreamingWireBytes, WireBytesStorage};

/// Result type for the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// How long a finisher task may occupy the foreground before it yields by
/// re-posting itself.
pub(crate) const FINISHER_DEADLINE: core::time::Duration = core::time::Duration::from_millis(1);
