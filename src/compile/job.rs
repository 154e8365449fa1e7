// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The asynchronous compile job: a sequenced step machine.
//!
//! Each step runs either on the foreground or on the background and
//! schedules its successor. Foreground steps are serialized through the
//! host's foreground runner; at most one step task is pending at a time, and
//! a pending task carries a validity token so cancelling it turns the queued
//! task into a no-op without reaching into the queue.

use crate::compile::state::CompilationEvent;
use crate::compile::unit::CompileMode;
use crate::compile::{compile_js_to_wasm_wrappers, initialize_compilation_units};
use crate::engine::{CompilationResultResolver, Engine};
use crate::indices::FuncIndex;
use crate::module::{Module, NativeModule};
use crate::task::TaskManager;
use crate::translate::{ModuleTranslator, TranslatedModule};
use crate::wire_bytes::OwnedWireBytes;
use crate::{Error, ModuleOrigin};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use wasmparser::WasmFeatures;

/// One step of the job, with the data it needs to run. Exactly one of the
/// foreground/background entry points applies per variant; transitions
/// construct the next variant.
pub(crate) enum CompileStep {
    /// Step 1 (background): decode the wire bytes.
    DecodeModule,
    /// Step 1b (foreground): decoding failed, reject.
    DecodeFail(Error),
    /// Step 2 (foreground): create the native module, register the event
    /// callback and, unless the units come from a stream, publish them all.
    PrepareAndStartCompile {
        module: Arc<TranslatedModule>,
        start_compilation: bool,
    },
    /// Step 4b (foreground): compilation failed, reject.
    CompileFailed(Error),
    /// Step 5 (foreground): compile the JS->Wasm adapters for exports.
    CompileWrappers,
    /// Step 6 (foreground): resolve with the module object.
    FinishModule,
}

struct JobInner {
    step: Option<CompileStep>,
    /// Validity token of the queued foreground step task, if one is
    /// pending. Clearing the token cancels the task.
    pending_foreground: Option<Arc<AtomicBool>>,
    /// The complete wire bytes. Present from the start for bulk jobs,
    /// installed at stream end for streaming jobs.
    wire_bytes: Option<Arc<[u8]>>,
    module: Option<Module>,
    aborted: bool,
}

/// An asynchronous compile job, owned by the engine's job registry until a
/// terminal step removes it.
pub(crate) struct AsyncCompileJob {
    engine: Engine,
    id: u64,
    resolver: Arc<dyn CompilationResultResolver>,
    /// Manages the job's own background tasks (decoding); the compile-state
    /// manages compilation workers separately.
    background: TaskManager,
    /// How many independent producers must report completion before the
    /// module can finish. Streaming sets this to 2: the byte stream and the
    /// baseline compilation can finish in either order.
    outstanding_finishers: AtomicU32,
    /// The resolver must hear exactly one verdict.
    resolved: AtomicBool,
    inner: Mutex<JobInner>,
}

impl AsyncCompileJob {
    pub(crate) fn new(
        engine: Engine,
        wire_bytes: Option<Arc<[u8]>>,
        resolver: Arc<dyn CompilationResultResolver>,
    ) -> Arc<Self> {
        let id = engine.next_job_id();
        Arc::new(Self {
            engine,
            id,
            resolver,
            background: TaskManager::new(),
            outstanding_finishers: AtomicU32::new(1),
            resolved: AtomicBool::new(false),
            inner: Mutex::new(JobInner {
                step: None,
                pending_foreground: None,
                wire_bytes,
                module: None,
                aborted: false,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn module(&self) -> Option<Module> {
        self.inner.lock().module.clone()
    }

    /// The manager for the job's own background tasks.
    pub(crate) fn background_manager(&self) -> &TaskManager {
        &self.background
    }

    pub(crate) fn start(job: &Arc<Self>) {
        Self::do_background(job, CompileStep::DecodeModule);
    }

    /// Transition to `step` and schedule it on the foreground.
    pub(crate) fn do_sync(job: &Arc<Self>, step: CompileStep) {
        Self::transition_sync(job, step, false);
    }

    /// Like [`do_sync`](Self::do_sync), but reuse an already-pending
    /// foreground task instead of posting another one.
    pub(crate) fn do_sync_use_existing(job: &Arc<Self>, step: CompileStep) {
        Self::transition_sync(job, step, true);
    }

    fn transition_sync(job: &Arc<Self>, step: CompileStep, use_existing_task: bool) {
        let mut inner = job.inner.lock();
        inner.step = Some(step);
        if use_existing_task && inner.pending_foreground.is_some() {
            return;
        }
        debug_assert!(inner.pending_foreground.is_none());
        let token = Arc::new(AtomicBool::new(true));
        inner.pending_foreground = Some(Arc::clone(&token));
        drop(inner);

        let job = Arc::clone(job);
        job.engine.clone().post_foreground(Box::new(move || {
            if !token.load(Ordering::Acquire) {
                return;
            }
            Self::run_step(&job, true, Some(&token));
        }));
    }

    /// Transition to `step` and run it right here, without a task round
    /// trip. The caller must be on the foreground.
    pub(crate) fn do_immediately(job: &Arc<Self>, step: CompileStep) {
        {
            let mut inner = job.inner.lock();
            debug_assert!(inner.pending_foreground.is_none());
            inner.step = Some(step);
        }
        Self::run_step(job, true, None);
    }

    /// Transition to `step` and schedule it on the worker pool.
    pub(crate) fn do_background(job: &Arc<Self>, step: CompileStep) {
        job.inner.lock().step = Some(step);
        let cloned = Arc::clone(job);
        let task = job
            .background
            .register(move || Self::run_step(&cloned, false, None));
        job.engine.post_background(task);
    }

    fn run_step(job: &Arc<Self>, on_foreground: bool, token: Option<&Arc<AtomicBool>>) {
        let step = {
            let mut inner = job.inner.lock();
            if let (Some(token), Some(pending)) = (token, &inner.pending_foreground) {
                if Arc::ptr_eq(token, pending) {
                    inner.pending_foreground = None;
                }
            }
            inner.step.take()
        };
        if let Some(step) = step {
            step.run(job, on_foreground);
        }
    }

    fn cancel_pending_foreground_task(&self) {
        if let Some(token) = self.inner.lock().pending_foreground.take() {
            token.store(false, Ordering::Release);
        }
    }

    pub(crate) fn set_outstanding_finishers(&self, count: u32) {
        self.outstanding_finishers.store(count, Ordering::Release);
    }

    /// Count one producer as done; returns whether that was the last one.
    pub(crate) fn decrement_and_check_finisher_count(&self) -> bool {
        self.outstanding_finishers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Create the native module for `module` and remember it on the job.
    pub(crate) fn prepare_runtime_objects(
        job: &Arc<Self>,
        module: Arc<TranslatedModule>,
    ) -> Module {
        let native_module = NativeModule::new(&job.engine, module);
        let module = Module::from_native(native_module);
        job.inner.lock().module = Some(module.clone());
        module
    }

    /// Compilation (or decoding, for function-less modules) is done: report
    /// feature usage and head for the finishing steps.
    pub(crate) fn finish_compile(job: &Arc<Self>, compile_wrappers: bool) {
        let module = job.module().expect("no module prepared");
        module
            .compilation_state()
            .publish_features(WasmFeatures::empty());
        if compile_wrappers {
            Self::do_sync(job, CompileStep::CompileWrappers);
        } else {
            Self::do_sync(job, CompileStep::FinishModule);
        }
    }

    fn resolve_succeeded(job: &Arc<Self>, module: Module) {
        if !job.resolved.swap(true, Ordering::AcqRel) {
            job.resolver.on_compilation_succeeded(module);
        }
    }

    /// Deregister the job and reject. The strong handle returned by the
    /// registry keeps the job alive until the resolver returns.
    fn resolve_failed(job: &Arc<Self>, error: Error) {
        let _keep_alive = job.engine.remove_job(job.id);
        if !job.resolved.swap(true, Ordering::AcqRel) {
            job.resolver.on_compilation_failed(error);
        }
    }

    /// Abort the job. Background work is joined before this returns.
    ///
    /// Once a native module exists the abort error is latched through the
    /// compile-state's error latch, and the resulting
    /// [`CompilationEvent::FailedCompilation`] rejects the resolver and
    /// retires the job on a subsequent foreground turn. The pending step
    /// task stays valid, so a job that was about to deliver its verdict
    /// still delivers exactly one. Before the native module exists nothing
    /// can ever fire an event; the resolver is rejected directly.
    /// Idempotent; called on the foreground.
    pub(crate) fn abort(job: &Arc<Self>) {
        let module = {
            let mut inner = job.inner.lock();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.module.clone()
        };

        if let Some(module) = module {
            let state = module.compilation_state();
            state.set_error(FuncIndex::from_u32(0), Error::Aborted);
            state.cancel_background_and_wait();
            job.background.cancel_and_wait();
            return;
        }

        // Join the decode task first; once it is gone it can no longer
        // re-arm the pending step task this cancels.
        job.background.cancel_and_wait();
        job.cancel_pending_foreground_task();
        let _keep_alive = job.engine.remove_job(job.id);
        if !job.resolved.swap(true, Ordering::AcqRel) {
            job.resolver.on_compilation_failed(Error::Aborted);
        }
    }

    /// The compilation-state callback, invoked from foreground tasks.
    fn on_compilation_event(job: &Arc<Self>, event: CompilationEvent, error: Option<&Error>) {
        match event {
            CompilationEvent::FinishedBaselineCompilation => {
                if job.decrement_and_check_finisher_count() {
                    Self::finish_compile(job, true);
                }
            }
            CompilationEvent::FinishedTopTierCompilation => {
                // If a foreground task or a stream finisher is still
                // pending, FinishModule removes the job instead.
                let pending = job.inner.lock().pending_foreground.is_some();
                if !pending && job.outstanding_finishers.load(Ordering::Acquire) == 0 {
                    job.engine.remove_job(job.id);
                }
            }
            CompilationEvent::FailedCompilation => {
                // Tier-up cannot fail if baseline compilation did not.
                let error = error.cloned().unwrap_or(Error::Aborted);
                Self::do_sync_use_existing(job, CompileStep::CompileFailed(error));
            }
        }
    }
}

impl CompileStep {
    pub(crate) fn run(self, job: &Arc<AsyncCompileJob>, on_foreground: bool) {
        match self {
            Self::DecodeModule => {
                debug_assert!(!on_foreground);
                decode_module(job);
            }
            Self::DecodeFail(error) => {
                debug_assert!(on_foreground);
                tracing::debug!(target: "riptide::compile", "(1b) decoding failed");
                AsyncCompileJob::resolve_failed(job, error);
            }
            Self::PrepareAndStartCompile {
                module,
                start_compilation,
            } => {
                debug_assert!(on_foreground);
                prepare_and_start_compile(job, module, start_compilation);
            }
            Self::CompileFailed(error) => {
                debug_assert!(on_foreground);
                tracing::debug!(target: "riptide::compile", "(4b) compilation failed");
                AsyncCompileJob::resolve_failed(job, error);
            }
            Self::CompileWrappers => {
                debug_assert!(on_foreground);
                let module = job.module().expect("no module prepared");
                compile_js_to_wasm_wrappers(job.engine(), module.native());
                AsyncCompileJob::do_sync(job, Self::FinishModule);
            }
            Self::FinishModule => {
                debug_assert!(on_foreground);
                finish_module(job);
            }
        }
    }
}

fn decode_module(job: &Arc<AsyncCompileJob>) {
    tracing::debug!(target: "riptide::compile", "(1) decoding module");
    let bytes = job
        .inner
        .lock()
        .wire_bytes
        .clone()
        .expect("async job started without wire bytes");
    let features = job.engine().config().enabled_features;
    match ModuleTranslator::new(features, ModuleOrigin::Wasm).translate(&bytes) {
        Ok(module) => AsyncCompileJob::do_sync(
            job,
            CompileStep::PrepareAndStartCompile {
                module: Arc::new(module),
                start_compilation: true,
            },
        ),
        Err(error) => AsyncCompileJob::do_sync(job, CompileStep::DecodeFail(error)),
    }
}

fn prepare_and_start_compile(
    job: &Arc<AsyncCompileJob>,
    module: Arc<TranslatedModule>,
    start_compilation: bool,
) {
    tracing::debug!(target: "riptide::compile", "(2) prepare and start compile");

    // Make sure no straggler decode task is still running.
    job.background.cancel_and_wait();

    let num_functions = module.num_declared_functions();
    let module_handle = AsyncCompileJob::prepare_runtime_objects(job, module);
    let native_module = module_handle.native();

    // For bulk compilation the bytes are known up front; streaming installs
    // its own storage right after this step.
    let bytes = job.inner.lock().wire_bytes.clone();
    if let Some(bytes) = bytes {
        native_module.set_wire_bytes(Arc::clone(&bytes));
        native_module
            .compilation_state()
            .set_wire_bytes_storage(Arc::new(OwnedWireBytes::new(bytes)));
    }

    if num_functions == 0 {
        // Degenerate case of a module without functions.
        AsyncCompileJob::finish_compile(job, true);
        return;
    }

    let state = native_module.compilation_state();
    let callback_job = Arc::clone(job);
    state.add_callback(Box::new(move |event, error| {
        AsyncCompileJob::on_compilation_event(&callback_job, event, error);
    }));

    if start_compilation {
        state.set_total(num_functions as usize);
        initialize_compilation_units(native_module);
    }
}

fn finish_module(job: &Arc<AsyncCompileJob>) {
    tracing::debug!(target: "riptide::compile", "(6) finish module");
    let module = job.module().expect("no module prepared");
    AsyncCompileJob::resolve_succeeded(job, module.clone());

    let state = module.compilation_state();
    if state.compile_mode() == CompileMode::Regular || module.num_declared_functions() == 0 {
        // Without tier-up the job is done here.
        job.engine().remove_job(job.id());
        return;
    }
    if !state.has_outstanding_units() {
        job.engine().remove_job(job.id());
    }
}

/// Handle to an in-flight asynchronous compile job, usable for aborting it.
pub struct JobHandle {
    job: Arc<AsyncCompileJob>,
}

impl JobHandle {
    pub(crate) fn new(job: Arc<AsyncCompileJob>) -> Self {
        Self { job }
    }

    /// Abort the job. Background tasks are cancelled and joined before this
    /// returns. If compilation was already under way, the rejection with
    /// [`Error::Aborted`] reaches the resolver through the failure event on
    /// a subsequent foreground turn; before that point the resolver is
    /// rejected directly. A job that already delivered its verdict keeps
    /// it. Idempotent. Must be called from the foreground.
    pub fn abort(&self) {
        AsyncCompileJob::abort(&self.job);
    }
}
