// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-module compilation coordinator.
//!
//! [`CompilationState`] keeps track of which functions are left to compile:
//! the pending and finished unit queues, the outstanding-unit counters, the
//! error latch, the event callbacks and the background-worker accounting.
//! The long-running worker loop ([`run_background_worker`]) and the
//! foreground finisher ([`run_finisher`]) live here too; they are spawned as
//! tasks capturing a strong module handle, so a module is only torn down
//! once every task that might touch it has finished.

use crate::code::Code;
use crate::codegen::CompilationEnv;
use crate::compile::unit::{CompilationUnit, CompileMode, ExecutionTier};
use crate::engine::Engine;
use crate::indices::FuncIndex;
use crate::module::NativeModule;
use crate::task::TaskManager;
use crate::wire_bytes::WireBytesStorage;
use crate::{Error, FINISHER_DEADLINE};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;
use wasmparser::WasmFeatures;

/// A compilation lifecycle notification.
///
/// Events fire in the order {baseline finished}? -> {top-tier finished |
/// failed}; the last two are final, nothing fires after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationEvent {
    FinishedBaselineCompilation,
    FinishedTopTierCompilation,
    FailedCompilation,
}

impl CompilationEvent {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::FinishedTopTierCompilation | Self::FailedCompilation
        )
    }
}

/// An event sink. Only ever invoked from foreground tasks, hence serialized.
/// The error argument accompanies [`CompilationEvent::FailedCompilation`].
pub type CompilationCallback = Box<dyn Fn(CompilationEvent, Option<&Error>) + Send>;

/// The first compilation error, together with the function it occurred in.
struct CompilationError {
    func_index: FuncIndex,
    error: Error,
}

/// Everything the compile-state mutex protects.
struct Guarded {
    baseline_units: Vec<Box<CompilationUnit>>,
    tiering_units: Vec<Box<CompilationUnit>>,
    baseline_finish_units: Vec<Box<CompilationUnit>>,
    tiering_finish_units: Vec<Box<CompilationUnit>>,
    finisher_is_running: bool,
    num_background_workers: usize,
    outstanding_baseline_units: usize,
    outstanding_tiering_units: usize,
    /// Optional features observed in use while compiling this module.
    detected_features: WasmFeatures,
    wire_bytes_storage: Option<Arc<dyn WireBytesStorage>>,
    /// Finished code awaiting the batched code-logging task.
    code_to_log: Vec<Arc<Code>>,
    log_task_scheduled: bool,
}

impl Guarded {
    fn baseline_compilation_finished(&self, mode: CompileMode) -> bool {
        self.outstanding_baseline_units == 0
            || (mode == CompileMode::Tiering && self.outstanding_tiering_units == 0)
    }

    /// The finished queue the finisher currently drains: baseline until
    /// baseline is fully counted down, then tiering.
    fn finish_units(&mut self, mode: CompileMode) -> &mut Vec<Box<CompilationUnit>> {
        if self.baseline_compilation_finished(mode) {
            &mut self.tiering_finish_units
        } else {
            &mut self.baseline_finish_units
        }
    }
}

/// Tracks the compilation state of one module.
pub struct CompilationState {
    engine: Engine,
    /// Used to hand strong module handles to spawned tasks. Weak, because
    /// the module owns this state.
    native_module: Weak<NativeModule>,
    compile_mode: CompileMode,
    max_workers: usize,
    /// Compilation error, set at most once. Check with relaxed cost via
    /// [`failed`](Self::failed); the full record is only inspected after the
    /// failure event.
    compile_error: OnceLock<CompilationError>,
    guarded: Mutex<Guarded>,
    /// Signalled whenever the finished queues or the counters move, so the
    /// blocking sync driver can wait instead of spinning.
    finisher_progress: Condvar,
    /// Mutated only from the foreground.
    callbacks: Mutex<SmallVec<[CompilationCallback; 2]>>,
    background: TaskManager,
    foreground: TaskManager,
}

impl CompilationState {
    pub(crate) fn new(
        engine: Engine,
        native_module: Weak<NativeModule>,
        compile_mode: CompileMode,
        max_workers: usize,
    ) -> Self {
        Self {
            engine,
            native_module,
            compile_mode,
            max_workers,
            compile_error: OnceLock::new(),
            guarded: Mutex::new(Guarded {
                baseline_units: Vec::new(),
                tiering_units: Vec::new(),
                baseline_finish_units: Vec::new(),
                tiering_finish_units: Vec::new(),
                finisher_is_running: false,
                num_background_workers: 0,
                outstanding_baseline_units: 0,
                outstanding_tiering_units: 0,
                detected_features: WasmFeatures::empty(),
                wire_bytes_storage: None,
                code_to_log: Vec::new(),
                log_task_scheduled: false,
            }),
            finisher_progress: Condvar::new(),
            callbacks: Mutex::new(SmallVec::new()),
            background: TaskManager::new(),
            foreground: TaskManager::new(),
        }
    }

    pub(crate) fn compile_mode(&self) -> CompileMode {
        self.compile_mode
    }

    /// Whether a compilation error has been latched. Cheap enough for worker
    /// loops.
    pub fn failed(&self) -> bool {
        self.compile_error.get().is_some()
    }

    /// Register an event sink. Must happen before units are added.
    pub fn add_callback(&self, callback: CompilationCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Set the number of functions expected to compile. Must be called
    /// exactly once, before the first [`add_units`](Self::add_units).
    pub(crate) fn set_total(&self, num_functions: usize) {
        debug_assert!(!self.failed());
        let mut guarded = self.guarded.lock();
        debug_assert!(guarded.baseline_units.is_empty() && guarded.tiering_units.is_empty());
        guarded.outstanding_baseline_units = num_functions;
        if self.compile_mode == CompileMode::Tiering {
            guarded.outstanding_tiering_units = num_functions;
        }
    }

    /// Append newly built units and kick off background compilation.
    pub(crate) fn add_units(
        &self,
        mut baseline_units: Vec<Box<CompilationUnit>>,
        mut tiering_units: Vec<Box<CompilationUnit>>,
    ) {
        {
            let mut guarded = self.guarded.lock();

            if self.compile_mode == CompileMode::Tiering {
                debug_assert_eq!(baseline_units.len(), tiering_units.len());
                debug_assert!(tiering_units
                    .last()
                    .map_or(true, |unit| unit.tier() == ExecutionTier::Optimized));
                guarded.tiering_units.append(&mut tiering_units);
            } else {
                debug_assert!(tiering_units.is_empty());
            }

            guarded.baseline_units.append(&mut baseline_units);
        }

        self.restart_workers(usize::MAX);
    }

    /// Pop the next unit to compile: baseline first until none are left,
    /// then tiering.
    pub(crate) fn next_unit(&self) -> Option<Box<CompilationUnit>> {
        let mut guarded = self.guarded.lock();
        if guarded.baseline_units.is_empty() {
            guarded.tiering_units.pop()
        } else {
            guarded.baseline_units.pop()
        }
    }

    /// Pop the next unit awaiting finalization, from the currently active
    /// finished queue.
    pub(crate) fn next_finished(&self) -> Option<Box<CompilationUnit>> {
        let mut guarded = self.guarded.lock();
        guarded.finish_units(self.compile_mode).pop()
    }

    pub(crate) fn has_unit_to_finish(&self) -> bool {
        let mut guarded = self.guarded.lock();
        !guarded.finish_units(self.compile_mode).is_empty()
    }

    /// Hand an executed unit to the finisher, starting one if none runs.
    pub(crate) fn schedule_for_finishing(&self, unit: Box<CompilationUnit>, tier: ExecutionTier) {
        let start_finisher = {
            let mut guarded = self.guarded.lock();
            if self.compile_mode == CompileMode::Tiering && tier == ExecutionTier::Optimized {
                guarded.tiering_finish_units.push(unit);
            } else {
                guarded.baseline_finish_units.push(unit);
            }
            self.finisher_progress.notify_all();

            // Setting the flag under the lock guarantees at most one
            // finisher is ever started.
            if !guarded.finisher_is_running && !self.failed() {
                guarded.finisher_is_running = true;
                true
            } else {
                false
            }
        };
        if start_finisher {
            self.schedule_finisher_task();
        }
    }

    /// Count down one finalized unit and fire whatever events the countdown
    /// completed.
    pub(crate) fn on_finished_unit(&self) {
        let mut events = SmallVec::<[CompilationEvent; 2]>::new();
        {
            let mut guarded = self.guarded.lock();
            let is_tiering_mode = self.compile_mode == CompileMode::Tiering;
            // Outside of tiering mode every unit counts as a baseline unit.
            let is_tiering_unit = is_tiering_mode && guarded.outstanding_baseline_units == 0;
            debug_assert!(is_tiering_mode || guarded.outstanding_tiering_units == 0);

            if is_tiering_unit {
                debug_assert!(guarded.outstanding_tiering_units > 0);
                guarded.outstanding_tiering_units -= 1;
                if guarded.outstanding_tiering_units == 0 {
                    // Baseline units are always finished before tiering
                    // units.
                    debug_assert_eq!(guarded.outstanding_baseline_units, 0);
                    events.push(CompilationEvent::FinishedTopTierCompilation);
                }
            } else {
                debug_assert!(guarded.outstanding_baseline_units > 0);
                guarded.outstanding_baseline_units -= 1;
                if guarded.outstanding_baseline_units == 0 {
                    events.push(CompilationEvent::FinishedBaselineCompilation);
                    if !is_tiering_mode {
                        events.push(CompilationEvent::FinishedTopTierCompilation);
                    }
                }
            }
            self.finisher_progress.notify_all();
        }
        for event in events {
            self.notify_on_event(event, None);
        }
    }

    /// Latch a compilation error. Only the first call takes effect and posts
    /// the foreground task that fires [`CompilationEvent::FailedCompilation`];
    /// later calls are ignored.
    pub(crate) fn set_error(&self, func_index: FuncIndex, error: Error) {
        let latched = self
            .compile_error
            .set(CompilationError { func_index, error })
            .is_ok();
        if !latched {
            return;
        }
        tracing::debug!(
            target: "riptide::compile",
            func = func_index.as_u32(),
            "compilation failed"
        );
        {
            // Wake a sync driver blocked on finisher progress.
            let _guarded = self.guarded.lock();
            self.finisher_progress.notify_all();
        }
        if let Some(native_module) = self.native_module.upgrade() {
            let task = self.foreground.register(move || {
                let state = native_module.compilation_state();
                let error = state.get_compile_error();
                state.notify_on_event(CompilationEvent::FailedCompilation, Some(&error));
            });
            self.engine.post_foreground(task);
        }
    }

    /// The latched error, formatted for the embedder.
    ///
    /// # Panics
    ///
    /// Panics if no error has been latched.
    pub fn get_compile_error(&self) -> Error {
        let latched = self
            .compile_error
            .get()
            .expect("no compilation error latched");
        if latched.error == Error::Aborted {
            return Error::Aborted;
        }
        let name = self.native_module.upgrade().and_then(|native_module| {
            native_module
                .module()
                .lookup_function_name(latched.func_index)
                .map(str::to_string)
        });
        Error::Compile {
            func_index: latched.func_index.as_u32(),
            name,
            offset: latched.error.offset(),
            message: latched.error.message(),
        }
    }

    /// Queue `code` for the batched foreground code-logging task. At most
    /// one logging task is scheduled at a time.
    pub(crate) fn schedule_code_logging(&self, code: Arc<Code>) {
        if !self.engine.config().log_code {
            return;
        }
        let schedule = {
            let mut guarded = self.guarded.lock();
            guarded.code_to_log.push(code);
            !core::mem::replace(&mut guarded.log_task_scheduled, true)
        };
        if !schedule {
            return;
        }
        if let Some(native_module) = self.native_module.upgrade() {
            let task = self.foreground.register(move || {
                let state = native_module.compilation_state();
                let batch = {
                    let mut guarded = state.guarded.lock();
                    guarded.log_task_scheduled = false;
                    core::mem::take(&mut guarded.code_to_log)
                };
                for code in batch {
                    tracing::debug!(
                        target: "riptide::compile",
                        func = code.func_index().as_u32(),
                        tier = ?code.tier(),
                        size = code.body().len(),
                        "generated code"
                    );
                }
            });
            self.engine.post_foreground(task);
        }
    }

    /// Record a worker exit, folding its locally detected features in.
    pub(crate) fn on_worker_stopped(&self, detected: WasmFeatures) {
        let mut guarded = self.guarded.lock();
        debug_assert!(guarded.num_background_workers >= 1);
        guarded.num_background_workers -= 1;
        guarded.detected_features |= detected;
    }

    /// Union `detected` into the feature set and report the total to the
    /// host. Reporting happens under the lock because tiering compilations
    /// may still be detecting features in the background.
    pub(crate) fn publish_features(&self, detected: WasmFeatures) {
        let guarded = {
            let mut guarded = self.guarded.lock();
            guarded.detected_features |= detected;
            guarded.detected_features
        };
        self.engine.metrics().features_used(guarded);
    }

    /// Spawn up to `max` background workers, bounded by the number of
    /// pending units and the per-module worker budget.
    pub(crate) fn restart_workers(&self, max: usize) {
        let Some(native_module) = self.native_module.upgrade() else {
            return;
        };
        let num_spawn = {
            let mut guarded = self.guarded.lock();
            if self.failed() {
                return;
            }
            debug_assert!(guarded.num_background_workers <= self.max_workers);
            let pending = guarded.baseline_units.len() + guarded.tiering_units.len();
            let stopped = self.max_workers - guarded.num_background_workers;
            let num_spawn = max.min(pending).min(stopped);
            guarded.num_background_workers += num_spawn;
            num_spawn
        };

        for _ in 0..num_spawn {
            let native_module = Arc::clone(&native_module);
            let task = self
                .background
                .register(move || run_background_worker(native_module));
            self.engine.post_background(task);
        }
    }

    /// Compare-and-set the finisher flag; returns whether it changed.
    pub(crate) fn set_finisher_is_running(&self, value: bool) -> bool {
        let mut guarded = self.guarded.lock();
        if guarded.finisher_is_running == value {
            return false;
        }
        guarded.finisher_is_running = value;
        true
    }

    pub(crate) fn schedule_finisher_task(&self) {
        if let Some(native_module) = self.native_module.upgrade() {
            let task = self.foreground.register(move || run_finisher(native_module));
            self.engine.post_foreground(task);
        }
    }

    /// Cancel the background workers and wait for them, leaving the
    /// callbacks in place so a latched error still reaches its audience.
    pub(crate) fn cancel_background_and_wait(&self) {
        self.background.cancel_and_wait();
    }

    /// Latch a generic error, cancel all background work and wait for it,
    /// and release the callbacks on the foreground. No event reaches anyone
    /// after this; the caller owns the rejection. Idempotent.
    pub(crate) fn abort(&self) {
        self.set_error(FuncIndex::from_u32(0), Error::Aborted);
        self.background.cancel_and_wait();
        // Callbacks may close over embedder resources that must only be
        // released on the foreground.
        let callbacks = core::mem::take(&mut *self.callbacks.lock());
        if !callbacks.is_empty() {
            self.engine.post_foreground(Box::new(move || drop(callbacks)));
        }
    }

    /// Block until every background and foreground task of this state has
    /// completed or been cancelled. Idempotent.
    pub fn cancel_and_wait(&self) {
        self.background.cancel_and_wait();
        self.foreground.cancel_and_wait();
    }

    pub fn set_wire_bytes_storage(&self, storage: Arc<dyn WireBytesStorage>) {
        self.guarded.lock().wire_bytes_storage = Some(storage);
    }

    pub(crate) fn wire_bytes_storage(&self) -> Option<Arc<dyn WireBytesStorage>> {
        self.guarded.lock().wire_bytes_storage.clone()
    }

    pub(crate) fn baseline_compilation_finished(&self) -> bool {
        self.guarded
            .lock()
            .baseline_compilation_finished(self.compile_mode)
    }

    pub(crate) fn has_outstanding_units(&self) -> bool {
        let guarded = self.guarded.lock();
        guarded.outstanding_baseline_units > 0 || guarded.outstanding_tiering_units > 0
    }

    /// Block the calling thread until the finished queues or the counters
    /// move, or compilation fails. Used by the blocking sync driver.
    pub(crate) fn wait_for_finisher_progress(&self) {
        let mut guarded = self.guarded.lock();
        if self.failed()
            || guarded.baseline_compilation_finished(self.compile_mode)
            || !guarded.finish_units(self.compile_mode).is_empty()
        {
            return;
        }
        self.finisher_progress.wait(&mut guarded);
    }

    /// Invoke all registered callbacks. Once a final event fired, the
    /// callbacks are dropped; no further events reach anyone.
    fn notify_on_event(&self, event: CompilationEvent, error: Option<&Error>) {
        let mut callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback(event, error);
        }
        if event.is_final() {
            callbacks.clear();
        }
    }
}

/// One fetch-compile-schedule round, run by background workers and by the
/// sync driver's calling thread alike. Returns `false` when no unit was
/// available.
pub(crate) fn fetch_and_execute_unit(
    engine: &Engine,
    state: &CompilationState,
    env: &CompilationEnv,
    detected: &mut WasmFeatures,
) -> bool {
    let Some(mut unit) = state.next_unit() else {
        return false;
    };
    // Capture the tier before compilation; it decides the finished queue.
    let tier = unit.tier();
    let storage = state
        .wire_bytes_storage()
        .expect("units published before the wire-bytes storage was installed");
    unit.execute(engine, env, &storage, detected);
    match unit.result() {
        Some(Ok(code)) => state.schedule_code_logging(Arc::clone(code)),
        Some(Err(error)) => state.set_error(unit.func_index(), error.clone()),
        None => unreachable!("unit executed without a result"),
    }
    state.schedule_for_finishing(unit, tier);
    true
}

/// Body of one background compilation task: pull units until the queues run
/// dry or compilation fails.
pub(crate) fn run_background_worker(native_module: Arc<NativeModule>) {
    tracing::trace!(target: "riptide::compile", "(3b) compiling");
    let engine = native_module.engine();
    let state = native_module.compilation_state();
    let env = native_module.compilation_env();
    let mut detected = WasmFeatures::empty();
    while !state.failed() {
        if !fetch_and_execute_unit(engine, state, &env, &mut detected) {
            break;
        }
    }
    state.on_worker_stopped(detected);
}

/// Body of the foreground finisher task: drain executed units, install their
/// code and fire events, yielding back to the event loop when the deadline
/// passes.
pub(crate) fn run_finisher(native_module: Arc<NativeModule>) {
    tracing::trace!(target: "riptide::compile", "(4a) finishing compilation units");
    let state = native_module.compilation_state();
    if state.failed() {
        state.set_finisher_is_running(false);
        return;
    }

    let deadline = Instant::now() + FINISHER_DEADLINE;
    loop {
        state.restart_workers(usize::MAX);

        let Some(mut unit) = state.next_finished() else {
            // A background task may have scheduled a unit for finishing
            // after the queue was drained but while the flag was still set,
            // in which case no new finisher was posted. Re-check before
            // exiting.
            state.set_finisher_is_running(false);
            if state.has_unit_to_finish() && state.set_finisher_is_running(true) {
                continue;
            }
            break;
        };

        if state.failed() {
            break;
        }

        if let Some(Ok(code)) = unit.take_result() {
            native_module.install_code(code);
        }
        state.on_finished_unit();

        if Instant::now() > deadline {
            // Yield to the host event loop. The flag stays set; the
            // continuation task owns it now.
            state.schedule_finisher_task();
            return;
        }
    }
}
