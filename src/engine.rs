// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::codegen::{CodeGenerator, CompileMetrics, NoopMetrics, WrapperGenerator};
use crate::compile::job::{AsyncCompileJob, JobHandle};
use crate::compile::streaming::{AsyncStreamingProcessor, StreamingDecoder};
use crate::compile;
use crate::config::{Config, ModuleOrigin};
use crate::module::Module;
use crate::task::{Task, TaskRunner};
use crate::{Error, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// External continuation for asynchronous compilation results.
///
/// Both methods are invoked on the foreground, exactly once per job.
pub trait CompilationResultResolver: Send + Sync {
    fn on_compilation_succeeded(&self, module: Module);
    fn on_compilation_failed(&self, error: Error);
}

/// Global context for compilation.
///
/// An engine can be safely shared across threads and is a cheap cloneable
/// handle to the actual engine. It owns the configuration, the external
/// collaborators (code generator, wrapper generator, task runner, metrics
/// sink) and the registry of in-flight asynchronous compile jobs.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

struct EngineInner {
    config: Config,
    generator: Arc<dyn CodeGenerator>,
    wrappers: Arc<dyn WrapperGenerator>,
    metrics: Arc<dyn CompileMetrics>,
    runner: Arc<dyn TaskRunner>,
    jobs: Mutex<HashMap<u64, Arc<AsyncCompileJob>>>,
    next_job_id: AtomicU64,
}

impl Engine {
    pub fn new(
        config: Config,
        generator: Arc<dyn CodeGenerator>,
        wrappers: Arc<dyn WrapperGenerator>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self::with_metrics(config, generator, wrappers, runner, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: Config,
        generator: Arc<dyn CodeGenerator>,
        wrappers: Arc<dyn WrapperGenerator>,
        runner: Arc<dyn TaskRunner>,
        metrics: Arc<dyn CompileMetrics>,
    ) -> Self {
        Self(Arc::new(EngineInner {
            config,
            generator,
            wrappers,
            metrics,
            runner,
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub(crate) fn generator(&self) -> &Arc<dyn CodeGenerator> {
        &self.0.generator
    }

    pub(crate) fn wrapper_generator(&self) -> &Arc<dyn WrapperGenerator> {
        &self.0.wrappers
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn CompileMetrics> {
        &self.0.metrics
    }

    pub(crate) fn runner(&self) -> &Arc<dyn TaskRunner> {
        &self.0.runner
    }

    /// Upper bound on concurrently running background compilation workers
    /// for one module.
    pub(crate) fn max_workers(&self) -> usize {
        1.max(
            self.0
                .config
                .num_compilation_tasks
                .min(self.0.runner.num_worker_threads()),
        )
    }

    pub(crate) fn post_foreground(&self, task: Task) {
        self.0.runner.post_foreground(task);
    }

    /// Post a background task, honoring `num_compilation_tasks = 0`: with no
    /// compilation tasks allowed, background work runs on the foreground
    /// runner instead, which makes timing deterministic.
    pub(crate) fn post_background(&self, task: Task) {
        if self.0.config.num_compilation_tasks > 0 {
            self.0.runner.post_worker(task);
        } else {
            self.0.runner.post_foreground(task);
        }
    }

    /// Synchronously compile `bytes` into a ready-to-instantiate module.
    ///
    /// Blocks the calling thread, which doubles as an extra compilation
    /// worker and as the finisher. In tiering mode the call returns once
    /// baseline compilation is done; top-tier compilation continues in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is malformed or a function fails to
    /// compile.
    pub fn compile_sync(&self, bytes: &[u8], origin: ModuleOrigin) -> Result<Module> {
        compile::compile_to_native_module(self, bytes, origin)
    }

    /// Start an asynchronous compile job for `bytes`.
    ///
    /// The job decodes and compiles on background tasks and reports through
    /// `resolver` on the foreground. The returned handle can abort the job.
    pub fn compile_async(
        &self,
        bytes: Vec<u8>,
        resolver: Arc<dyn CompilationResultResolver>,
    ) -> JobHandle {
        let job = AsyncCompileJob::new(self.clone(), Some(Arc::from(bytes)), resolver);
        self.register_job(Arc::clone(&job));
        AsyncCompileJob::start(&job);
        JobHandle::new(job)
    }

    /// Start a streaming compile job.
    ///
    /// Feed the returned decoder with [`StreamingDecoder::process_bytes`] as
    /// chunks arrive from the network, then call
    /// [`StreamingDecoder::finish`]. Results arrive through `resolver`.
    pub fn compile_streaming(&self, resolver: Arc<dyn CompilationResultResolver>) -> StreamingDecoder {
        let features = self.config().enabled_features;
        let job = AsyncCompileJob::new(self.clone(), None, resolver);
        self.register_job(Arc::clone(&job));
        StreamingDecoder::new(Box::new(AsyncStreamingProcessor::new(job)), features)
    }

    /// Number of asynchronous compile jobs currently registered.
    pub fn compile_job_count(&self) -> usize {
        self.0.jobs.lock().len()
    }

    pub(crate) fn next_job_id(&self) -> u64 {
        self.0.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_job(&self, job: Arc<AsyncCompileJob>) {
        self.0.jobs.lock().insert(job.id(), job);
    }

    /// Deregister a job. The returned strong handle keeps the job alive for
    /// the duration of the caller's cleanup.
    pub(crate) fn remove_job(&self, id: u64) -> Option<Arc<AsyncCompileJob>> {
        self.0.jobs.lock().remove(&id)
    }
}
