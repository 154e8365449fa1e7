// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Streaming compilation.
//!
//! [`StreamingDecoder`] splits arriving network chunks into module sections
//! and function bodies and pushes them into a [`StreamingProcessor`]. The
//! production processor, [`AsyncStreamingProcessor`], decodes incrementally
//! and starts compiling function bodies while later bytes are still on the
//! wire: compilation begins at the code-section header, and buffered units
//! are committed at every chunk boundary so workers saturate as early as
//! possible.

use crate::compile::job::{AsyncCompileJob, CompileStep};
use crate::compile::unit::CompilationUnitBuilder;
use crate::translate::{ModuleTranslator, SectionCode};
use crate::wire_bytes::{StreamingWireBytes, WireBytesStorage};
use crate::{Error, FuncIndex};
use std::sync::Arc;
use wasmparser::{Chunk, Parser, Payload, WasmFeatures};

/// Consumer side of the streaming decoder.
///
/// Methods that return `bool` signal whether the stream should keep going;
/// `false` stops all further processing.
pub(crate) trait StreamingProcessor: Send {
    fn process_module_header(&mut self, bytes: &[u8], offset: u32) -> bool;
    fn process_section(&mut self, code: SectionCode<'_>, bytes: &[u8], offset: u32) -> bool;
    fn process_code_section_header(
        &mut self,
        count: u32,
        offset: u32,
        wire_bytes_storage: Arc<dyn WireBytesStorage>,
    ) -> bool;
    fn process_function_body(&mut self, bytes: &[u8], offset: u32) -> bool;
    /// Called at the end of every received chunk.
    fn on_finished_chunk(&mut self);
    /// Called once the whole stream arrived and parsed cleanly.
    fn on_finished_stream(&mut self, bytes: Arc<[u8]>);
    fn on_error(&mut self, error: Error);
    fn on_abort(&mut self);
}

/// A section or function body cut out of the stream, detached from the
/// receive buffer so the processor runs without holding its lock.
enum PendingPayload {
    Header {
        bytes: Vec<u8>,
        offset: u32,
    },
    Section {
        kind: SectionKind,
        bytes: Vec<u8>,
        offset: u32,
    },
    CodeStart {
        count: u32,
        offset: u32,
    },
    Body {
        bytes: Vec<u8>,
        offset: u32,
    },
    End(usize),
    Skip,
}

enum SectionKind {
    Type,
    Import,
    Function,
    Table,
    Memory,
    Global,
    Export,
    Start,
    Element,
    DataCount,
    Data,
    Tag,
    Custom(String),
}

impl SectionKind {
    fn as_code(&self) -> SectionCode<'_> {
        match self {
            Self::Type => SectionCode::Type,
            Self::Import => SectionCode::Import,
            Self::Function => SectionCode::Function,
            Self::Table => SectionCode::Table,
            Self::Memory => SectionCode::Memory,
            Self::Global => SectionCode::Global,
            Self::Export => SectionCode::Export,
            Self::Start => SectionCode::Start,
            Self::Element => SectionCode::Element,
            Self::DataCount => SectionCode::DataCount,
            Self::Data => SectionCode::Data,
            Self::Tag => SectionCode::Tag,
            Self::Custom(name) => SectionCode::Custom { name },
        }
    }
}

/// Push interface for streaming compilation.
///
/// Feed chunks with [`process_bytes`](Self::process_bytes) as they arrive,
/// then call [`finish`](Self::finish) (or [`abort`](Self::abort)). Results
/// are delivered through the resolver of the owning compile job.
pub struct StreamingDecoder {
    processor: Box<dyn StreamingProcessor>,
    /// All received bytes; doubles as the wire-bytes storage workers read
    /// function bodies from.
    storage: Arc<StreamingWireBytes>,
    parser: Parser,
    /// Bytes already consumed by the parser.
    consumed: usize,
    /// Cleared on the first error; everything after is ignored.
    ok: bool,
    end_offset: Option<usize>,
}

impl StreamingDecoder {
    pub(crate) fn new(processor: Box<dyn StreamingProcessor>, features: WasmFeatures) -> Self {
        let mut parser = Parser::default();
        parser.set_features(features);
        Self {
            processor,
            storage: Arc::new(StreamingWireBytes::new()),
            parser,
            consumed: 0,
            ok: true,
            end_offset: None,
        }
    }

    /// Feed one network chunk.
    pub fn process_bytes(&mut self, chunk: &[u8]) {
        if !self.ok {
            return;
        }
        tracing::trace!(target: "riptide::streaming", len = chunk.len(), "process chunk");
        self.storage.lock().extend_from_slice(chunk);
        self.drive(false);
        if self.ok {
            self.processor.on_finished_chunk();
        }
    }

    /// The stream is complete; finish decoding and compilation.
    pub fn finish(mut self) {
        if !self.ok {
            return;
        }
        tracing::trace!(target: "riptide::streaming", "finish stream");
        self.drive(true);
        if self.ok {
            debug_assert!(self.end_offset.is_some());
            self.processor.on_finished_stream(self.storage.snapshot());
        }
    }

    /// Tear the stream and its compile job down.
    pub fn abort(mut self) {
        tracing::trace!(target: "riptide::streaming", "abort stream");
        if self.ok {
            self.ok = false;
            self.processor.on_abort();
        }
    }

    /// Parse as much of the buffered bytes as possible, dispatching each
    /// section to the processor.
    fn drive(&mut self, eof: bool) {
        while self.ok && self.end_offset.is_none() {
            // Payloads are copied out of the buffer so the lock is released
            // before the processor runs; the processor may commit units,
            // which spawns workers that read this very buffer.
            let payload = {
                let buffer = self.storage.lock();
                match self.parser.parse(&buffer[self.consumed..], eof) {
                    Ok(Chunk::NeedMoreData(_)) => None,
                    Ok(Chunk::Parsed { consumed, payload }) => {
                        let pending = Self::detach_payload(payload, &buffer);
                        self.consumed += consumed;
                        Some(Ok(pending))
                    }
                    Err(error) => Some(Err(Error::from(error))),
                }
            };
            match payload {
                None => break,
                Some(Ok(payload)) => {
                    if !self.dispatch(payload) {
                        self.ok = false;
                    }
                }
                Some(Err(error)) => {
                    self.ok = false;
                    self.processor.on_error(error);
                }
            }
        }
    }

    fn dispatch(&mut self, payload: PendingPayload) -> bool {
        match payload {
            PendingPayload::Header { bytes, offset } => {
                self.processor.process_module_header(&bytes, offset)
            }
            PendingPayload::Section {
                kind,
                bytes,
                offset,
            } => self.processor.process_section(kind.as_code(), &bytes, offset),
            PendingPayload::CodeStart { count, offset } => {
                let storage = Arc::clone(&self.storage) as Arc<dyn WireBytesStorage>;
                self.processor
                    .process_code_section_header(count, offset, storage)
            }
            PendingPayload::Body { bytes, offset } => {
                self.processor.process_function_body(&bytes, offset)
            }
            PendingPayload::End(offset) => {
                self.end_offset = Some(offset);
                true
            }
            PendingPayload::Skip => true,
        }
    }

    fn detach_payload(payload: Payload<'_>, buffer: &[u8]) -> PendingPayload {
        let section = |kind: SectionKind, range: core::ops::Range<usize>| PendingPayload::Section {
            kind,
            bytes: buffer[range.clone()].to_vec(),
            offset: u32::try_from(range.start).unwrap(),
        };
        match payload {
            Payload::Version { range, .. } => PendingPayload::Header {
                bytes: buffer[range.clone()].to_vec(),
                offset: u32::try_from(range.start).unwrap(),
            },
            Payload::TypeSection(reader) => section(SectionKind::Type, reader.range()),
            Payload::ImportSection(reader) => section(SectionKind::Import, reader.range()),
            Payload::FunctionSection(reader) => section(SectionKind::Function, reader.range()),
            Payload::TableSection(reader) => section(SectionKind::Table, reader.range()),
            Payload::MemorySection(reader) => section(SectionKind::Memory, reader.range()),
            Payload::GlobalSection(reader) => section(SectionKind::Global, reader.range()),
            Payload::ExportSection(reader) => section(SectionKind::Export, reader.range()),
            Payload::StartSection { range, .. } => section(SectionKind::Start, range),
            Payload::ElementSection(reader) => section(SectionKind::Element, reader.range()),
            Payload::DataCountSection { range, .. } => section(SectionKind::DataCount, range),
            Payload::DataSection(reader) => section(SectionKind::Data, reader.range()),
            Payload::TagSection(reader) => section(SectionKind::Tag, reader.range()),
            Payload::CustomSection(reader) => PendingPayload::Section {
                kind: SectionKind::Custom(reader.name().to_string()),
                bytes: reader.data().to_vec(),
                offset: u32::try_from(reader.data_offset()).unwrap(),
            },
            Payload::CodeSectionStart { count, range, .. } => PendingPayload::CodeStart {
                count,
                offset: u32::try_from(range.start).unwrap(),
            },
            Payload::CodeSectionEntry(body) => {
                let range = body.range();
                PendingPayload::Body {
                    bytes: buffer[range.clone()].to_vec(),
                    offset: u32::try_from(range.start).unwrap(),
                }
            }
            Payload::End(offset) => PendingPayload::End(offset),
            payload => {
                tracing::warn!(target: "riptide::streaming", "unknown section {payload:?}");
                PendingPayload::Skip
            }
        }
    }
}

/// The production [`StreamingProcessor`]: decodes sections incrementally and
/// drives the owning compile job.
pub(crate) struct AsyncStreamingProcessor {
    job: Arc<AsyncCompileJob>,
    translator: ModuleTranslator,
    /// Present between the code-section header and the first post-code
    /// section.
    builder: Option<CompilationUnitBuilder>,
    next_function: u32,
}

impl AsyncStreamingProcessor {
    pub(crate) fn new(job: Arc<AsyncCompileJob>) -> Self {
        let features = job.engine().config().enabled_features;
        Self {
            job,
            translator: ModuleTranslator::new(features, crate::ModuleOrigin::Wasm),
            builder: None,
            next_function: 0,
        }
    }

    /// Finish the compile job with an error. Returns `false` so callers can
    /// tail-return it as the processing verdict.
    fn finish_with_error(&mut self, error: Error) -> bool {
        tracing::debug!(target: "riptide::streaming", %error, "stream failed");
        // Make sure all of the job's own background tasks stopped before the
        // job transitions to the failure step.
        self.job.background_manager().cancel_and_wait();

        if let Some(module) = self.job.module() {
            // Compilation already started; tear the compile-state down and
            // reuse the failure task it may already have pending.
            module.compilation_state().abort();
            AsyncCompileJob::do_sync_use_existing(&self.job, CompileStep::DecodeFail(error));
            // The builder asserts emptiness at destruction.
            if let Some(builder) = &mut self.builder {
                builder.clear();
            }
        } else {
            AsyncCompileJob::do_sync(&self.job, CompileStep::DecodeFail(error));
        }
        false
    }

    fn commit_compilation_units(&mut self) {
        let builder = self.builder.as_mut().expect("no compilation unit builder");
        builder.commit();
    }
}

impl StreamingProcessor for AsyncStreamingProcessor {
    fn process_module_header(&mut self, bytes: &[u8], offset: u32) -> bool {
        tracing::trace!(target: "riptide::streaming", "process module header");
        match self.translator.translate_module_header(bytes, offset) {
            Ok(()) => true,
            Err(error) => self.finish_with_error(error),
        }
    }

    fn process_section(&mut self, code: SectionCode<'_>, bytes: &[u8], offset: u32) -> bool {
        tracing::trace!(target: "riptide::streaming", ?code, "process section");
        if self.builder.is_some() {
            // A section after the code section: the builder has served its
            // purpose.
            self.commit_compilation_units();
            self.builder = None;
        }
        match self.translator.translate_section(code, bytes, offset) {
            Ok(()) => true,
            Err(error) => self.finish_with_error(error),
        }
    }

    fn process_code_section_header(
        &mut self,
        count: u32,
        offset: u32,
        wire_bytes_storage: Arc<dyn WireBytesStorage>,
    ) -> bool {
        tracing::trace!(target: "riptide::streaming", count, "process code section header");
        let range = offset as usize..offset as usize;
        if let Err(error) = self.translator.check_functions_count(count, range) {
            return self.finish_with_error(error);
        }

        // Execute PrepareAndStartCompile right now rather than as a task:
        // function bodies follow in this very chunk and need somewhere to
        // go. Units are published by the stream, not by the step.
        let snapshot = Arc::new(self.translator.partial_module());
        AsyncCompileJob::do_immediately(
            &self.job,
            CompileStep::PrepareAndStartCompile {
                module: snapshot,
                start_compilation: false,
            },
        );

        let module = self.job.module().expect("prepare step did not run");
        let state = module.compilation_state();
        state.set_wire_bytes_storage(wire_bytes_storage);
        state.set_total(count as usize);

        // Both the stream and the compilation callback must report before
        // the module can finish; the last function body and the last
        // baseline compile race in either order.
        self.job.set_outstanding_finishers(2);

        self.builder = Some(CompilationUnitBuilder::new(Arc::clone(module.native())));
        true
    }

    fn process_function_body(&mut self, bytes: &[u8], offset: u32) -> bool {
        tracing::trace!(
            target: "riptide::streaming",
            func = self.next_function,
            "process function body"
        );
        if let Err(error) = self.translator.translate_function_body(bytes, offset) {
            return self.finish_with_error(error);
        }

        let num_imported = self.translator.module().num_imported_functions;
        let builder = self.builder.as_mut().expect("no compilation unit builder");
        let func_index = FuncIndex::from_u32(self.next_function + num_imported);
        let len = u32::try_from(bytes.len()).unwrap();
        builder.add(func_index, offset..offset + len);
        self.next_function += 1;
        true
    }

    fn on_finished_chunk(&mut self) {
        tracing::trace!(target: "riptide::streaming", "finished chunk");
        if self.builder.is_some() {
            // Publish everything decoded from this chunk so workers can
            // start before the next chunk arrives.
            self.commit_compilation_units();
        }
    }

    fn on_finished_stream(&mut self, bytes: Arc<[u8]>) {
        tracing::trace!(target: "riptide::streaming", "finished stream");
        let module = match self.translator.finish(&bytes, false) {
            Ok(module) => module,
            Err(error) => {
                self.finish_with_error(error);
                return;
            }
        };

        let needs_finish = self.job.decrement_and_check_finisher_count();
        match self.job.module() {
            None => {
                // A module without a code section: the runtime objects were
                // never created, do it now.
                debug_assert!(needs_finish);
                let handle = AsyncCompileJob::prepare_runtime_objects(&self.job, Arc::new(module));
                handle.native().set_wire_bytes(bytes);
            }
            Some(handle) => {
                // Swap the code-section-time snapshot for the complete
                // description, then store the finalized bytes.
                handle.native().update_module(Arc::new(module));
                handle.native().set_wire_bytes(bytes);
            }
        }
        if needs_finish {
            AsyncCompileJob::finish_compile(&self.job, true);
        }
    }

    fn on_error(&mut self, error: Error) {
        tracing::trace!(target: "riptide::streaming", "stream error");
        self.finish_with_error(error);
    }

    fn on_abort(&mut self) {
        tracing::trace!(target: "riptide::streaming", "stream aborted");
        AsyncCompileJob::abort(&self.job);
    }
}
