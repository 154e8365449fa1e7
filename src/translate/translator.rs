// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::config::ModuleOrigin;
use crate::indices::{FuncIndex, TypeIndex};
use crate::translate::{EntityIndex, FuncType, FunctionDesc, Import, TranslatedModule};
use crate::{Error, Result};
use core::ops::Range;
use wasmparser::{
    BinaryReader, CompositeInnerType, Encoding, ExportSectionReader, ExternalKind, FunctionBody,
    FunctionSectionReader, ImportSectionReader, Name, NameSectionReader, Parser, Payload, TypeRef,
    TypeSectionReader, Validator, WasmFeatures,
};

/// Identifies a module section during incremental decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionCode<'a> {
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
    Custom { name: &'a str },
}

/// A translator for converting the output of `wasmparser` into the module
/// description used by this crate.
///
/// Supports two modes of operation: [`translate`](Self::translate) consumes
/// a complete binary in one call; the `translate_*` methods consume one
/// section at a time as the streaming decoder delivers them, finishing with
/// [`finish`](Self::finish). Both modes run the structural validator;
/// function *bodies* are validated separately (by [`validate_functions`] or
/// by the code generator itself).
pub struct ModuleTranslator {
    validator: Validator,
    features: WasmFeatures,
    module: TranslatedModule,
    /// Number of code-section entries translated so far.
    next_body: u32,
}

impl ModuleTranslator {
    pub fn new(features: WasmFeatures, origin: ModuleOrigin) -> Self {
        Self {
            validator: Validator::new_with_features(features),
            features,
            module: TranslatedModule::new(origin),
            next_body: 0,
        }
    }

    /// The module as decoded so far.
    pub fn module(&self) -> &TranslatedModule {
        &self.module
    }

    /// A snapshot of the module as decoded so far. The streaming pipeline
    /// starts compiling from this at the code-section header, before the
    /// sections after the code section have arrived.
    pub fn partial_module(&self) -> TranslatedModule {
        self.module.clone()
    }

    /// Translate a complete module binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary is malformed or uses an unsupported
    /// feature.
    pub fn translate(mut self, data: &[u8]) -> Result<TranslatedModule> {
        let mut parser = Parser::default();
        parser.set_features(self.features);

        for payload in parser.parse_all(data) {
            self.translate_payload(payload?)?;
        }

        Ok(self.module)
    }

    fn translate_payload(&mut self, payload: Payload<'_>) -> Result<()> {
        match payload {
            Payload::Version {
                num,
                encoding,
                range,
            } => {
                self.validator.version(num, encoding, &range)?;
            }
            Payload::TypeSection(types) => {
                self.validator.type_section(&types)?;
                self.type_section(types)?;
            }
            Payload::ImportSection(imports) => {
                self.validator.import_section(&imports)?;
                self.import_section(imports)?;
            }
            Payload::FunctionSection(functions) => {
                self.validator.function_section(&functions)?;
                self.function_section(functions)?;
            }
            Payload::TableSection(tables) => {
                self.validator.table_section(&tables)?;
            }
            Payload::MemorySection(memories) => {
                self.validator.memory_section(&memories)?;
            }
            Payload::TagSection(_) => {
                return Err(Error::unsupported("exception handling"));
            }
            Payload::GlobalSection(globals) => {
                self.validator.global_section(&globals)?;
            }
            Payload::ExportSection(exports) => {
                self.validator.export_section(&exports)?;
                self.export_section(exports)?;
            }
            Payload::StartSection { func, range } => {
                self.validator.start_section(func, &range)?;
                self.module.start = Some(FuncIndex::from_u32(func));
            }
            Payload::ElementSection(elements) => {
                self.validator.element_section(&elements)?;
            }
            Payload::DataCountSection { count, range } => {
                self.validator.data_count_section(count, &range)?;
            }
            Payload::DataSection(data) => {
                self.validator.data_section(&data)?;
            }
            Payload::CodeSectionStart { count, range, .. } => {
                self.check_functions_count(count, range)?;
            }
            Payload::CodeSectionEntry(body) => {
                self.function_body(body)?;
            }
            Payload::CustomSection(section) => match section.name() {
                "name" => {
                    self.name_section(NameSectionReader::new(BinaryReader::new(
                        section.data(),
                        section.data_offset(),
                    )))?;
                }
                name => tracing::trace!("skipping custom section {name}"),
            },
            Payload::End(offset) => {
                self.validator.end(offset)?;
            }
            p => tracing::warn!("unknown section {p:?}"),
        }
        Ok(())
    }

    /// Decode the eight-byte module header.
    pub fn translate_module_header(&mut self, bytes: &[u8], offset: u32) -> Result<()> {
        let mut reader = BinaryReader::new(bytes, offset as usize);
        let magic = reader.read_bytes(4)?;
        debug_assert_eq!(magic, b"\0asm");
        let num = reader.read_bytes(4)?;
        let num = u16::from(num[0]) | (u16::from(num[1]) << 8);
        let range = offset as usize..offset as usize + bytes.len();
        self.validator.version(num, Encoding::Module, &range)?;
        Ok(())
    }

    /// Decode one non-code section delivered by the streaming decoder.
    pub fn translate_section(
        &mut self,
        code: SectionCode<'_>,
        bytes: &[u8],
        offset: u32,
    ) -> Result<()> {
        let offset = offset as usize;
        let range = offset..offset + bytes.len();
        match code {
            SectionCode::Type => {
                let types =
                    TypeSectionReader::new(BinaryReader::new_features(bytes, offset, self.features))?;
                self.validator.type_section(&types)?;
                self.type_section(types)?;
            }
            SectionCode::Import => {
                let imports = ImportSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.import_section(&imports)?;
                self.import_section(imports)?;
            }
            SectionCode::Function => {
                let functions = FunctionSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.function_section(&functions)?;
                self.function_section(functions)?;
            }
            SectionCode::Table => {
                let tables = wasmparser::TableSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.table_section(&tables)?;
            }
            SectionCode::Memory => {
                let memories = wasmparser::MemorySectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.memory_section(&memories)?;
            }
            SectionCode::Global => {
                let globals = wasmparser::GlobalSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.global_section(&globals)?;
            }
            SectionCode::Export => {
                let exports = ExportSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.export_section(&exports)?;
                self.export_section(exports)?;
            }
            SectionCode::Start => {
                let mut reader = BinaryReader::new_features(bytes, offset, self.features);
                let func = reader.read_var_u32()?;
                self.validator.start_section(func, &range)?;
                self.module.start = Some(FuncIndex::from_u32(func));
            }
            SectionCode::Element => {
                let elements = wasmparser::ElementSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.element_section(&elements)?;
            }
            SectionCode::DataCount => {
                let mut reader = BinaryReader::new_features(bytes, offset, self.features);
                let count = reader.read_var_u32()?;
                self.validator.data_count_section(count, &range)?;
            }
            SectionCode::Data => {
                let data = wasmparser::DataSectionReader::new(BinaryReader::new_features(
                    bytes,
                    offset,
                    self.features,
                ))?;
                self.validator.data_section(&data)?;
            }
            SectionCode::Tag => {
                return Err(Error::unsupported("exception handling"));
            }
            SectionCode::Custom { name: "name" } => {
                self.name_section(NameSectionReader::new(BinaryReader::new(bytes, offset)))?;
            }
            SectionCode::Custom { name } => tracing::trace!("skipping custom section {name}"),
        }
        Ok(())
    }

    /// Cross-check the code-section entry count against the function
    /// section.
    pub fn check_functions_count(&mut self, count: u32, range: Range<usize>) -> Result<()> {
        self.validator.code_section_start(count, &range)?;
        Ok(())
    }

    /// Record the body of the next defined function delivered by the
    /// streaming decoder.
    pub fn translate_function_body(&mut self, bytes: &[u8], offset: u32) -> Result<()> {
        let body = FunctionBody::new(BinaryReader::new_features(
            bytes,
            offset as usize,
            self.features,
        ));
        self.function_body(body)
    }

    /// Finish decoding and hand out the module description.
    ///
    /// When `verify_functions` is set, every function body in `bytes` is
    /// validated as well; the streaming pipeline passes `false` and defers
    /// body validation to the code generator.
    ///
    /// # Errors
    ///
    /// Returns an error if a section is missing or inconsistent, or if body
    /// validation was requested and failed.
    pub fn finish(&mut self, bytes: &[u8], verify_functions: bool) -> Result<TranslatedModule> {
        self.validator.end(bytes.len())?;
        let module = core::mem::replace(&mut self.module, TranslatedModule::new(ModuleOrigin::Wasm));
        if verify_functions {
            validate_functions(&module, bytes, self.features)?;
        }
        Ok(module)
    }

    fn type_section(&mut self, types: TypeSectionReader<'_>) -> Result<()> {
        self.module
            .types
            .reserve(usize::try_from(types.count()).unwrap());

        for rec_group in types {
            for sub in rec_group?.into_types() {
                match &sub.composite_type.inner {
                    CompositeInnerType::Func(func) => {
                        self.module.types.push(FuncType::from_wasmparser(func)?);
                    }
                    _ => return Err(Error::unsupported("gc types")),
                }
            }
        }

        Ok(())
    }

    fn import_section(&mut self, imports: ImportSectionReader<'_>) -> Result<()> {
        self.module
            .imports
            .reserve_exact(imports.count() as usize);

        for import in imports {
            let import = import?;

            if let TypeRef::Func(index) = import.ty {
                self.module.num_imported_functions += 1;
                self.module.functions.push(FunctionDesc {
                    signature: TypeIndex::from_u32(index),
                    body: None,
                });
            }

            self.module.imports.push(Import {
                module: import.module.to_string(),
                name: import.name.to_string(),
            });
        }

        Ok(())
    }

    fn function_section(&mut self, functions: FunctionSectionReader<'_>) -> Result<()> {
        self.module
            .functions
            .reserve_exact(functions.count() as usize);

        for index in functions {
            self.module.functions.push(FunctionDesc {
                signature: TypeIndex::from_u32(index?),
                body: None,
            });
        }

        Ok(())
    }

    fn export_section(&mut self, exports: ExportSectionReader<'_>) -> Result<()> {
        for export in exports {
            let export = export?;
            let index = match export.kind {
                ExternalKind::Func => {
                    let index = FuncIndex::from_u32(export.index);
                    // The export name doubles as a function name until the
                    // name section overwrites it.
                    self.module
                        .func_names
                        .insert(index, export.name.to_string());
                    EntityIndex::Function(index)
                }
                ExternalKind::Table => EntityIndex::Table(export.index),
                ExternalKind::Memory => EntityIndex::Memory(export.index),
                ExternalKind::Global => EntityIndex::Global(export.index),
                ExternalKind::Tag => EntityIndex::Tag(export.index),
            };

            self.module.exports.push((export.name.to_string(), index));
        }

        Ok(())
    }

    fn function_body(&mut self, body: FunctionBody<'_>) -> Result<()> {
        // Register the body with the validator for section bookkeeping; the
        // returned body validator is dropped, actual validation is deferred.
        let _ = self.validator.code_section_entry(&body)?;

        let range = body.range();
        let index = FuncIndex::from_u32(self.module.num_imported_functions + self.next_body);
        self.module.functions[index].body =
            Some(u32::try_from(range.start).unwrap()..u32::try_from(range.end).unwrap());
        self.next_body += 1;

        Ok(())
    }

    fn name_section(&mut self, reader: NameSectionReader<'_>) -> Result<()> {
        for subsection in reader {
            match subsection? {
                Name::Module { name, .. } => {
                    self.module.name = Some(name.to_string());
                }
                Name::Function(names) => {
                    for name in names {
                        let name = name?;
                        // Skip namings of functions that don't exist.
                        if name.index < self.module.num_functions() {
                            self.module
                                .func_names
                                .insert(FuncIndex::from_u32(name.index), name.name.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Validate every function body of an already-decoded module.
///
/// This is the validation pass that precedes lazy compilation: a module that
/// passes here can never produce a compile error later. Failures surface as
/// `Compiling function #<i>:<name> failed: <msg> @+<offset>`, distinct from
/// the per-function compile-failure message.
///
/// # Errors
///
/// Returns a validation error attributed to the offending function.
pub fn validate_functions(
    module: &TranslatedModule,
    bytes: &[u8],
    features: WasmFeatures,
) -> Result<()> {
    Validator::new_with_features(features)
        .validate_all(bytes)
        .map(|_| ())
        .map_err(|e| match module.function_at_offset(e.offset()) {
            Some(func_index) => Error::Validation {
                func_index: func_index.as_u32(),
                name: module.lookup_function_name(func_index).map(str::to_string),
                offset: e.offset(),
                message: e.message().to_string(),
            },
            None => Error::from(e),
        })
}
