// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Translation of the raw module binary into the crate's own description of
//! a module, built on `wasmparser`.

mod translator;

pub use translator::{validate_functions, ModuleTranslator, SectionCode};

use crate::config::ModuleOrigin;
use crate::indices::{DefinedFuncIndex, FuncIndex, TypeIndex};
use crate::{Error, Result};
use core::ops::Range;
use cranelift_entity::PrimaryMap;
use hashbrown::HashMap;

/// A WebAssembly value type, reduced to what the pipeline needs for keying
/// call adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValType {
    pub(crate) fn from_wasmparser(ty: wasmparser::ValType) -> Result<Self> {
        use wasmparser::{AbstractHeapType, HeapType};
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            wasmparser::ValType::V128 => Ok(Self::V128),
            wasmparser::ValType::Ref(r) => match r.heap_type() {
                HeapType::Abstract {
                    ty: AbstractHeapType::Func,
                    ..
                } => Ok(Self::FuncRef),
                HeapType::Abstract {
                    ty: AbstractHeapType::Extern,
                    ..
                } => Ok(Self::ExternRef),
                _ => Err(Error::unsupported(format!("reference type {r:?}"))),
            },
        }
    }
}

/// A function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Box<[ValType]>,
    pub results: Box<[ValType]>,
}

impl FuncType {
    pub(crate) fn from_wasmparser(ty: &wasmparser::FuncType) -> Result<Self> {
        let params = ty
            .params()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<Result<_>>()?;
        let results = ty
            .results()
            .iter()
            .map(|ty| ValType::from_wasmparser(*ty))
            .collect::<Result<_>>()?;
        Ok(Self { params, results })
    }
}

/// A function, imported or defined.
#[derive(Debug, Clone)]
pub struct FunctionDesc {
    pub signature: TypeIndex,
    /// Where the function's body lives in the wire bytes. `None` for
    /// imported functions, and for defined functions whose body has not
    /// arrived yet during streaming.
    pub body: Option<Range<u32>>,
}

/// An index into one of a module's entity index spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityIndex {
    Function(FuncIndex),
    Table(u32),
    Memory(u32),
    Global(u32),
    Tag(u32),
}

/// An entity the module requires from its environment.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
}

/// The decoded description of a module: everything the compilation pipeline
/// and the instance builder need, detached from the wire bytes.
#[derive(Debug, Clone)]
pub struct TranslatedModule {
    pub origin: ModuleOrigin,
    /// The module name from the name section, if present.
    pub name: Option<String>,
    pub types: PrimaryMap<TypeIndex, FuncType>,
    pub functions: PrimaryMap<FuncIndex, FunctionDesc>,
    pub num_imported_functions: u32,
    pub imports: Vec<Import>,
    pub exports: Vec<(String, EntityIndex)>,
    pub start: Option<FuncIndex>,
    /// Function names from the name section, with export names as fallback.
    pub func_names: HashMap<FuncIndex, String>,
}

impl TranslatedModule {
    pub(crate) fn new(origin: ModuleOrigin) -> Self {
        Self {
            origin,
            name: None,
            types: PrimaryMap::new(),
            functions: PrimaryMap::new(),
            num_imported_functions: 0,
            imports: Vec::new(),
            exports: Vec::new(),
            start: None,
            func_names: HashMap::new(),
        }
    }

    pub fn num_functions(&self) -> u32 {
        u32::try_from(self.functions.len()).unwrap()
    }

    /// Number of functions the module defines itself, i.e. the number of
    /// functions that need compiling.
    pub fn num_declared_functions(&self) -> u32 {
        self.num_functions() - self.num_imported_functions
    }

    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.num_imported_functions
    }

    /// The defined-function index of `index`, or `None` if it is imported.
    pub fn defined_func_index(&self, index: FuncIndex) -> Option<DefinedFuncIndex> {
        (!self.is_imported_function(index))
            .then(|| DefinedFuncIndex::from_u32(index.as_u32() - self.num_imported_functions))
    }

    pub fn func_index(&self, index: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(index.as_u32() + self.num_imported_functions)
    }

    pub fn function_type(&self, index: FuncIndex) -> &FuncType {
        &self.types[self.functions[index].signature]
    }

    pub fn lookup_function_name(&self, index: FuncIndex) -> Option<&str> {
        self.func_names.get(&index).map(String::as_str)
    }

    /// Wire-byte range of the body of `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is imported or its body has not been decoded, both
    /// of which would mean a unit was published before its body existed.
    pub(crate) fn function_body_range(&self, index: FuncIndex) -> Range<u32> {
        self.functions[index]
            .body
            .clone()
            .expect("no body decoded for function")
    }

    /// The function whose body contains the wire-byte offset `offset`.
    pub(crate) fn function_at_offset(&self, offset: usize) -> Option<FuncIndex> {
        let offset = u32::try_from(offset).ok()?;
        self.functions.iter().find_map(|(index, desc)| {
            desc.body
                .as_ref()
                .is_some_and(|body| body.contains(&offset))
                .then_some(index)
        })
    }
}
