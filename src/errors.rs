// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error type for the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input WebAssembly binary is malformed.
    InvalidWebAssembly {
        /// A string describing the decode or validation error.
        message: String,
        /// The bytecode offset where the error occurred.
        offset: usize,
    },
    /// A single function failed to translate to native code.
    Compile {
        /// The index of the offending function, in module index space.
        func_index: u32,
        /// The function's name, if the module carries one for it.
        name: Option<String>,
        /// The bytecode offset where the error occurred.
        offset: usize,
        /// A human-readable description of the error.
        message: String,
    },
    /// A function body failed validation ahead of lazy compilation.
    Validation {
        /// The index of the offending function, in module index space.
        func_index: u32,
        /// The function's name, if the module carries one for it.
        name: Option<String>,
        /// The bytecode offset where the error occurred.
        offset: usize,
        /// A human-readable description of the error.
        message: String,
    },
    /// The WebAssembly code used an unsupported feature.
    Unsupported(String),
    /// Allocation or guard-region setup failed.
    Resource(String),
    /// Compilation was torn down before it could finish.
    Aborted,
}

impl Error {
    pub(crate) fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported(feature.into())
    }

    /// The bare description of the error, without the surrounding
    /// "Compiling wasm function ..." framing.
    pub(crate) fn message(&self) -> String {
        match self {
            Self::InvalidWebAssembly { message, .. }
            | Self::Compile { message, .. }
            | Self::Validation { message, .. } => message.clone(),
            Self::Unsupported(feature) => format!("unsupported feature: {feature}"),
            Self::Resource(message) => message.clone(),
            Self::Aborted => "Compilation aborted".to_string(),
        }
    }

    pub(crate) fn offset(&self) -> usize {
        match self {
            Self::InvalidWebAssembly { offset, .. }
            | Self::Compile { offset, .. }
            | Self::Validation { offset, .. } => *offset,
            _ => 0,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWebAssembly { message, offset } => {
                f.write_fmt(format_args!("invalid WASM input at {offset}: {message}"))
            }
            Self::Compile {
                func_index,
                name,
                message,
                ..
            } => {
                let name = match name {
                    Some(name) => name.clone(),
                    None => format!("wasm-function[{func_index}]"),
                };
                f.write_fmt(format_args!(
                    "Compiling wasm function \"{name}\" failed: {message}"
                ))
            }
            Self::Validation {
                func_index,
                name,
                offset,
                message,
            } => {
                let name = name.as_deref().unwrap_or("");
                f.write_fmt(format_args!(
                    "Compiling function #{func_index}:{name} failed: {message} @+{offset}"
                ))
            }
            Self::Unsupported(feature) => f.write_fmt(format_args!(
                "Feature used by the WebAssembly code is not supported: {feature}"
            )),
            Self::Resource(message) => f.write_str(message),
            Self::Aborted => f.write_str("Compilation aborted"),
        }
    }
}

impl From<wasmparser::BinaryReaderError> for Error {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        Self::InvalidWebAssembly {
            message: e.message().into(),
            offset: e.offset(),
        }
    }
}

impl std::error::Error for Error {}
