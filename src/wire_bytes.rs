// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Abstraction over the storage of the module's wire bytes.
///
/// Held in an `Arc` by the compile-state so background compilation can keep
/// reading function bodies after the original owner of the bytes has let go
/// of them. During streaming compilation the storage is still growing while
/// workers read from it, so access hands out copies rather than borrows.
pub trait WireBytesStorage: Send + Sync {
    /// Copy of the bytes at `range` (absolute module offsets). The range
    /// must have been published through a compilation unit, which guarantees
    /// the bytes have arrived.
    fn code(&self, range: Range<u32>) -> Box<[u8]>;
}

/// Storage over a complete, immutable module binary.
pub struct OwnedWireBytes(Arc<[u8]>);

impl OwnedWireBytes {
    pub fn new(bytes: Arc<[u8]>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl WireBytesStorage for OwnedWireBytes {
    fn code(&self, range: Range<u32>) -> Box<[u8]> {
        self.0[range.start as usize..range.end as usize].into()
    }
}

/// Storage that accumulates a module binary as it arrives from the network.
///
/// The streaming decoder appends under the lock while workers copy function
/// bodies out; a unit is only ever published after its body bytes landed, so
/// readers never observe a short buffer.
pub struct StreamingWireBytes {
    bytes: Mutex<Vec<u8>>,
}

impl StreamingWireBytes {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock()
    }

    /// Freeze the received bytes into an immutable copy.
    pub fn snapshot(&self) -> Arc<[u8]> {
        Arc::from(self.bytes.lock().as_slice())
    }
}

impl Default for StreamingWireBytes {
    fn default() -> Self {
        Self::new()
    }
}

impl WireBytesStorage for StreamingWireBytes {
    fn code(&self, range: Range<u32>) -> Box<[u8]> {
        self.bytes.lock()[range.start as usize..range.end as usize].into()
    }
}
