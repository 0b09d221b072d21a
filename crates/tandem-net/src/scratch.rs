//! Reusable per-kind encode buffers.
//!
//! Each [`MessageKind`] owns one buffer that is cleared and reused on every
//! send. [`ScratchBuffers::acquire`] borrows the whole set mutably, so a
//! second encode cannot begin while a [`ScratchGuard`] is alive.

use std::ops::{Deref, DerefMut};

use crate::messages::MessageKind;

/// One reusable buffer per message kind.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    buffers: [Vec<u8>; MessageKind::COUNT],
}

impl ScratchBuffers {
    /// Creates the buffer set with no pre-allocated capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the cleared buffer for `kind`.
    pub fn acquire(&mut self, kind: MessageKind) -> ScratchGuard<'_> {
        let buf = &mut self.buffers[kind.index()];
        buf.clear();
        ScratchGuard { kind, buf }
    }

    /// Capacity retained by the buffer for `kind`.
    pub fn capacity(&self, kind: MessageKind) -> usize {
        self.buffers[kind.index()].capacity()
    }
}

/// Exclusive access to one scratch buffer for the duration of an encode.
pub struct ScratchGuard<'a> {
    kind: MessageKind,
    buf: &'a mut Vec<u8>,
}

impl ScratchGuard<'_> {
    /// Kind this buffer belongs to.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl Deref for ScratchGuard<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.buf
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf
    }
}
