//! Batch manager boundary.
//!
//! The engine does not own command-buffer memory, buffer objects,
//! relocation tables or kernel submission; it consumes them through
//! the [`BatchManager`] trait. Addresses of buffer objects referenced
//! from command words are not known until submission, so every buffer
//! reference is recorded as a relocation against a word position and
//! resolved by the batch manager.
//!
//! [`RecordingBatch`] is a reference implementation that records the
//! stream instead of driving hardware. Tests use it to observe exactly
//! which words an operation produced.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::RenderError;

/// Handle to a buffer object owned by the batch manager.
///
/// Handles are reference counted through [`BatchManager::retain`] and
/// [`BatchManager::release`]; the last release deallocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

bitflags! {
    /// Access domains recorded with a relocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Domain: u32 {
        /// Read by the shader pipeline's render cache.
        const RENDER = 1 << 0;
        /// Read through the sampler.
        const SAMPLER = 1 << 1;
        /// Read by the vertex fetcher.
        const VERTEX = 1 << 2;
        /// Accessed by the blitter.
        const BLT = 1 << 3;
        /// Written by the referencing command.
        const WRITE = 1 << 4;
    }
}

/// Which hardware engine the batch targets. Switching rings submits
/// any open batch, so staying on the current ring is cheaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    /// 3D/shader pipeline.
    Render,
    /// Fixed-function 2D blitter.
    Blt,
}

/// A deferred address patch against one command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Word position within the batch.
    pub at: usize,
    /// Referenced buffer; `None` means the batch buffer itself.
    pub buffer: Option<BufferHandle>,
    /// Byte offset added to the resolved address.
    pub delta: u32,
    /// Access domains.
    pub domain: Domain,
}

/// Command-buffer and buffer-object services consumed by the engine.
pub trait BatchManager {
    /// True if `n_words` more command words fit in the open batch.
    fn reserve_command_space(&mut self, n_words: usize) -> bool;

    /// True if `n` more relocation entries fit in the open batch.
    fn reserve_relocations(&mut self, n: usize) -> bool;

    /// Append one command word.
    fn emit(&mut self, word: u32);

    /// Word position the next `emit` will write.
    fn position(&self) -> usize;

    /// Overwrite a previously emitted word (vertex-count back-patching).
    fn patch(&mut self, at: usize, word: u32);

    /// Record a relocation for the word at `at` and return the presumed
    /// device address to store there. `None` references the batch
    /// buffer itself (inline data).
    fn add_relocation(
        &mut self,
        at: usize,
        buffer: Option<BufferHandle>,
        delta: u32,
        domain: Domain,
    ) -> u32;

    /// Submit the open batch. May block under back-pressure.
    fn submit(&mut self);

    /// True if the open batch holds no words yet.
    fn is_empty(&self) -> bool;

    /// Allocate a buffer object.
    fn create_buffer(&mut self, size: usize) -> Result<BufferHandle, RenderError>;

    /// Write into a buffer object (staging uploads, vertex spill).
    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), RenderError>;

    /// Take an additional reference on a buffer.
    fn retain(&mut self, buffer: BufferHandle);

    /// Drop a reference; the last release deallocates.
    fn release(&mut self, buffer: BufferHandle);

    fn ring(&self) -> Ring;

    /// Select the target engine, submitting the open batch if it
    /// belongs to the other ring.
    fn set_ring(&mut self, ring: Ring);
}

/// One submitted batch as recorded by [`RecordingBatch`].
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub words: Vec<u32>,
    pub relocations: Vec<Relocation>,
    pub ring: Ring,
}

struct BufferRecord {
    refcount: u32,
    data: Vec<u8>,
}

/// Recording implementation of [`BatchManager`].
///
/// Capacity limits are honest: once the word or relocation budget is
/// exceeded the reserve calls report failure, which exercises the
/// engine's flush-and-retry paths.
pub struct RecordingBatch {
    words: Vec<u32>,
    relocations: Vec<Relocation>,
    submitted: Vec<SubmittedBatch>,
    buffers: BTreeMap<BufferHandle, BufferRecord>,
    next_handle: u64,
    ring: Ring,
    word_limit: usize,
    reloc_limit: usize,
}

impl RecordingBatch {
    /// Default batch sizing, roomy enough for ordinary frames.
    pub fn new() -> Self {
        Self::with_limits(8192, 512)
    }

    /// Batch with explicit word and relocation budgets.
    pub fn with_limits(word_limit: usize, reloc_limit: usize) -> Self {
        Self {
            words: Vec::new(),
            relocations: Vec::new(),
            submitted: Vec::new(),
            buffers: BTreeMap::new(),
            next_handle: 1,
            ring: Ring::Render,
            word_limit,
            reloc_limit,
        }
    }

    /// Words of the open, not yet submitted batch.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Relocations of the open batch.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// All batches submitted so far.
    pub fn submitted(&self) -> &[SubmittedBatch] {
        &self.submitted
    }

    /// Contents of a live buffer object.
    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    /// Number of live buffer objects.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn presumed_address(buffer: Option<BufferHandle>, delta: u32) -> u32 {
        match buffer {
            Some(BufferHandle(h)) => (h as u32).wrapping_mul(0x0100_0000).wrapping_add(delta),
            None => 0x8000_0000 | delta,
        }
    }
}

impl Default for RecordingBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchManager for RecordingBatch {
    fn reserve_command_space(&mut self, n_words: usize) -> bool {
        self.words.len() + n_words <= self.word_limit
    }

    fn reserve_relocations(&mut self, n: usize) -> bool {
        self.relocations.len() + n <= self.reloc_limit
    }

    fn emit(&mut self, word: u32) {
        self.words.push(word);
    }

    fn position(&self) -> usize {
        self.words.len()
    }

    fn patch(&mut self, at: usize, word: u32) {
        self.words[at] = word;
    }

    fn add_relocation(
        &mut self,
        at: usize,
        buffer: Option<BufferHandle>,
        delta: u32,
        domain: Domain,
    ) -> u32 {
        self.relocations.push(Relocation {
            at,
            buffer,
            delta,
            domain,
        });
        Self::presumed_address(buffer, delta)
    }

    fn submit(&mut self) {
        if self.words.is_empty() {
            return;
        }
        self.submitted.push(SubmittedBatch {
            words: std::mem::take(&mut self.words),
            relocations: std::mem::take(&mut self.relocations),
            ring: self.ring,
        });
    }

    fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn create_buffer(&mut self, size: usize) -> Result<BufferHandle, RenderError> {
        let handle = BufferHandle(self.next_handle);
        self.next_handle += 1;
        self.buffers.insert(
            handle,
            BufferRecord {
                refcount: 1,
                data: vec![0; size],
            },
        );
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), RenderError> {
        let record = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::invalid("write to unknown buffer"))?;
        if offset + data.len() > record.data.len() {
            return Err(RenderError::invalid("write exceeds buffer size"));
        }
        record.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn retain(&mut self, buffer: BufferHandle) {
        if let Some(record) = self.buffers.get_mut(&buffer) {
            record.refcount += 1;
        }
    }

    fn release(&mut self, buffer: BufferHandle) {
        if let Some(record) = self.buffers.get_mut(&buffer) {
            record.refcount -= 1;
            if record.refcount == 0 {
                self.buffers.remove(&buffer);
            }
        }
    }

    fn ring(&self) -> Ring {
        self.ring
    }

    fn set_ring(&mut self, ring: Ring) {
        if self.ring != ring {
            self.submit();
            self.ring = ring;
        }
    }
}
