//! Device render-state cache.
//!
//! The cache always mirrors the last state actually written into the
//! command stream; every bind compares against it and emits nothing
//! when unchanged. All axes start at an invalid sentinel so the first
//! operation after a submission binds everything, and a per-batch
//! invariant preamble is emitted exactly once.

use crate::batch::{BatchManager, BufferHandle, Domain};
use crate::blend::BlendFactor;
use crate::channel::{Channel, Filter, Repeat};
use crate::cmd;
use crate::composite::RenderTarget;
use crate::kernel::WmKernel;
use crate::Device;

/// Number of distinct vertex layouts (one per floats-per-vertex).
pub const VERTEX_LAYOUTS: usize = 4;

/// Headroom reserved when (re)emitting full operation state: surfaces,
/// every state axis and the primitive setup.
pub const STATE_HEADROOM_WORDS: usize = 64;
/// Relocations needed by full state emission (target + two channels).
pub const STATE_HEADROOM_RELOCS: usize = 4;

/// Extra command words kept in reserve while a two-pass operation is
/// accumulating, so the second pass can always be emitted.
pub const CA_HEADROOM_WORDS: usize = 16;

/// Second-pass fixup recorded while a two-pass operation is live.
#[derive(Debug, Clone, Copy)]
pub struct CaFixup {
    pub blend: (BlendFactor, BlendFactor),
    pub kernel: WmKernel,
}

type SurfaceKey = (BufferHandle, u32);

/// Cached device state, one field per axis.
#[derive(Debug)]
pub struct RenderState {
    pub(crate) needs_invariant: bool,
    blend: Option<(BlendFactor, BlendFactor)>,
    sampler: Option<u32>,
    kernel: Option<WmKernel>,
    constants: Option<[u32; 4]>,
    vertex_layout: Option<(u32, usize)>,
    surfaces: Option<(SurfaceKey, Option<SurfaceKey>, Option<SurfaceKey>)>,
    drawrect: Option<(u32, u32)>,
    /// Bitmask of vertex layouts with a live vertex-buffer binding.
    pub(crate) vb_bound: u32,
    /// Relocation word positions of each layout's vertex-buffer bind.
    pub(crate) vertex_reloc: [Option<usize>; VERTEX_LAYOUTS],
    /// Patch position of the open primitive's vertex-count word.
    pub(crate) vertex_offset: Option<usize>,
    /// Batch position just past the last primitive, for continuing an
    /// uninterrupted rectangle run without a fresh draw command.
    pub(crate) last_primitive: Option<usize>,
    /// Live second-pass fixup, applied at every flush.
    pub(crate) ca_fixup: Option<CaFixup>,
}

impl RenderState {
    pub fn new() -> Self {
        Self {
            needs_invariant: true,
            blend: None,
            sampler: None,
            kernel: None,
            constants: None,
            vertex_layout: None,
            surfaces: None,
            drawrect: None,
            vb_bound: 0,
            vertex_reloc: [None; VERTEX_LAYOUTS],
            vertex_offset: None,
            last_primitive: None,
            ca_fixup: None,
        }
    }

    /// Forget everything; the next batch starts from scratch.
    pub fn invalidate(&mut self) {
        let ca = self.ca_fixup;
        *self = Self::new();
        self.ca_fixup = ca;
    }
}

impl Default for RenderState {
    fn default() -> Self {
        Self::new()
    }
}

/// Packed sampler selector for the source/mask filter and extend
/// modes, plus the per-channel fixup bits.
pub fn sampler_key(src: Option<&Channel>, mask: Option<&Channel>) -> u32 {
    fn filter_bits(f: Filter) -> u32 {
        match f {
            Filter::Nearest => 0,
            Filter::Bilinear => 1,
        }
    }
    fn extend_bits(r: Repeat) -> u32 {
        match r {
            Repeat::None => 0,
            Repeat::Normal => 1,
            Repeat::Pad => 2,
            Repeat::Reflect => 3,
        }
    }

    let (sf, se, s_swap, s_fix) = match src {
        Some(c) => (
            filter_bits(c.filter),
            extend_bits(c.repeat),
            c.channel_swap as u32,
            c.alpha_fixup as u32,
        ),
        None => (0, 0, 0, 0),
    };
    let (mf, me, m_swap, m_fix) = match mask {
        Some(c) => (
            filter_bits(c.filter),
            extend_bits(c.repeat),
            c.channel_swap as u32,
            c.alpha_fixup as u32,
        ),
        None => (0, 0, 0, 0),
    };

    let base = ((sf * 4 + se) * 2 + mf) * 4 + me;
    base | s_swap << 6 | s_fix << 7 | m_swap << 8 | m_fix << 9
}

impl<B: BatchManager> Device<B> {
    /// Make room for `words`/`relocs` in the open batch, submitting the
    /// current one if necessary, and emit the per-batch preamble.
    pub(crate) fn begin_batch(&mut self, words: usize, relocs: usize) {
        if !self.batch.reserve_command_space(words) || !self.batch.reserve_relocations(relocs) {
            log::debug!("batch full, submitting before reserving {} words", words);
            self.submit_batch();
            if !self.batch.reserve_command_space(words) {
                log::warn!("reservation of {} words exceeds batch capacity", words);
            }
        }
        if self.state.needs_invariant {
            self.batch.emit(cmd::with_len(cmd::STATE_INVARIANT, 2));
            self.batch.emit(1);
            self.state.needs_invariant = false;
        }
    }

    /// Close out the vertex machinery and submit the open batch. The
    /// state cache is invalidated: accumulated command words are gone,
    /// so every cached binding is stale.
    pub(crate) fn submit_batch(&mut self) {
        self.vertex_close();
        self.batch.submit();
        self.state.invalidate();
    }

    /// Drop all cached state, e.g. after the display server submitted
    /// work of its own on this context.
    pub fn reset(&mut self) {
        self.state.invalidate();
        self.vertices.reset();
    }

    /// Finalize a frame: drain the accumulator and submit the open
    /// batch.
    pub fn flush(&mut self) {
        self.submit_batch();
    }

    /// Back-patch the open primitive's vertex count and, for two-pass
    /// operations, immediately re-issue the accumulated range with the
    /// second-pass blend and kernel.
    pub(crate) fn vertex_flush(&mut self) {
        let Some(at) = self.state.vertex_offset.take() else {
            return;
        };
        let (start, end) = self.vertices.primitive_range();
        log::trace!("flush primitive: vertices {}..{}", start, end);
        self.batch.patch(at, (end - start) as u32);

        if let Some(fixup) = self.state.ca_fixup {
            self.second_pass(&fixup, start, end);
        }
    }

    /// The component-alpha second pass: same vertex range, complementary
    /// blend and kernel.
    fn second_pass(&mut self, fixup: &CaFixup, start: usize, end: usize) {
        log::debug!(
            "component-alpha second pass over vertices {}..{}",
            start,
            end
        );
        self.bind_blend(fixup.blend);
        self.bind_kernel(fixup.kernel);
        self.batch.emit(cmd::with_len(cmd::MI_FLUSH, 2));
        self.batch.emit(0);

        self.batch.emit(cmd::with_len(cmd::PRIMITIVE_RECTLIST, 6));
        self.batch.emit((end - start) as u32);
        self.batch.emit(start as u32);
        self.batch.emit(1);
        self.batch.emit(0);
        self.batch.emit(0);
        // Never extend the second-pass primitive with first-pass
        // rectangles.
        self.state.last_primitive = None;
    }

    /// Drain the accumulator into a fresh buffer object mid-batch, so
    /// accumulation can continue after the capacity was exhausted.
    pub(crate) fn vertex_spill(&mut self) {
        self.vertex_flush();
        if self.vertices.used() == 0 {
            return;
        }
        self.write_vertex_relocs(false);
        self.vertices.reset();
        self.state.vb_bound = 0;
    }

    /// Final drain at submission: inline the vertex data into the
    /// command stream when it fits, otherwise spill to a buffer.
    pub(crate) fn vertex_close(&mut self) {
        self.vertex_flush();
        if self.vertices.used() == 0 {
            return;
        }
        let inline = self.batch.reserve_command_space(self.vertices.used());
        self.write_vertex_relocs(inline);
        self.vertices.reset();
        self.state.vb_bound = 0;
    }

    fn write_vertex_relocs(&mut self, inline: bool) {
        let used_bytes = (self.vertices.used() * 4) as u32;
        let (bo, delta) = if inline {
            let delta = (self.batch.position() * 4) as u32;
            log::trace!("inlining {} vertex bytes into batch", used_bytes);
            let words: Vec<u32> = self.vertices.as_words().collect();
            for w in words {
                self.batch.emit(w);
            }
            (None, delta)
        } else {
            let bo = match self.batch.create_buffer(used_bytes as usize) {
                Ok(bo) => bo,
                Err(err) => {
                    log::error!("vertex spill allocation failed: {}", err);
                    return;
                }
            };
            if let Err(err) = self.batch.write_buffer(bo, 0, &self.vertices.as_bytes()) {
                log::error!("vertex spill write failed: {}", err);
                self.batch.release(bo);
                return;
            }
            log::trace!("spilled {} vertex bytes to buffer", used_bytes);
            (Some(bo), 0)
        };

        for id in 0..VERTEX_LAYOUTS {
            if let Some(at) = self.state.vertex_reloc[id].take() {
                let start = self.batch.add_relocation(at, bo, delta, Domain::VERTEX);
                self.batch.patch(at, start);
                let end = self
                    .batch
                    .add_relocation(at + 1, bo, delta + used_bytes - 1, Domain::VERTEX);
                self.batch.patch(at + 1, end);
            }
        }

        if let Some(bo) = bo {
            // The relocations keep the buffer alive inside the batch
            // manager; drop the engine's reference.
            self.batch.release(bo);
        }
    }

    /// Flush accumulated vertices before a state change invalidates
    /// the conditions they were emitted under.
    fn flush_before_bind(&mut self) {
        if self.state.vertex_offset.is_some() {
            self.vertex_flush();
        }
    }

    pub(crate) fn bind_blend(&mut self, blend: (BlendFactor, BlendFactor)) -> bool {
        if self.state.blend == Some(blend) {
            return false;
        }
        self.flush_before_bind();
        self.batch.emit(cmd::with_len(cmd::STATE_BLEND, 2));
        self.batch.emit((blend.0 as u32) << 16 | blend.1 as u32);
        self.state.blend = Some(blend);
        true
    }

    pub(crate) fn bind_sampler(&mut self, key: u32) -> bool {
        if self.state.sampler == Some(key) {
            return false;
        }
        self.flush_before_bind();
        self.batch.emit(cmd::with_len(cmd::STATE_SAMPLER, 2));
        self.batch.emit(key);
        self.state.sampler = Some(key);
        true
    }

    pub(crate) fn bind_kernel(&mut self, kernel: WmKernel) -> bool {
        if self.state.kernel == Some(kernel) {
            return false;
        }
        self.flush_before_bind();
        log::trace!("switching to kernel {}", kernel.name());
        self.batch.emit(cmd::with_len(cmd::STATE_KERNEL, 2));
        self.batch.emit(kernel.id());
        self.state.kernel = Some(kernel);
        true
    }

    pub(crate) fn bind_constants(&mut self, words: [u32; 4]) -> bool {
        if self.state.constants == Some(words) {
            return false;
        }
        self.flush_before_bind();
        self.batch.emit(cmd::with_len(cmd::STATE_CONSTANTS, 5));
        for w in words {
            self.batch.emit(w);
        }
        self.state.constants = Some(words);
        true
    }

    pub(crate) fn bind_vertex_layout(&mut self, id: u32, floats_per_vertex: usize) -> bool {
        if self.state.vertex_layout == Some((id, floats_per_vertex)) {
            return false;
        }
        self.flush_before_bind();
        self.batch.emit(cmd::with_len(cmd::STATE_VERTEX_ELEMENTS, 2));
        self.batch.emit(id << 16 | floats_per_vertex as u32);
        self.state.vertex_layout = Some((id, floats_per_vertex));
        true
    }

    fn emit_surface(&mut self, op: u32, key: SurfaceKey, size: u32, pitch: u32, domain: Domain) {
        self.batch.emit(cmd::with_len(op, 5));
        self.batch.emit(key.1);
        self.batch.emit(size);
        self.batch.emit(pitch);
        let at = self.batch.position();
        let addr = self.batch.add_relocation(at, Some(key.0), 0, domain);
        self.batch.emit(addr);
    }

    /// Bind the render target and sampled surfaces. Cached as a tuple:
    /// an operation reusing the previous operation's exact surfaces
    /// emits nothing.
    pub(crate) fn bind_surfaces(
        &mut self,
        target: &RenderTarget,
        src: Option<&Channel>,
        mask: Option<&Channel>,
    ) -> bool {
        let target_key = (target.buffer, crate::channel::dest_format(target.format).code());
        let src_key = src.map(|c| (c.bo, c.card_format.code()));
        let mask_key = mask.map(|c| (c.bo, c.card_format.code()));
        let key = (target_key, src_key, mask_key);
        if self.state.surfaces.as_ref() == Some(&key) {
            return false;
        }
        self.flush_before_bind();

        self.emit_surface(
            cmd::STATE_TARGET,
            target_key,
            (target.width as u32) << 16 | target.height as u32,
            target.pitch,
            Domain::RENDER | Domain::WRITE,
        );
        if let Some(c) = src {
            self.emit_surface(
                cmd::STATE_SURFACE,
                (c.bo, c.card_format.code()),
                (c.width as u32) << 16 | c.height as u32,
                0,
                Domain::SAMPLER,
            );
        }
        if let Some(c) = mask {
            self.emit_surface(
                cmd::STATE_SURFACE,
                (c.bo, c.card_format.code()),
                (c.width as u32) << 16 | c.height as u32,
                0,
                Domain::SAMPLER,
            );
        }
        self.state.surfaces = Some(key);
        true
    }

    /// Bind the drawing rectangle (clip bounds plus target origin).
    /// Never skipped when `force` is set: a preceding non-pipelined
    /// state change requires re-emission regardless of the cache.
    pub(crate) fn bind_drawing_rect(&mut self, target: &RenderTarget, force: bool) -> bool {
        let limit =
            ((target.height as u32 - 1) << 16) | (target.width as u32 - 1);
        let offset = cmd::xy(target.origin.0, target.origin.1);
        if !force && self.state.drawrect == Some((limit, offset)) {
            return false;
        }
        self.flush_before_bind();
        self.batch.emit(cmd::with_len(cmd::STATE_DRAW_RECT, 3));
        self.batch.emit(limit);
        self.batch.emit(offset);
        self.state.drawrect = Some((limit, offset));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordingBatch;
    use crate::channel::Filter;
    use crate::{Color, Device, DeviceConfig, PixelFormat};

    fn device() -> Device<RecordingBatch> {
        Device::new(RecordingBatch::new(), DeviceConfig::default())
    }

    #[test]
    fn test_redundant_binds_are_skipped() {
        let mut dev = device();
        let blend = (BlendFactor::One, BlendFactor::InvSrcAlpha);
        assert!(dev.bind_blend(blend));
        let words = dev.batch.words().len();
        assert!(!dev.bind_blend(blend));
        assert_eq!(dev.batch.words().len(), words);
        assert!(dev.bind_blend((BlendFactor::One, BlendFactor::One)));
    }

    #[test]
    fn test_invalidate_forces_rebind() {
        let mut dev = device();
        assert!(dev.bind_kernel(WmKernel::NoMaskAffine));
        dev.state.invalidate();
        assert!(dev.bind_kernel(WmKernel::NoMaskAffine));
    }

    #[test]
    fn test_begin_batch_emits_invariant_once() {
        let mut dev = device();
        dev.begin_batch(16, 0);
        dev.begin_batch(16, 0);
        let invariants = dev
            .batch
            .words()
            .iter()
            .filter(|w| cmd::opcode(**w) == cmd::STATE_INVARIANT)
            .count();
        assert_eq!(invariants, 1);
    }

    #[test]
    fn test_surface_tuple_cached() {
        let mut dev = device();
        let bo = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        let target = RenderTarget {
            buffer: bo,
            format: PixelFormat::Argb8888,
            width: 64,
            height: 64,
            pitch: 256,
            origin: (0, 0),
        };
        let src = dev.solid_channel(Color::WHITE).unwrap();
        assert!(dev.bind_surfaces(&target, Some(&src), None));
        assert!(!dev.bind_surfaces(&target, Some(&src), None));
        let other = dev.solid_channel(Color::BLACK).unwrap();
        assert!(dev.bind_surfaces(&target, Some(&other), None));
    }

    #[test]
    fn test_sampler_key_packs_channels() {
        let mut dev = device();
        let mut a = dev.solid_channel(Color::WHITE).unwrap();
        let b = dev.solid_channel(Color::WHITE).unwrap();
        assert_eq!(sampler_key(Some(&a), None), sampler_key(Some(&b), None));
        a.filter = Filter::Bilinear;
        assert_ne!(sampler_key(Some(&a), None), sampler_key(Some(&b), None));
        let mut fixed = dev.solid_channel(Color::WHITE).unwrap();
        fixed.alpha_fixup = true;
        assert_ne!(
            sampler_key(Some(&fixed), None),
            sampler_key(Some(&b), None)
        );
    }
}
