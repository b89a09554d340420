//! Blitter engine.
//!
//! The fixed-function 2D path: solid fills and screen-to-screen copies
//! with a raster operation, no blending and no sampling. Cheaper than
//! the shader pipeline and not bound by its surface-size limit, but
//! restricted to copy/clear-style operators on depth-compatible
//! surfaces within the blitter's pitch limit.

use crate::batch::{BatchManager, BufferHandle, Domain, Ring};
use crate::cmd;
use crate::geom::Box2;
use crate::{Device, PixelFormat, RenderError};

/// Raster operations exposed at the copy boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    /// Destination := 0.
    Clear,
    /// Destination := source (or fill color).
    Copy,
}

impl Alu {
    /// Rop byte for fill commands.
    pub fn fill_rop(self) -> u8 {
        match self {
            Alu::Clear => 0x00,
            Alu::Copy => 0xf0,
        }
    }

    /// Rop byte for copy commands.
    pub fn copy_rop(self) -> u8 {
        match self {
            Alu::Clear => 0x00,
            Alu::Copy => 0xcc,
        }
    }
}

fn strip_alpha(format: PixelFormat) -> PixelFormat {
    use PixelFormat::*;
    match format {
        Argb8888 => Xrgb8888,
        Abgr8888 => Xbgr8888,
        Argb1555 => Xrgb1555,
        Argb2101010 => Xrgb2101010,
        Argb4444 => Xrgb4444,
        other => other,
    }
}

/// Copy compatibility: same pixel size and the same channel layout up
/// to the presence of alpha bits the destination ignores.
pub fn compare_depth(a: PixelFormat, b: PixelFormat) -> bool {
    a.bits_per_pixel() == b.bits_per_pixel() && strip_alpha(a) == strip_alpha(b)
}

fn br13(rop: u8, cpp: u32, pitch: u32) -> u32 {
    (rop as u32) << 24 | (cpp * 8) << 16 | (pitch & 0xffff)
}

impl<B: BatchManager> Device<B> {
    /// Move to the requested engine, draining the open batch first so
    /// accumulated work is never carried across a ring switch.
    pub(crate) fn switch_ring(&mut self, ring: Ring) {
        if self.batch.ring() != ring {
            log::debug!("switching ring to {:?}", ring);
            self.submit_batch();
            self.batch.set_ring(ring);
        }
    }

    /// Reserve blitter command room, forcing one submit if the open
    /// batch is full. A second failure is a real exhaustion.
    pub(crate) fn blt_room(&mut self, words: usize, relocs: usize) -> Result<(), RenderError> {
        if self.batch.reserve_command_space(words) && self.batch.reserve_relocations(relocs) {
            return Ok(());
        }
        self.submit_batch();
        if self.batch.reserve_command_space(words) && self.batch.reserve_relocations(relocs) {
            Ok(())
        } else {
            Err(RenderError::exhausted("blt command space"))
        }
    }

    /// Within blitter limits for one surface.
    pub(crate) fn blt_able(&self, width: u16, height: u16, pitch: u32) -> bool {
        width <= self.config.max_2d_size
            && height <= self.config.max_2d_size
            && pitch <= self.config.max_blt_pitch
    }

    /// Emit one fill rectangle, in destination-surface coordinates.
    pub(crate) fn blt_fill_one(
        &mut self,
        dst: BufferHandle,
        dst_pitch: u32,
        cpp: u32,
        rop: u8,
        pixel: u32,
        b: &Box2,
    ) -> Result<(), RenderError> {
        self.switch_ring(Ring::Blt);
        self.blt_room(6, 1)?;
        self.batch.emit(cmd::with_len(cmd::BLT_FILL, 6));
        self.batch.emit(br13(rop, cpp, dst_pitch));
        self.batch.emit(cmd::xy(b.x1, b.y1));
        self.batch.emit(cmd::xy(b.x2, b.y2));
        let at = self.batch.position();
        let addr = self
            .batch
            .add_relocation(at, Some(dst), 0, Domain::BLT | Domain::WRITE);
        self.batch.emit(addr);
        self.batch.emit(pixel);
        Ok(())
    }

    /// Fill a box list with a raw pixel value.
    pub(crate) fn blt_fill_boxes(
        &mut self,
        dst: BufferHandle,
        dst_pitch: u32,
        cpp: u32,
        rop: u8,
        pixel: u32,
        origin: (i16, i16),
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        log::debug!("blt fill {:08x} x {} boxes", pixel, boxes.len());
        for b in boxes {
            if b.is_empty() {
                continue;
            }
            self.blt_fill_one(dst, dst_pitch, cpp, rop, pixel, &b.translate(origin.0, origin.1))?;
        }
        Ok(())
    }

    /// Emit one copy rectangle between surfaces.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn blt_copy_raw(
        &mut self,
        src: BufferHandle,
        src_pitch: u32,
        src_origin: (i16, i16),
        dst: BufferHandle,
        dst_pitch: u32,
        dst_origin: (i16, i16),
        size: (i16, i16),
        cpp: u32,
    ) -> Result<(), RenderError> {
        self.switch_ring(Ring::Blt);
        self.blt_room(8, 2)?;
        self.batch.emit(cmd::with_len(cmd::BLT_COPY, 8));
        self.batch.emit(br13(Alu::Copy.copy_rop(), cpp, dst_pitch));
        self.batch.emit(cmd::xy(dst_origin.0, dst_origin.1));
        self.batch
            .emit(cmd::xy(dst_origin.0 + size.0, dst_origin.1 + size.1));
        let at = self.batch.position();
        let addr = self
            .batch
            .add_relocation(at, Some(dst), 0, Domain::BLT | Domain::WRITE);
        self.batch.emit(addr);
        self.batch.emit(cmd::xy(src_origin.0, src_origin.1));
        self.batch.emit(src_pitch & 0xffff);
        let at = self.batch.position();
        let addr = self.batch.add_relocation(at, Some(src), 0, Domain::BLT);
        self.batch.emit(addr);
        Ok(())
    }

    /// Copy a box list between surfaces, offsetting each box by the
    /// per-surface deltas.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn blt_copy_boxes(
        &mut self,
        src: BufferHandle,
        src_pitch: u32,
        src_delta: (i16, i16),
        dst: BufferHandle,
        dst_pitch: u32,
        dst_delta: (i16, i16),
        cpp: u32,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        log::debug!("blt copy x {} boxes", boxes.len());
        for b in boxes {
            if b.is_empty() {
                continue;
            }
            self.blt_copy_raw(
                src,
                src_pitch,
                (b.x1 + src_delta.0, b.y1 + src_delta.1),
                dst,
                dst_pitch,
                (b.x1 + dst_delta.0, b.y1 + dst_delta.1),
                (b.width(), b.height()),
                cpp,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordingBatch;
    use crate::DeviceConfig;

    fn device() -> Device<RecordingBatch> {
        Device::new(RecordingBatch::new(), DeviceConfig::default())
    }

    fn count_ops(batch: &RecordingBatch, op: u32) -> usize {
        batch
            .submitted()
            .iter()
            .flat_map(|b| b.words.iter())
            .chain(batch.words().iter())
            .filter(|w| cmd::opcode(**w) == op)
            .count()
    }

    #[test]
    fn test_depth_compatibility() {
        assert!(compare_depth(PixelFormat::Argb8888, PixelFormat::Argb8888));
        assert!(compare_depth(PixelFormat::Argb8888, PixelFormat::Xrgb8888));
        assert!(!compare_depth(PixelFormat::Argb8888, PixelFormat::Abgr8888));
        assert!(!compare_depth(PixelFormat::Argb8888, PixelFormat::Rgb565));
    }

    #[test]
    fn test_fill_emits_on_blt_ring() {
        let mut dev = device();
        let bo = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        let boxes = [Box2::new(0, 0, 32, 32), Box2::new(32, 0, 64, 16)];
        dev.blt_fill_boxes(bo, 256, 4, Alu::Copy.fill_rop(), 0xff00ff00, (0, 0), &boxes)
            .unwrap();
        assert_eq!(dev.batch.ring(), Ring::Blt);
        assert_eq!(count_ops(&dev.batch, cmd::BLT_FILL), 2);
    }

    #[test]
    fn test_fill_skips_empty_boxes() {
        let mut dev = device();
        let bo = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        let boxes = [Box2::new(10, 10, 10, 20)];
        dev.blt_fill_boxes(bo, 256, 4, 0xf0, 0, (0, 0), &boxes).unwrap();
        assert_eq!(count_ops(&dev.batch, cmd::BLT_FILL), 0);
    }

    #[test]
    fn test_copy_records_two_relocations() {
        let mut dev = device();
        let src = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        let dst = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        dev.blt_copy_raw(src, 256, (0, 0), dst, 256, (8, 8), (16, 16), 4)
            .unwrap();
        assert_eq!(dev.batch.relocations().len(), 2);
        assert!(dev
            .batch
            .relocations()
            .iter()
            .any(|r| r.buffer == Some(dst) && r.domain.contains(Domain::WRITE)));
    }

    #[test]
    fn test_full_batch_submits_and_retries() {
        let mut dev = Device::new(
            RecordingBatch::with_limits(16, 64),
            DeviceConfig::default(),
        );
        let bo = dev.batch.create_buffer(64 * 64 * 4).unwrap();
        let boxes: Vec<Box2> = (0..4).map(|i| Box2::new(i, 0, i + 1, 1)).collect();
        dev.blt_fill_boxes(bo, 256, 4, 0xf0, 0, (0, 0), &boxes).unwrap();
        // 4 fills x 6 words do not fit in 16, so at least one submit
        // happened and every fill was still emitted.
        assert!(!dev.batch.submitted().is_empty());
        assert_eq!(count_ops(&dev.batch, cmd::BLT_FILL), 4);
    }
}
