//! Lumen render acceleration engine.
//!
//! This crate compiles high-level 2D operations into GPU command
//! streams for the display server. Every operation is lowered onto one
//! of two hardware paths: the fixed-function blitter (copy and fill)
//! or the shader pipeline (blending, masks, gradients, transformed
//! sampling).
//!
//! # Architecture
//!
//! The engine is organized into:
//!
//! - `batch`: the consumed batch-manager boundary (command words,
//!   relocations, buffer objects)
//! - `cmd`: the command-word vocabulary
//! - `geom`: boxes, rectangles and classified transforms
//! - `channel`: source/mask classification into channels
//! - `gradient`: solid-color and gradient-ramp caches
//! - `blend`: operator tables and blend-factor derivation
//! - `kernel`: shader kernel selection matrix
//! - `vertex`: the vertex accumulator
//! - `emit`: per-channel-combination rectangle emitters
//! - `state`: the device render-state cache
//! - `blt`: the blitter engine
//! - `pipeline`: path selection, tiling and two-pass decisions
//! - `composite`: the operation facade (composite, fill, copy)
//! - `tiling`: oversized-operation decomposition
//! - `glyph`: the glyph atlas cache
//! - `damage`: damage reporting at the facade boundary

pub mod batch;
pub mod blend;
pub mod blt;
pub mod channel;
pub mod cmd;
pub mod composite;
pub mod damage;
pub mod emit;
pub mod geom;
pub mod glyph;
pub mod gradient;
pub mod kernel;
pub mod pipeline;
pub mod state;
pub mod tiling;
pub mod vertex;

use batch::BatchManager;
use glyph::GlyphCaches;
use gradient::{GradientCache, SolidCache};
use state::RenderState;
use vertex::VertexAccumulator;

/// Render engine error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    /// The operator/format/size combination is not expressible by
    /// either hardware path; the caller should composite in software.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Command space, relocation slots or a buffer allocation ran out
    /// and a forced submit did not recover it.
    #[error("resources exhausted: {0}")]
    Exhausted(String),
    /// The request was malformed and rejected before any device state
    /// was touched.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl RenderError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::Exhausted(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}

/// Pixel formats of surfaces handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit alpha only.
    A8,
    /// ARGB, 8 bits per channel.
    Argb8888,
    /// RGB, 8 bits per channel, alpha bits unused.
    Xrgb8888,
    /// ABGR, 8 bits per channel.
    Abgr8888,
    /// BGR, 8 bits per channel, alpha bits unused.
    Xbgr8888,
    /// RGB 5-6-5.
    Rgb565,
    /// ARGB 1-5-5-5.
    Argb1555,
    /// RGB 5-5-5, alpha bit unused.
    Xrgb1555,
    /// ARGB 2-10-10-10.
    Argb2101010,
    /// RGB 10-10-10, alpha bits unused.
    Xrgb2101010,
    /// ARGB 4-4-4-4.
    Argb4444,
    /// RGB 4-4-4, alpha bits unused.
    Xrgb4444,
}

/// Per-channel bit layout: (shift, width).
struct FormatInfo {
    bpp: u32,
    a: (u32, u32),
    r: (u32, u32),
    g: (u32, u32),
    b: (u32, u32),
}

impl PixelFormat {
    fn info(self) -> FormatInfo {
        use PixelFormat::*;
        match self {
            A8 => FormatInfo { bpp: 8, a: (0, 8), r: (0, 0), g: (0, 0), b: (0, 0) },
            Argb8888 => FormatInfo { bpp: 32, a: (24, 8), r: (16, 8), g: (8, 8), b: (0, 8) },
            Xrgb8888 => FormatInfo { bpp: 32, a: (0, 0), r: (16, 8), g: (8, 8), b: (0, 8) },
            Abgr8888 => FormatInfo { bpp: 32, a: (24, 8), r: (0, 8), g: (8, 8), b: (16, 8) },
            Xbgr8888 => FormatInfo { bpp: 32, a: (0, 0), r: (0, 8), g: (8, 8), b: (16, 8) },
            Rgb565 => FormatInfo { bpp: 16, a: (0, 0), r: (11, 5), g: (5, 6), b: (0, 5) },
            Argb1555 => FormatInfo { bpp: 16, a: (15, 1), r: (10, 5), g: (5, 5), b: (0, 5) },
            Xrgb1555 => FormatInfo { bpp: 16, a: (0, 0), r: (10, 5), g: (5, 5), b: (0, 5) },
            Argb2101010 => FormatInfo { bpp: 32, a: (30, 2), r: (20, 10), g: (10, 10), b: (0, 10) },
            Xrgb2101010 => FormatInfo { bpp: 32, a: (0, 0), r: (20, 10), g: (10, 10), b: (0, 10) },
            Argb4444 => FormatInfo { bpp: 16, a: (12, 4), r: (8, 4), g: (4, 4), b: (0, 4) },
            Xrgb4444 => FormatInfo { bpp: 16, a: (0, 0), r: (8, 4), g: (4, 4), b: (0, 4) },
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        self.info().bpp
    }

    pub fn bytes_per_pixel(self) -> u32 {
        self.info().bpp / 8
    }

    /// Color depth: bits carrying channel information.
    pub fn depth(self) -> u32 {
        let i = self.info();
        i.a.1 + i.r.1 + i.g.1 + i.b.1
    }

    pub fn has_alpha(self) -> bool {
        self.info().a.1 != 0
    }
}

/// A normalized 4-channel color, not premultiplied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 0.0 };
    pub const BLACK: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn is_opaque(&self) -> bool {
        self.a >= 1.0
    }

    fn channel_from_bits(pixel: u32, (shift, width): (u32, u32), default: f32) -> f32 {
        if width == 0 {
            return default;
        }
        let max = (1u32 << width) - 1;
        let v = (pixel >> shift) & max;
        v as f32 / max as f32
    }

    fn channel_to_bits(value: f32, (shift, width): (u32, u32)) -> u32 {
        if width == 0 {
            return 0;
        }
        let max = (1u32 << width) - 1;
        let v = (value.clamp(0.0, 1.0) * max as f32).round() as u32;
        v << shift
    }

    /// Decode a pixel value. Missing channels read as their natural
    /// default (alpha 1, color 0).
    pub fn from_pixel(pixel: u32, format: PixelFormat) -> Self {
        let i = format.info();
        Self {
            a: Self::channel_from_bits(pixel, i.a, 1.0),
            r: Self::channel_from_bits(pixel, i.r, 0.0),
            g: Self::channel_from_bits(pixel, i.g, 0.0),
            b: Self::channel_from_bits(pixel, i.b, 0.0),
        }
    }

    /// Encode into a pixel value of `format`.
    pub fn to_pixel(&self, format: PixelFormat) -> u32 {
        let i = format.info();
        Self::channel_to_bits(self.a, i.a)
            | Self::channel_to_bits(self.r, i.r)
            | Self::channel_to_bits(self.g, i.g)
            | Self::channel_to_bits(self.b, i.b)
    }

    /// Canonical ARGB8888 value, used as the solid-cache key.
    pub fn to_argb8888(&self) -> u32 {
        self.to_pixel(PixelFormat::Argb8888)
    }
}

/// Hardware limits supplied by the platform layer.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Maximum width/height the blitter can address.
    pub max_2d_size: u16,
    /// Maximum width/height the shader pipeline can render or sample.
    pub max_3d_size: u16,
    /// Maximum blitter pitch in bytes.
    pub max_blt_pitch: u32,
    /// Vertex accumulator capacity in floats.
    pub vertex_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_2d_size: 32767,
            max_3d_size: 8192,
            max_blt_pitch: 32768,
            vertex_capacity: vertex::DEFAULT_CAPACITY,
        }
    }
}

/// The device render context.
///
/// Owns all mutable engine state for one GPU context: the batch
/// manager connection, the render-state cache, the vertex accumulator
/// and the solid/gradient/glyph caches. Single-threaded by design; a
/// compositor owns exactly one `Device` per GPU.
pub struct Device<B: BatchManager> {
    pub(crate) batch: B,
    pub(crate) state: RenderState,
    pub(crate) vertices: VertexAccumulator,
    pub(crate) solids: SolidCache,
    pub(crate) gradients: GradientCache,
    pub(crate) glyphs: GlyphCaches,
    pub(crate) config: DeviceConfig,
}

impl<B: BatchManager> Device<B> {
    pub fn new(batch: B, config: DeviceConfig) -> Self {
        Self {
            batch,
            state: RenderState::new(),
            vertices: VertexAccumulator::with_capacity(config.vertex_capacity),
            solids: SolidCache::new(),
            gradients: GradientCache::new(),
            glyphs: GlyphCaches::new(),
            config,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn batch(&self) -> &B {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut B {
        &mut self.batch
    }

    /// Tear down the context, dropping cache references.
    pub fn fini(&mut self) {
        self.solids.clear(&mut self.batch);
        self.gradients.clear(&mut self.batch);
        self.glyphs.clear(&mut self.batch);
    }
}
