//! Solid-color and gradient-ramp caches.
//!
//! Solid sources sample a cached 1x1 texture; gradient sources sample
//! a cached 1-D ramp and evaluate their parameter from shader
//! constants. Both caches hold one reference per entry and hand out an
//! additional reference per lookup, so entries survive the operations
//! that use them and are torn down on device reset.

use std::collections::BTreeMap;

use crate::batch::{BatchManager, BufferHandle};
use crate::{Color, RenderError};

/// Width of a gradient ramp in texels.
pub const RAMP_WIDTH: usize = 1024;

const SOLID_CACHE_SIZE: usize = 32;
const GRADIENT_CACHE_SIZE: usize = 16;

/// One color stop of a gradient, offset in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientStop {
    pub offset: f32,
    pub color: Color,
}

/// Parametric gradient coefficients, carried as shader constants.
///
/// Linear: `t = P . (dx, dy) - offset`, pre-scaled so t runs 0..1
/// between the end points. Radial: `t = |P - (cx, cy)| * inv_radius`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientCoefficients {
    Linear { dx: f32, dy: f32, offset: f32 },
    Radial { cx: f32, cy: f32, inv_radius: f32 },
}

impl GradientCoefficients {
    /// Derive linear coefficients from the end points.
    pub fn linear(p0: (f32, f32), p1: (f32, f32)) -> Option<Self> {
        let vx = p1.0 - p0.0;
        let vy = p1.1 - p0.1;
        let len2 = vx * vx + vy * vy;
        if len2 == 0.0 {
            return None;
        }
        let dx = vx / len2;
        let dy = vy / len2;
        Some(Self::Linear {
            dx,
            dy,
            offset: p0.0 * dx + p0.1 * dy,
        })
    }

    /// Derive radial coefficients from center and radius.
    pub fn radial(center: (f32, f32), radius: f32) -> Option<Self> {
        if radius <= 0.0 {
            return None;
        }
        Some(Self::Radial {
            cx: center.0,
            cy: center.1,
            inv_radius: 1.0 / radius,
        })
    }

    /// The constant words emitted with `STATE_CONSTANTS`.
    pub fn to_words(&self) -> [u32; 4] {
        match *self {
            Self::Linear { dx, dy, offset } => {
                [dx.to_bits(), dy.to_bits(), offset.to_bits(), 0]
            }
            Self::Radial { cx, cy, inv_radius } => {
                [cx.to_bits(), cy.to_bits(), inv_radius.to_bits(), 0]
            }
        }
    }
}

fn premultiplied_argb(color: &Color) -> u32 {
    let p = Color {
        r: color.r * color.a,
        g: color.g * color.a,
        b: color.b * color.a,
        a: color.a,
    };
    p.to_argb8888()
}

/// Cache of 1x1 solid-color buffers keyed by premultiplied ARGB.
pub struct SolidCache {
    entries: BTreeMap<u32, BufferHandle>,
}

impl SolidCache {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// A 1x1 buffer holding `color`; the returned handle carries a
    /// reference the caller must release.
    pub fn get<B: BatchManager>(
        &mut self,
        batch: &mut B,
        color: &Color,
    ) -> Result<BufferHandle, RenderError> {
        let pixel = premultiplied_argb(color);
        if let Some(&bo) = self.entries.get(&pixel) {
            batch.retain(bo);
            return Ok(bo);
        }

        if self.entries.len() >= SOLID_CACHE_SIZE {
            log::debug!("solid cache full, recycling {} entries", self.entries.len());
            self.clear(batch);
        }

        let bo = batch.create_buffer(4)?;
        batch.write_buffer(bo, 0, &pixel.to_le_bytes())?;
        batch.retain(bo);
        self.entries.insert(pixel, bo);
        Ok(bo)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear<B: BatchManager>(&mut self, batch: &mut B) {
        for (_, bo) in std::mem::take(&mut self.entries) {
            batch.release(bo);
        }
    }
}

impl Default for SolidCache {
    fn default() -> Self {
        Self::new()
    }
}

type RampKey = Vec<(u32, u32)>;

/// Cache of 1-D gradient ramp buffers keyed by the stop vector.
pub struct GradientCache {
    entries: BTreeMap<RampKey, BufferHandle>,
}

impl GradientCache {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn key(stops: &[GradientStop]) -> RampKey {
        stops
            .iter()
            .map(|s| {
                (
                    (s.offset.clamp(0.0, 1.0) * 65536.0) as u32,
                    premultiplied_argb(&s.color),
                )
            })
            .collect()
    }

    /// A `RAMP_WIDTH x 1` buffer holding the interpolated stops; the
    /// returned handle carries a reference the caller must release.
    pub fn get<B: BatchManager>(
        &mut self,
        batch: &mut B,
        stops: &[GradientStop],
    ) -> Result<BufferHandle, RenderError> {
        if stops.is_empty() {
            return Err(RenderError::invalid("gradient without stops"));
        }

        let key = Self::key(stops);
        if let Some(&bo) = self.entries.get(&key) {
            batch.retain(bo);
            return Ok(bo);
        }

        if self.entries.len() >= GRADIENT_CACHE_SIZE {
            log::debug!("gradient cache full, recycling {} ramps", self.entries.len());
            self.clear(batch);
        }

        let bo = batch.create_buffer(RAMP_WIDTH * 4)?;
        batch.write_buffer(bo, 0, &build_ramp(stops))?;
        batch.retain(bo);
        self.entries.insert(key, bo);
        Ok(bo)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear<B: BatchManager>(&mut self, batch: &mut B) {
        for (_, bo) in std::mem::take(&mut self.entries) {
            batch.release(bo);
        }
    }
}

impl Default for GradientCache {
    fn default() -> Self {
        Self::new()
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Rasterize stops into a premultiplied ARGB ramp. Texels before the
/// first and after the last stop clamp to the end colors.
fn build_ramp(stops: &[GradientStop]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(RAMP_WIDTH * 4);
    let mut sorted: Vec<GradientStop> = stops.to_vec();
    sorted.sort_by(|a, b| a.offset.total_cmp(&b.offset));

    for i in 0..RAMP_WIDTH {
        let t = i as f32 / (RAMP_WIDTH - 1) as f32;
        let color = sample_stops(&sorted, t);
        bytes.extend_from_slice(&premultiplied_argb(&color).to_le_bytes());
    }
    bytes
}

fn sample_stops(stops: &[GradientStop], t: f32) -> Color {
    let first = &stops[0];
    let last = &stops[stops.len() - 1];
    if t <= first.offset {
        return first.color;
    }
    if t >= last.offset {
        return last.color;
    }
    for pair in stops.windows(2) {
        let (lo, hi) = (&pair[0], &pair[1]);
        if t <= hi.offset {
            let span = hi.offset - lo.offset;
            let f = if span > 0.0 { (t - lo.offset) / span } else { 1.0 };
            return Color {
                r: lerp(lo.color.r, hi.color.r, f),
                g: lerp(lo.color.g, hi.color.g, f),
                b: lerp(lo.color.b, hi.color.b, f),
                a: lerp(lo.color.a, hi.color.a, f),
            };
        }
    }
    last.color
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordingBatch;

    #[test]
    fn test_solid_cache_reuses_buffers() {
        let mut batch = RecordingBatch::new();
        let mut cache = SolidCache::new();
        let red = Color::new(1.0, 0.0, 0.0, 1.0);
        let a = cache.get(&mut batch, &red).unwrap();
        let b = cache.get(&mut batch, &red).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(batch.buffer_data(a).unwrap(), 0xffff_0000u32.to_le_bytes());
    }

    #[test]
    fn test_solid_cache_premultiplies() {
        let mut batch = RecordingBatch::new();
        let mut cache = SolidCache::new();
        let half = Color::new(1.0, 1.0, 1.0, 0.5);
        let bo = cache.get(&mut batch, &half).unwrap();
        let data = batch.buffer_data(bo).unwrap();
        let px = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(px, 0x8080_8080);
    }

    #[test]
    fn test_linear_coefficients() {
        let c = GradientCoefficients::linear((0.0, 0.0), (100.0, 0.0)).unwrap();
        match c {
            GradientCoefficients::Linear { dx, dy, offset } => {
                assert!((dx - 0.01).abs() < 1e-6);
                assert_eq!(dy, 0.0);
                assert_eq!(offset, 0.0);
            }
            _ => unreachable!(),
        }
        assert!(GradientCoefficients::linear((5.0, 5.0), (5.0, 5.0)).is_none());
    }

    #[test]
    fn test_ramp_interpolates_and_clamps() {
        let stops = [
            GradientStop { offset: 0.25, color: Color::BLACK },
            GradientStop { offset: 0.75, color: Color::WHITE },
        ];
        let ramp = build_ramp(&stops);
        assert_eq!(ramp.len(), RAMP_WIDTH * 4);
        // Clamped ends.
        let first = u32::from_le_bytes(ramp[0..4].try_into().unwrap());
        let last = u32::from_le_bytes(ramp[ramp.len() - 4..].try_into().unwrap());
        assert_eq!(first, 0xff00_0000);
        assert_eq!(last, 0xffff_ffff);
        // Midpoint is mid grey.
        let mid = u32::from_le_bytes(
            ramp[(RAMP_WIDTH / 2) * 4..(RAMP_WIDTH / 2) * 4 + 4]
                .try_into()
                .unwrap(),
        );
        let r = (mid >> 16) & 0xff;
        assert!((r as i32 - 128).abs() <= 2);
    }

    #[test]
    fn test_gradient_cache_keyed_by_stops() {
        let mut batch = RecordingBatch::new();
        let mut cache = GradientCache::new();
        let a = [
            GradientStop { offset: 0.0, color: Color::BLACK },
            GradientStop { offset: 1.0, color: Color::WHITE },
        ];
        let b = [
            GradientStop { offset: 0.0, color: Color::WHITE },
            GradientStop { offset: 1.0, color: Color::BLACK },
        ];
        let ra = cache.get(&mut batch, &a).unwrap();
        let rb = cache.get(&mut batch, &b).unwrap();
        let ra2 = cache.get(&mut batch, &a).unwrap();
        assert_ne!(ra, rb);
        assert_eq!(ra, ra2);
        assert_eq!(cache.len(), 2);
    }
}
