//! Glyph atlas cache.
//!
//! Small glyph rasters are packed into a shared atlas texture so text
//! runs sample one surface instead of binding per glyph. Slots come in
//! power-of-two size classes; allocation is a linear cursor until the
//! atlas fills, after which a randomized eviction cursor frees whole
//! regions. One cache per mask format class: alpha-only glyphs and
//! color (subpixel) glyphs.

use std::collections::BTreeMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::batch::{BatchManager, BufferHandle};
use crate::blend::BlendOp;
use crate::channel::{Picture, SurfaceDesc};
use crate::composite::RenderTarget;
use crate::geom::Rectangle;
use crate::{Device, PixelFormat, RenderError};

/// Atlas texture dimension.
pub const ATLAS_SIZE: u16 = 1024;
/// Smallest slot dimension.
pub const GLYPH_MIN_SIZE: u16 = 8;
/// Largest glyph the atlas accepts.
pub const GLYPH_MAX_SIZE: u16 = 64;

/// Caller-assigned glyph identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlyphKey(pub u64);

/// A rasterized glyph awaiting upload.
#[derive(Debug, Clone, Copy)]
pub struct GlyphRaster {
    pub buffer: BufferHandle,
    pub format: PixelFormat,
    pub width: u16,
    pub height: u16,
    pub pitch: u32,
}

/// A glyph's position in the atlas. Valid only until the glyph is
/// evicted; re-check with `glyph_lookup` before reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphSlot {
    /// Base cell index in the cache.
    pub pos: usize,
    /// Size class the glyph occupies.
    pub size: u16,
    pub x: i16,
    pub y: i16,
}

/// Atlas format class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtlasClass {
    Alpha,
    Color,
}

impl AtlasClass {
    pub fn for_format(format: PixelFormat) -> AtlasClass {
        if format == PixelFormat::A8 {
            AtlasClass::Alpha
        } else {
            AtlasClass::Color
        }
    }

    fn pixel_format(self) -> PixelFormat {
        match self {
            AtlasClass::Alpha => PixelFormat::A8,
            AtlasClass::Color => PixelFormat::Argb8888,
        }
    }
}

/// Number of minimum-size cells a slot of `size` covers.
fn size_to_count(size: u16, min: u16) -> usize {
    let cells = (size / min) as usize;
    cells * cells
}

fn count_to_mask(count: usize) -> usize {
    !(count - 1)
}

fn size_to_mask(size: u16, min: u16) -> usize {
    count_to_mask(size_to_count(size, min))
}

/// One size-classed slot allocator over a shared texture.
pub struct GlyphCache {
    class: AtlasClass,
    atlas_size: u16,
    min_size: u16,
    max_size: u16,
    atlas: Option<BufferHandle>,
    /// Occupant key and size class, recorded at each slot's base cell.
    slots: Vec<Option<(GlyphKey, u16)>>,
    map: BTreeMap<GlyphKey, GlyphSlot>,
    /// Linear allocation cursor in cells.
    count: usize,
    /// Eviction cursor, re-randomized after every eviction.
    evict: usize,
    rng: SmallRng,
}

impl GlyphCache {
    pub fn new(class: AtlasClass) -> Self {
        Self::with_geometry(class, ATLAS_SIZE, GLYPH_MIN_SIZE, GLYPH_MAX_SIZE)
    }

    /// Cache over a custom atlas geometry (tests shrink it so the
    /// eviction paths are reachable quickly).
    pub fn with_geometry(class: AtlasClass, atlas_size: u16, min_size: u16, max_size: u16) -> Self {
        let cells = (atlas_size as usize / min_size as usize).pow(2);
        Self {
            class,
            atlas_size,
            min_size,
            max_size,
            atlas: None,
            slots: vec![None; cells],
            map: BTreeMap::new(),
            count: 0,
            evict: 0,
            rng: SmallRng::seed_from_u64(class as u64),
        }
    }

    fn cells(&self) -> usize {
        self.slots.len()
    }

    /// Coordinates of a cell index: blocks of max-size slots walk the
    /// atlas row-major, and inside a block two index bits per level
    /// select the quadrant offset.
    fn slot_coordinates(&self, pos: usize) -> (i16, i16) {
        let per_block = size_to_count(self.max_size, self.min_size);
        let block = pos / per_block;
        let blocks_per_row = (self.atlas_size / self.max_size) as usize;
        let mut x = (block % blocks_per_row) as i16 * self.max_size as i16;
        let mut y = (block / blocks_per_row) as i16 * self.max_size as i16;

        let mut p = pos;
        let mut s = self.min_size as i16;
        while (s as u16) < self.max_size {
            if p & 1 != 0 {
                x += s;
            }
            if p & 2 != 0 {
                y += s;
            }
            p >>= 2;
            s *= 2;
        }
        (x, y)
    }

    /// Slot size class for a glyph, if it fits the atlas at all.
    fn size_class(&self, width: u16, height: u16) -> Option<u16> {
        if width > self.max_size || height > self.max_size {
            return None;
        }
        let mut size = self.min_size;
        while width > size || height > size {
            size *= 2;
        }
        Some(size)
    }

    /// Drop every occupant recorded in `[base, base + count)`.
    fn clear_region(&mut self, base: usize, count: usize) {
        for cell in base..base + count {
            if let Some((key, _)) = self.slots[cell].take() {
                self.map.remove(&key);
            }
        }
    }

    /// Allocate a slot for a glyph, evicting if the linear cursor is
    /// spent. Returns `None` for glyphs larger than the atlas accepts.
    pub fn place(&mut self, key: GlyphKey, width: u16, height: u16) -> Option<GlyphSlot> {
        let size = self.size_class(width, height)?;
        let count = size_to_count(size, self.min_size);
        let mask = count_to_mask(count);

        let mut pos = (self.count + count - 1) & mask;
        if pos + count <= self.cells() {
            self.count = pos + count;
        } else {
            // Walk size classes upward from the eviction cursor: an
            // aligned occupant at least as large frees exactly the
            // region we need; otherwise clear every smaller occupant
            // inside it.
            let mut freed = false;
            let mut s = size;
            while s <= self.max_size {
                let i = self.evict & size_to_mask(s, self.min_size);
                if let Some((_, occupant_size)) = self.slots[i] {
                    if occupant_size >= s {
                        self.clear_region(i, size_to_count(occupant_size, self.min_size));
                        pos = i;
                        freed = true;
                    }
                    break;
                }
                s *= 2;
            }
            if !freed {
                pos = self.evict & mask;
                self.clear_region(pos, count);
            }
            log::debug!("glyph cache eviction at cell {}", pos);
            self.evict = self.rng.gen_range(0..self.cells());
        }

        // Replacing a still-cached glyph frees its old slot.
        if let Some(old) = self.map.remove(&key) {
            self.slots[old.pos] = None;
        }

        let (x, y) = self.slot_coordinates(pos);
        let slot = GlyphSlot { pos, size, x, y };
        self.slots[pos] = Some((key, size));
        self.map.insert(key, slot);
        Some(slot)
    }

    /// The glyph's current slot, if it has not been evicted.
    pub fn lookup(&self, key: GlyphKey) -> Option<GlyphSlot> {
        self.map.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear<B: BatchManager>(&mut self, batch: &mut B) {
        if let Some(atlas) = self.atlas.take() {
            batch.release(atlas);
        }
        self.slots.iter_mut().for_each(|s| *s = None);
        self.map.clear();
        self.count = 0;
    }
}

/// The per-device pair of glyph caches.
pub struct GlyphCaches {
    alpha: GlyphCache,
    color: GlyphCache,
}

impl GlyphCaches {
    pub fn new() -> Self {
        Self {
            alpha: GlyphCache::new(AtlasClass::Alpha),
            color: GlyphCache::new(AtlasClass::Color),
        }
    }

    pub fn cache(&self, class: AtlasClass) -> &GlyphCache {
        match class {
            AtlasClass::Alpha => &self.alpha,
            AtlasClass::Color => &self.color,
        }
    }

    pub fn cache_mut(&mut self, class: AtlasClass) -> &mut GlyphCache {
        match class {
            AtlasClass::Alpha => &mut self.alpha,
            AtlasClass::Color => &mut self.color,
        }
    }

    pub fn clear<B: BatchManager>(&mut self, batch: &mut B) {
        self.alpha.clear(batch);
        self.color.clear(batch);
    }
}

impl Default for GlyphCaches {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: BatchManager> Device<B> {
    fn glyph_atlas_target(&mut self, class: AtlasClass) -> Result<RenderTarget, RenderError> {
        let format = class.pixel_format();
        let (size, existing) = {
            let cache = self.glyphs.cache(class);
            (cache.atlas_size, cache.atlas)
        };
        let pitch = size as u32 * format.bytes_per_pixel();
        let buffer = match existing {
            Some(bo) => bo,
            None => {
                let bo = self.batch.create_buffer(pitch as usize * size as usize)?;
                self.glyphs.cache_mut(class).atlas = Some(bo);
                bo
            }
        };
        Ok(RenderTarget {
            buffer,
            format,
            width: size,
            height: size,
            pitch,
            origin: (0, 0),
        })
    }

    /// The glyph's current atlas slot, if still cached.
    pub fn glyph_lookup(&self, class: AtlasClass, key: GlyphKey) -> Option<GlyphSlot> {
        self.glyphs.cache(class).lookup(key)
    }

    /// Place a glyph in its atlas and composite its raster into the
    /// slot. Returns `None` for glyphs too large to cache; the caller
    /// composites those directly from their own surface.
    pub fn glyph_place(
        &mut self,
        key: GlyphKey,
        raster: &GlyphRaster,
    ) -> Result<Option<GlyphSlot>, RenderError> {
        let class = AtlasClass::for_format(raster.format);
        let Some(slot) = self
            .glyphs
            .cache_mut(class)
            .place(key, raster.width, raster.height)
        else {
            log::debug!(
                "glyph {}x{} too large for atlas",
                raster.width,
                raster.height
            );
            return Ok(None);
        };

        let target = self.glyph_atlas_target(class)?;
        let picture = Picture::surface(SurfaceDesc {
            buffer: raster.buffer,
            format: raster.format,
            width: raster.width,
            height: raster.height,
            pitch: raster.pitch,
            pixel: None,
        });
        let mut upload = self.begin_composite(
            BlendOp::Src,
            &picture,
            None,
            &target,
            (0, 0),
            (0, 0),
            (slot.x, slot.y),
            (raster.width as i16, raster.height as i16),
            None,
        )?;
        upload.draw_rectangle(
            self,
            &Rectangle {
                src_x: slot.x,
                src_y: slot.y,
                mask_x: slot.x,
                mask_y: slot.y,
                dst_x: slot.x,
                dst_y: slot.y,
                width: raster.width as i16,
                height: raster.height as i16,
            },
        )?;
        upload.finish(self)?;

        Ok(Some(slot))
    }

    /// The atlas surface for compositing cached glyphs, once any glyph
    /// has been uploaded to it.
    pub fn glyph_atlas_surface(&self, class: AtlasClass) -> Option<SurfaceDesc> {
        let cache = self.glyphs.cache(class);
        let format = class.pixel_format();
        cache.atlas.map(|buffer| SurfaceDesc {
            buffer,
            format,
            width: cache.atlas_size,
            height: cache.atlas_size,
            pitch: cache.atlas_size as u32 * format.bytes_per_pixel(),
            pixel: None,
        })
    }
}
