//! Tiling fallback for oversized operations.
//!
//! An operation whose extent exceeds the shader pipeline's surface
//! limit collects its rectangles and, at finish, replays them through
//! one full sub-operation per tile. The tile grid steps by the 3D
//! limit and covers the extent exactly: no gaps, no double-covered
//! pixels.

use crate::batch::BatchManager;
use crate::blend::BlendOp;
use crate::channel::Picture;
use crate::composite::RenderTarget;
use crate::damage::DamageRegion;
use crate::geom::Rectangle;
use crate::{Device, RenderError};

/// A deferred, tiled composite operation.
#[derive(Debug)]
pub struct TiledComposite {
    op: BlendOp,
    src: Picture,
    mask: Option<Picture>,
    dst: RenderTarget,
    src_origin: (i16, i16),
    mask_origin: (i16, i16),
    dst_origin: (i16, i16),
    size: (i16, i16),
    rects: Vec<Rectangle>,
}

impl TiledComposite {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        op: BlendOp,
        src: Picture,
        mask: Option<Picture>,
        dst: RenderTarget,
        src_origin: (i16, i16),
        mask_origin: (i16, i16),
        dst_origin: (i16, i16),
        size: (i16, i16),
    ) -> Self {
        Self {
            op,
            src,
            mask,
            dst,
            src_origin,
            mask_origin,
            dst_origin,
            size,
            rects: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, r: Rectangle) {
        self.rects.push(r);
    }

    /// Replay the collected rectangles tile by tile. Each tile runs
    /// the full pipeline as an independent sub-operation whose extent
    /// is within hardware limits.
    pub(crate) fn finish<B: BatchManager>(
        self,
        dev: &mut Device<B>,
        mut damage: Option<&mut DamageRegion>,
    ) -> Result<(), RenderError> {
        if self.rects.is_empty() {
            return Ok(());
        }

        let step = dev.config().max_3d_size as i32;
        let (width, height) = (self.size.0 as i32, self.size.1 as i32);
        let tiles = tile_grid(width, height, step);
        log::debug!(
            "tiled composite {}x{} as {} tiles of {}",
            width,
            height,
            tiles.len(),
            step
        );

        for (x, y, w, h) in tiles {
            self.run_tile(
                dev,
                x as i16,
                y as i16,
                w as i16,
                h as i16,
                damage.as_deref_mut(),
            )?;
        }
        Ok(())
    }

    fn run_tile<B: BatchManager>(
        &self,
        dev: &mut Device<B>,
        x: i16,
        y: i16,
        tile_w: i16,
        tile_h: i16,
        mut damage: Option<&mut DamageRegion>,
    ) -> Result<(), RenderError> {
        let mut sub = dev.begin_composite(
            self.op,
            &self.src,
            self.mask.as_ref(),
            &self.dst,
            (self.src_origin.0 + x, self.src_origin.1 + y),
            (self.mask_origin.0 + x, self.mask_origin.1 + y),
            (self.dst_origin.0 + x, self.dst_origin.1 + y),
            (tile_w, tile_h),
            None,
        )?;

        for r in &self.rects {
            if let Some(clipped) = self.clip_to_tile(r, x, y, tile_w, tile_h) {
                sub.draw_rectangle(dev, &clipped)?;
                if let Some(d) = damage.as_deref_mut() {
                    d.add_box(
                        crate::geom::Box2::from_rect(
                            clipped.dst_x,
                            clipped.dst_y,
                            clipped.width,
                            clipped.height,
                        )
                        .translate(self.dst.origin.0, self.dst.origin.1),
                    );
                }
            }
        }

        sub.finish(dev)
    }

    /// Clip one rectangle to a tile window, shifting every channel
    /// origin by the amount clipped off the leading edges.
    fn clip_to_tile(
        &self,
        r: &Rectangle,
        x: i16,
        y: i16,
        tile_w: i16,
        tile_h: i16,
    ) -> Option<Rectangle> {
        let mut x1 = r.dst_x - self.dst_origin.0;
        let mut dx = 0;
        if x1 < x {
            dx = x - x1;
            x1 = x;
        }
        let mut y1 = r.dst_y - self.dst_origin.1;
        let mut dy = 0;
        if y1 < y {
            dy = y - y1;
            y1 = y;
        }

        let mut x2 = r.dst_x + r.width - self.dst_origin.0;
        if x2 > x + tile_w {
            x2 = x + tile_w;
        }
        let mut y2 = r.dst_y + r.height - self.dst_origin.1;
        if y2 > y + tile_h {
            y2 = y + tile_h;
        }

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rectangle {
            src_x: r.src_x + dx,
            src_y: r.src_y + dy,
            mask_x: r.mask_x + dx,
            mask_y: r.mask_y + dy,
            dst_x: r.dst_x + dx,
            dst_y: r.dst_y + dy,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// Exact tile grid over a `width x height` extent with tile limit
/// `step`: `ceil(w/step) * ceil(h/step)` tiles covering every pixel
/// exactly once.
pub fn tile_grid(width: i32, height: i32, step: i32) -> Vec<(i32, i32, i32, i32)> {
    let mut tiles = Vec::new();
    let mut y = 0;
    while y < height {
        let h = step.min(height - y);
        let mut x = 0;
        while x < width {
            let w = step.min(width - x);
            tiles.push((x, y, w, h));
            x += step;
        }
        y += step;
    }
    tiles
}
