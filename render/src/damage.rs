//! Damage tracking at the operation boundary.
//!
//! The display server owns real damage bookkeeping; the engine only
//! needs to report which destination pixels an operation touched, and
//! to elide that reporting when the operation is known to rewrite the
//! whole target anyway.

use crate::geom::Box2;

/// A bounded union of damaged boxes on one render target.
#[derive(Debug, Default)]
pub struct DamageRegion {
    boxes: Vec<Box2>,
    /// Set once the whole target is known dirty; individual boxes are
    /// no longer recorded past this point.
    all: bool,
}

impl DamageRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_box(&mut self, b: Box2) {
        if self.all || b.is_empty() {
            return;
        }
        self.boxes.push(b);
    }

    /// Mark the entire target dirty.
    pub fn add_all(&mut self) {
        self.all = true;
        self.boxes.clear();
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.boxes.is_empty()
    }

    pub fn boxes(&self) -> &[Box2] {
        &self.boxes
    }

    /// Bounding-box containment test used to decide whether an
    /// operation covering `extent` makes per-rectangle reporting
    /// redundant. This is a containment heuristic, not an exact
    /// coverage computation.
    pub fn covers(extent: &Box2, target_width: i16, target_height: i16) -> bool {
        extent.x1 <= 0
            && extent.y1 <= 0
            && extent.x2 >= target_width
            && extent.y2 >= target_height
    }
}
