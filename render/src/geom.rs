//! Geometry primitives.
//!
//! This module provides the integer boxes, composite rectangles and 3x3
//! transforms used throughout the render pipeline. Transforms carry a
//! classification so the rest of the engine can pick cheaper paths for
//! trivial cases (identity sampling, integer translation, affine).

/// An axis-aligned pixel box, half-open: `[x1, x2) x [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Box2 {
    pub x1: i16,
    pub y1: i16,
    pub x2: i16,
    pub y2: i16,
}

impl Box2 {
    pub fn new(x1: i16, y1: i16, x2: i16, y2: i16) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box spanning `width x height` pixels at `(x, y)`.
    pub fn from_rect(x: i16, y: i16, width: i16, height: i16) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub fn width(&self) -> i16 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i16 {
        self.y2 - self.y1
    }

    /// True if the box covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn translate(&self, dx: i16, dy: i16) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    pub fn intersect(&self, other: &Box2) -> Self {
        Self {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        }
    }

    /// True if `other` lies entirely within this box.
    pub fn contains(&self, other: &Box2) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }
}

/// One rectangle of a composite request: per-channel sample origins plus
/// the destination origin and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub src_x: i16,
    pub src_y: i16,
    pub mask_x: i16,
    pub mask_y: i16,
    pub dst_x: i16,
    pub dst_y: i16,
    pub width: i16,
    pub height: i16,
}

impl Rectangle {
    /// A rectangle whose source and mask origins coincide with the
    /// destination box, as used by the box-list entry points.
    pub fn from_box(b: &Box2) -> Self {
        Self {
            src_x: b.x1,
            src_y: b.y1,
            mask_x: b.x1,
            mask_y: b.y1,
            dst_x: b.x1,
            dst_y: b.y1,
            width: b.width(),
            height: b.height(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Transform triviality class, ordered from cheapest to most general.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransformClass {
    Identity,
    Translation,
    UniformScale,
    ScaleTranslation,
    Affine,
    Projective,
}

impl TransformClass {
    /// Projective channels carry a homogeneous w and divide by it before
    /// sampling; everything below skips the divide.
    pub fn is_affine(self) -> bool {
        self != TransformClass::Projective
    }
}

/// A row-major 3x3 transform mapping destination pixels to sample space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub m: [[f32; 3]; 3],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    pub fn translation(dx: f32, dy: f32) -> Self {
        Self {
            m: [[1.0, 0.0, dx], [0.0, 1.0, dy], [0.0, 0.0, 1.0]],
        }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            m: [[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    pub fn classify(&self) -> TransformClass {
        let m = &self.m;
        if m[2][0] != 0.0 || m[2][1] != 0.0 || m[2][2] != 1.0 {
            return TransformClass::Projective;
        }
        if m[0][1] != 0.0 || m[1][0] != 0.0 {
            return TransformClass::Affine;
        }
        let translated = m[0][2] != 0.0 || m[1][2] != 0.0;
        if m[0][0] == 1.0 && m[1][1] == 1.0 {
            if translated {
                TransformClass::Translation
            } else {
                TransformClass::Identity
            }
        } else if translated {
            TransformClass::ScaleTranslation
        } else if m[0][0] == m[1][1] {
            TransformClass::UniformScale
        } else {
            TransformClass::ScaleTranslation
        }
    }

    pub fn is_affine(&self) -> bool {
        self.classify().is_affine()
    }

    /// The translation in whole pixels, if the transform is nothing but
    /// one. Folding such a transform into the sample offset lets the
    /// channel drop the matrix and sample with the nearest filter.
    pub fn integer_translation(&self) -> Option<(i16, i16)> {
        match self.classify() {
            TransformClass::Identity => Some((0, 0)),
            TransformClass::Translation => {
                let dx = self.m[0][2];
                let dy = self.m[1][2];
                if dx.fract() == 0.0 && dy.fract() == 0.0 {
                    Some((dx as i16, dy as i16))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Map a point, resolving the homogeneous divide. Returns the input
    /// unchanged for a degenerate (w == 0) projective point.
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        match self.apply_3d(x, y) {
            Some((tx, ty, w)) if w != 0.0 => (tx / w, ty / w),
            _ => (x, y),
        }
    }

    /// Map a point keeping the homogeneous w, for projective emitters.
    pub fn apply_3d(&self, x: f32, y: f32) -> Option<(f32, f32, f32)> {
        let m = &self.m;
        let tx = m[0][0] * x + m[0][1] * y + m[0][2];
        let ty = m[1][0] * x + m[1][1] * y + m[1][2];
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w == 0.0 {
            None
        } else {
            Some((tx, ty, w))
        }
    }

    /// Axis-aligned bounds of a box under this transform, rounded
    /// outward to whole pixels.
    pub fn bounds(&self, b: &Box2) -> Box2 {
        let corners = [
            (b.x1 as f32, b.y1 as f32),
            (b.x2 as f32, b.y1 as f32),
            (b.x1 as f32, b.y2 as f32),
            (b.x2 as f32, b.y2 as f32),
        ];
        let mut x1 = f32::MAX;
        let mut y1 = f32::MAX;
        let mut x2 = f32::MIN;
        let mut y2 = f32::MIN;
        for (x, y) in corners {
            let (tx, ty) = self.apply(x, y);
            x1 = x1.min(tx);
            y1 = y1.min(ty);
            x2 = x2.max(tx);
            y2 = y2.max(ty);
        }
        Box2 {
            x1: x1.floor() as i16,
            y1: y1.floor() as i16,
            x2: x2.ceil() as i16,
            y2: y2.ceil() as i16,
        }
    }
}
