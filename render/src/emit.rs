//! Rectangle vertex emitters.
//!
//! Each operation selects one emitter for its (source kind, mask kind,
//! transform class) combination at setup time; the emitter then writes
//! exactly one rectangle per call: three vertices, in bottom-right,
//! bottom-left, top-left order. The cheap emitters exist because the
//! common cases (solid, untransformed source) need none of the generic
//! path's per-corner transform work.

use crate::channel::{Channel, ChannelKind};
use crate::geom::Rectangle;
use crate::vertex::VertexAccumulator;

/// Emitter selected for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitter {
    /// Solid or gradient source, no mask: position plus a unit box.
    Solid,
    /// Untransformed texture source, no mask.
    IdentitySource,
    /// Affine-transformed texture source, no mask.
    AffineSource,
    /// Untransformed source and mask.
    IdentitySourceMask,
    /// Anything else: per-corner transforms, optional mask, optional
    /// homogeneous w per channel.
    Generic,
}

/// Choose the emitter and floats-per-vertex for a channel combination.
pub fn choose_emitter(src: &Channel, mask: Option<&Channel>) -> (Emitter, usize) {
    let is_affine = src.is_affine() && mask.map_or(true, Channel::is_affine);
    match mask {
        Some(mask_ch) => {
            let fpv = 5 + 2 * usize::from(!is_affine);
            if src.transform.is_none() && mask_ch.transform.is_none() {
                (Emitter::IdentitySourceMask, fpv)
            } else {
                (Emitter::Generic, fpv)
            }
        }
        None => {
            let fpv = 3 + usize::from(!is_affine);
            if src.kind != ChannelKind::Texture {
                (Emitter::Solid, 3)
            } else if src.transform.is_none() {
                (Emitter::IdentitySource, 3)
            } else if src.is_affine() {
                (Emitter::AffineSource, 3)
            } else {
                (Emitter::Generic, fpv)
            }
        }
    }
}

/// Append one rectangle through the chosen emitter.
pub fn emit_rectangle(
    emitter: Emitter,
    src: &Channel,
    mask: Option<&Channel>,
    is_affine: bool,
    acc: &mut VertexAccumulator,
    r: &Rectangle,
) {
    match emitter {
        Emitter::Solid => emit_solid(acc, r),
        Emitter::IdentitySource => emit_identity_source(src, acc, r),
        Emitter::AffineSource => emit_affine_source(src, acc, r),
        Emitter::IdentitySourceMask => emit_identity_source_mask(src, mask.unwrap(), acc, r),
        Emitter::Generic => emit_generic(src, mask, is_affine, acc, r),
    }
}

fn emit_solid(acc: &mut VertexAccumulator, r: &Rectangle) {
    let v = acc.alloc(9);
    v[0] = crate::vertex::pack_xy(r.dst_x + r.width, r.dst_y + r.height);
    v[1] = 1.0;
    v[2] = 1.0;
    v[3] = crate::vertex::pack_xy(r.dst_x, r.dst_y + r.height);
    v[4] = 0.0;
    v[5] = 1.0;
    v[6] = crate::vertex::pack_xy(r.dst_x, r.dst_y);
    v[7] = 0.0;
    v[8] = 0.0;
}

fn emit_identity_source(src: &Channel, acc: &mut VertexAccumulator, r: &Rectangle) {
    let sx = (r.src_x + src.offset[0]) as f32 * src.scale[0];
    let sy = (r.src_y + src.offset[1]) as f32 * src.scale[1];
    let ex = sx + r.width as f32 * src.scale[0];
    let ey = sy + r.height as f32 * src.scale[1];

    let v = acc.alloc(9);
    v[0] = crate::vertex::pack_xy(r.dst_x + r.width, r.dst_y + r.height);
    v[1] = ex;
    v[2] = ey;
    v[3] = crate::vertex::pack_xy(r.dst_x, r.dst_y + r.height);
    v[4] = sx;
    v[5] = ey;
    v[6] = crate::vertex::pack_xy(r.dst_x, r.dst_y);
    v[7] = sx;
    v[8] = sy;
}

fn emit_affine_source(src: &Channel, acc: &mut VertexAccumulator, r: &Rectangle) {
    let Some(transform) = src.transform.as_ref() else {
        return emit_identity_source(src, acc, r);
    };
    let sx = (r.src_x + src.offset[0]) as f32;
    let sy = (r.src_y + src.offset[1]) as f32;
    let w = r.width as f32;
    let h = r.height as f32;

    let (brx, bry) = transform.apply(sx + w, sy + h);
    let (blx, bly) = transform.apply(sx, sy + h);
    let (tlx, tly) = transform.apply(sx, sy);

    let v = acc.alloc(9);
    v[0] = crate::vertex::pack_xy(r.dst_x + r.width, r.dst_y + r.height);
    v[1] = brx * src.scale[0];
    v[2] = bry * src.scale[1];
    v[3] = crate::vertex::pack_xy(r.dst_x, r.dst_y + r.height);
    v[4] = blx * src.scale[0];
    v[5] = bly * src.scale[1];
    v[6] = crate::vertex::pack_xy(r.dst_x, r.dst_y);
    v[7] = tlx * src.scale[0];
    v[8] = tly * src.scale[1];
}

fn emit_identity_source_mask(
    src: &Channel,
    mask: &Channel,
    acc: &mut VertexAccumulator,
    r: &Rectangle,
) {
    let sx = (r.src_x + src.offset[0]) as f32 * src.scale[0];
    let sy = (r.src_y + src.offset[1]) as f32 * src.scale[1];
    let mx = (r.mask_x + mask.offset[0]) as f32 * mask.scale[0];
    let my = (r.mask_y + mask.offset[1]) as f32 * mask.scale[1];
    let sw = r.width as f32 * src.scale[0];
    let sh = r.height as f32 * src.scale[1];
    let mw = r.width as f32 * mask.scale[0];
    let mh = r.height as f32 * mask.scale[1];

    let v = acc.alloc(15);
    v[0] = crate::vertex::pack_xy(r.dst_x + r.width, r.dst_y + r.height);
    v[1] = sx + sw;
    v[2] = sy + sh;
    v[3] = mx + mw;
    v[4] = my + mh;
    v[5] = crate::vertex::pack_xy(r.dst_x, r.dst_y + r.height);
    v[6] = sx;
    v[7] = sy + sh;
    v[8] = mx;
    v[9] = my + mh;
    v[10] = crate::vertex::pack_xy(r.dst_x, r.dst_y);
    v[11] = sx;
    v[12] = sy;
    v[13] = mx;
    v[14] = my;
}

/// Emit one channel's texture coordinate for a corner, with the
/// homogeneous w when the operation layout carries one.
fn emit_texcoord(
    acc: &mut VertexAccumulator,
    channel: &Channel,
    x: i16,
    y: i16,
    with_w: bool,
) {
    let px = (x + channel.offset[0]) as f32;
    let py = (y + channel.offset[1]) as f32;
    match &channel.transform {
        Some(t) if !channel.is_affine() => {
            let (tx, ty, w) = t.apply_3d(px, py).unwrap_or((px, py, 1.0));
            acc.emit(tx * channel.scale[0]);
            acc.emit(ty * channel.scale[1]);
            if with_w {
                acc.emit(w);
            }
        }
        Some(t) => {
            let (tx, ty) = t.apply(px, py);
            acc.emit(tx * channel.scale[0]);
            acc.emit(ty * channel.scale[1]);
            if with_w {
                acc.emit(1.0);
            }
        }
        None => {
            acc.emit(px * channel.scale[0]);
            acc.emit(py * channel.scale[1]);
            if with_w {
                acc.emit(1.0);
            }
        }
    }
}

fn emit_generic(
    src: &Channel,
    mask: Option<&Channel>,
    is_affine: bool,
    acc: &mut VertexAccumulator,
    r: &Rectangle,
) {
    let with_w = !is_affine;
    let corners = [
        (r.dst_x + r.width, r.dst_y + r.height, r.width, r.height),
        (r.dst_x, r.dst_y + r.height, 0, r.height),
        (r.dst_x, r.dst_y, 0, 0),
    ];
    for (dx, dy, ox, oy) in corners {
        acc.emit_xy(dx, dy);
        emit_texcoord(acc, src, r.src_x + ox, r.src_y + oy, with_w);
        if let Some(mask_ch) = mask {
            emit_texcoord(acc, mask_ch, r.mask_x + ox, r.mask_y + oy, with_w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchManager, RecordingBatch};
    use crate::channel::Picture;
    use crate::geom::{Box2, Transform};
    use crate::{Color, Device, DeviceConfig};

    fn solid_channel() -> Channel {
        let mut dev = Device::new(RecordingBatch::new(), DeviceConfig::default());
        dev.solid_channel(Color::WHITE).unwrap()
    }

    fn texture_channel(width: u16, height: u16, transform: Option<Transform>) -> Channel {
        let mut dev = Device::new(RecordingBatch::new(), DeviceConfig::default());
        let bo = dev
            .batch_mut()
            .create_buffer(width as usize * height as usize * 4)
            .unwrap();
        let mut picture = Picture::surface(crate::channel::SurfaceDesc {
            buffer: bo,
            format: crate::PixelFormat::Argb8888,
            width,
            height,
            pitch: width as u32 * 4,
            pixel: None,
        });
        picture.transform = transform;
        match dev.classify_channel(&picture, 0, 0, 16, 16, 0, 0).unwrap() {
            crate::channel::Classified::Ready(ch) => ch,
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_emitter_selection() {
        let solid = solid_channel();
        assert_eq!(choose_emitter(&solid, None), (Emitter::Solid, 3));

        let tex = texture_channel(64, 64, None);
        assert_eq!(choose_emitter(&tex, None), (Emitter::IdentitySource, 3));

        let affine = texture_channel(64, 64, Some(Transform::scale(2.0, 3.0)));
        assert_eq!(choose_emitter(&affine, None), (Emitter::AffineSource, 3));

        let mut proj = Transform::IDENTITY;
        proj.m[2][0] = 0.01;
        let projective = texture_channel(64, 64, Some(proj));
        assert_eq!(choose_emitter(&projective, None), (Emitter::Generic, 4));

        let mask = texture_channel(64, 64, None);
        assert_eq!(
            choose_emitter(&tex, Some(&mask)),
            (Emitter::IdentitySourceMask, 5)
        );
        assert_eq!(choose_emitter(&affine, Some(&mask)), (Emitter::Generic, 5));
        assert_eq!(
            choose_emitter(&projective, Some(&mask)),
            (Emitter::Generic, 7)
        );
    }

    #[test]
    fn test_solid_emit_writes_one_rectangle() {
        let mut acc = VertexAccumulator::with_capacity(64);
        acc.align(3);
        let r = Rectangle::from_box(&Box2::new(1, 2, 11, 22));
        emit_solid(&mut acc, &r);
        acc.advance_rects(1);
        assert_eq!(acc.used(), 9);
        assert_eq!(acc.index(), 3);
    }

    #[test]
    fn test_identity_source_coords_are_normalized() {
        let tex = texture_channel(64, 32, None);
        let mut acc = VertexAccumulator::with_capacity(64);
        acc.align(3);
        let r = Rectangle::from_box(&Box2::new(0, 0, 64, 32));
        emit_identity_source(&tex, &mut acc, &r);
        let words: Vec<u32> = acc.as_words().collect();
        // Bottom-right corner samples (1, 1).
        assert_eq!(f32::from_bits(words[1]), 1.0);
        assert_eq!(f32::from_bits(words[2]), 1.0);
        // Top-left corner samples (0, 0).
        assert_eq!(f32::from_bits(words[7]), 0.0);
        assert_eq!(f32::from_bits(words[8]), 0.0);
    }

    #[test]
    fn test_generic_projective_carries_w() {
        let mut proj = Transform::IDENTITY;
        proj.m[2][2] = 2.0;
        let tex = texture_channel(64, 64, Some(proj));
        let mut acc = VertexAccumulator::with_capacity(64);
        acc.align(4);
        let r = Rectangle::from_box(&Box2::new(0, 0, 8, 8));
        emit_generic(&tex, None, false, &mut acc, &r);
        acc.advance_rects(1);
        assert_eq!(acc.used(), 12);
        let words: Vec<u32> = acc.as_words().collect();
        // Each vertex carries w == 2.0 as its fourth float.
        assert_eq!(f32::from_bits(words[3]), 2.0);
        assert_eq!(f32::from_bits(words[7]), 2.0);
        assert_eq!(f32::from_bits(words[11]), 2.0);
    }
}
