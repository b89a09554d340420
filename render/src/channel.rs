//! Source and mask classification.
//!
//! Every input picture of an operation is classified into a `Channel`:
//! a solid color, a parametric gradient or a sampled texture, together
//! with its transform class, sampler parameters and any format fixups.
//! Classification happens before any device state is touched, so a
//! rejected picture leaves the context unchanged.

use crate::batch::{BatchManager, BufferHandle};
use crate::geom::{Box2, Transform, TransformClass};
use crate::gradient::{GradientCoefficients, GradientStop, RAMP_WIDTH};
use crate::{Color, Device, PixelFormat, RenderError};

/// Sampler filter modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Bilinear,
}

/// Sampler extend modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Transparent outside the surface.
    None,
    /// Tile the surface.
    Normal,
    /// Clamp to the edge texel.
    Pad,
    /// Mirror at the edges.
    Reflect,
}

/// Sampler view formats understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardFormat {
    A8Unorm,
    Bgra8Unorm,
    Bgrx8Unorm,
    Rgba8Unorm,
    Rgbx8Unorm,
    B5G6R5Unorm,
    B5G5R5A1Unorm,
    B4G4R4A4Unorm,
    B10G10R10A2Unorm,
    B10G10R10X2Unorm,
}

impl CardFormat {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Sampler format for a pixel format, plus whether the kernel must
/// swap the red/blue channel order.
pub fn sampler_format(format: PixelFormat) -> Option<(CardFormat, bool)> {
    use PixelFormat::*;
    match format {
        A8 => Some((CardFormat::A8Unorm, false)),
        Argb8888 => Some((CardFormat::Bgra8Unorm, false)),
        Xrgb8888 => Some((CardFormat::Bgrx8Unorm, false)),
        Abgr8888 => Some((CardFormat::Rgba8Unorm, true)),
        Xbgr8888 => Some((CardFormat::Rgbx8Unorm, true)),
        Rgb565 => Some((CardFormat::B5G6R5Unorm, false)),
        Argb1555 => Some((CardFormat::B5G5R5A1Unorm, false)),
        Argb2101010 => Some((CardFormat::B10G10R10A2Unorm, false)),
        Xrgb2101010 => Some((CardFormat::B10G10R10X2Unorm, false)),
        Argb4444 => Some((CardFormat::B4G4R4A4Unorm, false)),
        // No ignore-alpha sampler views exist for the 15/12-bit
        // families; those go through the alpha-fixup path.
        Xrgb1555 | Xrgb4444 => None,
    }
}

/// Sampler format substituted when a format without a usable alpha
/// channel passes the even-coverage check; the channel's fixup flag
/// then forces alpha to one downstream.
pub fn alpha_fixup_format(format: PixelFormat) -> Option<CardFormat> {
    match format {
        PixelFormat::Xrgb1555 => Some(CardFormat::B5G5R5A1Unorm),
        PixelFormat::Xrgb4444 => Some(CardFormat::B4G4R4A4Unorm),
        _ => None,
    }
}

/// Render-target format for a destination. Formats without alpha bits
/// render through the alpha-carrying view; the spare bits are ignored
/// by every consumer of such surfaces.
pub fn dest_format(format: PixelFormat) -> CardFormat {
    use PixelFormat::*;
    match format {
        A8 => CardFormat::A8Unorm,
        Argb8888 | Xrgb8888 => CardFormat::Bgra8Unorm,
        Abgr8888 | Xbgr8888 => CardFormat::Rgba8Unorm,
        Rgb565 => CardFormat::B5G6R5Unorm,
        Argb1555 | Xrgb1555 => CardFormat::B5G5R5A1Unorm,
        Argb2101010 | Xrgb2101010 => CardFormat::B10G10R10A2Unorm,
        Argb4444 | Xrgb4444 => CardFormat::B4G4R4A4Unorm,
    }
}

/// A surface backing a picture.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDesc {
    pub buffer: BufferHandle,
    pub format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Row pitch in bytes.
    pub pitch: u32,
    /// Pixel value of a 1x1 surface when the caller knows it; lets the
    /// classifier fold repeating 1x1 sources into solids.
    pub pixel: Option<u32>,
}

/// What a picture draws from.
#[derive(Debug, Clone)]
pub enum PictureSource {
    Solid {
        color: Color,
    },
    LinearGradient {
        p0: (f32, f32),
        p1: (f32, f32),
        stops: Vec<GradientStop>,
    },
    RadialGradient {
        center: (f32, f32),
        radius: f32,
        stops: Vec<GradientStop>,
    },
    Surface(SurfaceDesc),
}

/// Caller-facing description of one operation input.
#[derive(Debug, Clone)]
pub struct Picture {
    pub source: PictureSource,
    pub transform: Option<Transform>,
    pub filter: Filter,
    pub repeat: Repeat,
    /// Mask pictures only: per-channel alpha.
    pub component_alpha: bool,
}

impl Picture {
    pub fn solid(color: Color) -> Self {
        Self {
            source: PictureSource::Solid { color },
            transform: None,
            filter: Filter::Nearest,
            repeat: Repeat::Normal,
            component_alpha: false,
        }
    }

    pub fn surface(desc: SurfaceDesc) -> Self {
        Self {
            source: PictureSource::Surface(desc),
            transform: None,
            filter: Filter::Nearest,
            repeat: Repeat::None,
            component_alpha: false,
        }
    }
}

/// Channel kind after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Solid,
    LinearGradient,
    RadialGradient,
    Texture,
}

/// One classified operation input.
#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelKind,
    pub bo: BufferHandle,
    pub card_format: CardFormat,
    pub filter: Filter,
    pub repeat: Repeat,
    /// Kept only when sampling actually needs the matrix.
    pub transform: Option<Transform>,
    pub transform_class: TransformClass,
    pub width: u16,
    pub height: u16,
    /// Texel scale into the sampler's normalized domain.
    pub scale: [f32; 2],
    /// Maps rectangle source coordinates into surface sample space.
    pub offset: [i16; 2],
    pub is_solid_opaque: bool,
    pub solid_color: Option<Color>,
    pub alpha_fixup: bool,
    pub channel_swap: bool,
    pub gradient: Option<GradientCoefficients>,
}

impl Channel {
    pub fn is_affine(&self) -> bool {
        self.transform_class.is_affine()
    }

    /// Drop the buffer reference taken at classification.
    pub fn release<B: BatchManager>(&self, batch: &mut B) {
        batch.release(self.bo);
    }
}

/// Outcome of classifying a picture.
#[derive(Debug)]
pub enum Classified {
    /// Usable as-is.
    Ready(Channel),
    /// The sampled region is degenerate; the operation reads nothing
    /// (treat as fully transparent).
    Clear,
    /// The format has no sampler view; the caller must convert the
    /// source and retry, or composite in software.
    NeedsConversion,
    /// Not expressible by the shader pipeline; software fallback.
    Unsupported,
}

impl<B: BatchManager> Device<B> {
    /// Build a solid channel from the 1x1 solid cache.
    pub(crate) fn solid_channel(&mut self, color: Color) -> Result<Channel, RenderError> {
        log::debug!("solid channel {:08x}", color.to_argb8888());
        let bo = self.solids.get(&mut self.batch, &color)?;
        Ok(Channel {
            kind: ChannelKind::Solid,
            bo,
            card_format: CardFormat::Bgra8Unorm,
            filter: Filter::Nearest,
            repeat: Repeat::Normal,
            transform: None,
            transform_class: TransformClass::Identity,
            width: 1,
            height: 1,
            scale: [1.0, 1.0],
            offset: [0, 0],
            is_solid_opaque: color.is_opaque(),
            solid_color: Some(color),
            alpha_fixup: false,
            channel_swap: false,
            gradient: None,
        })
    }

    fn gradient_channel(
        &mut self,
        kind: ChannelKind,
        coefficients: GradientCoefficients,
        stops: &[GradientStop],
    ) -> Result<Channel, RenderError> {
        let bo = self.gradients.get(&mut self.batch, stops)?;
        Ok(Channel {
            kind,
            bo,
            card_format: CardFormat::Bgra8Unorm,
            filter: Filter::Bilinear,
            repeat: Repeat::Pad,
            transform: None,
            transform_class: TransformClass::Identity,
            width: RAMP_WIDTH as u16,
            height: 1,
            scale: [1.0 / RAMP_WIDTH as f32, 1.0],
            offset: [0, 0],
            is_solid_opaque: false,
            solid_color: None,
            alpha_fixup: false,
            channel_swap: false,
            gradient: Some(coefficients),
        })
    }

    /// Classify one picture into a channel.
    ///
    /// `(x, y)` is the sample origin matching destination origin
    /// `(dst_x, dst_y)`; `(w, h)` is the operation extent. Resource
    /// errors are returned; everything else is a definite outcome the
    /// caller dispatches on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn classify_channel(
        &mut self,
        picture: &Picture,
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        dst_x: i16,
        dst_y: i16,
    ) -> Result<Classified, RenderError> {
        match &picture.source {
            PictureSource::Solid { color } => {
                Ok(Classified::Ready(self.solid_channel(*color)?))
            }

            PictureSource::LinearGradient { p0, p1, stops } => {
                if let Some(solid) = single_stop_color(stops) {
                    return Ok(Classified::Ready(self.solid_channel(solid)?));
                }
                let Some(mut coef) = GradientCoefficients::linear(*p0, *p1) else {
                    return Ok(Classified::Unsupported);
                };
                match fold_linear_transform(&mut coef, picture.transform.as_ref()) {
                    Ok(()) => {}
                    Err(()) => return Ok(Classified::Unsupported),
                }
                Ok(Classified::Ready(self.gradient_channel(
                    ChannelKind::LinearGradient,
                    coef,
                    stops,
                )?))
            }

            PictureSource::RadialGradient {
                center,
                radius,
                stops,
            } => {
                if let Some(solid) = single_stop_color(stops) {
                    return Ok(Classified::Ready(self.solid_channel(solid)?));
                }
                let Some(mut coef) = GradientCoefficients::radial(*center, *radius) else {
                    return Ok(Classified::Unsupported);
                };
                match fold_radial_transform(&mut coef, picture.transform.as_ref()) {
                    Ok(()) => {}
                    Err(()) => return Ok(Classified::Unsupported),
                }
                Ok(Classified::Ready(self.gradient_channel(
                    ChannelKind::RadialGradient,
                    coef,
                    stops,
                )?))
            }

            PictureSource::Surface(desc) => {
                self.classify_surface(picture, desc, x, y, w, h, dst_x, dst_y)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_surface(
        &mut self,
        picture: &Picture,
        desc: &SurfaceDesc,
        mut x: i16,
        mut y: i16,
        w: i16,
        h: i16,
        dst_x: i16,
        dst_y: i16,
    ) -> Result<Classified, RenderError> {
        // A known 1x1 repeating surface is just a solid.
        if desc.width == 1 && desc.height == 1 && picture.repeat != Repeat::None {
            if let Some(pixel) = desc.pixel {
                let color = Color::from_pixel(pixel, desc.format);
                return Ok(Classified::Ready(self.solid_channel(color)?));
            }
        }

        let mut filter = picture.filter;
        let mut transform = picture.transform;
        let mut class = transform
            .as_ref()
            .map_or(TransformClass::Identity, Transform::classify);

        // Fold whole-pixel translations into the sample offset; the
        // remaining sampling is exact under the nearest filter.
        if let Some(t) = &transform {
            if let Some((tx, ty)) = t.integer_translation() {
                log::debug!("folding integer translation ({}, {})", tx, ty);
                x += tx;
                y += ty;
                transform = None;
                class = TransformClass::Identity;
                filter = Filter::Nearest;
            }
        }

        let (card_format, channel_swap, alpha_fixup) = match sampler_format(desc.format) {
            Some((card, swap)) => (card, swap, false),
            None => {
                let covered = sample_region_covered(
                    desc,
                    transform.as_ref(),
                    picture.repeat,
                    x,
                    y,
                    w,
                    h,
                );
                match alpha_fixup_format(desc.format) {
                    Some(card) if covered => (card, false, true),
                    _ => return Ok(Classified::NeedsConversion),
                }
            }
        };

        let max = self.config.max_3d_size;
        if desc.width > max || desc.height > max {
            return self.extract_surface(
                desc,
                transform.as_ref(),
                picture.repeat,
                filter,
                card_format,
                channel_swap,
                alpha_fixup,
                x,
                y,
                w,
                h,
                dst_x,
                dst_y,
            );
        }

        self.batch.retain(desc.buffer);
        Ok(Classified::Ready(Channel {
            kind: ChannelKind::Texture,
            bo: desc.buffer,
            card_format,
            filter,
            repeat: picture.repeat,
            transform,
            transform_class: class,
            width: desc.width,
            height: desc.height,
            scale: [1.0 / desc.width as f32, 1.0 / desc.height as f32],
            offset: [x - dst_x, y - dst_y],
            is_solid_opaque: false,
            solid_color: None,
            alpha_fixup,
            channel_swap,
            gradient: None,
        }))
    }

    /// Copy the sampled region of an oversized surface into a bounded
    /// staging buffer and retarget the channel at it.
    #[allow(clippy::too_many_arguments)]
    fn extract_surface(
        &mut self,
        desc: &SurfaceDesc,
        transform: Option<&Transform>,
        repeat: Repeat,
        filter: Filter,
        card_format: CardFormat,
        channel_swap: bool,
        alpha_fixup: bool,
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        dst_x: i16,
        dst_y: i16,
    ) -> Result<Classified, RenderError> {
        if w <= 0 || h <= 0 {
            return Ok(Classified::Clear);
        }
        // Transformed oversized sources have no cheap bounded copy;
        // leave them to the software path.
        if transform.is_some() {
            log::debug!("oversized transformed source, punting");
            return Ok(Classified::Unsupported);
        }
        // A repeating source may sample anywhere in the surface; the
        // whole thing does not fit by definition here.
        let bounds = Box2::new(0, 0, desc.width as i16, desc.height as i16);
        let mut region = Box2::new(x, y, x + w, y + h);
        if repeat != Repeat::None && !bounds.contains(&region) {
            log::debug!("oversized repeating source, punting");
            return Ok(Classified::Unsupported);
        }
        region = region.intersect(&bounds);
        if region.is_empty() {
            return Ok(Classified::Clear);
        }

        let rw = region.width();
        let rh = region.height();
        let max = self.config.max_3d_size as i16;
        if rw > max || rh > max {
            return Ok(Classified::Unsupported);
        }

        let bpp = desc.format.bytes_per_pixel();
        let pitch = rw as u32 * bpp;
        let staging = self.batch.create_buffer(pitch as usize * rh as usize)?;
        log::debug!(
            "extracting {}x{} at ({}, {}) from {}x{} source",
            rw,
            rh,
            region.x1,
            region.y1,
            desc.width,
            desc.height
        );
        self.blt_copy_raw(
            desc.buffer,
            desc.pitch,
            (region.x1, region.y1),
            staging,
            pitch,
            (0, 0),
            (rw, rh),
            bpp,
        )?;

        Ok(Classified::Ready(Channel {
            kind: ChannelKind::Texture,
            bo: staging,
            card_format,
            filter,
            repeat,
            transform: None,
            transform_class: TransformClass::Identity,
            width: rw as u16,
            height: rh as u16,
            scale: [1.0 / rw as f32, 1.0 / rh as f32],
            offset: [x - region.x1 - dst_x, y - region.y1 - dst_y],
            is_solid_opaque: false,
            solid_color: None,
            alpha_fixup,
            channel_swap,
            gradient: None,
        }))
    }
}

/// Resolve a picture that is a constant color, without touching the
/// device.
pub(crate) fn picture_solid_color(picture: &Picture) -> Option<Color> {
    match &picture.source {
        PictureSource::Solid { color } => Some(*color),
        PictureSource::Surface(desc)
            if desc.width == 1 && desc.height == 1 && picture.repeat != Repeat::None =>
        {
            desc.pixel.map(|px| Color::from_pixel(px, desc.format))
        }
        PictureSource::LinearGradient { stops, .. }
        | PictureSource::RadialGradient { stops, .. } => single_stop_color(stops),
        _ => None,
    }
}

/// A gradient whose stops all resolve to one color is a solid.
fn single_stop_color(stops: &[GradientStop]) -> Option<Color> {
    match stops {
        [only] => Some(only.color),
        [first, rest @ ..] if rest.iter().all(|s| s.color == first.color) => Some(first.color),
        _ => None,
    }
}

/// Even-coverage check: the operation samples no texels outside the
/// surface, so forcing alpha to one cannot manufacture opaque border
/// pixels.
fn sample_region_covered(
    desc: &SurfaceDesc,
    transform: Option<&Transform>,
    repeat: Repeat,
    x: i16,
    y: i16,
    w: i16,
    h: i16,
) -> bool {
    if repeat != Repeat::None {
        return true;
    }
    let sampled = Box2::new(x, y, x + w, y + h);
    let sampled = match transform {
        Some(t) => t.bounds(&sampled),
        None => sampled,
    };
    Box2::new(0, 0, desc.width as i16, desc.height as i16).contains(&sampled)
}

fn fold_linear_transform(
    coef: &mut GradientCoefficients,
    transform: Option<&Transform>,
) -> Result<(), ()> {
    let Some(t) = transform else { return Ok(()) };
    if !t.is_affine() {
        return Err(());
    }
    let GradientCoefficients::Linear { dx, dy, offset } = *coef else {
        return Err(());
    };
    let m = &t.m;
    *coef = GradientCoefficients::Linear {
        dx: dx * m[0][0] + dy * m[1][0],
        dy: dx * m[0][1] + dy * m[1][1],
        offset: offset - (dx * m[0][2] + dy * m[1][2]),
    };
    Ok(())
}

fn fold_radial_transform(
    coef: &mut GradientCoefficients,
    transform: Option<&Transform>,
) -> Result<(), ()> {
    let Some(t) = transform else { return Ok(()) };
    let GradientCoefficients::Radial { cx, cy, inv_radius } = *coef else {
        return Err(());
    };
    match t.classify() {
        TransformClass::Identity => Ok(()),
        TransformClass::Translation => {
            *coef = GradientCoefficients::Radial {
                cx: cx - t.m[0][2],
                cy: cy - t.m[1][2],
                inv_radius,
            };
            Ok(())
        }
        TransformClass::UniformScale | TransformClass::ScaleTranslation
            if t.m[0][0] == t.m[1][1] && t.m[0][0] != 0.0 =>
        {
            let s = t.m[0][0];
            *coef = GradientCoefficients::Radial {
                cx: (cx - t.m[0][2]) / s,
                cy: (cy - t.m[1][2]) / s,
                inv_radius: inv_radius * s,
            };
            Ok(())
        }
        _ => Err(()),
    }
}
