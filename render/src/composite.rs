//! Operation facade.
//!
//! The public entry points assemble an operation once (classify the
//! channels, pick the path, bind state) and then stream any number of
//! rectangles through it before a final `finish`. Operations are
//! tagged variants (shader, blitter, tiled) selected at setup, not
//! dispatched per rectangle.

use crate::batch::{BatchManager, BufferHandle, Ring};
use crate::blend::{blend_for, BlendOp};
use crate::blt::{compare_depth, Alu};
use crate::channel::{
    picture_solid_color, sampler_format, Channel, ChannelKind, Classified, Picture, PictureSource,
    SurfaceDesc,
};
use crate::cmd;
use crate::damage::DamageRegion;
use crate::emit::{choose_emitter, emit_rectangle, Emitter};
use crate::geom::{Box2, Rectangle};
use crate::kernel::{choose_kernel, KernelSource, WmKernel};
use crate::pipeline::{
    decide_component_alpha, needs_tiling, prefer_blt, vertex_layout_id, Phase,
};
use crate::state::{
    sampler_key, CaFixup, CA_HEADROOM_WORDS, STATE_HEADROOM_RELOCS, STATE_HEADROOM_WORDS,
};
use crate::tiling::TiledComposite;
use crate::{Color, Device, PixelFormat, RenderError};

/// A destination surface.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub buffer: BufferHandle,
    pub format: PixelFormat,
    pub width: u16,
    pub height: u16,
    /// Row pitch in bytes.
    pub pitch: u32,
    /// Offset of the drawable within the backing surface.
    pub origin: (i16, i16),
}

impl RenderTarget {
    fn validate(&self) -> Result<(), RenderError> {
        if self.width == 0 || self.height == 0 {
            return Err(RenderError::invalid("degenerate render target"));
        }
        if self.pitch < self.width as u32 * self.format.bytes_per_pixel() {
            return Err(RenderError::invalid("target pitch smaller than a row"));
        }
        Ok(())
    }
}

/// The unit of work for the shader pipeline: assembled at setup,
/// read-only while rectangles stream through it.
#[derive(Debug)]
pub struct OperationDescriptor {
    pub op: BlendOp,
    pub target: RenderTarget,
    pub src: Channel,
    pub mask: Option<Channel>,
    pub is_affine: bool,
    pub component_alpha: bool,
    pub two_pass: bool,
    pub emitter: Emitter,
    pub floats_per_vertex: usize,
    pub floats_per_rect: usize,
    pub kernel: WmKernel,
    pub layout_id: u32,
}

fn kernel_source(kind: ChannelKind) -> KernelSource {
    match kind {
        ChannelKind::Solid | ChannelKind::Texture => KernelSource::Sampled,
        ChannelKind::LinearGradient => KernelSource::LinearGradient,
        ChannelKind::RadialGradient => KernelSource::RadialGradient,
    }
}

/// Copy-back bookkeeping when an oversized destination was redirected
/// to a temporary render target.
#[derive(Debug)]
struct Redirect {
    real: RenderTarget,
    extent: Box2,
}

#[derive(Debug)]
struct ShaderOp {
    desc: OperationDescriptor,
    redirect: Option<Redirect>,
}

#[derive(Debug)]
enum BltKind {
    Fill { pixel: u32, rop: u8 },
    Copy { src: SurfaceDesc, delta: (i16, i16) },
}

#[derive(Debug)]
struct BltCompositeOp {
    kind: BltKind,
    dst: RenderTarget,
}

#[derive(Debug)]
enum OpKind {
    Shader(ShaderOp),
    Blt(BltCompositeOp),
    Tiled(TiledComposite),
}

/// Handle for one in-flight operation.
pub struct CompositeOp<'d> {
    kind: OpKind,
    phase: Phase,
    damage: Option<&'d mut DamageRegion>,
}

impl<B: BatchManager> Device<B> {
    /// Prepare a composite operation.
    ///
    /// Failure means the request is not acceleratable on this device;
    /// the caller owns the software fallback. No device state is
    /// mutated on the failure paths that precede channel
    /// classification.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_composite<'d>(
        &mut self,
        op: BlendOp,
        src: &Picture,
        mask: Option<&Picture>,
        dst: &RenderTarget,
        src_origin: (i16, i16),
        mask_origin: (i16, i16),
        dst_origin: (i16, i16),
        size: (i16, i16),
        mut damage: Option<&'d mut DamageRegion>,
    ) -> Result<CompositeOp<'d>, RenderError> {
        dst.validate()?;
        let (width, height) = size;
        if width <= 0 || height <= 0 {
            return Err(RenderError::invalid("degenerate operation extent"));
        }

        log::debug!(
            "composite {:?} {}x{} at ({}, {})",
            op,
            width,
            height,
            dst_origin.0,
            dst_origin.1
        );

        let extent = Box2::from_rect(dst_origin.0, dst_origin.1, width, height);
        if let Some(d) = damage.as_deref_mut() {
            // An operation rewriting the whole target makes
            // per-rectangle reporting redundant.
            if DamageRegion::covers(&extent, dst.width as i16, dst.height as i16) {
                d.add_all();
                damage = None;
            }
        }

        // Cheap path first: the blitter handles unmasked copy/clear
        // shapes, and staying on the current ring is worth preferring.
        if mask.is_none()
            && prefer_blt(self.batch.ring(), width, height, self.config.max_3d_size)
        {
            if let Some(blt) = self.try_blt_composite(op, src, dst, src_origin, dst_origin, size)? {
                return Ok(CompositeOp {
                    kind: OpKind::Blt(blt),
                    phase: Phase::Ready,
                    damage,
                });
            }
        }

        if needs_tiling(self.config.max_3d_size, width, height) {
            log::debug!("extent exceeds 3d limit, tiling");
            let tiled = TiledComposite::new(
                op,
                src.clone(),
                mask.cloned(),
                dst.clone(),
                src_origin,
                mask_origin,
                dst_origin,
                size,
            );
            return Ok(CompositeOp {
                kind: OpKind::Tiled(tiled),
                phase: Phase::Ready,
                damage,
            });
        }

        let (target, redirect) = if dst.width > self.config.max_3d_size
            || dst.height > self.config.max_3d_size
        {
            let (temp, redirect) = self.redirect_target(dst, &extent)?;
            (temp, Some(redirect))
        } else {
            (dst.clone(), None)
        };

        let release_redirect = |dev: &mut Self, redirect: &Option<Redirect>, target: &RenderTarget| {
            if redirect.is_some() {
                dev.batch.release(target.buffer);
            }
        };

        let src_channel = match self.classify_channel(
            src,
            src_origin.0,
            src_origin.1,
            width,
            height,
            dst_origin.0,
            dst_origin.1,
        )? {
            Classified::Ready(ch) => ch,
            Classified::Clear => self.solid_channel(Color::TRANSPARENT)?,
            Classified::NeedsConversion | Classified::Unsupported => {
                release_redirect(self, &redirect, &target);
                return Err(RenderError::unsupported("source not sampleable"));
            }
        };

        let mask_channel = match mask {
            Some(mask_picture) => match self.classify_channel(
                mask_picture,
                mask_origin.0,
                mask_origin.1,
                width,
                height,
                dst_origin.0,
                dst_origin.1,
            )? {
                Classified::Ready(ch) => Some(ch),
                Classified::Clear => Some(self.solid_channel(Color::TRANSPARENT)?),
                Classified::NeedsConversion | Classified::Unsupported => {
                    src_channel.release(&mut self.batch);
                    release_redirect(self, &redirect, &target);
                    return Err(RenderError::unsupported("mask not sampleable"));
                }
            },
            None => None,
        };

        let mask_has_color = mask_channel
            .as_ref()
            .map_or(false, |c| c.card_format != crate::channel::CardFormat::A8Unorm);
        let ca = match decide_component_alpha(
            op,
            mask.map_or(false, |m| m.component_alpha),
            mask_has_color,
        ) {
            Some(ca) => ca,
            None => {
                if let Some(m) = &mask_channel {
                    m.release(&mut self.batch);
                }
                src_channel.release(&mut self.batch);
                release_redirect(self, &redirect, &target);
                return Err(RenderError::unsupported(
                    "component-alpha mask with this operator",
                ));
            }
        };

        if ca.is_component_alpha && src_channel.kind != ChannelKind::Texture
            && src_channel.kind != ChannelKind::Solid
        {
            // Gradient kernels have no component-alpha variants.
            if let Some(m) = &mask_channel {
                m.release(&mut self.batch);
            }
            src_channel.release(&mut self.batch);
            release_redirect(self, &redirect, &target);
            return Err(RenderError::unsupported("component alpha over gradient"));
        }

        let is_affine =
            src_channel.is_affine() && mask_channel.as_ref().map_or(true, Channel::is_affine);
        let (emitter, floats_per_vertex) = choose_emitter(&src_channel, mask_channel.as_ref());
        let kernel = choose_kernel(
            ca.first_pass_op,
            kernel_source(src_channel.kind),
            mask_channel.is_some(),
            ca.is_component_alpha,
            is_affine,
        );

        let desc = OperationDescriptor {
            op: ca.first_pass_op,
            target,
            src: src_channel,
            mask: mask_channel,
            is_affine,
            component_alpha: ca.is_component_alpha,
            two_pass: ca.two_pass,
            emitter,
            floats_per_vertex,
            floats_per_rect: 3 * floats_per_vertex,
            kernel,
            layout_id: vertex_layout_id(mask.is_some(), is_affine),
        };

        self.switch_ring(Ring::Render);
        self.emit_operation_state(&desc);
        self.vertices.align(desc.floats_per_vertex);
        self.state.ca_fixup = if desc.two_pass {
            Some(CaFixup {
                blend: blend_for(BlendOp::Add, true, desc.target.format.has_alpha()),
                kernel: choose_kernel(BlendOp::Add, KernelSource::Sampled, true, true, is_affine),
            })
        } else {
            None
        };

        Ok(CompositeOp {
            kind: OpKind::Shader(ShaderOp {
                desc,
                redirect,
            }),
            phase: Phase::Ready,
            damage,
        })
    }

    /// Solid fill over a box list.
    pub fn fill_rectangles(
        &mut self,
        op: BlendOp,
        color: Color,
        dst: &RenderTarget,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        dst.validate()?;
        if boxes.is_empty() {
            return Ok(());
        }

        // Reduce to a blitter alu where the operator allows it.
        let alu = reduce_fill_alu(op, &color);
        let oversized = dst.width > self.config.max_3d_size || dst.height > self.config.max_3d_size;
        if let Some(alu) = alu {
            let blt_preferred = self.batch.ring() == Ring::Blt || oversized;
            if blt_preferred && self.blt_able(dst.width, dst.height, dst.pitch) {
                let pixel = match alu {
                    Alu::Clear => 0,
                    Alu::Copy => premultiplied_pixel(&color, dst.format),
                };
                return self.blt_fill_boxes(
                    dst.buffer,
                    dst.pitch,
                    dst.format.bytes_per_pixel(),
                    alu.fill_rop(),
                    pixel,
                    dst.origin,
                    boxes,
                );
            }
        }
        if oversized {
            return Err(RenderError::unsupported("oversized blended fill"));
        }

        let fill_color = if op == BlendOp::Clear {
            Color::TRANSPARENT
        } else {
            color
        };
        let src = self.solid_channel(fill_color)?;
        let desc = OperationDescriptor {
            op,
            target: dst.clone(),
            src,
            mask: None,
            is_affine: true,
            component_alpha: false,
            two_pass: false,
            emitter: Emitter::Solid,
            floats_per_vertex: 3,
            floats_per_rect: 9,
            kernel: WmKernel::NoMaskAffine,
            layout_id: vertex_layout_id(false, true),
        };

        self.switch_ring(Ring::Render);
        self.emit_operation_state(&desc);
        self.vertices.align(desc.floats_per_vertex);

        let result = self.stream_boxes(&desc, boxes);
        self.vertex_flush();
        desc.src.release(&mut self.batch);
        result
    }

    /// Copy a box list between surfaces. Boxes are destination
    /// coordinates; `src_delta` maps them into the source.
    pub fn copy_rectangles(
        &mut self,
        alu: Alu,
        src: &SurfaceDesc,
        src_delta: (i16, i16),
        dst: &RenderTarget,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        dst.validate()?;
        if boxes.is_empty() {
            return Ok(());
        }

        let depths_match = compare_depth(src.format, dst.format);
        let blt_ok = depths_match
            && self.blt_able(src.width, src.height, src.pitch)
            && self.blt_able(dst.width, dst.height, dst.pitch);

        // Same ring, same depth: the blitter wins outright.
        if self.batch.ring() == Ring::Blt && blt_ok {
            return self.blt_copy_alu(alu, src, src_delta, dst, boxes);
        }

        let max = self.config.max_3d_size;
        let oversized = src.width > max || src.height > max || dst.width > max || dst.height > max;
        if oversized || src.buffer == dst.buffer {
            if blt_ok {
                return self.blt_copy_alu(alu, src, src_delta, dst, boxes);
            }
            return Err(RenderError::unsupported("copy outside blitter limits"));
        }

        let Some((card_format, channel_swap)) = sampler_format(src.format) else {
            if blt_ok {
                return self.blt_copy_alu(alu, src, src_delta, dst, boxes);
            }
            return Err(RenderError::unsupported("copy source not sampleable"));
        };

        self.batch.retain(src.buffer);
        let src_channel = Channel {
            kind: ChannelKind::Texture,
            bo: src.buffer,
            card_format,
            filter: crate::channel::Filter::Nearest,
            repeat: crate::channel::Repeat::None,
            transform: None,
            transform_class: crate::geom::TransformClass::Identity,
            width: src.width,
            height: src.height,
            scale: [1.0 / src.width as f32, 1.0 / src.height as f32],
            offset: [src_delta.0, src_delta.1],
            is_solid_opaque: false,
            solid_color: None,
            alpha_fixup: false,
            channel_swap,
            gradient: None,
        };

        let desc = OperationDescriptor {
            op: match alu {
                Alu::Copy => BlendOp::Src,
                Alu::Clear => BlendOp::Clear,
            },
            target: dst.clone(),
            src: src_channel,
            mask: None,
            is_affine: true,
            component_alpha: false,
            two_pass: false,
            emitter: Emitter::IdentitySource,
            floats_per_vertex: 3,
            floats_per_rect: 9,
            kernel: WmKernel::NoMaskAffine,
            layout_id: vertex_layout_id(false, true),
        };

        self.switch_ring(Ring::Render);
        self.emit_operation_state(&desc);
        self.vertices.align(desc.floats_per_vertex);

        let result = self.stream_boxes(&desc, boxes);
        self.vertex_flush();
        desc.src.release(&mut self.batch);
        result
    }

    /// Accumulate an unmasked box list through `desc`, batching the
    /// reserve calls. Zero-area boxes emit nothing.
    fn stream_boxes(
        &mut self,
        desc: &OperationDescriptor,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        let mut remaining: Vec<&Box2> = boxes.iter().filter(|b| !b.is_empty()).collect();
        while !remaining.is_empty() {
            let n = self.get_rectangles_or_restart(desc, remaining.len())?;
            for b in remaining.drain(..n) {
                log::trace!("box ({}, {}) - ({}, {})", b.x1, b.y1, b.x2, b.y2);
                emit_rectangle(
                    desc.emitter,
                    &desc.src,
                    None,
                    true,
                    &mut self.vertices,
                    &Rectangle::from_box(b),
                );
            }
        }
        Ok(())
    }

    fn blt_copy_alu(
        &mut self,
        alu: Alu,
        src: &SurfaceDesc,
        src_delta: (i16, i16),
        dst: &RenderTarget,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        match alu {
            Alu::Copy => self.blt_copy_boxes(
                src.buffer,
                src.pitch,
                src_delta,
                dst.buffer,
                dst.pitch,
                dst.origin,
                dst.format.bytes_per_pixel(),
                boxes,
            ),
            Alu::Clear => self.blt_fill_boxes(
                dst.buffer,
                dst.pitch,
                dst.format.bytes_per_pixel(),
                alu.fill_rop(),
                0,
                dst.origin,
                boxes,
            ),
        }
    }

    /// Blitter eligibility ladder for unmasked composites.
    fn try_blt_composite(
        &mut self,
        op: BlendOp,
        src: &Picture,
        dst: &RenderTarget,
        src_origin: (i16, i16),
        dst_origin: (i16, i16),
        size: (i16, i16),
    ) -> Result<Option<BltCompositeOp>, RenderError> {
        if !matches!(dst.format.bits_per_pixel(), 8 | 16 | 32) {
            return Ok(None);
        }
        if !self.blt_able(dst.width, dst.height, dst.pitch) {
            return Ok(None);
        }

        if op == BlendOp::Clear {
            return Ok(Some(BltCompositeOp {
                kind: BltKind::Fill { pixel: 0, rop: Alu::Copy.fill_rop() },
                dst: dst.clone(),
            }));
        }

        if let Some(color) = picture_solid_color(src) {
            let op = op.reduce_opaque_source(color.is_opaque());
            if op != BlendOp::Src {
                return Ok(None);
            }
            return Ok(Some(BltCompositeOp {
                kind: BltKind::Fill {
                    pixel: premultiplied_pixel(&color, dst.format),
                    rop: Alu::Copy.fill_rop(),
                },
                dst: dst.clone(),
            }));
        }

        let PictureSource::Surface(desc) = &src.source else {
            return Ok(None);
        };
        if !compare_depth(desc.format, dst.format) {
            return Ok(None);
        }
        let op = if op == BlendOp::Over && !desc.format.has_alpha() {
            BlendOp::Src
        } else {
            op
        };
        if op != BlendOp::Src {
            return Ok(None);
        }
        let (mut sx, mut sy) = src_origin;
        match &src.transform {
            None => {}
            Some(t) => match t.integer_translation() {
                Some((tx, ty)) => {
                    sx += tx;
                    sy += ty;
                }
                None => return Ok(None),
            },
        }
        // The blitter cannot repeat or pad: the copied region must lie
        // inside the source.
        let (width, height) = size;
        if sx < 0
            || sy < 0
            || sx as i32 + width as i32 > desc.width as i32
            || sy as i32 + height as i32 > desc.height as i32
        {
            return Ok(None);
        }
        if !self.blt_able(desc.width, desc.height, desc.pitch) {
            return Ok(None);
        }

        self.batch.retain(desc.buffer);
        Ok(Some(BltCompositeOp {
            kind: BltKind::Copy {
                src: *desc,
                delta: (sx - dst_origin.0, sy - dst_origin.1),
            },
            dst: dst.clone(),
        }))
    }

    /// Allocate a temporary render target covering `extent` when the
    /// real destination exceeds the shader pipeline's limit.
    fn redirect_target(
        &mut self,
        real: &RenderTarget,
        extent: &Box2,
    ) -> Result<(RenderTarget, Redirect), RenderError> {
        let width = extent.width() as u16;
        let height = extent.height() as u16;
        let pitch = width as u32 * real.format.bytes_per_pixel();
        let buffer = self.batch.create_buffer(pitch as usize * height as usize)?;
        log::debug!(
            "redirecting {}x{} target through {}x{} temporary",
            real.width,
            real.height,
            width,
            height
        );
        Ok((
            RenderTarget {
                buffer,
                format: real.format,
                width,
                height,
                pitch,
                origin: (-extent.x1, -extent.y1),
            },
            Redirect {
                real: real.clone(),
                extent: *extent,
            },
        ))
    }

    /// Bind (or re-bind) the full state an operation needs. Redundant
    /// axes are suppressed by the state cache.
    pub(crate) fn emit_operation_state(&mut self, desc: &OperationDescriptor) {
        self.begin_batch(STATE_HEADROOM_WORDS, STATE_HEADROOM_RELOCS);
        let blend = blend_for(desc.op, desc.component_alpha, desc.target.format.has_alpha());
        self.bind_surfaces(&desc.target, Some(&desc.src), desc.mask.as_ref());
        let blend_changed = self.bind_blend(blend);
        if let Some(gradient) = &desc.src.gradient {
            self.bind_constants(gradient.to_words());
        }
        self.bind_sampler(sampler_key(Some(&desc.src), desc.mask.as_ref()));
        self.bind_kernel(desc.kernel);
        self.bind_vertex_layout(desc.layout_id, desc.floats_per_vertex);
        self.bind_drawing_rect(&desc.target, blend_changed);
    }

    /// Open (or extend) the rectangle-list primitive for `desc`.
    fn rectangle_begin(&mut self, desc: &OperationDescriptor) -> bool {
        let bit = 1u32 << desc.layout_id;
        let mut ndwords = 6;
        if desc.two_pass {
            ndwords += CA_HEADROOM_WORDS;
        }
        if self.state.vb_bound & bit == 0 {
            ndwords += 5;
        }
        if !self.batch.reserve_command_space(ndwords) || !self.batch.reserve_relocations(2) {
            return false;
        }

        if self.state.vb_bound & bit == 0 {
            self.batch.emit(cmd::with_len(cmd::VERTEX_BUFFER, 5));
            self.batch.emit(4 * desc.floats_per_vertex as u32);
            self.state.vertex_reloc[desc.layout_id as usize] = Some(self.batch.position());
            self.batch.emit(0);
            self.batch.emit(0);
            self.batch.emit(0);
            self.state.vb_bound |= bit;
        }

        match self.state.last_primitive {
            // Nothing intervened since the last draw of this batch:
            // extend it instead of opening a new one.
            Some(pos) if pos == self.batch.position() => {
                self.state.vertex_offset = Some(pos - 5);
            }
            _ => {
                self.batch.emit(cmd::with_len(cmd::PRIMITIVE_RECTLIST, 6));
                self.state.vertex_offset = Some(self.batch.position());
                self.batch.emit(0);
                self.batch.emit(self.vertices.index() as u32);
                self.batch.emit(1);
                self.batch.emit(0);
                self.batch.emit(0);
                self.vertices.start_primitive();
                self.state.last_primitive = Some(self.batch.position());
            }
        }
        true
    }

    /// Reserve accumulator room for up to `want` rectangles, flushing
    /// and spilling as needed. Returns how many fit (0 means the
    /// caller must re-emit operation state and retry).
    pub(crate) fn get_rectangles(&mut self, desc: &OperationDescriptor, want: usize) -> usize {
        if desc.floats_per_rect > self.vertices.capacity() {
            self.vertices.grow_for(desc.floats_per_rect);
        }

        let mut rem = self.vertices.space();
        if rem < desc.floats_per_rect {
            log::trace!(
                "vertex buffer full ({} < {}), draining",
                rem,
                desc.floats_per_rect
            );
            let needed = 5 + if desc.two_pass { CA_HEADROOM_WORDS } else { 0 };
            if !self.batch.reserve_command_space(needed)
                || !self.batch.reserve_relocations(2)
            {
                return 0;
            }
            self.vertex_spill();
            if desc.two_pass {
                // The second pass rebound blend and kernel; force the
                // caller through a state re-emission.
                return 0;
            }
            rem = self.vertices.space();
        }

        if self.state.vertex_offset.is_none() && !self.rectangle_begin(desc) {
            return 0;
        }

        let mut want = want;
        if want > 1 && want * desc.floats_per_rect > rem {
            want = rem / desc.floats_per_rect;
        }
        self.vertices.advance_rects(want);
        want
    }

    /// `get_rectangles` with the one-shot recovery ladder: re-emit
    /// state (which may submit the batch) and retry, then give up.
    pub(crate) fn get_rectangles_or_restart(
        &mut self,
        desc: &OperationDescriptor,
        want: usize,
    ) -> Result<usize, RenderError> {
        let n = self.get_rectangles(desc, want);
        if n != 0 {
            return Ok(n);
        }
        self.emit_operation_state(desc);
        let n = self.get_rectangles(desc, want);
        if n != 0 {
            return Ok(n);
        }
        Err(RenderError::exhausted("command stream"))
    }
}

fn premultiplied_pixel(color: &Color, format: PixelFormat) -> u32 {
    Color {
        r: color.r * color.a,
        g: color.g * color.a,
        b: color.b * color.a,
        a: color.a,
    }
    .to_pixel(format)
}

/// Fill operators the blitter can express directly.
fn reduce_fill_alu(op: BlendOp, color: &Color) -> Option<Alu> {
    match op {
        BlendOp::Clear => Some(Alu::Clear),
        BlendOp::OutReverse if color.is_opaque() => Some(Alu::Clear),
        BlendOp::Src if color.a <= 0.0 => Some(Alu::Clear),
        BlendOp::Src => Some(Alu::Copy),
        BlendOp::Over if color.is_opaque() => Some(Alu::Copy),
        _ => None,
    }
}

impl<'d> CompositeOp<'d> {
    /// Record one rectangle against the real (not redirected) target.
    fn report_damage(
        damage: &mut Option<&'d mut DamageRegion>,
        origin: (i16, i16),
        r: &Rectangle,
    ) {
        if let Some(d) = damage.as_deref_mut() {
            let b = Box2::from_rect(r.dst_x, r.dst_y, r.width, r.height)
                .translate(origin.0, origin.1);
            d.add_box(b);
        }
    }

    /// Append one rectangle.
    pub fn draw_rectangle<B: BatchManager>(
        &mut self,
        dev: &mut Device<B>,
        r: &Rectangle,
    ) -> Result<(), RenderError> {
        if !self.phase.accepts_rectangles() {
            return Err(RenderError::invalid("operation is not accepting rectangles"));
        }
        if r.is_empty() {
            return Ok(());
        }
        match &mut self.kind {
            OpKind::Shader(shader) => {
                let desc = &shader.desc;
                let n = dev.get_rectangles_or_restart(desc, 1)?;
                debug_assert_eq!(n, 1);
                emit_rectangle(
                    desc.emitter,
                    &desc.src,
                    desc.mask.as_ref(),
                    desc.is_affine,
                    &mut dev.vertices,
                    r,
                );
                let origin = shader
                    .redirect
                    .as_ref()
                    .map_or(desc.target.origin, |rd| rd.real.origin);
                Self::report_damage(&mut self.damage, origin, r);
                self.phase = if dev.state.vertex_offset.is_some() {
                    Phase::Accumulating
                } else {
                    Phase::Flushed
                };
            }
            OpKind::Blt(blt) => {
                let b = Box2::from_rect(r.dst_x, r.dst_y, r.width, r.height);
                match &blt.kind {
                    BltKind::Fill { pixel, rop } => {
                        dev.blt_fill_one(
                            blt.dst.buffer,
                            blt.dst.pitch,
                            blt.dst.format.bytes_per_pixel(),
                            *rop,
                            *pixel,
                            &b.translate(blt.dst.origin.0, blt.dst.origin.1),
                        )?;
                    }
                    BltKind::Copy { src, delta } => {
                        dev.blt_copy_raw(
                            src.buffer,
                            src.pitch,
                            (r.src_x + delta.0, r.src_y + delta.1),
                            blt.dst.buffer,
                            blt.dst.pitch,
                            (
                                r.dst_x + blt.dst.origin.0,
                                r.dst_y + blt.dst.origin.1,
                            ),
                            (r.width, r.height),
                            blt.dst.format.bytes_per_pixel(),
                        )?;
                    }
                }
                Self::report_damage(&mut self.damage, blt.dst.origin, r);
                self.phase = Phase::Accumulating;
            }
            OpKind::Tiled(tiled) => {
                tiled.add(*r);
                self.phase = Phase::Accumulating;
            }
        }
        Ok(())
    }

    /// Append a rectangle list.
    pub fn draw_rectangles<B: BatchManager>(
        &mut self,
        dev: &mut Device<B>,
        rects: &[Rectangle],
    ) -> Result<(), RenderError> {
        for r in rects {
            self.draw_rectangle(dev, r)?;
        }
        Ok(())
    }

    /// Append a box list; source and mask follow the destination.
    pub fn draw_boxes<B: BatchManager>(
        &mut self,
        dev: &mut Device<B>,
        boxes: &[Box2],
    ) -> Result<(), RenderError> {
        match &mut self.kind {
            OpKind::Shader(shader) if boxes.len() > 1 => {
                if !self.phase.accepts_rectangles() {
                    return Err(RenderError::invalid("operation is not accepting rectangles"));
                }
                let desc = &shader.desc;
                let origin = shader
                    .redirect
                    .as_ref()
                    .map_or(desc.target.origin, |rd| rd.real.origin);
                let mut remaining: Vec<&Box2> =
                    boxes.iter().filter(|b| !b.is_empty()).collect();
                while !remaining.is_empty() {
                    let n = dev.get_rectangles_or_restart(desc, remaining.len())?;
                    for b in remaining.drain(..n) {
                        let r = Rectangle::from_box(b);
                        emit_rectangle(
                            desc.emitter,
                            &desc.src,
                            desc.mask.as_ref(),
                            desc.is_affine,
                            &mut dev.vertices,
                            &r,
                        );
                        Self::report_damage(&mut self.damage, origin, &r);
                    }
                }
                self.phase = if dev.state.vertex_offset.is_some() {
                    Phase::Accumulating
                } else {
                    Phase::Flushed
                };
                Ok(())
            }
            _ => {
                for b in boxes {
                    self.draw_rectangle(dev, &Rectangle::from_box(b))?;
                }
                Ok(())
            }
        }
    }

    /// Finalize: flush accumulation, run any pending second pass, copy
    /// a redirected target back, and release channel references.
    pub fn finish<B: BatchManager>(mut self, dev: &mut Device<B>) -> Result<(), RenderError> {
        self.phase = Phase::Finalizing;
        let damage = self.damage.take();
        let result = match self.kind {
            OpKind::Shader(shader) => {
                dev.vertex_flush();
                dev.state.ca_fixup = None;

                let mut result = Ok(());
                if let Some(redirect) = &shader.redirect {
                    let extent = redirect.extent;
                    result = dev.blt_copy_raw(
                        shader.desc.target.buffer,
                        shader.desc.target.pitch,
                        (0, 0),
                        redirect.real.buffer,
                        redirect.real.pitch,
                        (
                            extent.x1 + redirect.real.origin.0,
                            extent.y1 + redirect.real.origin.1,
                        ),
                        (extent.width(), extent.height()),
                        redirect.real.format.bytes_per_pixel(),
                    );
                    dev.batch.release(shader.desc.target.buffer);
                }

                shader.desc.src.release(&mut dev.batch);
                if let Some(mask) = &shader.desc.mask {
                    mask.release(&mut dev.batch);
                }
                result
            }
            OpKind::Blt(blt) => {
                if let BltKind::Copy { src, .. } = &blt.kind {
                    dev.batch.release(src.buffer);
                }
                Ok(())
            }
            OpKind::Tiled(tiled) => tiled.finish(dev, damage),
        };
        self.phase = Phase::Done;
        result
    }
}
