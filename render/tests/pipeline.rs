//! End-to-end pipeline scenarios over the recording batch manager.

use lumen_render::batch::{BatchManager, RecordingBatch, Ring};
use lumen_render::blend::BlendOp;
use lumen_render::blt::Alu;
use lumen_render::channel::{Filter, Picture, PictureSource, Repeat, SurfaceDesc};
use lumen_render::cmd;
use lumen_render::composite::RenderTarget;
use lumen_render::damage::DamageRegion;
use lumen_render::geom::{Box2, Rectangle};
use lumen_render::gradient::GradientStop;
use lumen_render::{Color, Device, DeviceConfig, PixelFormat};

fn device_with(config: DeviceConfig) -> Device<RecordingBatch> {
    Device::new(RecordingBatch::new(), config)
}

fn device() -> Device<RecordingBatch> {
    device_with(DeviceConfig::default())
}

fn make_target(
    dev: &mut Device<RecordingBatch>,
    width: u16,
    height: u16,
    format: PixelFormat,
) -> RenderTarget {
    let pitch = width as u32 * format.bytes_per_pixel();
    let buffer = dev
        .batch_mut()
        .create_buffer(pitch as usize * height as usize)
        .unwrap();
    RenderTarget {
        buffer,
        format,
        width,
        height,
        pitch,
        origin: (0, 0),
    }
}

fn make_source(
    dev: &mut Device<RecordingBatch>,
    width: u16,
    height: u16,
    format: PixelFormat,
) -> SurfaceDesc {
    let pitch = width as u32 * format.bytes_per_pixel();
    let buffer = dev
        .batch_mut()
        .create_buffer(pitch as usize * height as usize)
        .unwrap();
    SurfaceDesc {
        buffer,
        format,
        width,
        height,
        pitch,
        pixel: None,
    }
}

/// Submitted batches followed by the open batch, each as its own word
/// stream. Inline vertex payloads are always a suffix of their batch,
/// so walking commands from the front of each batch is safe.
fn batch_list(dev: &Device<RecordingBatch>) -> Vec<Vec<u32>> {
    let mut batches: Vec<Vec<u32>> = dev
        .batch()
        .submitted()
        .iter()
        .map(|b| b.words.clone())
        .collect();
    batches.push(dev.batch().words().to_vec());
    batches
}

/// Walk one batch command by command, yielding (opcode, payload start).
fn walk_commands(words: &[u32], mut visit: impl FnMut(u32, usize)) {
    let mut i = 0;
    while i < words.len() {
        let w = words[i];
        let len = (w & !cmd::OPCODE_MASK) as usize + 2;
        visit(cmd::opcode(w), i);
        i += len.max(1);
    }
}

fn count_opcode(dev: &Device<RecordingBatch>, op: u32) -> usize {
    let mut count = 0;
    for batch in batch_list(dev) {
        walk_commands(&batch, |opcode, _| {
            if opcode == op {
                count += 1;
            }
        });
    }
    count
}

fn primitive_vertex_counts(dev: &Device<RecordingBatch>) -> Vec<u32> {
    let mut counts = Vec::new();
    for batch in batch_list(dev) {
        walk_commands(&batch, |opcode, at| {
            if opcode == cmd::PRIMITIVE_RECTLIST {
                counts.push(batch[at + 1]);
            }
        });
    }
    counts
}

fn is_state_opcode(op: u32) -> bool {
    matches!(
        op,
        cmd::STATE_TARGET
            | cmd::STATE_SURFACE
            | cmd::STATE_BLEND
            | cmd::STATE_SAMPLER
            | cmd::STATE_KERNEL
            | cmd::STATE_VERTEX_ELEMENTS
            | cmd::STATE_DRAW_RECT
            | cmd::STATE_CONSTANTS
    )
}

fn state_bind_count(dev: &Device<RecordingBatch>) -> usize {
    let mut count = 0;
    for batch in batch_list(dev) {
        walk_commands(&batch, |opcode, _| {
            if is_state_opcode(opcode) {
                count += 1;
            }
        });
    }
    count
}

#[test]
fn vertex_accounting_is_lossless_across_flushes() {
    // Room for 16 rectangles per accumulator fill at 3 floats/vertex.
    let mut dev = device_with(DeviceConfig {
        vertex_capacity: 16 * 9,
        ..DeviceConfig::default()
    });
    let dst = make_target(&mut dev, 512, 512, PixelFormat::Argb8888);
    let src = make_source(&mut dev, 512, 512, PixelFormat::Argb8888);

    let n = 100;
    let mut op = dev
        .begin_composite(
            BlendOp::Over,
            &Picture::surface(src),
            None,
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (512, 512),
            None,
        )
        .unwrap();
    for i in 0..n {
        let r = Rectangle::from_box(&Box2::from_rect((i % 64) as i16, (i / 64) as i16 * 4, 4, 4));
        op.draw_rectangle(&mut dev, &r).unwrap();
    }
    op.finish(&mut dev).unwrap();

    // The flushes mid-list must not lose or duplicate rectangles:
    // total vertices across all draws is exactly 3 per rectangle.
    let counts = primitive_vertex_counts(&dev);
    assert!(counts.len() > 1, "expected mid-list flushes");
    assert!(counts.iter().all(|c| c % 3 == 0));
    assert_eq!(counts.iter().sum::<u32>(), 3 * n as u32);
}

#[test]
fn identical_operation_binds_no_state_twice() {
    let mut dev = device();
    let dst = make_target(&mut dev, 256, 256, PixelFormat::Argb8888);
    let src = Picture::solid(Color::new(0.2, 0.4, 0.6, 1.0));

    let run = |dev: &mut Device<RecordingBatch>| {
        let mut op = dev
            .begin_composite(
                BlendOp::Over,
                &src,
                None,
                &dst,
                (0, 0),
                (0, 0),
                (10, 10),
                (64, 64),
                None,
            )
            .unwrap();
        op.draw_rectangle(dev, &Rectangle::from_box(&Box2::from_rect(10, 10, 64, 64)))
            .unwrap();
        op.finish(dev).unwrap();
    };

    run(&mut dev);
    let before = state_bind_count(&dev);
    run(&mut dev);
    let after = state_bind_count(&dev);
    assert_eq!(after, before, "second identical operation re-bound state");
}

#[test]
fn oversized_composite_tiles_exactly() {
    let mut dev = device_with(DeviceConfig {
        max_3d_size: 2048,
        ..DeviceConfig::default()
    });
    let dst = make_target(&mut dev, 4096, 4096, PixelFormat::Argb8888);
    // Translucent solid: not reducible to a blitter fill, so every
    // tile exercises the full shader pipeline.
    let src = Picture::solid(Color::new(0.0, 1.0, 0.0, 0.5));
    let mut damage = DamageRegion::new();

    let mut op = dev
        .begin_composite(
            BlendOp::Over,
            &src,
            None,
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (4096, 4096),
            Some(&mut damage),
        )
        .unwrap();
    op.draw_rectangle(
        &mut dev,
        &Rectangle::from_box(&Box2::from_rect(0, 0, 4096, 4096)),
    )
    .unwrap();
    op.finish(&mut dev).unwrap();

    // The extent rewrites the whole target: per-rectangle reporting is
    // elided in favor of whole-surface damage.
    assert!(damage.is_all());

    // ceil(4096/2048)^2 = 4 tiles. The destination itself exceeds the
    // 3D limit, so each tile renders via a redirected target and blits
    // back: one copy per tile, one 3-vertex draw per tile.
    assert_eq!(count_opcode(&dev, cmd::BLT_COPY), 4);
    let counts = primitive_vertex_counts(&dev);
    assert_eq!(counts.iter().sum::<u32>(), 12);
}

#[test]
fn component_alpha_over_runs_two_passes() {
    let mut dev = device();
    let dst = make_target(&mut dev, 256, 256, PixelFormat::Argb8888);
    let src_surface = make_source(&mut dev, 128, 128, PixelFormat::Argb8888);
    let mask_surface = make_source(&mut dev, 128, 128, PixelFormat::Argb8888);
    let mut mask = Picture::surface(mask_surface);
    mask.component_alpha = true;

    let mut op = dev
        .begin_composite(
            BlendOp::Over,
            &Picture::surface(src_surface),
            Some(&mask),
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (128, 128),
            None,
        )
        .unwrap();
    op.draw_rectangle(&mut dev, &Rectangle::from_box(&Box2::from_rect(0, 0, 128, 128)))
        .unwrap();
    op.finish(&mut dev).unwrap();

    // One logical request, two draws: the OutReverse pass and the Add
    // pass over the same vertex range, under different blend state.
    let counts = primitive_vertex_counts(&dev);
    assert_eq!(counts.len(), 2);
    assert_eq!(counts[0], counts[1]);

    let mut blends = Vec::new();
    for batch in batch_list(&dev) {
        walk_commands(&batch, |opcode, at| {
            if opcode == cmd::STATE_BLEND {
                blends.push(batch[at + 1]);
            }
        });
    }
    assert_eq!(blends.len(), 2);
    assert_ne!(blends[0], blends[1], "both passes used the same blend");
}

#[test]
fn component_alpha_rejects_other_operators() {
    let mut dev = device();
    let dst = make_target(&mut dev, 64, 64, PixelFormat::Argb8888);
    let src_surface = make_source(&mut dev, 64, 64, PixelFormat::Argb8888);
    let mask_surface = make_source(&mut dev, 64, 64, PixelFormat::Argb8888);
    let mut mask = Picture::surface(mask_surface);
    mask.component_alpha = true;

    let live_before = dev.batch().live_buffers();
    let result = dev.begin_composite(
        BlendOp::Atop,
        &Picture::surface(src_surface),
        Some(&mask),
        &dst,
        (0, 0),
        (0, 0),
        (0, 0),
        (64, 64),
        None,
    );
    assert!(result.is_err());
    // The failure released every reference it took.
    assert_eq!(dev.batch().live_buffers(), live_before);
}

#[test]
fn self_copy_uses_blitter_only() {
    let mut dev = device();
    let dst = make_target(&mut dev, 512, 512, PixelFormat::Argb8888);
    let src = SurfaceDesc {
        buffer: dst.buffer,
        format: dst.format,
        width: dst.width,
        height: dst.height,
        pitch: dst.pitch,
        pixel: None,
    };

    dev.copy_rectangles(
        Alu::Copy,
        &src,
        (256, 0),
        &dst,
        &[Box2::from_rect(0, 0, 256, 256)],
    )
    .unwrap();
    dev.flush();

    let submitted = dev.batch().submitted();
    let blt_batches = submitted.iter().filter(|b| b.ring == Ring::Blt).count();
    assert_eq!(blt_batches, 1);
    assert_eq!(count_opcode(&dev, cmd::BLT_COPY), 1);
    assert_eq!(state_bind_count(&dev), 0, "blitter copy touched shader state");
}

/// Interpret recorded blitter fills against a pixel buffer.
fn interpret_fills(dev: &Device<RecordingBatch>, width: usize, height: usize) -> Vec<u32> {
    let mut pixels = vec![0u32; width * height];
    for batch in batch_list(dev) {
        walk_commands(&batch, |opcode, at| {
            if opcode == cmd::BLT_FILL {
                let x1 = (batch[at + 2] & 0xffff) as i16 as i32;
                let y1 = (batch[at + 2] >> 16) as i16 as i32;
                let x2 = (batch[at + 3] & 0xffff) as i16 as i32;
                let y2 = (batch[at + 3] >> 16) as i16 as i32;
                let pixel = batch[at + 5];
                for y in y1.max(0)..y2.min(height as i32) {
                    for x in x1.max(0)..x2.min(width as i32) {
                        pixels[y as usize * width + x as usize] = pixel;
                    }
                }
            }
        });
    }
    pixels
}

#[test]
fn opaque_fill_readback_matches_color() {
    let mut dev = device();
    let dst = make_target(&mut dev, 64, 64, PixelFormat::Xrgb8888);

    // Park the device on the BLT ring so the fill takes the blitter
    // path the interpreter understands.
    let self_src = SurfaceDesc {
        buffer: dst.buffer,
        format: dst.format,
        width: dst.width,
        height: dst.height,
        pitch: dst.pitch,
        pixel: None,
    };
    dev.copy_rectangles(
        Alu::Copy,
        &self_src,
        (32, 32),
        &dst,
        &[Box2::from_rect(0, 0, 1, 1)],
    )
    .unwrap();

    let red = Color::new(1.0, 0.0, 0.0, 1.0);
    dev.fill_rectangles(BlendOp::Src, red, &dst, &[Box2::from_rect(0, 0, 64, 64)])
        .unwrap();
    dev.flush();

    let pixels = interpret_fills(&dev, 64, 64);
    let expected = 0x00ff_0000;
    assert!(pixels.iter().all(|p| *p == expected));
}

#[test]
fn ten_thousand_fills_cycle_the_accumulator() {
    // Capacity for exactly 1000 solid rectangles' worth of floats.
    let mut dev = device_with(DeviceConfig {
        vertex_capacity: 1000 * 9,
        ..DeviceConfig::default()
    });
    let dst = make_target(&mut dev, 4096, 4096, PixelFormat::Argb8888);

    let boxes: Vec<Box2> = (0..10_000)
        .map(|i| {
            let x = (i % 1024) as i16 * 4;
            let y = (i / 1024) as i16 * 4;
            Box2::from_rect(x % 4096, y % 4096, 4, 4)
        })
        .collect();
    dev.fill_rectangles(BlendOp::Src, Color::WHITE, &dst, &boxes)
        .unwrap();
    dev.flush();

    let counts = primitive_vertex_counts(&dev);
    assert!(
        counts.len() >= 10,
        "expected at least 10 flush cycles, saw {}",
        counts.len()
    );
    assert_eq!(counts.iter().sum::<u32>(), 30_000);
}

#[test]
fn gradient_source_binds_constants() {
    let mut dev = device();
    let dst = make_target(&mut dev, 256, 256, PixelFormat::Argb8888);
    let src = Picture {
        source: PictureSource::LinearGradient {
            p0: (0.0, 0.0),
            p1: (256.0, 0.0),
            stops: vec![
                GradientStop { offset: 0.0, color: Color::BLACK },
                GradientStop { offset: 1.0, color: Color::WHITE },
            ],
        },
        transform: None,
        filter: Filter::Bilinear,
        repeat: Repeat::Pad,
        component_alpha: false,
    };

    let mut op = dev
        .begin_composite(
            BlendOp::Src,
            &src,
            None,
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (256, 256),
            None,
        )
        .unwrap();
    op.draw_rectangle(&mut dev, &Rectangle::from_box(&Box2::from_rect(0, 0, 256, 256)))
        .unwrap();
    op.finish(&mut dev).unwrap();

    assert_eq!(count_opcode(&dev, cmd::STATE_CONSTANTS), 1);
    assert!(count_opcode(&dev, cmd::PRIMITIVE_RECTLIST) >= 1);
}

#[test]
fn finish_releases_channel_references() {
    let mut dev = device();
    let dst = make_target(&mut dev, 128, 128, PixelFormat::Argb8888);
    let src_surface = make_source(&mut dev, 64, 64, PixelFormat::Argb8888);
    let live_before = dev.batch().live_buffers();

    let mut op = dev
        .begin_composite(
            BlendOp::Over,
            &Picture::surface(src_surface),
            None,
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (64, 64),
            None,
        )
        .unwrap();
    op.draw_rectangle(&mut dev, &Rectangle::from_box(&Box2::from_rect(0, 0, 64, 64)))
        .unwrap();
    op.finish(&mut dev).unwrap();

    // The operation retained the source for its duration and released
    // it at finish; the caller's own reference remains.
    assert_eq!(dev.batch().live_buffers(), live_before);
}

#[test]
fn damage_elided_when_operation_covers_target() {
    let mut dev = device();
    let dst = make_target(&mut dev, 64, 64, PixelFormat::Argb8888);
    let mut damage = DamageRegion::new();

    let mut op = dev
        .begin_composite(
            BlendOp::Src,
            &Picture::solid(Color::WHITE),
            None,
            &dst,
            (0, 0),
            (0, 0),
            (0, 0),
            (64, 64),
            Some(&mut damage),
        )
        .unwrap();
    op.draw_rectangle(&mut dev, &Rectangle::from_box(&Box2::from_rect(0, 0, 64, 64)))
        .unwrap();
    op.finish(&mut dev).unwrap();

    assert!(damage.is_all());
    assert!(damage.boxes().is_empty());
}

#[test]
fn partial_operation_reports_damage_boxes() {
    let mut dev = device();
    let dst = make_target(&mut dev, 256, 256, PixelFormat::Argb8888);
    let mut damage = DamageRegion::new();

    let mut op = dev
        .begin_composite(
            BlendOp::Over,
            &Picture::solid(Color::new(1.0, 0.0, 0.0, 0.5)),
            None,
            &dst,
            (0, 0),
            (0, 0),
            (16, 16),
            (32, 32),
            Some(&mut damage),
        )
        .unwrap();
    op.draw_rectangle(&mut dev, &Rectangle::from_box(&Box2::from_rect(16, 16, 32, 32)))
        .unwrap();
    op.finish(&mut dev).unwrap();

    assert!(!damage.is_all());
    assert_eq!(damage.boxes(), &[Box2::from_rect(16, 16, 32, 32)]);
}
