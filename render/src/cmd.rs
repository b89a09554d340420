//! Command-word vocabulary.
//!
//! The batch manager treats the command stream as an opaque sequence of
//! 32-bit words plus relocations; these constants are the vocabulary
//! this engine emits into it. Each command is a header word carrying
//! the opcode in the high half and `length - 2` in the low bits,
//! followed by its payload words.

/// Mask selecting the opcode portion of a header word.
pub const OPCODE_MASK: u32 = 0xffff_0000;

/// Pipeline flush. Payload: reserved word.
pub const MI_FLUSH: u32 = 0x0200_0000;

/// Per-batch fixed-function preamble. Payload: device capability word.
pub const STATE_INVARIANT: u32 = 0x6100_0000;

/// Render target binding. Payload: format, size, pitch, address.
pub const STATE_TARGET: u32 = 0x6200_0000;

/// Sampler surface binding. Payload: format, size, pitch, address.
pub const STATE_SURFACE: u32 = 0x6300_0000;

/// Blend state. Payload: source factor << 16 | destination factor.
pub const STATE_BLEND: u32 = 0x6400_0000;

/// Sampler state. Payload: packed filter/extend selector.
pub const STATE_SAMPLER: u32 = 0x6500_0000;

/// Shader kernel. Payload: kernel id.
pub const STATE_KERNEL: u32 = 0x6600_0000;

/// Vertex element layout. Payload: layout id << 16 | floats per vertex.
pub const STATE_VERTEX_ELEMENTS: u32 = 0x6700_0000;

/// Drawing rectangle. Payload: limit (y << 16 | x), offset (y << 16 | x).
pub const STATE_DRAW_RECT: u32 = 0x6800_0000;

/// Shader constants (gradient coefficients). Payload: four words.
pub const STATE_CONSTANTS: u32 = 0x6a00_0000;

/// Vertex buffer binding. Payload: pitch in bytes, start address,
/// end address, reserved. The two address words are relocations,
/// patched when the vertex buffer is closed.
pub const VERTEX_BUFFER: u32 = 0x6900_0000;

/// Rectangle-list draw. Payload: vertex count (back-patched at flush),
/// start vertex, instance count, start instance, reserved.
pub const PRIMITIVE_RECTLIST: u32 = 0x7a00_0000;

/// Blitter solid fill. Payload: rop/bpp, start, end, address, pixel.
pub const BLT_FILL: u32 = 0x4050_0000;

/// Blitter copy. Payload: rop/bpp, dst start, dst end, dst address,
/// src start, src pitch, src address.
pub const BLT_COPY: u32 = 0x4053_0000;

/// Build a header word for a command of `len` total words.
pub const fn with_len(op: u32, len: u32) -> u32 {
    op | (len - 2)
}

/// Opcode portion of a header word.
pub const fn opcode(word: u32) -> u32 {
    word & OPCODE_MASK
}

/// Pack a coordinate pair into one word, y in the high half.
pub fn xy(x: i16, y: i16) -> u32 {
    ((y as u16 as u32) << 16) | x as u16 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_length_encoding() {
        let w = with_len(STATE_DRAW_RECT, 3);
        assert_eq!(opcode(w), STATE_DRAW_RECT);
        assert_eq!(w & !OPCODE_MASK, 1);
    }

    #[test]
    fn test_xy_packs_signed() {
        assert_eq!(xy(3, 7), (7 << 16) | 3);
        assert_eq!(xy(-1, 0), 0xffff);
        assert_eq!(xy(0, -1), 0xffff_0000);
    }
}
