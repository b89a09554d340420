//! Blend operators and the blend-factor derivation table.
//!
//! One authoritative table maps each Porter-Duff style operator to its
//! hardware source/destination factors; the two adjustments (targets
//! without an alpha channel, component-alpha masks) are applied on top
//! of the table lookup, never encoded into extra table rows.

/// Composite operators accepted at the public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlendOp {
    Clear,
    Src,
    Dst,
    Over,
    OverReverse,
    In,
    InReverse,
    Out,
    OutReverse,
    Atop,
    AtopReverse,
    Xor,
    Add,
}

impl BlendOp {
    pub const COUNT: usize = 13;

    /// `Over` with a source known to be fully opaque writes the same
    /// pixels as `Src`, which the blitter can express.
    pub fn reduce_opaque_source(self, source_is_opaque: bool) -> BlendOp {
        if self == BlendOp::Over && source_is_opaque {
            BlendOp::Src
        } else {
            self
        }
    }
}

/// Hardware blend factors used by the operator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
}

struct BlendInfo {
    /// Whether the equation consumes the source alpha value. Relevant
    /// both for the component-alpha factor rewrite and for kernel
    /// selection.
    src_alpha: bool,
    src: BlendFactor,
    dst: BlendFactor,
}

const BLEND_TABLE: [BlendInfo; BlendOp::COUNT] = [
    // Clear
    BlendInfo { src_alpha: false, src: BlendFactor::Zero, dst: BlendFactor::Zero },
    // Src
    BlendInfo { src_alpha: false, src: BlendFactor::One, dst: BlendFactor::Zero },
    // Dst
    BlendInfo { src_alpha: false, src: BlendFactor::Zero, dst: BlendFactor::One },
    // Over
    BlendInfo { src_alpha: true, src: BlendFactor::One, dst: BlendFactor::InvSrcAlpha },
    // OverReverse
    BlendInfo { src_alpha: false, src: BlendFactor::InvDstAlpha, dst: BlendFactor::One },
    // In
    BlendInfo { src_alpha: false, src: BlendFactor::DstAlpha, dst: BlendFactor::Zero },
    // InReverse
    BlendInfo { src_alpha: true, src: BlendFactor::Zero, dst: BlendFactor::SrcAlpha },
    // Out
    BlendInfo { src_alpha: false, src: BlendFactor::InvDstAlpha, dst: BlendFactor::Zero },
    // OutReverse
    BlendInfo { src_alpha: true, src: BlendFactor::Zero, dst: BlendFactor::InvSrcAlpha },
    // Atop
    BlendInfo { src_alpha: true, src: BlendFactor::DstAlpha, dst: BlendFactor::InvSrcAlpha },
    // AtopReverse
    BlendInfo { src_alpha: true, src: BlendFactor::InvDstAlpha, dst: BlendFactor::SrcAlpha },
    // Xor
    BlendInfo { src_alpha: true, src: BlendFactor::InvDstAlpha, dst: BlendFactor::InvSrcAlpha },
    // Add
    BlendInfo { src_alpha: false, src: BlendFactor::One, dst: BlendFactor::One },
];

/// Whether the operator's equation reads the source alpha. Operators
/// for which this holds cannot combine a non-zero source factor with a
/// component-alpha mask in a single pass.
pub fn op_reads_source_alpha(op: BlendOp) -> bool {
    BLEND_TABLE[op as usize].src_alpha
}

/// Source factor of the raw table entry, before adjustments.
pub fn table_src_factor(op: BlendOp) -> BlendFactor {
    BLEND_TABLE[op as usize].src
}

/// Derive the hardware blend factor pair for an operator.
///
/// Targets without an alpha channel behave as if destination alpha
/// were saturated; component-alpha masks replace the per-pixel source
/// alpha with the mask-multiplied per-channel values.
pub fn blend_for(
    op: BlendOp,
    has_component_alpha: bool,
    dst_has_alpha: bool,
) -> (BlendFactor, BlendFactor) {
    let info = &BLEND_TABLE[op as usize];
    let mut src = info.src;
    let mut dst = info.dst;

    if !dst_has_alpha {
        if src == BlendFactor::DstAlpha {
            src = BlendFactor::One;
        } else if src == BlendFactor::InvDstAlpha {
            src = BlendFactor::Zero;
        }
    }

    if has_component_alpha && info.src_alpha {
        if dst == BlendFactor::SrcAlpha {
            dst = BlendFactor::SrcColor;
        } else if dst == BlendFactor::InvSrcAlpha {
            dst = BlendFactor::InvSrcColor;
        }
    }

    (src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_factors() {
        assert_eq!(
            blend_for(BlendOp::Over, false, true),
            (BlendFactor::One, BlendFactor::InvSrcAlpha)
        );
        assert_eq!(
            blend_for(BlendOp::Add, false, true),
            (BlendFactor::One, BlendFactor::One)
        );
        assert_eq!(
            blend_for(BlendOp::Clear, false, true),
            (BlendFactor::Zero, BlendFactor::Zero)
        );
    }

    #[test]
    fn test_opaque_destination_adjustment() {
        // Without destination alpha, In degenerates to Src.
        assert_eq!(
            blend_for(BlendOp::In, false, false),
            (BlendFactor::One, BlendFactor::Zero)
        );
        assert_eq!(
            blend_for(BlendOp::Out, false, false),
            (BlendFactor::Zero, BlendFactor::Zero)
        );
    }

    #[test]
    fn test_component_alpha_factor_rewrite() {
        assert_eq!(
            blend_for(BlendOp::Over, true, true),
            (BlendFactor::One, BlendFactor::InvSrcColor)
        );
        assert_eq!(
            blend_for(BlendOp::OutReverse, true, true),
            (BlendFactor::Zero, BlendFactor::InvSrcColor)
        );
        // Operators that never read source alpha are unaffected.
        assert_eq!(
            blend_for(BlendOp::Add, true, true),
            (BlendFactor::One, BlendFactor::One)
        );
    }

    #[test]
    fn test_opaque_over_reduction() {
        assert_eq!(BlendOp::Over.reduce_opaque_source(true), BlendOp::Src);
        assert_eq!(BlendOp::Over.reduce_opaque_source(false), BlendOp::Over);
        assert_eq!(BlendOp::Add.reduce_opaque_source(true), BlendOp::Add);
    }
}
