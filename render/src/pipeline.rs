//! Pipeline selection.
//!
//! Every operation is routed once, at setup: blitter or shader
//! pipeline, tiled or direct, one pass or two. The decisions live here
//! so the facade stays a wiring layer.

use crate::batch::Ring;
use crate::blend::{op_reads_source_alpha, table_src_factor, BlendFactor, BlendOp};

/// Lifecycle of one operation descriptor.
///
/// `Building -> Ready -> Accumulating <-> Flushed -> Finalizing -> Done`;
/// only `Accumulating` re-enters `Flushed`, and `Finalizing` (which
/// runs the second pass when one is pending) is terminal apart from
/// `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Ready,
    Accumulating,
    Flushed,
    Finalizing,
    Done,
}

impl Phase {
    /// Whether rectangles may be appended in this phase.
    pub fn accepts_rectangles(self) -> bool {
        matches!(self, Phase::Ready | Phase::Accumulating | Phase::Flushed)
    }
}

/// Prefer the blitter when the device is already in BLT mode (a
/// pipeline switch costs a submission) or when the geometry exceeds
/// what the shader pipeline can address.
pub fn prefer_blt(ring: Ring, width: i16, height: i16, max_3d_size: u16) -> bool {
    if ring == Ring::Blt {
        return true;
    }
    width as i32 > max_3d_size as i32 || height as i32 > max_3d_size as i32
}

/// The shader pipeline cannot address the extent in one operation.
pub fn needs_tiling(max_3d_size: u16, width: i16, height: i16) -> bool {
    width as i32 > max_3d_size as i32 || height as i32 > max_3d_size as i32
}

/// Vertex layout id: one per floats-per-vertex combination.
pub fn vertex_layout_id(has_mask: bool, is_affine: bool) -> u32 {
    (has_mask as u32) << 1 | is_affine as u32
}

/// Component-alpha routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaDecision {
    /// The mask carries per-channel alpha.
    pub is_component_alpha: bool,
    /// The blend needs both source alpha and per-channel mask values;
    /// run OutReverse then Add over the same geometry.
    pub two_pass: bool,
    /// Operator bound for the first (or only) pass.
    pub first_pass_op: BlendOp,
}

/// Decide component-alpha handling for an operation.
///
/// A component-alpha mask multiplies each channel separately, so the
/// blender's single source value cannot carry both the source alpha
/// and the per-channel mask product. For Over the sum can be split
/// into an OutReverse pass and an Add pass over identical geometry;
/// for every other alpha-consuming operator this is a capability
/// failure, never an approximation.
pub fn decide_component_alpha(
    op: BlendOp,
    mask_is_component_alpha: bool,
    mask_has_color: bool,
) -> Option<CaDecision> {
    let is_ca = mask_is_component_alpha && mask_has_color;
    if !is_ca {
        return Some(CaDecision {
            is_component_alpha: false,
            two_pass: false,
            first_pass_op: op,
        });
    }

    if op_reads_source_alpha(op) && table_src_factor(op) != BlendFactor::Zero {
        if op != BlendOp::Over {
            return None;
        }
        return Some(CaDecision {
            is_component_alpha: true,
            two_pass: true,
            first_pass_op: BlendOp::OutReverse,
        });
    }

    Some(CaDecision {
        is_component_alpha: true,
        two_pass: false,
        first_pass_op: op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefer_blt_on_blt_ring() {
        assert!(prefer_blt(Ring::Blt, 16, 16, 8192));
        assert!(!prefer_blt(Ring::Render, 16, 16, 8192));
    }

    #[test]
    fn test_prefer_blt_for_oversized_geometry() {
        assert!(prefer_blt(Ring::Render, 9000, 16, 8192));
        assert!(prefer_blt(Ring::Render, 16, 9000, 8192));
    }

    #[test]
    fn test_needs_tiling() {
        assert!(!needs_tiling(2048, 2048, 2048));
        assert!(needs_tiling(2048, 2049, 16));
        assert!(needs_tiling(2048, 16, 4096));
    }

    #[test]
    fn test_vertex_layout_ids_distinct() {
        let ids = [
            vertex_layout_id(false, false),
            vertex_layout_id(false, true),
            vertex_layout_id(true, false),
            vertex_layout_id(true, true),
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_plain_mask_is_single_pass() {
        let d = decide_component_alpha(BlendOp::Over, false, true).unwrap();
        assert!(!d.is_component_alpha);
        assert!(!d.two_pass);
        assert_eq!(d.first_pass_op, BlendOp::Over);
    }

    #[test]
    fn test_component_alpha_over_needs_two_passes() {
        let d = decide_component_alpha(BlendOp::Over, true, true).unwrap();
        assert!(d.is_component_alpha);
        assert!(d.two_pass);
        assert_eq!(d.first_pass_op, BlendOp::OutReverse);
    }

    #[test]
    fn test_component_alpha_without_color_bits_is_plain() {
        let d = decide_component_alpha(BlendOp::Over, true, false).unwrap();
        assert!(!d.is_component_alpha);
        assert!(!d.two_pass);
    }

    #[test]
    fn test_component_alpha_single_pass_operators() {
        // Add never reads source alpha: single pass.
        let d = decide_component_alpha(BlendOp::Add, true, true).unwrap();
        assert!(d.is_component_alpha);
        assert!(!d.two_pass);
        // OutReverse reads source alpha but with a zero source factor.
        let d = decide_component_alpha(BlendOp::OutReverse, true, true).unwrap();
        assert!(!d.two_pass);
    }

    #[test]
    fn test_component_alpha_capability_failure() {
        assert!(decide_component_alpha(BlendOp::Atop, true, true).is_none());
        assert!(decide_component_alpha(BlendOp::Xor, true, true).is_none());
    }

    #[test]
    fn test_phase_rectangle_gate() {
        assert!(Phase::Ready.accepts_rectangles());
        assert!(Phase::Accumulating.accepts_rectangles());
        assert!(Phase::Flushed.accepts_rectangles());
        assert!(!Phase::Building.accepts_rectangles());
        assert!(!Phase::Finalizing.accepts_rectangles());
        assert!(!Phase::Done.accepts_rectangles());
    }
}
