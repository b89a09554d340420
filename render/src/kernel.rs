//! Shader kernel selection.
//!
//! The shader pipeline runs one of a fixed set of pixel kernels,
//! selected by the source kind (sampled texture or solid, linear
//! gradient, radial gradient), the mask kind (none, per-pixel alpha,
//! component alpha, component alpha multiplying source alpha) and the
//! transform class (affine kernels skip the homogeneous divide).

use crate::blend::{op_reads_source_alpha, BlendOp};

/// Pixel-shader kernels known to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WmKernel {
    NoMaskAffine,
    NoMaskProjective,
    MaskAffine,
    MaskProjective,
    MaskCaAffine,
    MaskCaProjective,
    MaskCaSrcAlphaAffine,
    MaskCaSrcAlphaProjective,
    LinearGradient,
    LinearGradientMask,
    RadialGradient,
    RadialGradientMask,
}

impl WmKernel {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            WmKernel::NoMaskAffine => "nomask_affine",
            WmKernel::NoMaskProjective => "nomask_projective",
            WmKernel::MaskAffine => "mask_affine",
            WmKernel::MaskProjective => "mask_projective",
            WmKernel::MaskCaAffine => "maskca_affine",
            WmKernel::MaskCaProjective => "maskca_projective",
            WmKernel::MaskCaSrcAlphaAffine => "maskca_srcalpha_affine",
            WmKernel::MaskCaSrcAlphaProjective => "maskca_srcalpha_projective",
            WmKernel::LinearGradient => "linear_gradient",
            WmKernel::LinearGradientMask => "linear_gradient_mask",
            WmKernel::RadialGradient => "radial_gradient",
            WmKernel::RadialGradientMask => "radial_gradient_mask",
        }
    }
}

/// Source shape axis of the kernel matrix. Solid sources sample a 1x1
/// texture and share the sampled kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSource {
    Sampled,
    LinearGradient,
    RadialGradient,
}

/// Select the kernel for an operation.
///
/// A component-alpha mask whose operator reads source alpha needs the
/// kernel that multiplies source alpha into the mask channels; the
/// plain component-alpha kernel multiplies color channels only.
/// Gradient sources evaluate their parameter from shader constants, so
/// they ignore the affine axis and have no component-alpha variants
/// (the pipeline rejects that combination beforehand).
pub fn choose_kernel(
    op: BlendOp,
    source: KernelSource,
    has_mask: bool,
    is_ca: bool,
    is_affine: bool,
) -> WmKernel {
    match source {
        KernelSource::LinearGradient => {
            if has_mask {
                WmKernel::LinearGradientMask
            } else {
                WmKernel::LinearGradient
            }
        }
        KernelSource::RadialGradient => {
            if has_mask {
                WmKernel::RadialGradientMask
            } else {
                WmKernel::RadialGradient
            }
        }
        KernelSource::Sampled => match (has_mask, is_ca, op_reads_source_alpha(op), is_affine) {
            (false, _, _, true) => WmKernel::NoMaskAffine,
            (false, _, _, false) => WmKernel::NoMaskProjective,
            (true, false, _, true) => WmKernel::MaskAffine,
            (true, false, _, false) => WmKernel::MaskProjective,
            (true, true, false, true) => WmKernel::MaskCaAffine,
            (true, true, false, false) => WmKernel::MaskCaProjective,
            (true, true, true, true) => WmKernel::MaskCaSrcAlphaAffine,
            (true, true, true, false) => WmKernel::MaskCaSrcAlphaProjective,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampled_kernel_matrix() {
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::Sampled, false, false, true),
            WmKernel::NoMaskAffine
        );
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::Sampled, false, false, false),
            WmKernel::NoMaskProjective
        );
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::Sampled, true, false, true),
            WmKernel::MaskAffine
        );
        // Add does not read source alpha, so component alpha stays in
        // the plain CA kernel.
        assert_eq!(
            choose_kernel(BlendOp::Add, KernelSource::Sampled, true, true, true),
            WmKernel::MaskCaAffine
        );
        // Over does, which selects the source-alpha variant.
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::Sampled, true, true, true),
            WmKernel::MaskCaSrcAlphaAffine
        );
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::Sampled, true, true, false),
            WmKernel::MaskCaSrcAlphaProjective
        );
    }

    #[test]
    fn test_gradient_kernels() {
        assert_eq!(
            choose_kernel(BlendOp::Src, KernelSource::LinearGradient, false, false, true),
            WmKernel::LinearGradient
        );
        assert_eq!(
            choose_kernel(BlendOp::Over, KernelSource::RadialGradient, true, false, true),
            WmKernel::RadialGradientMask
        );
    }
}
