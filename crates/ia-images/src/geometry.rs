//! Resize geometry shared by all engines

use ia_core::ResizeOp;

/// Output dimensions of `op` applied to a `width` x `height` source
///
/// Aspect-preserving scales round to the nearest pixel and never go below 1.
pub fn target_dimensions(width: u32, height: u32, op: ResizeOp) -> (u32, u32) {
    match op {
        ResizeOp::Thumbnail { width, height } | ResizeOp::Exact { width, height } => {
            (width, height)
        }
        ResizeOp::Width { width: target } => {
            let scaled = height as f64 * target as f64 / width.max(1) as f64;
            (target, (scaled.round() as u32).max(1))
        }
        ResizeOp::Height { height: target } => {
            let scaled = width as f64 * target as f64 / height.max(1) as f64;
            ((scaled.round() as u32).max(1), target)
        }
    }
}
