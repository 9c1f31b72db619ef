//! Rotary position embedding
//!
//! Applied in place to Q and K before the attention dot product. Adjacent
//! element pairs `(2i, 2i+1)` within each head are rotated by an angle
//! that depends on the pair index and the absolute position.

use emberlm_common::{EmberError, Result};

/// Default rotary frequency base
pub const ROPE_BASE: f32 = 10_000.0;

/// Rotate all heads of one token's Q or K vector in place.
///
/// `x` holds `num_heads` contiguous head vectors of `head_dim` elements;
/// `position` is the token's absolute position in the sequence.
pub fn apply_rope(x: &mut [f32], head_dim: usize, position: usize, base: f32) -> Result<()> {
    if head_dim == 0 || head_dim % 2 != 0 {
        return Err(EmberError::invalid_input(format!(
            "head_dim must be a positive even number, got {head_dim}"
        )));
    }
    if x.len() % head_dim != 0 {
        return Err(EmberError::shape(format!(
            "rope input of {} elements is not a multiple of head_dim {head_dim}",
            x.len()
        )));
    }

    for head in x.chunks_mut(head_dim) {
        for i in 0..head_dim / 2 {
            let theta = position as f32 * base.powf(-2.0 * i as f32 / head_dim as f32);
            let (sin, cos) = theta.sin_cos();
            let a = head[2 * i];
            let b = head[2 * i + 1];
            head[2 * i] = a * cos - b * sin;
            head[2 * i + 1] = a * sin + b * cos;
        }
    }
    Ok(())
}
