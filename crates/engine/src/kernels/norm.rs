//! Normalization kernels
//!
//! RMSNorm and LayerNorm over the last dimension of a `(batch, features)`
//! input, each in a plain and a residual-fused form. The fused variants
//! read `x + residual` in both passes instead of writing the sum to an
//! intermediate buffer.

use emberlm_common::{EmberError, Result};

/// Default epsilon for both normalizations
pub const NORM_EPS: f32 = 1e-5;

/// RMSNorm: `out = gamma * x / sqrt(mean(x^2) + eps)`, two-pass
pub fn rms_norm(
    out: &mut [f32],
    x: &[f32],
    gamma: &[f32],
    batch: usize,
    features: usize,
    eps: f32,
) -> Result<()> {
    check_norm_dims("rms_norm", out.len(), x.len(), batch, features, gamma.len())?;

    for (out_row, x_row) in out.chunks_mut(features).zip(x.chunks(features)) {
        let mut sum_sq = 0.0f32;
        for &v in x_row {
            sum_sq += v * v;
        }
        let inv_rms = 1.0 / (sum_sq / features as f32 + eps).sqrt();

        for ((o, &v), &g) in out_row.iter_mut().zip(x_row).zip(gamma) {
            *o = g * v * inv_rms;
        }
    }
    Ok(())
}

/// RMSNorm over `x + residual`, fused: the sum is never materialized
pub fn rms_norm_fused_residual(
    out: &mut [f32],
    x: &[f32],
    residual: &[f32],
    gamma: &[f32],
    batch: usize,
    features: usize,
    eps: f32,
) -> Result<()> {
    check_norm_dims("rms_norm_fused", out.len(), x.len(), batch, features, gamma.len())?;
    if residual.len() != x.len() {
        return Err(EmberError::shape(format!(
            "rms_norm_fused: residual has {} elements, input {}",
            residual.len(),
            x.len()
        )));
    }

    for ((out_row, x_row), r_row) in out
        .chunks_mut(features)
        .zip(x.chunks(features))
        .zip(residual.chunks(features))
    {
        let mut sum_sq = 0.0f32;
        for (&v, &r) in x_row.iter().zip(r_row) {
            let s = v + r;
            sum_sq += s * s;
        }
        let inv_rms = 1.0 / (sum_sq / features as f32 + eps).sqrt();

        for (((o, &v), &r), &g) in out_row.iter_mut().zip(x_row).zip(r_row).zip(gamma) {
            *o = g * (v + r) * inv_rms;
        }
    }
    Ok(())
}

/// LayerNorm: `out = gamma * (x - mean) / sqrt(var + eps) + beta`.
///
/// Mean and variance use Welford's update for numerical stability.
pub fn layer_norm(
    out: &mut [f32],
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    batch: usize,
    features: usize,
    eps: f32,
) -> Result<()> {
    check_norm_dims("layer_norm", out.len(), x.len(), batch, features, gamma.len())?;
    if beta.len() != features {
        return Err(EmberError::shape(format!(
            "layer_norm: beta has {} elements, features {}",
            beta.len(),
            features
        )));
    }

    for (out_row, x_row) in out.chunks_mut(features).zip(x.chunks(features)) {
        let (mean, var) = welford(x_row.iter().copied());
        let inv_std = 1.0 / (var + eps).sqrt();

        for (((o, &v), &g), &b) in out_row.iter_mut().zip(x_row).zip(gamma).zip(beta) {
            *o = g * (v - mean) * inv_std + b;
        }
    }
    Ok(())
}

/// LayerNorm over `x + residual`, fused
#[allow(clippy::too_many_arguments)]
pub fn layer_norm_fused_residual(
    out: &mut [f32],
    x: &[f32],
    residual: &[f32],
    gamma: &[f32],
    beta: &[f32],
    batch: usize,
    features: usize,
    eps: f32,
) -> Result<()> {
    check_norm_dims("layer_norm_fused", out.len(), x.len(), batch, features, gamma.len())?;
    if beta.len() != features || residual.len() != x.len() {
        return Err(EmberError::shape(
            "layer_norm_fused: beta or residual length mismatch".to_string(),
        ));
    }

    for ((out_row, x_row), r_row) in out
        .chunks_mut(features)
        .zip(x.chunks(features))
        .zip(residual.chunks(features))
    {
        let (mean, var) = welford(x_row.iter().zip(r_row).map(|(&v, &r)| v + r));
        let inv_std = 1.0 / (var + eps).sqrt();

        for ((((o, &v), &r), &g), &b) in
            out_row.iter_mut().zip(x_row).zip(r_row).zip(gamma).zip(beta)
        {
            *o = g * ((v + r) - mean) * inv_std + b;
        }
    }
    Ok(())
}

/// Welford running mean and population variance
fn welford(values: impl Iterator<Item = f32>) -> (f32, f32) {
    let mut mean = 0.0f32;
    let mut m2 = 0.0f32;
    let mut count = 0usize;

    for v in values {
        count += 1;
        let delta = v - mean;
        mean += delta / count as f32;
        m2 += delta * (v - mean);
    }

    if count == 0 {
        (0.0, 0.0)
    } else {
        (mean, m2 / count as f32)
    }
}

fn check_norm_dims(
    op: &str,
    out_len: usize,
    x_len: usize,
    batch: usize,
    features: usize,
    gamma_len: usize,
) -> Result<()> {
    if x_len != batch * features || out_len != x_len || gamma_len != features {
        return Err(EmberError::shape(format!(
            "{op}: out={out_len}, x={x_len}, gamma={gamma_len} for batch={batch}, features={features}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_gamma() {
        let x = vec![1.0f32, 2.0, 3.0, 4.0];
        let gamma = vec![1.0; 4];
        let mut out = vec![0.0; 4];
        rms_norm(&mut out, &x, &gamma, 1, 4, 0.0).unwrap();

        let rms = (x.iter().map(|v| v * v).sum::<f32>() / 4.0).sqrt();
        for (o, v) in out.iter().zip(x.iter()) {
            assert!((o - v / rms).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rms_norm_fused_equals_unfused_on_sum() {
        let x = vec![0.5f32, -1.0, 2.0, 0.25, 1.5, -0.75];
        let r = vec![0.1f32, 0.2, -0.3, 0.4, -0.5, 0.6];
        let gamma = vec![1.2f32, 0.8, 1.0];

        let summed: Vec<f32> = x.iter().zip(r.iter()).map(|(a, b)| a + b).collect();
        let mut unfused = vec![0.0; 6];
        rms_norm(&mut unfused, &summed, &gamma, 2, 3, NORM_EPS).unwrap();

        let mut fused = vec![0.0; 6];
        rms_norm_fused_residual(&mut fused, &x, &r, &gamma, 2, 3, NORM_EPS).unwrap();

        for (f, u) in fused.iter().zip(unfused.iter()) {
            assert!((f - u).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_var() {
        let x = vec![1.0f32, 2.0, 3.0, 4.0, 5.0];
        let gamma = vec![1.0; 5];
        let beta = vec![0.0; 5];
        let mut out = vec![0.0; 5];
        layer_norm(&mut out, &x, &gamma, &beta, 1, 5, 0.0).unwrap();

        let mean: f32 = out.iter().sum::<f32>() / 5.0;
        let var: f32 = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 5.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_gamma_beta_applied() {
        let x = vec![-1.0f32, 1.0];
        let gamma = vec![2.0f32, 2.0];
        let beta = vec![10.0f32, 10.0];
        let mut out = vec![0.0; 2];
        layer_norm(&mut out, &x, &gamma, &beta, 1, 2, 0.0).unwrap();

        // Normalized input is [-1, 1]; scaled and shifted: [8, 12].
        assert!((out[0] - 8.0).abs() < 1e-4);
        assert!((out[1] - 12.0).abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_fused_equals_unfused_on_sum() {
        let x = vec![0.5f32, -1.0, 2.0, 0.25];
        let r = vec![0.3f32, 0.1, -0.2, 0.9];
        let gamma = vec![1.0f32, 1.1, 0.9, 1.0];
        let beta = vec![0.0f32, -0.1, 0.1, 0.2];

        let summed: Vec<f32> = x.iter().zip(r.iter()).map(|(a, b)| a + b).collect();
        let mut unfused = vec![0.0; 4];
        layer_norm(&mut unfused, &summed, &gamma, &beta, 1, 4, NORM_EPS).unwrap();

        let mut fused = vec![0.0; 4];
        layer_norm_fused_residual(&mut fused, &x, &r, &gamma, &beta, 1, 4, NORM_EPS).unwrap();

        for (f, u) in fused.iter().zip(unfused.iter()) {
            assert!((f - u).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut out: Vec<f32> = vec![];
        rms_norm(&mut out, &[], &[1.0, 1.0], 0, 2, NORM_EPS).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_norm_shape_mismatch() {
        let mut out = vec![0.0; 4];
        assert!(rms_norm(&mut out, &[0.0; 4], &[1.0; 3], 1, 4, NORM_EPS).is_err());
        assert!(layer_norm(&mut out, &[0.0; 4], &[1.0; 4], &[0.0; 3], 1, 4, NORM_EPS).is_err());
    }
}
