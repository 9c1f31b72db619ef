//! Activation functions and softmax
//!
//! Activations run in place over caller buffers. Softmax subtracts the row
//! maximum before exponentiating.

/// GELU, tanh approximation, in place
pub fn gelu(x: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    for v in x.iter_mut() {
        let x3 = *v * *v * *v;
        *v = 0.5 * *v * (1.0 + (SQRT_2_OVER_PI * (*v + 0.044715 * x3)).tanh());
    }
}

/// SiLU (`x * sigmoid(x)`), in place
pub fn silu(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = *v / (1.0 + (-*v).exp());
    }
}

/// Numerically stable softmax over one row, in place
pub fn softmax(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv;
    }
}

/// Softmax over the last dimension of a `(rows, cols)` buffer, in place
pub fn softmax_rows(data: &mut [f32], cols: usize) {
    if cols == 0 {
        return;
    }
    for row in data.chunks_mut(cols) {
        softmax(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut row = vec![1.0f32, 2.0, 3.0];
        softmax(&mut row);

        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(row[0] < row[1] && row[1] < row[2]);
    }

    #[test]
    fn test_softmax_handles_large_logits() {
        // Without max subtraction these would overflow to inf.
        let mut row = vec![1000.0f32, 1001.0, 999.0];
        softmax(&mut row);
        assert!(row.iter().all(|v| v.is_finite()));
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_empty_is_noop() {
        let mut row: Vec<f32> = vec![];
        softmax(&mut row);
    }

    #[test]
    fn test_softmax_rows_independent() {
        let mut data = vec![0.0f32, 0.0, 5.0, 5.0];
        softmax_rows(&mut data, 2);
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!((data[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gelu_known_values() {
        let mut x = vec![0.0f32, 1.0, -1.0];
        gelu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 0.841_192).abs() < 1e-3);
        assert!((x[2] + 0.158_808).abs() < 1e-3);
    }

    #[test]
    fn test_silu_known_values() {
        let mut x = vec![0.0f32, 1.0];
        silu(&mut x);
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 0.731_058).abs() < 1e-4);
    }
}
