//! Matrix multiplication against block-quantized weights
//!
//! `C = A · dequant(B)` where B stays in its block encoding. Each block of
//! B contributes `block_size` partial products scaled by the block's scale;
//! at no point is the dequantized matrix materialized. Blocks are decoded
//! into a small stack buffer so the accumulation can run through the
//! dispatch's fused-multiply-add path.

use super::KernelDispatch;
use crate::tensor::{Q4Tensor, Q8Tensor};
use emberlm_common::{EmberError, Result};
use rayon::prelude::*;

use super::matmul::PARALLEL_ROW_THRESHOLD;

/// Largest supported quantization block width
pub const MAX_BLOCK_SIZE: usize = 256;

/// `C = A · dequant(B)` with `A: (m, k)`, `B: k x n quantized`, `C: (m, n)`
pub fn matmul_q4(
    dispatch: &KernelDispatch,
    c: &mut [f32],
    a: &[f32],
    b: &Q4Tensor,
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_quant_dims("matmul_q4", a.len(), c.len(), b.rows(), b.cols(), b.block_size(), m, k, n)?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let block_size = b.block_size();
    let blocks_per_row = b.blocks_per_row();

    let row_op = |(row_out, a_row): (&mut [f32], &[f32])| {
        let mut decoded = [0.0f32; MAX_BLOCK_SIZE];
        row_out.fill(0.0);
        for (ki, &av) in a_row.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            for blk in 0..blocks_per_row {
                let scale = b.scale(ki, blk);
                if scale == 0.0 {
                    continue;
                }
                let bytes = b.block_bytes(ki, blk);
                for (i, &byte) in bytes.iter().enumerate() {
                    decoded[2 * i] = ((byte & 0x0F) as i32 - 8) as f32;
                    decoded[2 * i + 1] = ((byte >> 4) as i32 - 8) as f32;
                }
                let col = blk * block_size;
                dispatch.axpy(
                    av * scale,
                    &decoded[..block_size],
                    &mut row_out[col..col + block_size],
                );
            }
        }
    };

    if m >= PARALLEL_ROW_THRESHOLD {
        c.par_chunks_mut(n).zip(a.par_chunks(k)).for_each(row_op);
    } else {
        c.chunks_mut(n).zip(a.chunks(k)).for_each(row_op);
    }
    Ok(())
}

/// `C = A · dequant(B)` for 8-bit blocks
pub fn matmul_q8(
    dispatch: &KernelDispatch,
    c: &mut [f32],
    a: &[f32],
    b: &Q8Tensor,
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_quant_dims("matmul_q8", a.len(), c.len(), b.rows(), b.cols(), b.block_size(), m, k, n)?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let block_size = b.block_size();
    let blocks_per_row = b.blocks_per_row();

    let row_op = |(row_out, a_row): (&mut [f32], &[f32])| {
        let mut decoded = [0.0f32; MAX_BLOCK_SIZE];
        row_out.fill(0.0);
        for (ki, &av) in a_row.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            for blk in 0..blocks_per_row {
                let scale = b.scale(ki, blk);
                if scale == 0.0 {
                    continue;
                }
                for (d, &q) in decoded[..block_size]
                    .iter_mut()
                    .zip(b.block_codes(ki, blk).iter())
                {
                    *d = q as f32;
                }
                let col = blk * block_size;
                dispatch.axpy(
                    av * scale,
                    &decoded[..block_size],
                    &mut row_out[col..col + block_size],
                );
            }
        }
    };

    if m >= PARALLEL_ROW_THRESHOLD {
        c.par_chunks_mut(n).zip(a.par_chunks(k)).for_each(row_op);
    } else {
        c.chunks_mut(n).zip(a.chunks(k)).for_each(row_op);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_quant_dims(
    op: &str,
    a_len: usize,
    c_len: usize,
    b_rows: usize,
    b_cols: usize,
    block_size: usize,
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    if block_size > MAX_BLOCK_SIZE {
        return Err(EmberError::invalid_input(format!(
            "{op}: block_size {block_size} exceeds supported maximum {MAX_BLOCK_SIZE}"
        )));
    }
    if a_len != m * k || c_len != m * n || b_rows != k || b_cols != n {
        return Err(EmberError::shape(format!(
            "{op}: got a={a_len}, b={b_rows}x{b_cols}, c={c_len}; expected a={}, b={k}x{n}, c={}",
            m * k,
            m * n
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{all_dispatches, matmul::matmul};

    fn sample(len: usize, salt: u64) -> Vec<f32> {
        // Deterministic values in [-1, 1] per the numerical contract.
        (0..len)
            .map(|i| {
                let x = ((i as u64).wrapping_mul(2862933555777941757).wrapping_add(salt) >> 33)
                    % 2000;
                x as f32 / 1000.0 - 1.0
            })
            .collect()
    }

    fn max_relative_error(got: &[f32], expected: &[f32]) -> f32 {
        got.iter()
            .zip(expected.iter())
            .map(|(g, e)| (g - e).abs() / e.abs().max(1.0))
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_q4_matches_dequant_then_matmul() {
        for dispatch in all_dispatches() {
            let (m, k, n) = (4, 16, 64);
            let a = sample(m * k, 11);
            let b_f32 = sample(k * n, 12);
            let b = Q4Tensor::quantize(&b_f32, k, n, 32).unwrap();

            let mut direct = vec![0.0; m * n];
            matmul_q4(&dispatch, &mut direct, &a, &b, m, k, n).unwrap();

            let dequant = b.dequantize();
            let mut reference = vec![0.0; m * n];
            matmul(&dispatch, &mut reference, &a, &dequant, m, k, n).unwrap();

            assert!(
                max_relative_error(&direct, &reference) < 1e-4,
                "{:?} exceeded the 1e-4 relative error contract",
                dispatch.kind()
            );
        }
    }

    #[test]
    fn test_q4_parallel_path_matches_serial() {
        for dispatch in all_dispatches() {
            let (m, k, n) = (PARALLEL_ROW_THRESHOLD + 4, 8, 32);
            let a = sample(m * k, 13);
            let b_f32 = sample(k * n, 14);
            let b = Q4Tensor::quantize(&b_f32, k, n, 32).unwrap();

            let mut wide = vec![0.0; m * n];
            matmul_q4(&dispatch, &mut wide, &a, &b, m, k, n).unwrap();

            // Row 0 computed alone must equal row 0 of the parallel run.
            let mut single = vec![0.0; n];
            matmul_q4(&dispatch, &mut single, &a[..k], &b, 1, k, n).unwrap();
            assert_eq!(&wide[..n], single.as_slice());
        }
    }

    #[test]
    fn test_q8_matches_dequant_then_matmul() {
        for dispatch in all_dispatches() {
            let (m, k, n) = (3, 8, 32);
            let a = sample(m * k, 15);
            let b_f32 = sample(k * n, 16);
            let b = Q8Tensor::quantize(&b_f32, k, n, 32).unwrap();

            let mut direct = vec![0.0; m * n];
            matmul_q8(&dispatch, &mut direct, &a, &b, m, k, n).unwrap();

            let dequant = b.dequantize();
            let mut reference = vec![0.0; m * n];
            matmul(&dispatch, &mut reference, &a, &dequant, m, k, n).unwrap();

            assert!(max_relative_error(&direct, &reference) < 1e-4);
        }
    }

    #[test]
    fn test_q4_shape_mismatch() {
        let dispatch = KernelDispatch::scalar();
        let b = Q4Tensor::quantize(&sample(8 * 32, 17), 8, 32, 32).unwrap();
        let mut c = vec![0.0; 32];
        // k does not match b.rows().
        assert!(matmul_q4(&dispatch, &mut c, &[0.0; 4], &b, 1, 4, 32).is_err());
    }
}
