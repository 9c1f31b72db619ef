//! Dense matrix multiplication
//!
//! Row-major throughout. The plain product streams B row-by-row with an
//! axpy accumulation, which keeps memory access sequential on both inputs;
//! the transposed variants never materialize a transpose. Rows are
//! distributed across the rayon pool once the output is tall enough to
//! amortize the fork.

use super::KernelDispatch;
use emberlm_common::{EmberError, Result};
use rayon::prelude::*;

/// Row threshold above which matmul parallelizes across output rows
pub const PARALLEL_ROW_THRESHOLD: usize = 32;

/// `C = A · B` with `A: (m, k)`, `B: (k, n)`, `C: (m, n)`
pub fn matmul(
    dispatch: &KernelDispatch,
    c: &mut [f32],
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_dims("matmul", a.len(), m * k, b.len(), k * n, c.len(), m * n)?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let row_op = |(row_out, a_row): (&mut [f32], &[f32])| {
        row_out.fill(0.0);
        for (ki, &av) in a_row.iter().enumerate() {
            dispatch.axpy(av, &b[ki * n..(ki + 1) * n], row_out);
        }
    };

    if m >= PARALLEL_ROW_THRESHOLD {
        c.par_chunks_mut(n)
            .zip(a.par_chunks(k))
            .for_each(row_op);
    } else {
        c.chunks_mut(n).zip(a.chunks(k)).for_each(row_op);
    }
    Ok(())
}

/// `C = A · Bᵀ` with `A: (m, k)`, `B: (n, k)`, `C: (m, n)`.
///
/// B is read row-major; no transpose is materialized.
pub fn matmul_bt(
    dispatch: &KernelDispatch,
    c: &mut [f32],
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_dims("matmul_bt", a.len(), m * k, b.len(), n * k, c.len(), m * n)?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let row_op = |(row_out, a_row): (&mut [f32], &[f32])| {
        for (ni, out) in row_out.iter_mut().enumerate() {
            *out = dispatch.dot(a_row, &b[ni * k..(ni + 1) * k]);
        }
    };

    if m >= PARALLEL_ROW_THRESHOLD {
        c.par_chunks_mut(n)
            .zip(a.par_chunks(k))
            .for_each(row_op);
    } else {
        c.chunks_mut(n).zip(a.chunks(k)).for_each(row_op);
    }
    Ok(())
}

/// `C = Aᵀ · B` with `A: (k, m)`, `B: (k, n)`, `C: (m, n)`.
///
/// A is read row-major; no transpose is materialized.
pub fn matmul_at(
    dispatch: &KernelDispatch,
    c: &mut [f32],
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    check_dims("matmul_at", a.len(), k * m, b.len(), k * n, c.len(), m * n)?;
    if m == 0 || n == 0 {
        return Ok(());
    }

    let row_op = |(mi, row_out): (usize, &mut [f32])| {
        row_out.fill(0.0);
        for ki in 0..k {
            // A is (k, m): column mi of A read with stride m.
            dispatch.axpy(a[ki * m + mi], &b[ki * n..(ki + 1) * n], row_out);
        }
    };

    if m >= PARALLEL_ROW_THRESHOLD {
        c.par_chunks_mut(n).enumerate().for_each(|(mi, row)| row_op((mi, row)));
    } else {
        c.chunks_mut(n).enumerate().for_each(|(mi, row)| row_op((mi, row)));
    }
    Ok(())
}

fn check_dims(
    op: &str,
    a_len: usize,
    a_expected: usize,
    b_len: usize,
    b_expected: usize,
    c_len: usize,
    c_expected: usize,
) -> Result<()> {
    if a_len != a_expected || b_len != b_expected || c_len != c_expected {
        return Err(EmberError::shape(format!(
            "{op}: got a={a_len}, b={b_len}, c={c_len}; expected a={a_expected}, b={b_expected}, c={c_expected}"
        )));
    }
    Ok(())
}
