//! Block-quantized weight containers
//!
//! Weights are stored as row-major sequences of fixed-width blocks, one
//! scale per block. Kernels stream blocks directly; the reconstructed f32
//! matrix is never materialized during inference.

use emberlm_common::{EmberError, Result};
use half::f16;

/// 4-bit block-quantized 2-D weight matrix.
///
/// A block covers `block_size` contiguous columns of one row and carries an
/// f16 scale plus `block_size / 2` packed bytes, low nibble first.
/// Reconstruction of element `(r, c)` is
/// `scale[r, c / block_size] * (nibble(r, c) - 8)`.
#[derive(Debug, Clone)]
pub struct Q4Tensor {
    rows: usize,
    cols: usize,
    block_size: usize,
    scales: Vec<f16>,
    packed: Vec<u8>,
}

impl Q4Tensor {
    /// Quantize a row-major f32 matrix.
    ///
    /// Per block: `scale = absmax / 7`, code = `round(x / scale) + 8`
    /// clamped to `[0, 15]`. Deterministic: a pure function of the input.
    pub fn quantize(src: &[f32], rows: usize, cols: usize, block_size: usize) -> Result<Self> {
        validate_block_geometry(src.len(), rows, cols, block_size)?;

        let blocks_per_row = cols / block_size;
        let mut scales = Vec::with_capacity(rows * blocks_per_row);
        let mut packed = vec![0u8; rows * cols / 2];

        for r in 0..rows {
            let row = &src[r * cols..(r + 1) * cols];
            for b in 0..blocks_per_row {
                let block = &row[b * block_size..(b + 1) * block_size];
                let absmax = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
                let scale = absmax / 7.0;
                scales.push(f16::from_f32(scale));

                let base = (r * cols + b * block_size) / 2;
                for (i, pair) in block.chunks_exact(2).enumerate() {
                    let lo = encode_nibble(pair[0], scale);
                    let hi = encode_nibble(pair[1], scale);
                    packed[base + i] = lo | (hi << 4);
                }
            }
        }

        Ok(Self {
            rows,
            cols,
            block_size,
            scales,
            packed,
        })
    }

    /// Assemble from already-encoded parts (used by the model loader)
    pub fn from_parts(
        rows: usize,
        cols: usize,
        block_size: usize,
        scales: Vec<f16>,
        packed: Vec<u8>,
    ) -> Result<Self> {
        validate_block_geometry(rows * cols, rows, cols, block_size)?;
        if scales.len() != rows * (cols / block_size) || packed.len() != rows * cols / 2 {
            return Err(EmberError::invalid_input(format!(
                "quantized payload mismatch: {} scales, {} packed bytes for {}x{}/{}",
                scales.len(),
                packed.len(),
                rows,
                cols,
                block_size
            )));
        }
        Ok(Self {
            rows,
            cols,
            block_size,
            scales,
            packed,
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Columns covered by one block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks per row
    pub fn blocks_per_row(&self) -> usize {
        self.cols / self.block_size
    }

    /// Scale of block `b` in row `r`
    #[inline]
    pub fn scale(&self, r: usize, b: usize) -> f32 {
        self.scales[r * self.blocks_per_row() + b].to_f32()
    }

    /// Packed bytes of block `b` in row `r` (`block_size / 2` bytes)
    #[inline]
    pub fn block_bytes(&self, r: usize, b: usize) -> &[u8] {
        let half_block = self.block_size / 2;
        let base = (r * self.cols + b * self.block_size) / 2;
        &self.packed[base..base + half_block]
    }

    /// Raw scale table, block-major within rows
    pub fn scales(&self) -> &[f16] {
        &self.scales
    }

    /// Raw packed nibbles
    pub fn packed(&self) -> &[u8] {
        &self.packed
    }

    /// Reconstruct a single element
    pub fn dequantize_element(&self, r: usize, c: usize) -> f32 {
        let byte = self.packed[(r * self.cols + c) / 2];
        let nibble = if c % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        self.scale(r, c / self.block_size) * (nibble as i32 - 8) as f32
    }

    /// Materialize the full f32 matrix. Test and tooling path only.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.push(self.dequantize_element(r, c));
            }
        }
        out
    }

    /// Bytes consumed by scales and packed data
    pub fn payload_bytes(&self) -> usize {
        self.scales.len() * 2 + self.packed.len()
    }
}

#[inline]
fn encode_nibble(x: f32, scale: f32) -> u8 {
    if scale == 0.0 {
        return 8;
    }
    ((x / scale).round() as i32 + 8).clamp(0, 15) as u8
}

/// 8-bit block-quantized 2-D weight matrix.
///
/// Same block layout as [`Q4Tensor`] with one signed byte per element and
/// `scale = absmax / 127`.
#[derive(Debug, Clone)]
pub struct Q8Tensor {
    rows: usize,
    cols: usize,
    block_size: usize,
    scales: Vec<f16>,
    data: Vec<i8>,
}

impl Q8Tensor {
    /// Quantize a row-major f32 matrix
    pub fn quantize(src: &[f32], rows: usize, cols: usize, block_size: usize) -> Result<Self> {
        validate_block_geometry(src.len(), rows, cols, block_size)?;

        let blocks_per_row = cols / block_size;
        let mut scales = Vec::with_capacity(rows * blocks_per_row);
        let mut data = Vec::with_capacity(rows * cols);

        for r in 0..rows {
            let row = &src[r * cols..(r + 1) * cols];
            for b in 0..blocks_per_row {
                let block = &row[b * block_size..(b + 1) * block_size];
                let absmax = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
                let scale = absmax / 127.0;
                scales.push(f16::from_f32(scale));

                for &x in block {
                    let q = if scale == 0.0 {
                        0
                    } else {
                        (x / scale).round().clamp(-127.0, 127.0) as i8
                    };
                    data.push(q);
                }
            }
        }

        Ok(Self {
            rows,
            cols,
            block_size,
            scales,
            data,
        })
    }

    /// Assemble from already-encoded parts (used by the model loader)
    pub fn from_parts(
        rows: usize,
        cols: usize,
        block_size: usize,
        scales: Vec<f16>,
        data: Vec<i8>,
    ) -> Result<Self> {
        validate_block_geometry(rows * cols, rows, cols, block_size)?;
        if scales.len() != rows * (cols / block_size) || data.len() != rows * cols {
            return Err(EmberError::invalid_input(format!(
                "quantized payload mismatch: {} scales, {} codes for {}x{}/{}",
                scales.len(),
                data.len(),
                rows,
                cols,
                block_size
            )));
        }
        Ok(Self {
            rows,
            cols,
            block_size,
            scales,
            data,
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Columns covered by one block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks per row
    pub fn blocks_per_row(&self) -> usize {
        self.cols / self.block_size
    }

    /// Scale of block `b` in row `r`
    #[inline]
    pub fn scale(&self, r: usize, b: usize) -> f32 {
        self.scales[r * self.blocks_per_row() + b].to_f32()
    }

    /// Codes of block `b` in row `r`
    #[inline]
    pub fn block_codes(&self, r: usize, b: usize) -> &[i8] {
        let base = r * self.cols + b * self.block_size;
        &self.data[base..base + self.block_size]
    }

    /// Raw scale table
    pub fn scales(&self) -> &[f16] {
        &self.scales
    }

    /// Raw codes
    pub fn codes(&self) -> &[i8] {
        &self.data
    }

    /// Materialize the full f32 matrix. Test and tooling path only.
    pub fn dequantize(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for b in 0..self.blocks_per_row() {
                let scale = self.scale(r, b);
                for &q in self.block_codes(r, b) {
                    out.push(scale * q as f32);
                }
            }
        }
        out
    }

    /// Bytes consumed by scales and codes
    pub fn payload_bytes(&self) -> usize {
        self.scales.len() * 2 + self.data.len()
    }
}

fn validate_block_geometry(
    src_len: usize,
    rows: usize,
    cols: usize,
    block_size: usize,
) -> Result<()> {
    if block_size == 0 || block_size % 2 != 0 {
        return Err(EmberError::invalid_input(format!(
            "block_size must be a positive even number, got {block_size}"
        )));
    }
    if cols % block_size != 0 {
        return Err(EmberError::invalid_input(format!(
            "cols ({cols}) must be a multiple of block_size ({block_size})"
        )));
    }
    if src_len != rows * cols {
        return Err(EmberError::shape(format!(
            "source holds {src_len} elements, {rows}x{cols} required"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_matrix(rows: usize, cols: usize) -> Vec<f32> {
        // Deterministic pseudo-random values in [-1, 1].
        (0..rows * cols)
            .map(|i| {
                let x = ((i as u64).wrapping_mul(2654435761) % 2000) as f32;
                x / 1000.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_q4_nibble_packing_order() {
        // One row, one block of 4; chosen so codes are distinct.
        // absmax = 7 -> scale = 1, codes = value + 8.
        let src = vec![-7.0f32, -1.0, 2.0, 7.0];
        let q = Q4Tensor::quantize(&src, 1, 4, 4).unwrap();

        // Low nibble first: byte0 = 1 | (7 << 4), byte1 = 10 | (15 << 4).
        assert_eq!(q.packed(), &[0x71, 0xFA]);
        assert_eq!(q.dequantize_element(0, 0), -7.0);
        assert_eq!(q.dequantize_element(0, 3), 7.0);
    }

    #[test]
    fn test_q4_round_trip_error_bound() {
        let src = sample_matrix(8, 64);
        let q = Q4Tensor::quantize(&src, 8, 64, 32).unwrap();
        let deq = q.dequantize();

        for (r, chunk) in src.chunks(64).enumerate() {
            for (b, block) in chunk.chunks(32).enumerate() {
                let absmax = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
                let scale = f16::from_f32(absmax / 7.0).to_f32();
                for (c, &x) in block.iter().enumerate() {
                    let got = deq[r * 64 + b * 32 + c];
                    // Half a quantization step plus f16 scale rounding.
                    assert!(
                        (got - x).abs() <= scale * 0.51 + 1e-3,
                        "element ({r},{}) error too large: {x} vs {got}",
                        b * 32 + c
                    );
                }
            }
        }
    }

    #[test]
    fn test_q4_is_deterministic() {
        let src = sample_matrix(4, 32);
        let a = Q4Tensor::quantize(&src, 4, 32, 32).unwrap();
        let b = Q4Tensor::quantize(&src, 4, 32, 32).unwrap();
        assert_eq!(a.packed(), b.packed());
        assert_eq!(a.scales(), b.scales());
    }

    #[test]
    fn test_q4_zero_block() {
        let src = vec![0.0f32; 32];
        let q = Q4Tensor::quantize(&src, 1, 32, 32).unwrap();
        assert!(q.dequantize().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_q4_rejects_bad_geometry() {
        let src = vec![0.0f32; 12];
        assert!(Q4Tensor::quantize(&src, 3, 4, 3).is_err()); // odd block
        assert!(Q4Tensor::quantize(&src, 2, 6, 4).is_err()); // cols % block != 0
        assert!(Q4Tensor::quantize(&src, 4, 4, 4).is_err()); // wrong len
    }

    #[test]
    fn test_q8_round_trip() {
        let src = sample_matrix(4, 64);
        let q = Q8Tensor::quantize(&src, 4, 64, 32).unwrap();
        let deq = q.dequantize();

        for (i, (&x, &got)) in src.iter().zip(deq.iter()).enumerate() {
            assert!(
                (got - x).abs() <= 0.01,
                "element {i} error too large: {x} vs {got}"
            );
        }
    }

    #[test]
    fn test_q8_block_accessors() {
        let src = sample_matrix(2, 64);
        let q = Q8Tensor::quantize(&src, 2, 64, 32).unwrap();
        assert_eq!(q.blocks_per_row(), 2);
        assert_eq!(q.block_codes(1, 1).len(), 32);
    }
}
