//! Native model file format
//!
//! A model file is a small fixed header (magic, version, architecture,
//! hyperparameters), a tensor table, and 64-byte-aligned payloads. All
//! integers are little-endian. Q4/Q8 payloads interleave `(scale,
//! packed_codes)` per block. The file is parsed through one read-only
//! memory map; under the `MemoryMap` storage policy, f32 payloads are
//! mapped zero-copy into tensor storage while quantized payloads are
//! unpacked into their block containers (scales and codes, never the
//! dequantized matrix).

use super::{
    Activation, Hyperparams, LayerWeights, ModelWeights, NormType, NormWeights, StoragePolicy,
    WeightMatrix,
};
use crate::tensor::{Q4Tensor, Q8Tensor, Tensor, TensorStorage, DENSE_MAX_ELEMENTS, DEFAULT_CHUNK_ELEMENTS};
use emberlm_common::{EmberError, Result};
use half::f16;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File magic, `b"EMBR"` read as a little-endian u32
pub const MAGIC: u32 = u32::from_le_bytes(*b"EMBR");

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Architecture tag for decoder-only transformers
pub const ARCH_DECODER_ONLY: u32 = 0;

/// Payload alignment in bytes
const PAYLOAD_ALIGN: u64 = 64;

/// Well-known tensor names
pub const TOK_EMBEDDINGS: &str = "tok_embeddings";
pub const FINAL_NORM_WEIGHT: &str = "norm.weight";
pub const FINAL_NORM_BIAS: &str = "norm.bias";
pub const OUTPUT: &str = "output";

/// Name of a per-layer tensor
pub fn layer_tensor(layer: usize, suffix: &str) -> String {
    format!("layers.{layer}.{suffix}")
}

/// Payload encoding tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorDType {
    F32,
    Q4,
    Q8,
}

impl TensorDType {
    fn code(self) -> u8 {
        match self {
            TensorDType::F32 => 0,
            TensorDType::Q4 => 1,
            TensorDType::Q8 => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(TensorDType::F32),
            1 => Ok(TensorDType::Q4),
            2 => Ok(TensorDType::Q8),
            other => Err(EmberError::UnsupportedQuantType { code: other as u32 }),
        }
    }
}

/// One tensor table entry
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub dtype: TensorDType,
    pub shape: Vec<usize>,
    pub offset: u64,
    pub byte_len: u64,
    pub block_size: usize,
}

impl TensorEntry {
    /// Logical element count
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Writer that assembles a model file
pub struct FormatWriter {
    params: Hyperparams,
    tensors: Vec<(String, TensorDType, Vec<usize>, usize, Vec<u8>)>,
}

impl FormatWriter {
    /// Start a file for the given hyperparameters
    pub fn new(params: Hyperparams) -> Self {
        Self {
            params,
            tensors: Vec::new(),
        }
    }

    /// Add an f32 tensor
    pub fn add_f32(&mut self, name: &str, shape: Vec<usize>, data: &[f32]) -> Result<()> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(EmberError::shape(format!(
                "tensor '{name}': {} elements for shape {:?}",
                data.len(),
                shape
            )));
        }
        let mut bytes = Vec::with_capacity(data.len() * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.tensors
            .push((name.to_string(), TensorDType::F32, shape, 0, bytes));
        Ok(())
    }

    /// Add a Q4 tensor; blocks are written interleaved `(scale, nibbles)`
    pub fn add_q4(&mut self, name: &str, q: &Q4Tensor) {
        let half_block = q.block_size() / 2;
        let mut bytes = Vec::with_capacity(q.rows() * q.blocks_per_row() * (2 + half_block));
        for r in 0..q.rows() {
            for b in 0..q.blocks_per_row() {
                let scale = f16::from_f32(q.scale(r, b));
                bytes.extend_from_slice(&scale.to_le_bytes());
                bytes.extend_from_slice(q.block_bytes(r, b));
            }
        }
        self.tensors.push((
            name.to_string(),
            TensorDType::Q4,
            vec![q.rows(), q.cols()],
            q.block_size(),
            bytes,
        ));
    }

    /// Add a Q8 tensor; blocks are written interleaved `(scale, codes)`
    pub fn add_q8(&mut self, name: &str, q: &Q8Tensor) {
        let mut bytes =
            Vec::with_capacity(q.rows() * q.blocks_per_row() * (2 + q.block_size()));
        for r in 0..q.rows() {
            for b in 0..q.blocks_per_row() {
                let scale = f16::from_f32(q.scale(r, b));
                bytes.extend_from_slice(&scale.to_le_bytes());
                for &code in q.block_codes(r, b) {
                    bytes.push(code as u8);
                }
            }
        }
        self.tensors.push((
            name.to_string(),
            TensorDType::Q8,
            vec![q.rows(), q.cols()],
            q.block_size(),
            bytes,
        ));
    }

    /// Write the assembled file
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| EmberError::storage_at(path, format!("create failed: {e}")))?;
        let mut out = BufWriter::new(file);

        // Header.
        out.write_all(&MAGIC.to_le_bytes())?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&ARCH_DECODER_ONLY.to_le_bytes())?;
        write_hyperparams(&mut out, &self.params)?;

        // Table, with payload offsets computed up front.
        out.write_all(&(self.tensors.len() as u32).to_le_bytes())?;
        let table_bytes: u64 = self
            .tensors
            .iter()
            .map(|(name, _, shape, _, _)| 2 + name.len() as u64 + 1 + 1 + 8 * shape.len() as u64 + 8 + 8 + 4)
            .sum();
        let header_end = 12 + HYPERPARAMS_BYTES + 4 + table_bytes;

        let mut offset = align_up(header_end, PAYLOAD_ALIGN);
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for (_, _, _, _, payload) in &self.tensors {
            offsets.push(offset);
            offset = align_up(offset + payload.len() as u64, PAYLOAD_ALIGN);
        }

        for ((name, dtype, shape, block_size, payload), &payload_offset) in
            self.tensors.iter().zip(offsets.iter())
        {
            out.write_all(&(name.len() as u16).to_le_bytes())?;
            out.write_all(name.as_bytes())?;
            out.write_all(&[dtype.code(), shape.len() as u8])?;
            for &dim in shape {
                out.write_all(&(dim as u64).to_le_bytes())?;
            }
            out.write_all(&payload_offset.to_le_bytes())?;
            out.write_all(&(payload.len() as u64).to_le_bytes())?;
            out.write_all(&(*block_size as u32).to_le_bytes())?;
        }

        // Payloads at their aligned offsets.
        let mut file = out
            .into_inner()
            .map_err(|e| EmberError::storage_at(path, format!("flush failed: {e}")))?;
        for ((_, _, _, _, payload), &payload_offset) in self.tensors.iter().zip(offsets.iter()) {
            file.seek(SeekFrom::Start(payload_offset))?;
            file.write_all(payload)?;
        }
        file.flush()?;

        debug!(
            path = %path.display(),
            tensors = self.tensors.len(),
            "wrote model file"
        );
        Ok(())
    }
}

const HYPERPARAMS_BYTES: u64 = 8 * 4 + 4 + 4;

fn write_hyperparams<W: Write>(out: &mut W, p: &Hyperparams) -> Result<()> {
    for dim in [
        p.vocab_size,
        p.context_length,
        p.num_layers,
        p.num_heads,
        p.kv_heads,
        p.head_dim,
        p.embed_dim,
        p.ffn_dim,
    ] {
        out.write_all(&(dim as u32).to_le_bytes())?;
    }
    let norm = match p.norm_type {
        NormType::LayerNorm => 0u8,
        NormType::RmsNorm => 1,
    };
    let act = match p.activation {
        Activation::Gelu => 0u8,
        Activation::Silu => 1,
    };
    out.write_all(&[norm, act, 0, 0])?;
    out.write_all(&p.rope_base.to_le_bytes())?;
    Ok(())
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// A parsed model file
#[derive(Debug)]
pub struct ModelFile {
    path: PathBuf,
    mmap: Mmap,
    params: Hyperparams,
    tensors: HashMap<String, TensorEntry>,
}

impl ModelFile {
    /// Open and parse a model file through one read-only mapping
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| EmberError::storage_at(path, format!("open failed: {e}")))?;
        // Safety: mapping stays read-only and the file handle outlives it.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| EmberError::storage_at(path, format!("mmap failed: {e}")))?;

        let mut cursor = Cursor::new(&mmap, path);
        let magic = cursor.read_u32()?;
        let version = cursor.read_u32()?;
        if magic != MAGIC || version != FORMAT_VERSION {
            return Err(EmberError::UnsupportedModel {
                path: path.to_path_buf(),
                magic,
                version,
            });
        }
        let arch = cursor.read_u32()?;
        if arch != ARCH_DECODER_ONLY {
            return Err(EmberError::UnsupportedModel {
                path: path.to_path_buf(),
                magic,
                version,
            });
        }

        let params = read_hyperparams(&mut cursor)?;
        params.validate()?;

        let count = cursor.read_u32()? as usize;
        let mut tensors = HashMap::with_capacity(count);
        for _ in 0..count {
            let name_len = cursor.read_u16()? as usize;
            let name = String::from_utf8(cursor.read_bytes(name_len)?.to_vec())
                .map_err(|_| EmberError::storage_at(path, "tensor name is not UTF-8"))?;
            let dtype = TensorDType::from_code(cursor.read_u8()?)?;
            let ndim = cursor.read_u8()? as usize;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                shape.push(cursor.read_u64()? as usize);
            }
            let offset = cursor.read_u64()?;
            let byte_len = cursor.read_u64()?;
            let block_size = cursor.read_u32()? as usize;

            if offset + byte_len > mmap.len() as u64 {
                return Err(EmberError::storage_at(
                    path,
                    format!("tensor '{name}' payload extends past end of file"),
                ));
            }
            tensors.insert(
                name,
                TensorEntry {
                    dtype,
                    shape,
                    offset,
                    byte_len,
                    block_size,
                },
            );
        }

        info!(
            path = %path.display(),
            layers = params.num_layers,
            vocab = params.vocab_size,
            tensors = tensors.len(),
            "parsed model file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            params,
            tensors,
        })
    }

    /// Hyperparameters from the header
    pub fn hyperparams(&self) -> &Hyperparams {
        &self.params
    }

    /// Look up a tensor table entry
    pub fn entry(&self, name: &str) -> Result<&TensorEntry> {
        self.tensors.get(name).ok_or_else(|| {
            EmberError::model(format!(
                "model file {} is missing tensor '{name}'",
                self.path.display()
            ))
        })
    }

    fn payload(&self, entry: &TensorEntry) -> &[u8] {
        &self.mmap[entry.offset as usize..(entry.offset + entry.byte_len) as usize]
    }

    /// Read an f32 tensor under the given storage policy
    pub fn read_f32(&self, name: &str, policy: StoragePolicy) -> Result<Tensor> {
        let entry = self.entry(name)?.clone();
        if entry.dtype != TensorDType::F32 {
            return Err(EmberError::model(format!(
                "tensor '{name}' is not f32"
            )));
        }
        let elements = entry.elements();
        if entry.byte_len as usize != elements * 4 {
            return Err(EmberError::storage_at(
                &self.path,
                format!("tensor '{name}' payload is {} bytes, expected {}", entry.byte_len, elements * 4),
            ));
        }

        let storage = match policy {
            StoragePolicy::MemoryMap => {
                TensorStorage::map_file(&self.path, entry.offset, elements, false)?
            }
            StoragePolicy::Preload => {
                let cols = *entry.shape.last().unwrap_or(&1);
                let mut storage = if elements > DENSE_MAX_ELEMENTS {
                    // Row-aligned chunks so streaming matmul sees whole rows.
                    let chunk = (DEFAULT_CHUNK_ELEMENTS / cols).max(1) * cols;
                    TensorStorage::alloc_with_limits(elements, DENSE_MAX_ELEMENTS, chunk)
                } else {
                    TensorStorage::alloc(elements)
                };
                let floats = decode_f32(self.payload(&entry));
                storage.copy_from(&floats, 0)?;
                storage
            }
        };
        Tensor::new(storage, entry.shape)
    }

    /// Read an f32 vector (1-D tensor) into a plain buffer
    pub fn read_vector(&self, name: &str) -> Result<Vec<f32>> {
        let entry = self.entry(name)?;
        if entry.dtype != TensorDType::F32 {
            return Err(EmberError::model(format!("tensor '{name}' is not f32")));
        }
        Ok(decode_f32(self.payload(entry)))
    }

    /// Read a weight matrix in whatever encoding the file carries
    pub fn read_matrix(&self, name: &str, policy: StoragePolicy) -> Result<WeightMatrix> {
        let entry = self.entry(name)?.clone();
        if entry.shape.len() != 2 {
            return Err(EmberError::model(format!(
                "tensor '{name}' has {} dimensions, expected 2",
                entry.shape.len()
            )));
        }
        let (rows, cols) = (entry.shape[0], entry.shape[1]);

        match entry.dtype {
            TensorDType::F32 => Ok(WeightMatrix::F32(self.read_f32(name, policy)?)),
            TensorDType::Q4 => {
                let payload = self.payload(&entry);
                let (scales, packed) =
                    deinterleave_q4(payload, rows, cols, entry.block_size, &self.path)?;
                Ok(WeightMatrix::Q4(Q4Tensor::from_parts(
                    rows,
                    cols,
                    entry.block_size,
                    scales,
                    packed,
                )?))
            }
            TensorDType::Q8 => {
                let payload = self.payload(&entry);
                let (scales, codes) =
                    deinterleave_q8(payload, rows, cols, entry.block_size, &self.path)?;
                Ok(WeightMatrix::Q8(Q8Tensor::from_parts(
                    rows,
                    cols,
                    entry.block_size,
                    scales,
                    codes,
                )?))
            }
        }
    }

    /// Read a normalization site's gamma (and beta when the architecture
    /// uses LayerNorm)
    pub fn read_norm(&self, weight_name: &str, bias_name: &str) -> Result<NormWeights> {
        let gamma = self.read_vector(weight_name)?;
        let beta = match self.params.norm_type {
            NormType::LayerNorm => Some(self.read_vector(bias_name)?),
            NormType::RmsNorm => None,
        };
        Ok(NormWeights { gamma, beta })
    }

    /// Assemble the full weight set
    pub fn load_weights(&self, policy: StoragePolicy) -> Result<ModelWeights> {
        let embedding = self.read_f32(TOK_EMBEDDINGS, policy)?;

        let mut layers = Vec::with_capacity(self.params.num_layers);
        for i in 0..self.params.num_layers {
            let w_gate = if self.params.gated_ffn() {
                Some(self.read_matrix(&layer_tensor(i, "ffn.gate"), policy)?)
            } else {
                None
            };
            layers.push(LayerWeights {
                attn_norm: self.read_norm(
                    &layer_tensor(i, "attn_norm.weight"),
                    &layer_tensor(i, "attn_norm.bias"),
                )?,
                wq: self.read_matrix(&layer_tensor(i, "attn.wq"), policy)?,
                wk: self.read_matrix(&layer_tensor(i, "attn.wk"), policy)?,
                wv: self.read_matrix(&layer_tensor(i, "attn.wv"), policy)?,
                wo: self.read_matrix(&layer_tensor(i, "attn.wo"), policy)?,
                ffn_norm: self.read_norm(
                    &layer_tensor(i, "ffn_norm.weight"),
                    &layer_tensor(i, "ffn_norm.bias"),
                )?,
                w_gate,
                w_up: self.read_matrix(&layer_tensor(i, "ffn.up"), policy)?,
                w_down: self.read_matrix(&layer_tensor(i, "ffn.down"), policy)?,
            });
        }

        Ok(ModelWeights {
            embedding,
            layers,
            final_norm: self.read_norm(FINAL_NORM_WEIGHT, FINAL_NORM_BIAS)?,
            lm_head: self.read_matrix(OUTPUT, policy)?,
        })
    }
}

fn read_hyperparams(cursor: &mut Cursor<'_>) -> Result<Hyperparams> {
    let mut dims = [0usize; 8];
    for dim in dims.iter_mut() {
        *dim = cursor.read_u32()? as usize;
    }
    let norm = cursor.read_u8()?;
    let act = cursor.read_u8()?;
    cursor.read_u16()?; // padding
    let rope_base = f32::from_le_bytes(cursor.read_bytes(4)?.try_into().expect("4 bytes"));

    Ok(Hyperparams {
        vocab_size: dims[0],
        context_length: dims[1],
        num_layers: dims[2],
        num_heads: dims[3],
        kv_heads: dims[4],
        head_dim: dims[5],
        embed_dim: dims[6],
        ffn_dim: dims[7],
        norm_type: match norm {
            0 => NormType::LayerNorm,
            _ => NormType::RmsNorm,
        },
        activation: match act {
            0 => Activation::Gelu,
            _ => Activation::Silu,
        },
        rope_base,
    })
}

fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes(b.try_into().expect("4 bytes")))
        .collect()
}

fn deinterleave_q4(
    payload: &[u8],
    rows: usize,
    cols: usize,
    block_size: usize,
    path: &Path,
) -> Result<(Vec<f16>, Vec<u8>)> {
    if block_size == 0 || cols % block_size != 0 {
        return Err(EmberError::UnsupportedQuantType {
            code: block_size as u32,
        });
    }
    let blocks = rows * (cols / block_size);
    let half_block = block_size / 2;
    if payload.len() != blocks * (2 + half_block) {
        return Err(EmberError::storage_at(
            path,
            format!(
                "q4 payload is {} bytes, expected {}",
                payload.len(),
                blocks * (2 + half_block)
            ),
        ));
    }

    let mut scales = Vec::with_capacity(blocks);
    let mut packed = Vec::with_capacity(blocks * half_block);
    for block in payload.chunks_exact(2 + half_block) {
        scales.push(f16::from_le_bytes([block[0], block[1]]));
        packed.extend_from_slice(&block[2..]);
    }
    Ok((scales, packed))
}

fn deinterleave_q8(
    payload: &[u8],
    rows: usize,
    cols: usize,
    block_size: usize,
    path: &Path,
) -> Result<(Vec<f16>, Vec<i8>)> {
    if block_size == 0 || cols % block_size != 0 {
        return Err(EmberError::UnsupportedQuantType {
            code: block_size as u32,
        });
    }
    let blocks = rows * (cols / block_size);
    if payload.len() != blocks * (2 + block_size) {
        return Err(EmberError::storage_at(
            path,
            format!(
                "q8 payload is {} bytes, expected {}",
                payload.len(),
                blocks * (2 + block_size)
            ),
        ));
    }

    let mut scales = Vec::with_capacity(blocks);
    let mut codes = Vec::with_capacity(blocks * block_size);
    for block in payload.chunks_exact(2 + block_size) {
        scales.push(f16::from_le_bytes([block[0], block[1]]));
        codes.extend(block[2..].iter().map(|&b| b as i8));
    }
    Ok((scales, codes))
}

/// Bounds-checked little-endian reader over the mapped file
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], path: &'a Path) -> Self {
        Self { data, pos: 0, path }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(EmberError::storage_at(
                self.path,
                format!(
                    "truncated file: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len() - self.pos.min(self.data.len())
                ),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_bytes(2)?.try_into().expect("2 bytes")))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().expect("8 bytes")))
    }
}
