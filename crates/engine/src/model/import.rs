//! Foreign model container import
//!
//! The import format is a tag-length-value stream: string-keyed metadata
//! records describing the architecture, followed by named f32 tensor
//! records. Imports are transcoded into the native format exactly once and
//! cached under a caller-supplied directory keyed by a content hash of the
//! source, so repeated loads of the same file skip the conversion.

use super::format::{FormatWriter, ModelFile};
use super::{Activation, Hyperparams, NormType, WeightKind};
use crate::tensor::{Q4Tensor, Q8Tensor};
use emberlm_common::{EmberError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Record tags in the import container
const TAG_METADATA: u8 = 1;
const TAG_TENSOR: u8 = 2;

/// Quantization block width applied when transcoding to Q4/Q8
const IMPORT_BLOCK_SIZE: usize = 32;

/// Parsed import container
pub struct ImportContainer {
    metadata: HashMap<String, serde_json::Value>,
    tensors: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl ImportContainer {
    /// Parse a TLV container from a byte buffer
    pub fn parse(data: &[u8], path: &Path) -> Result<Self> {
        let mut metadata = HashMap::new();
        let mut tensors = Vec::new();
        let mut pos = 0usize;

        while pos < data.len() {
            if pos + 9 > data.len() {
                return Err(EmberError::storage_at(path, "truncated TLV record header"));
            }
            let tag = data[pos];
            let len = u64::from_le_bytes(data[pos + 1..pos + 9].try_into().expect("8 bytes"))
                as usize;
            pos += 9;
            if pos + len > data.len() {
                return Err(EmberError::storage_at(
                    path,
                    format!("TLV record of {len} bytes extends past end of file"),
                ));
            }
            let value = &data[pos..pos + len];
            pos += len;

            match tag {
                TAG_METADATA => {
                    let (key, rest) = read_string(value, path)?;
                    let json: serde_json::Value = serde_json::from_slice(rest)?;
                    metadata.insert(key, json);
                }
                TAG_TENSOR => {
                    let (name, rest) = read_string(value, path)?;
                    if rest.is_empty() {
                        return Err(EmberError::storage_at(path, "empty tensor record"));
                    }
                    let ndim = rest[0] as usize;
                    let dims_end = 1 + ndim * 8;
                    if rest.len() < dims_end {
                        return Err(EmberError::storage_at(path, "truncated tensor dims"));
                    }
                    let shape: Vec<usize> = rest[1..dims_end]
                        .chunks_exact(8)
                        .map(|b| u64::from_le_bytes(b.try_into().expect("8 bytes")) as usize)
                        .collect();
                    let expected: usize = shape.iter().product::<usize>() * 4;
                    let payload = &rest[dims_end..];
                    if payload.len() != expected {
                        return Err(EmberError::storage_at(
                            path,
                            format!(
                                "tensor '{name}' payload is {} bytes, expected {expected}",
                                payload.len()
                            ),
                        ));
                    }
                    let floats = payload
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes(b.try_into().expect("4 bytes")))
                        .collect();
                    tensors.push((name, shape, floats));
                }
                other => {
                    return Err(EmberError::storage_at(
                        path,
                        format!("unknown TLV tag {other}"),
                    ));
                }
            }
        }

        Ok(Self { metadata, tensors })
    }

    /// Extract hyperparameters from the metadata records
    pub fn hyperparams(&self) -> Result<Hyperparams> {
        let dim = |key: &str| -> Result<usize> {
            self.metadata
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .ok_or_else(|| EmberError::model(format!("import metadata is missing '{key}'")))
        };

        let norm_type = match self.metadata.get("norm_type").and_then(|v| v.as_str()) {
            Some("layer_norm") => NormType::LayerNorm,
            Some("rms_norm") | None => NormType::RmsNorm,
            Some(other) => {
                return Err(EmberError::model(format!("unknown norm_type '{other}'")))
            }
        };
        let activation = match self.metadata.get("activation").and_then(|v| v.as_str()) {
            Some("gelu") => Activation::Gelu,
            Some("silu") | None => Activation::Silu,
            Some(other) => {
                return Err(EmberError::model(format!("unknown activation '{other}'")))
            }
        };
        let rope_base = self
            .metadata
            .get("rope_base")
            .and_then(|v| v.as_f64())
            .unwrap_or(10_000.0) as f32;

        let params = Hyperparams {
            vocab_size: dim("vocab_size")?,
            context_length: dim("context_length")?,
            num_layers: dim("num_layers")?,
            num_heads: dim("num_heads")?,
            kv_heads: dim("kv_heads")?,
            head_dim: dim("head_dim")?,
            embed_dim: dim("embed_dim")?,
            ffn_dim: dim("ffn_dim")?,
            norm_type,
            activation,
            rope_base,
        };
        params.validate()?;
        Ok(params)
    }

    /// Metadata value by key
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Parsed tensors
    pub fn tensors(&self) -> &[(String, Vec<usize>, Vec<f32>)] {
        &self.tensors
    }
}

fn read_string<'a>(value: &'a [u8], path: &Path) -> Result<(String, &'a [u8])> {
    if value.len() < 2 {
        return Err(EmberError::storage_at(path, "truncated string field"));
    }
    let len = u16::from_le_bytes([value[0], value[1]]) as usize;
    if value.len() < 2 + len {
        return Err(EmberError::storage_at(path, "truncated string payload"));
    }
    let s = String::from_utf8(value[2..2 + len].to_vec())
        .map_err(|_| EmberError::storage_at(path, "string field is not UTF-8"))?;
    Ok((s, &value[2 + len..]))
}

/// Transcode a foreign container into the native format, cached by content
/// hash. Returns the path of the cached native file.
///
/// 2-D tensors wider than one quantization block are re-encoded to
/// `target`; vectors and the embedding table stay f32.
pub fn import_model(source: &Path, cache_dir: &Path, target: WeightKind) -> Result<PathBuf> {
    let data = std::fs::read(source)
        .map_err(|e| EmberError::storage_at(source, format!("read failed: {e}")))?;

    let digest = Sha256::digest(&data);
    let cache_name = format!("{}.embr", &hex::encode(digest)[..16]);
    let cached = cache_dir.join(cache_name);

    if cached.exists() {
        // Validate the cached artifact before trusting it.
        if ModelFile::open(&cached).is_ok() {
            debug!(source = %source.display(), cached = %cached.display(), "import cache hit");
            return Ok(cached);
        }
    }

    let container = ImportContainer::parse(&data, source)?;
    let params = container.hyperparams()?;

    std::fs::create_dir_all(cache_dir)
        .map_err(|e| EmberError::storage_at(cache_dir, format!("mkdir failed: {e}")))?;

    let mut writer = FormatWriter::new(params);
    for (name, shape, floats) in container.tensors() {
        let quantizable = shape.len() == 2
            && shape[1] % IMPORT_BLOCK_SIZE == 0
            && name != super::format::TOK_EMBEDDINGS;

        match (target, quantizable) {
            (WeightKind::Q4, true) => {
                let q = Q4Tensor::quantize(floats, shape[0], shape[1], IMPORT_BLOCK_SIZE)?;
                writer.add_q4(name, &q);
            }
            (WeightKind::Q8, true) => {
                let q = Q8Tensor::quantize(floats, shape[0], shape[1], IMPORT_BLOCK_SIZE)?;
                writer.add_q8(name, &q);
            }
            _ => writer.add_f32(name, shape.clone(), floats)?,
        }
    }
    writer.write(&cached)?;

    info!(
        source = %source.display(),
        cached = %cached.display(),
        target = ?target,
        "transcoded import"
    );
    Ok(cached)
}

/// Serialize tensors and metadata into the import TLV format (tooling and
/// test path)
pub struct ImportWriter {
    records: Vec<u8>,
}

impl ImportWriter {
    /// Start an empty container
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Add a string-keyed metadata record
    pub fn add_metadata(&mut self, key: &str, value: &serde_json::Value) {
        let json = serde_json::to_vec(value).expect("JSON value serializes");
        let mut body = Vec::with_capacity(2 + key.len() + json.len());
        body.extend_from_slice(&(key.len() as u16).to_le_bytes());
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(&json);
        self.push_record(TAG_METADATA, &body);
    }

    /// Add an f32 tensor record
    pub fn add_tensor(&mut self, name: &str, shape: &[usize], data: &[f32]) {
        let mut body = Vec::with_capacity(2 + name.len() + 1 + shape.len() * 8 + data.len() * 4);
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(shape.len() as u8);
        for &dim in shape {
            body.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        for v in data {
            body.extend_from_slice(&v.to_le_bytes());
        }
        self.push_record(TAG_TENSOR, &body);
    }

    fn push_record(&mut self, tag: u8, body: &[u8]) {
        self.records.push(tag);
        self.records
            .extend_from_slice(&(body.len() as u64).to_le_bytes());
        self.records.extend_from_slice(body);
    }

    /// Write the container to disk
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.records)
            .map_err(|e| EmberError::storage_at(path, format!("write failed: {e}")))
    }
}

impl Default for ImportWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_container(path: &Path) {
        let mut writer = ImportWriter::new();
        for (key, value) in [
            ("vocab_size", json!(8)),
            ("context_length", json!(16)),
            ("num_layers", json!(1)),
            ("num_heads", json!(2)),
            ("kv_heads", json!(2)),
            ("head_dim", json!(4)),
            ("embed_dim", json!(8)),
            ("ffn_dim", json!(32)),
        ] {
            writer.add_metadata(key, &value);
        }
        writer.add_metadata("activation", &json!("silu"));

        let weights: Vec<f32> = (0..8 * 32).map(|i| ((i % 9) as f32 - 4.0) / 5.0).collect();
        writer.add_tensor("ffn.up", &[8, 32], &weights);
        writer.add_tensor("norm.weight", &[8], &[1.0; 8]);
        writer.write(path).unwrap();
    }

    #[test]
    fn test_parse_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.tlv");
        write_container(&path);

        let data = std::fs::read(&path).unwrap();
        let container = ImportContainer::parse(&data, &path).unwrap();

        let params = container.hyperparams().unwrap();
        assert_eq!(params.vocab_size, 8);
        assert_eq!(params.activation, Activation::Silu);
        assert_eq!(container.tensors().len(), 2);
    }

    #[test]
    fn test_import_transcodes_and_caches() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("model.tlv");
        let cache = dir.path().join("cache");
        write_container(&source);

        let first = import_model(&source, &cache, WeightKind::Q4).unwrap();
        assert!(first.exists());
        let native = ModelFile::open(&first).unwrap();
        assert_eq!(native.hyperparams().vocab_size, 8);
        // 2-D weight got quantized; the vector stayed f32.
        assert!(native.entry("ffn.up").unwrap().block_size > 0);
        assert_eq!(native.entry("norm.weight").unwrap().block_size, 0);

        // Second import reuses the cached artifact (same mtime).
        let mtime = std::fs::metadata(&first).unwrap().modified().unwrap();
        let second = import_model(&source, &cache, WeightKind::Q4).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::metadata(&second).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_cache_name_tracks_content() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");

        let a = dir.path().join("a.tlv");
        write_container(&a);
        let cached_a = import_model(&a, &cache, WeightKind::F32).unwrap();

        // Perturb one byte of the final tensor's f32 payload: still a valid
        // container, but a different content hash.
        let mut bytes = std::fs::read(&a).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        let b = dir.path().join("b.tlv");
        std::fs::write(&b, bytes).unwrap();

        let cached_b = import_model(&b, &cache, WeightKind::F32).unwrap();
        assert_ne!(cached_a, cached_b);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tlv");
        let mut bytes = vec![9u8]; // unknown tag
        bytes.extend_from_slice(&0u64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(ImportContainer::parse(&data, &path).is_err());
    }
}
