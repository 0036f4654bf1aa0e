//! Delta engine: signatures, delta construction, delta application
//!
//! Files are chunked at fixed offsets. A signature is the ordered list of
//! chunk digests; a delta transforms a base signature's content into new
//! content with copy and insert operations. All hash comparisons are raw
//! 32-byte equality.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::store::chunks::{content_hash, hash_hex, ChunkHash};

/// Signature of a single chunk: position plus content digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSignature {
    /// Chunk index within the file
    pub index: u32,
    /// Byte offset of the chunk
    pub offset: u64,
    /// Chunk length; equals the fixed chunk size except possibly for the
    /// final chunk
    pub size: u32,
    /// SHA-256 of the chunk bytes
    #[serde(with = "hash_hex")]
    pub hash: ChunkHash,
}

/// One delta operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    /// Copy a run of chunks from the base, starting at `from_index`
    Copy {
        from_index: u32,
        count: u32,
        /// Total bytes the run covers
        size: u64,
    },
    /// Splice in a chunk; `bytes` is present iff the receiver does not
    /// already hold the chunk body
    Insert {
        #[serde(with = "hash_hex")]
        hash: ChunkHash,
        size: u32,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        bytes: Option<Vec<u8>>,
    },
}

/// Delta from a base signature to new content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Digest of the base signature the delta was computed against
    #[serde(with = "hash_hex")]
    pub base_digest: ChunkHash,
    /// Ordered operations reconstructing the new content
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// True when the delta carries no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Transfer efficiency numbers for a delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaMetrics {
    pub chunks_total: u64,
    pub chunks_copied: u64,
    pub chunks_inserted: u64,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    /// bytes_saved / (bytes_saved + bytes_transferred)
    pub compression_ratio: f64,
}

/// Delta computation engine with a fixed chunk size
#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    chunk_size: usize,
}

impl DeltaEngine {
    /// Create an engine with the given fixed chunk size
    pub fn new(chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        Self { chunk_size }
    }

    /// The configured chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split content into chunk signatures at fixed offsets.
    /// Empty content yields an empty signature.
    pub fn signature(&self, content: &[u8]) -> Vec<ChunkSignature> {
        let mut signatures = Vec::with_capacity(content.len().div_ceil(self.chunk_size));

        for (index, chunk) in content.chunks(self.chunk_size).enumerate() {
            signatures.push(ChunkSignature {
                index: index as u32,
                offset: (index * self.chunk_size) as u64,
                size: chunk.len() as u32,
                hash: content_hash(chunk),
            });
        }

        signatures
    }

    /// Digest identifying a signature: SHA-256 over the concatenated
    /// chunk digests
    pub fn signature_digest(signature: &[ChunkSignature]) -> ChunkHash {
        let mut hasher = Sha256::new();
        for sig in signature {
            hasher.update(sig.hash);
        }
        hasher.finalize().into()
    }

    /// Build a delta transforming the base signature's content into
    /// `new_content`.
    ///
    /// Chunks whose hash appears in the base become copies (first
    /// occurrence wins); consecutive copies of contiguous base indices
    /// merge into one span. Everything else is an insert carrying the
    /// chunk body.
    pub fn delta(&self, base: &[ChunkSignature], new_content: &[u8]) -> Delta {
        let mut base_index: HashMap<ChunkHash, u32> = HashMap::with_capacity(base.len());
        for sig in base {
            base_index.entry(sig.hash).or_insert(sig.index);
        }

        let mut ops: Vec<DeltaOp> = Vec::new();

        for chunk in new_content.chunks(self.chunk_size) {
            let hash = content_hash(chunk);
            match base_index.get(&hash) {
                Some(&idx) => {
                    if let Some(DeltaOp::Copy {
                        from_index,
                        count,
                        size,
                    }) = ops.last_mut()
                    {
                        if *from_index + *count == idx {
                            *count += 1;
                            *size += chunk.len() as u64;
                            continue;
                        }
                    }
                    ops.push(DeltaOp::Copy {
                        from_index: idx,
                        count: 1,
                        size: chunk.len() as u64,
                    });
                }
                None => {
                    ops.push(DeltaOp::Insert {
                        hash,
                        size: chunk.len() as u32,
                        bytes: Some(chunk.to_vec()),
                    });
                }
            }
        }

        Delta {
            base_digest: Self::signature_digest(base),
            ops,
        }
    }

    /// Apply a delta to base content, verifying integrity throughout.
    ///
    /// The base must match the delta's recorded signature digest, every
    /// insert must carry bytes hashing to its declared digest, copied
    /// spans must cover exactly their recorded size, and the result must
    /// hash to `declared`. Any mismatch is a `DeltaIntegrity` error.
    pub fn apply(&self, base: &[u8], delta: &Delta, declared: &ChunkHash) -> Result<Vec<u8>> {
        let base_sig = self.signature(base);
        if Self::signature_digest(&base_sig) != delta.base_digest {
            return Err(Error::DeltaIntegrity(
                "base content does not match the delta's base signature".into(),
            ));
        }

        let mut result = Vec::new();

        for op in &delta.ops {
            match op {
                DeltaOp::Copy {
                    from_index,
                    count,
                    size,
                } => {
                    let mut copied = 0u64;
                    for k in 0..*count {
                        let idx = (*from_index + k) as usize;
                        let start = idx * self.chunk_size;
                        if start >= base.len() {
                            return Err(Error::DeltaIntegrity(format!(
                                "copy references base chunk {} beyond base length",
                                idx
                            )));
                        }
                        let end = usize::min(start + self.chunk_size, base.len());
                        result.extend_from_slice(&base[start..end]);
                        copied += (end - start) as u64;
                    }
                    if copied != *size {
                        return Err(Error::DeltaIntegrity(format!(
                            "copy span covered {} bytes, expected {}",
                            copied, size
                        )));
                    }
                }
                DeltaOp::Insert { hash, size, bytes } => {
                    let body = bytes
                        .as_ref()
                        .ok_or_else(|| Error::MissingChunk(hex::encode(hash)))?;
                    if body.len() != *size as usize || content_hash(body) != *hash {
                        return Err(Error::DeltaIntegrity(format!(
                            "insert body does not match declared digest {}",
                            hex::encode(hash)
                        )));
                    }
                    result.extend_from_slice(body);
                }
            }
        }

        if content_hash(&result) != *declared {
            return Err(Error::DeltaIntegrity(
                "reconstructed content does not hash to the declared digest".into(),
            ));
        }

        Ok(result)
    }

    /// Transfer efficiency numbers for a delta
    pub fn metrics(delta: &Delta) -> DeltaMetrics {
        let mut metrics = DeltaMetrics::default();

        for op in &delta.ops {
            match op {
                DeltaOp::Copy { count, size, .. } => {
                    metrics.chunks_total += *count as u64;
                    metrics.chunks_copied += *count as u64;
                    metrics.bytes_saved += size;
                }
                DeltaOp::Insert { size, .. } => {
                    metrics.chunks_total += 1;
                    metrics.chunks_inserted += 1;
                    metrics.bytes_transferred += *size as u64;
                }
            }
        }

        let total_bytes = metrics.bytes_saved + metrics.bytes_transferred;
        if total_bytes > 0 {
            metrics.compression_ratio = metrics.bytes_saved as f64 / total_bytes as f64;
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 4096;

    fn engine() -> DeltaEngine {
        DeltaEngine::new(CHUNK)
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_signature_empty_content() {
        assert!(engine().signature(b"").is_empty());
    }

    #[test]
    fn test_signature_single_byte() {
        let sigs = engine().signature(b"x");
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].index, 0);
        assert_eq!(sigs[0].offset, 0);
        assert_eq!(sigs[0].size, 1);
    }

    #[test]
    fn test_signature_exact_multiple_has_no_short_tail() {
        let content = patterned(3 * CHUNK, 0);
        let sigs = engine().signature(&content);
        assert_eq!(sigs.len(), 3);
        assert!(sigs.iter().all(|s| s.size as usize == CHUNK));
    }

    #[test]
    fn test_signature_short_final_chunk() {
        let content = patterned(CHUNK + 100, 0);
        let sigs = engine().signature(&content);
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[1].offset, CHUNK as u64);
        assert_eq!(sigs[1].size, 100);
    }

    #[test]
    fn test_identity_delta_has_no_inserts() {
        let content = patterned(2 * CHUNK + 7, 3);
        let base = engine().signature(&content);

        let delta = engine().delta(&base, &content);
        assert!(delta
            .ops
            .iter()
            .all(|op| matches!(op, DeltaOp::Copy { .. })));

        let rebuilt = engine()
            .apply(&content, &delta, &content_hash(&content))
            .unwrap();
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_delta_between_empties_is_empty() {
        let delta = engine().delta(&[], b"");
        assert!(delta.is_empty());
        let rebuilt = engine().apply(b"", &delta, &content_hash(b"")).unwrap();
        assert!(rebuilt.is_empty());
    }

    #[test]
    fn test_middle_chunk_edit_transfers_one_chunk() {
        // 12 KiB file, rewrite only chunk 1.
        let old = patterned(3 * CHUNK, 0);
        let mut new = old.clone();
        for byte in &mut new[CHUNK..2 * CHUNK] {
            *byte = byte.wrapping_add(97);
        }

        let base = engine().signature(&old);
        let delta = engine().delta(&base, &new);

        assert_eq!(delta.ops.len(), 3);
        assert!(matches!(
            delta.ops[0],
            DeltaOp::Copy {
                from_index: 0,
                count: 1,
                ..
            }
        ));
        assert!(matches!(delta.ops[1], DeltaOp::Insert { .. }));
        assert!(matches!(
            delta.ops[2],
            DeltaOp::Copy {
                from_index: 2,
                count: 1,
                ..
            }
        ));

        let metrics = DeltaEngine::metrics(&delta);
        assert_eq!(metrics.chunks_total, 3);
        assert_eq!(metrics.chunks_inserted, 1);
        assert_eq!(metrics.bytes_transferred, CHUNK as u64);
        assert_eq!(metrics.bytes_saved, 2 * CHUNK as u64);
        assert!((metrics.compression_ratio - 2.0 / 3.0).abs() < 1e-9);

        let rebuilt = engine().apply(&old, &delta, &content_hash(&new)).unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn test_contiguous_copies_merge_into_spans() {
        let old = patterned(4 * CHUNK, 0);
        let mut new = old.clone();
        new.extend_from_slice(&patterned(CHUNK, 200));

        let base = engine().signature(&old);
        let delta = engine().delta(&base, &new);

        // Four unchanged chunks collapse into one span, then one insert.
        assert_eq!(delta.ops.len(), 2);
        assert!(matches!(
            delta.ops[0],
            DeltaOp::Copy {
                from_index: 0,
                count: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_apply_transforms_arbitrary_content() {
        let old = patterned(2 * CHUNK + 300, 1);
        let new = patterned(3 * CHUNK + 17, 77);

        let base = engine().signature(&old);
        let delta = engine().delta(&base, &new);
        let rebuilt = engine().apply(&old, &delta, &content_hash(&new)).unwrap();
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn test_apply_rejects_wrong_base() {
        let old = patterned(2 * CHUNK, 1);
        let new = patterned(2 * CHUNK, 9);

        let base = engine().signature(&old);
        let delta = engine().delta(&base, &new);

        let wrong_base = patterned(2 * CHUNK, 55);
        let err = engine()
            .apply(&wrong_base, &delta, &content_hash(&new))
            .unwrap_err();
        assert!(matches!(err, Error::DeltaIntegrity(_)));
    }

    #[test]
    fn test_apply_rejects_corrupted_insert() {
        let old = patterned(CHUNK, 1);
        let new = patterned(CHUNK, 9);

        let base = engine().signature(&old);
        let mut delta = engine().delta(&base, &new);

        if let Some(DeltaOp::Insert { bytes, .. }) = delta.ops.first_mut() {
            bytes.as_mut().unwrap()[0] ^= 0xff;
        }

        let err = engine()
            .apply(&old, &delta, &content_hash(&new))
            .unwrap_err();
        assert!(matches!(err, Error::DeltaIntegrity(_)));
    }

    #[test]
    fn test_apply_requires_insert_bodies() {
        let base = engine().signature(b"");
        let new = patterned(CHUNK, 4);
        let mut delta = engine().delta(&base, &new);

        if let Some(DeltaOp::Insert { bytes, .. }) = delta.ops.first_mut() {
            *bytes = None;
        }

        let err = engine()
            .apply(b"", &delta, &content_hash(&new))
            .unwrap_err();
        assert!(matches!(err, Error::MissingChunk(_)));
    }
}
