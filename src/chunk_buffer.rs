//! In-memory accumulator for a chunk's record stream, used by the writer to
//! decide — before any bytes reach the real output file — whether
//! compression is actually worth keeping.

use crc32fast::Hasher;

use crate::compression::{self, Compression, CompressionLevel, Encoder};
use crate::McapResult;

/// Below this many uncompressed bytes, compression is skipped regardless of
/// the configured ratio threshold.
const MIN_COMPRESSION_SIZE: u64 = 1024;
/// Compression must shrink the payload by at least this ratio to be worth
/// keeping; otherwise the escape hatch falls back to storing it raw.
const MIN_COMPRESSION_RATIO: f64 = 1.02;

/// What a finished chunk should be written to disk as.
pub struct FinishedChunk {
    /// Bytes to place in the Chunk record's trailing `records` field: either
    /// the compressed bytes, or the raw bytes if the escape hatch triggered.
    pub bytes: Vec<u8>,
    /// The `compression` field to write ("" if the escape hatch triggered).
    pub compression: &'static str,
    pub uncompressed_size: u64,
    pub uncompressed_crc: u32,
}

/// Accumulates raw record bytes for one chunk, optionally compressing them,
/// and decides at [`ChunkBuffer::finish`] whether compression was worth it.
pub struct ChunkBuffer {
    raw: Vec<u8>,
    hasher: Hasher,
    compression: Option<(Compression, CompressionLevel)>,
    force_compression: bool,
    compute_crc: bool,
}

impl ChunkBuffer {
    pub fn new(
        compression: Option<(Compression, CompressionLevel)>,
        force_compression: bool,
        compute_crc: bool,
    ) -> Self {
        Self {
            raw: Vec::new(),
            hasher: Hasher::new(),
            compression,
            force_compression,
            compute_crc,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.raw.len() as u64
    }

    /// Appends bytes belonging to one already-serialized record.
    pub fn write_record(&mut self, bytes: &[u8]) {
        if self.compute_crc {
            self.hasher.update(bytes);
        }
        self.raw.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.hasher = Hasher::new();
    }

    /// Finalizes the chunk: compresses the accumulated bytes (if configured)
    /// and applies the compression escape hatch (§4.1: skip compression when
    /// it isn't worth it, unless `force_compression` is set).
    pub fn finish(&self) -> McapResult<FinishedChunk> {
        let uncompressed_size = self.raw.len() as u64;
        let uncompressed_crc = if self.compute_crc {
            self.hasher.clone().finalize()
        } else {
            0
        };

        let Some((codec, level)) = self.compression else {
            return Ok(FinishedChunk {
                bytes: self.raw.clone(),
                compression: "",
                uncompressed_size,
                uncompressed_crc,
            });
        };

        let mut encoder = Encoder::new(codec, level)?;
        std::io::Write::write_all(&mut encoder, &self.raw)?;
        let compressed = encoder.finish()?;

        let use_compressed = self.force_compression
            || (uncompressed_size >= MIN_COMPRESSION_SIZE
                && (uncompressed_size as f64) / (compressed.len().max(1) as f64)
                    >= MIN_COMPRESSION_RATIO);

        if use_compressed {
            Ok(FinishedChunk {
                bytes: compressed,
                compression: codec.name(),
                uncompressed_size,
                uncompressed_crc,
            })
        } else {
            Ok(FinishedChunk {
                bytes: self.raw.clone(),
                compression: "",
                uncompressed_size,
                uncompressed_crc,
            })
        }
    }
}

/// Decompresses a chunk's on-disk payload, used by the reader side.
pub fn decompress(compression: &str, compressed: &[u8], uncompressed_size: u64) -> McapResult<Vec<u8>> {
    compression::decompress_chunk(compression, compressed, uncompressed_size)
}
