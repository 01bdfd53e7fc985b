//! Compression codec abstraction: an optional encoder/decoder pair per
//! compression variant, used by the chunk buffer on write and the chunk
//! sub-reader on read.

use std::io::{self, Write};

use crate::{McapError, McapResult};

/// Compression algorithm applied to a chunk's record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Lz4,
    Zstd,
}

impl Compression {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Tuning knob for the chosen [`Compression`] algorithm. The exact numeric
/// mapping is implementation-defined but stable within a crate version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fastest,
    Fast,
    #[default]
    Default,
    Slow,
    Slowest,
}

fn zstd_level(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::Fastest => 1,
        CompressionLevel::Fast => 3,
        CompressionLevel::Default => 7,
        CompressionLevel::Slow => 15,
        CompressionLevel::Slowest => 19,
    }
}

fn lz4_level(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fastest => 0,
        CompressionLevel::Fast => 2,
        CompressionLevel::Default => 4,
        CompressionLevel::Slow => 9,
        CompressionLevel::Slowest => 12,
    }
}

/// A streaming compressor wrapping an in-memory sink. Used by
/// [`crate::chunk_buffer::ChunkBuffer`], which always compresses into memory
/// first so it can compare the result against the escape-hatch thresholds
/// before committing bytes to the real output file.
pub(crate) enum Encoder {
    #[cfg(feature = "lz4")]
    Lz4(lz4::Encoder<Vec<u8>>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    pub(crate) fn new(compression: Compression, level: CompressionLevel) -> McapResult<Self> {
        match compression {
            #[cfg(feature = "lz4")]
            Compression::Lz4 => {
                let encoder = lz4::EncoderBuilder::new()
                    .level(lz4_level(level))
                    .build(Vec::new())
                    .map_err(|e| McapError::Compression(e.to_string()))?;
                Ok(Encoder::Lz4(encoder))
            }
            #[cfg(not(feature = "lz4"))]
            Compression::Lz4 => Err(McapError::UnsupportedCompression("lz4".into())),
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = zstd::stream::Encoder::new(Vec::new(), zstd_level(level))
                    .map_err(|e| McapError::Compression(e.to_string()))?;
                encoder
                    .multithread(num_cpus::get() as u32)
                    .map_err(|e| McapError::Compression(e.to_string()))?;
                Ok(Encoder::Zstd(encoder))
            }
            #[cfg(not(feature = "zstd"))]
            Compression::Zstd => Err(McapError::UnsupportedCompression("zstd".into())),
        }
    }

    pub(crate) fn finish(self) -> McapResult<Vec<u8>> {
        match self {
            #[cfg(feature = "lz4")]
            Encoder::Lz4(encoder) => {
                let (buf, result) = encoder.finish();
                result.map_err(|e| McapError::Compression(e.to_string()))?;
                Ok(buf)
            }
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder
                .finish()
                .map_err(|e| McapError::Compression(e.to_string())),
        }
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(feature = "lz4")]
            Encoder::Lz4(encoder) => encoder.write(buf),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(feature = "lz4")]
            Encoder::Lz4(encoder) => encoder.flush(),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Decompresses a whole chunk's compressed payload into a freshly allocated
/// buffer of exactly `uncompressed_size` bytes.
pub(crate) fn decompress_chunk(
    compression: &str,
    compressed: &[u8],
    uncompressed_size: u64,
) -> McapResult<Vec<u8>> {
    let uncompressed_size: usize = uncompressed_size
        .try_into()
        .map_err(|_| McapError::TooLong(uncompressed_size))?;
    match compression {
        "" => Ok(compressed.to_vec()),
        #[cfg(feature = "lz4")]
        "lz4" => {
            use std::io::Read;
            let mut out = vec![0u8; uncompressed_size];
            let mut decoder = lz4::Decoder::new(compressed)?;
            decoder.read_exact(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "zstd")]
        "zstd" => {
            let mut out = vec![0u8; uncompressed_size];
            let n = zstd::bulk::decompress_to_buffer(compressed, &mut out)
                .map_err(|e| McapError::Compression(e.to_string()))?;
            if n != uncompressed_size {
                return Err(McapError::Compression(format!(
                    "zstd decompression produced {n} bytes, expected {uncompressed_size}"
                )));
            }
            Ok(out)
        }
        other => Err(McapError::UnsupportedCompression(other.to_string())),
    }
}
