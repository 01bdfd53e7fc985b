mod common;

use common::*;

use anyhow::Result;
use itertools::Itertools;
use mcap::{McapReader, WriteOptions};

fn round_trip(compression: Option<mcap::Compression>) -> Result<()> {
    let bytes = write_demo_mcap(WriteOptions::new().compression(compression))?;

    let reference = McapReader::new(&bytes)?;
    let reread = McapReader::new(&bytes)?;

    for (a, b) in reference.messages().zip_eq(reread.messages()) {
        assert_eq!(a?, b?);
    }

    Ok(())
}

#[test]
fn uncompressed_round_trip() -> Result<()> {
    round_trip(None)
}

#[cfg(feature = "zstd")]
#[test]
fn zstd_round_trip() -> Result<()> {
    round_trip(Some(mcap::Compression::Zstd))
}

#[cfg(feature = "lz4")]
#[test]
fn lz4_round_trip() -> Result<()> {
    round_trip(Some(mcap::Compression::Lz4))
}

/// A payload small enough to trip the compression escape hatch should be
/// stored raw even when a compressor is configured.
#[cfg(feature = "zstd")]
#[test]
fn small_chunk_falls_back_to_uncompressed() -> Result<()> {
    use std::borrow::Cow;
    use std::sync::Arc;

    let channel = Arc::new(mcap::Channel {
        topic: "tiny".to_string(),
        schema: None,
        message_encoding: "raw".to_string(),
        metadata: Default::default(),
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = WriteOptions::new()
            .compression(Some(mcap::Compression::Zstd))
            .create(&mut buf)?;
        writer.write(&mcap::Message {
            channel,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
            data: Cow::Borrowed(b"hi"),
        })?;
        writer.finish()?;
    }
    let bytes = buf.into_inner();

    let summary = McapReader::new(&bytes)?.read_summary(mcap::SummaryReadMethod::NoFallbackScan)?;
    assert_eq!(summary.chunk_indexes[0].compression, "");

    Ok(())
}

#[cfg(feature = "zstd")]
#[test]
fn force_compression_keeps_compressed_even_when_small() -> Result<()> {
    use std::borrow::Cow;
    use std::sync::Arc;

    let channel = Arc::new(mcap::Channel {
        topic: "tiny".to_string(),
        schema: None,
        message_encoding: "raw".to_string(),
        metadata: Default::default(),
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = WriteOptions::new()
            .compression(Some(mcap::Compression::Zstd))
            .force_compression(true)
            .create(&mut buf)?;
        writer.write(&mcap::Message {
            channel,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
            data: Cow::Borrowed(b"hi"),
        })?;
        writer.finish()?;
    }
    let bytes = buf.into_inner();

    let summary = McapReader::new(&bytes)?.read_summary(mcap::SummaryReadMethod::NoFallbackScan)?;
    assert_eq!(summary.chunk_indexes[0].compression, "zstd");

    Ok(())
}
