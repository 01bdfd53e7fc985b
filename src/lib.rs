//! Read and write MCAP files: a self-describing container format for
//! heterogeneous timestamped binary messages, designed for robotics and
//! other multi-sensor recording workloads.
//!
//! ```no_run
//! # use std::fs;
//! # fn main() -> mcap::McapResult<()> {
//! let mut writer = mcap::WriteOptions::new().create(fs::File::create("out.mcap")?)?;
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod channels;
pub mod chunk_buffer;
pub mod compression;
pub mod indexed_reader;
pub mod io_utils;
pub mod read;
pub mod records;
pub mod write;

pub use compression::{Compression, CompressionLevel};
pub use indexed_reader::{IndexedReader, IndexedReaderOptions, ReadOrder};
pub use read::{McapReader, MessageStream, ReadOptions, ReadProblem, Summary, SummaryReadMethod};
pub use write::{WriteOptions, Writer};

/// The eight magic bytes that open and close every well-formed MCAP file.
pub const MAGIC: &[u8] = b"\x89MCAP0\r\n";

/// A parsed schema: a named, encoded, opaque description of a message layout.
///
/// The library never interprets `data`; it is handed back to the caller as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct Schema<'a> {
    pub name: String,
    pub encoding: String,
    pub data: Cow<'a, [u8]>,
}

/// A channel: a named stream of messages sharing one schema and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel<'a> {
    pub topic: String,
    pub schema: Option<Arc<Schema<'a>>>,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

/// A single timestamped message on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<'a> {
    pub channel: Arc<Channel<'a>>,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
    pub data: Cow<'a, [u8]>,
}

/// An attachment: an arbitrary named blob embedded in the file, outside the
/// channel/message model (e.g. calibration files, a video, a configuration
/// dump).
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment<'a> {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
    pub data: Cow<'a, [u8]>,
}

/// A metadata record: a named key-value map not associated with any channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

pub type McapResult<T> = Result<T, McapError>;

/// Errors that can arise while reading or writing an MCAP file.
#[derive(thiserror::Error, Debug)]
pub enum McapError {
    #[error("Bad magic number")]
    BadMagic,
    #[error("Footer record doesn't match expected length")]
    BadFooterLength,
    #[error("Record parse failed: expected more data than was available")]
    DataTooShort,
    #[error("string was not valid UTF-8: {0}")]
    StringEncoding(#[from] std::str::Utf8Error),
    #[error("Chunk ended before reaching the expected length of {0} bytes")]
    BadChunkLength(u64),
    #[error("Schema with id 0 is invalid")]
    InvalidSchemaId,
    #[error("Schema id referenced by channel `{0}` does not exist: {1}")]
    UnknownSchema(String, u16),
    #[error("Channel id {0} has not been added to this writer")]
    UnknownChannel(u16),
    #[error("Schema `{0}` was already added with a different definition")]
    ConflictingSchemas(String),
    #[error("Channel `{0}` was already added with a different definition")]
    ConflictingChannels(String),
    #[error("All 65535 schema IDs have already been used")]
    TooManySchemas,
    #[error("All 65536 channel IDs have already been used")]
    TooManyChannels,
    #[error("Attachment CRC mismatch: expected {saved}, calculated {calculated}")]
    BadAttachmentCrc { saved: u32, calculated: u32 },
    #[error("Summary section CRC mismatch: expected {saved}, calculated {calculated}")]
    BadSummaryCrc { saved: u32, calculated: u32 },
    #[error("Data section CRC mismatch: expected {saved}, calculated {calculated}")]
    BadDataCrc { saved: u32, calculated: u32 },
    #[error("Unrecognized compression format `{0}`")]
    UnsupportedCompression(String),
    #[error("Compression failed: {0}")]
    Compression(String),
    #[error("Value {0} does not fit in this platform's usize")]
    TooLong(u64),
    #[error("Record opcode {0:#x} is not valid inside a chunk")]
    InvalidOpCode(u8),
    #[error("No attachment write is currently in progress")]
    AttachmentNotInProgress,
    #[error(
        "Attachment write would exceed its declared length by {excess} bytes (declared {declared})"
    )]
    AttachmentTooLarge { excess: u64, declared: u64 },
    #[error("Attachment write finished with {written} bytes, expected {declared}")]
    AttachmentIncomplete { written: u64, declared: u64 },
    #[error("Writer has already been closed")]
    AlreadyClosed,
    #[error("No chunk or record found at the requested offset")]
    BadIndex,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl fmt::Debug for Schema<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("encoding", &self.encoding)
            .field("data", &format!("<{} bytes>", self.data.len()))
            .finish()
    }
}
