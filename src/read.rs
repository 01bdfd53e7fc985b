//! Read MCAP data from a byte slice.
//!
//! MCAPs are read from a single `&[u8]` instead of a [`std::io::Read`] trait
//! object. Memory-mapping the file (see the `memmap2` crate) lets the OS
//! page bytes in on demand instead of loading the whole file up front.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::channels::ChannelAccumulator;
use crate::chunk_buffer;
use crate::records::{self, op, Record};
use crate::{Attachment, McapError, McapResult, Message, Metadata, MAGIC};

const FOOTER_BODY_LEN: u64 = 8 + 8 + 4;
const FOOTER_RECORD_LEN: u64 = 1 + 8 + FOOTER_BODY_LEN;

/// A recoverable inconsistency found while reading. The iterator that found
/// it keeps going (skipping or passing through the offending data); this is
/// purely diagnostic.
#[derive(Debug, Clone)]
pub struct ReadProblem {
    pub offset: usize,
    pub opcode: u8,
    pub message: String,
}

/// Options shared by the streaming and indexed readers: whether to validate
/// chunk/attachment CRCs as they stream by, and where to surface problems
/// found along the way.
///
/// Every recoverable problem is logged via [`log::warn!`] regardless of
/// whether a callback is registered, so a binary embedding this crate gets a
/// diagnostic trail through whatever `log` subscriber it installs even if it
/// never wires one up itself.
pub struct ReadOptions {
    pub(crate) validate_crcs: bool,
    on_problem: Option<Box<dyn FnMut(ReadProblem)>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            validate_crcs: true,
            on_problem: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate_crcs(mut self, validate: bool) -> Self {
        self.validate_crcs = validate;
        self
    }

    pub fn on_problem<F: FnMut(ReadProblem) + 'static>(mut self, callback: F) -> Self {
        self.on_problem = Some(Box::new(callback));
        self
    }

    pub(crate) fn report(&mut self, problem: ReadProblem) {
        log::warn!(
            "mcap: {} (offset {}, opcode {:#x})",
            problem.message,
            problem.offset,
            problem.opcode
        );
        if let Some(callback) = self.on_problem.as_mut() {
            callback(problem);
        }
    }
}

/// Sequentially reads the opcode+length+payload records out of a flat byte
/// slice, performing no interpretation beyond the TLV envelope.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_record(&mut self) -> Option<McapResult<(u8, &'a [u8])>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        if self.pos + 9 > self.buf.len() {
            return Some(Err(McapError::DataTooShort));
        }
        let opcode = self.buf[self.pos];
        let len = u64::from_le_bytes(self.buf[self.pos + 1..self.pos + 9].try_into().unwrap());
        let body_start = self.pos + 9;
        let body_end = match body_start.checked_add(len as usize) {
            Some(end) if end <= self.buf.len() => end,
            _ => return Some(Err(McapError::DataTooShort)),
        };
        self.pos = body_end;
        Some(Ok((opcode, &self.buf[body_start..body_end])))
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = McapResult<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (opcode, data) = match self.next_record()? {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        Some(records::parse_record(opcode, data))
    }
}

/// Reads the Schema/Channel/Message records that make up a chunk's
/// decompressed record stream. Any other opcode inside a chunk is an error.
pub struct ChunkSubReader<'a> {
    inner: RecordReader<'a>,
}

impl<'a> ChunkSubReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            inner: RecordReader::new(buf),
        }
    }
}

impl<'a> Iterator for ChunkSubReader<'a> {
    type Item = McapResult<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.inner.next()?;
        Some(record.and_then(|record| match &record {
            Record::Schema { .. } | Record::Channel(_) | Record::Message { .. } => Ok(record),
            other => Err(McapError::InvalidOpCode(other.opcode())),
        }))
    }
}

/// Top-level record dispatcher: yields the records of the data section in
/// file order, transparently expanding each Chunk into the Schema/Channel/
/// Message records it contains.
///
/// The decompressed bytes of a chunk are owned by this reader for as long as
/// it is being drained, so yielded records are detached (`'static`) rather
/// than borrowing from the original file buffer while inside a chunk.
pub struct TypedRecordReader<'a> {
    outer: RecordReader<'a>,
    inner: Option<(Vec<u8>, usize)>,
    done: bool,
    options: ReadOptions,
    /// Bytes between the end of the leading Magic and the start of this
    /// reader's own buffer (i.e. the Header record), fed into the DataEnd
    /// CRC check ahead of the buffer's own bytes. Empty unless constructed
    /// through [`McapReader`], which is the only place this prefix is known.
    header_prefix: &'a [u8],
}

impl<'a> TypedRecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_options(buf, ReadOptions::new())
    }

    pub fn with_options(buf: &'a [u8], options: ReadOptions) -> Self {
        Self::with_header_prefix(buf, options, &[])
    }

    pub(crate) fn with_header_prefix(
        buf: &'a [u8],
        options: ReadOptions,
        header_prefix: &'a [u8],
    ) -> Self {
        Self {
            outer: RecordReader::new(buf),
            inner: None,
            done: false,
            options,
            header_prefix,
        }
    }

    fn next_in_chunk(buf: &[u8], pos: &mut usize) -> Option<McapResult<Record<'static>>> {
        if *pos >= buf.len() {
            return None;
        }
        let mut reader = RecordReader::new(&buf[*pos..]);
        let result = reader.next()?;
        *pos += reader.position();
        Some(result.and_then(|record| match &record {
            Record::Schema { .. } | Record::Channel(_) | Record::Message { .. } => {
                Ok(record.into_owned())
            }
            other => Err(McapError::InvalidOpCode(other.opcode())),
        }))
    }
}

impl<'a> Iterator for TypedRecordReader<'a> {
    type Item = McapResult<Record<'static>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((buf, pos)) = self.inner.as_mut() {
                match Self::next_in_chunk(buf, pos) {
                    Some(record) => return Some(record),
                    None => {
                        self.inner = None;
                    }
                }
            }
            let record_start = self.outer.position();
            let record = match self.outer.next()? {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            match record {
                Record::DataEnd(end) => {
                    self.done = true;
                    if self.options.validate_crcs && end.data_section_crc != 0 {
                        let mut hasher = crc32fast::Hasher::new();
                        hasher.update(self.header_prefix);
                        hasher.update(&self.outer.buf[..record_start]);
                        let calculated = hasher.finalize();
                        if calculated != end.data_section_crc {
                            self.options.report(ReadProblem {
                                offset: record_start,
                                opcode: op::DATA_END,
                                message: format!(
                                    "data section CRC mismatch: expected {}, calculated {calculated}",
                                    end.data_section_crc
                                ),
                            });
                        }
                    }
                    return Some(Ok(Record::DataEnd(end)));
                }
                Record::Chunk { header, data } => {
                    let decompressed = match chunk_buffer::decompress(
                        &header.compression,
                        &data,
                        header.uncompressed_size,
                    ) {
                        Ok(d) => d,
                        Err(e) => return Some(Err(e)),
                    };
                    if self.options.validate_crcs && header.uncompressed_crc != 0 {
                        let calculated = crc32fast::hash(&decompressed);
                        if calculated != header.uncompressed_crc {
                            self.options.report(ReadProblem {
                                offset: record_start,
                                opcode: op::CHUNK,
                                message: format!(
                                    "chunk CRC mismatch: expected {}, calculated {calculated}",
                                    header.uncompressed_crc
                                ),
                            });
                        }
                    }
                    self.inner = Some((decompressed, 0));
                }
                other => return Some(Ok(other.into_owned())),
            }
        }
    }
}

/// Controls how [`McapReader::read_summary`] obtains its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryReadMethod {
    /// Use only the Summary section named by the Footer. Returns an empty
    /// `Summary` if the file has none; fails if the recorded one is
    /// malformed or fails CRC validation.
    NoFallbackScan,
    /// Use the Footer's Summary section if present and valid; otherwise
    /// reconstruct one by scanning the whole data section.
    AllowFallbackScan,
    /// Ignore any Summary section and always reconstruct one by scanning
    /// the whole data section via [`TypedRecordReader`].
    ForceScan,
}

/// Accumulated view of a file's Summary section: statistics, the full
/// schema/channel registry, and the indexes needed for random access.
#[derive(Default)]
pub struct Summary<'a> {
    pub statistics: Option<records::Statistics>,
    pub channels: ChannelAccumulator<'a>,
    pub chunk_indexes: Vec<records::ChunkIndex>,
    pub attachment_indexes: Vec<records::AttachmentIndex>,
    pub metadata_indexes: Vec<records::MetadataIndex>,
}

impl std::fmt::Debug for Summary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summary")
            .field("statistics", &self.statistics)
            .field("chunk_indexes", &self.chunk_indexes.len())
            .field("attachment_indexes", &self.attachment_indexes.len())
            .field("metadata_indexes", &self.metadata_indexes.len())
            .finish()
    }
}

/// A parsed MCAP file backed by a borrowed byte slice (e.g. a memory map).
pub struct McapReader<'a> {
    data: &'a [u8],
    header_end: usize,
    footer: records::Footer,
    footer_record_start: usize,
}

impl<'a> McapReader<'a> {
    /// Validates the leading/trailing magic and parses the footer. Does not
    /// read the summary section; call [`McapReader::read_summary`] for that.
    pub fn new(data: &'a [u8]) -> McapResult<Self> {
        if data.len() < MAGIC.len() * 2 + FOOTER_RECORD_LEN as usize {
            return Err(McapError::DataTooShort);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(McapError::BadMagic);
        }
        if &data[data.len() - MAGIC.len()..] != MAGIC {
            return Err(McapError::BadMagic);
        }

        let footer_record_start = data.len() - MAGIC.len() - FOOTER_RECORD_LEN as usize;
        let footer_opcode = data[footer_record_start];
        if footer_opcode != op::FOOTER {
            return Err(McapError::BadFooterLength);
        }
        let footer_len = u64::from_le_bytes(
            data[footer_record_start + 1..footer_record_start + 9]
                .try_into()
                .unwrap(),
        );
        if footer_len != FOOTER_BODY_LEN {
            return Err(McapError::BadFooterLength);
        }
        let footer_body = &data[footer_record_start + 9..footer_record_start + 9 + FOOTER_BODY_LEN as usize];
        let footer = records::parse_record(op::FOOTER, footer_body)?;
        let Record::Footer(footer) = footer else {
            unreachable!("parse_record(FOOTER, ..) always returns Record::Footer")
        };

        let mut header_reader = RecordReader::new(&data[MAGIC.len()..]);
        let header_record = header_reader
            .next()
            .ok_or(McapError::DataTooShort)??;
        if !matches!(header_record, Record::Header(_)) {
            return Err(McapError::DataTooShort);
        }
        let header_end = MAGIC.len() + header_reader.position();

        Ok(Self {
            data,
            header_end,
            footer,
            footer_record_start,
        })
    }

    pub fn footer(&self) -> &records::Footer {
        &self.footer
    }

    /// The byte range `[start, end)` covering the data section: everything
    /// between the leading Header record and the trailing DataEnd record.
    fn data_range(&self) -> std::ops::Range<usize> {
        self.header_end..self.footer_data_end()
    }

    /// The minimal byte range `[start, end)` covering every Chunk whose time
    /// range overlaps `[start_time, end_time]`, computed from the file's
    /// ChunkIndexes. Falls back to the whole data section when no Summary
    /// section is present (or it carries no ChunkIndexes) to scan against.
    pub fn byte_range(&self, start_time: u64, end_time: u64) -> McapResult<std::ops::Range<usize>> {
        let summary = self.read_summary(SummaryReadMethod::NoFallbackScan)?;
        if summary.chunk_indexes.is_empty() {
            return Ok(self.data_range());
        }

        let mut range: Option<std::ops::Range<usize>> = None;
        for idx in &summary.chunk_indexes {
            if idx.message_start_time > end_time || idx.message_end_time < start_time {
                continue;
            }
            let chunk_start = idx.chunk_start_offset as usize;
            let chunk_end = chunk_start + idx.chunk_length as usize;
            range = Some(match range {
                Some(r) => r.start.min(chunk_start)..r.end.max(chunk_end),
                None => chunk_start..chunk_end,
            });
        }
        Ok(range.unwrap_or_else(|| self.data_range().start..self.data_range().start))
    }

    fn footer_data_end(&self) -> usize {
        if self.footer.summary_start != 0 {
            self.footer.summary_start as usize
        } else {
            self.footer_record_start
        }
    }

    /// Obtains the file's Summary: statistics, the schema/channel registry,
    /// and the chunk/attachment/metadata indexes, per `method`. See
    /// [`SummaryReadMethod`].
    pub fn read_summary(&self, method: SummaryReadMethod) -> McapResult<Summary<'a>> {
        match method {
            SummaryReadMethod::ForceScan => self.scan_summary(),
            SummaryReadMethod::NoFallbackScan => self.read_summary_section(),
            SummaryReadMethod::AllowFallbackScan => {
                if self.footer.summary_start == 0 {
                    return self.scan_summary();
                }
                match self.read_summary_section() {
                    Ok(summary) => Ok(summary),
                    Err(_) => self.scan_summary(),
                }
            }
        }
    }

    /// Parses the Summary section named by the footer. Returns an empty
    /// `Summary` if the file has none (`summary_start == 0`).
    fn read_summary_section(&self) -> McapResult<Summary<'a>> {
        let mut summary = Summary::default();
        if self.footer.summary_start == 0 {
            return Ok(summary);
        }
        if self.footer.summary_start as usize > self.footer_record_start {
            return Err(McapError::BadIndex);
        }

        if self.footer.summary_crc != 0 {
            let crc_start = self.footer.summary_start as usize;
            let crc_end = self.footer_record_start + 9 + 16;
            if crc_end > self.data.len() {
                return Err(McapError::DataTooShort);
            }
            let calculated = crc32fast::hash(&self.data[crc_start..crc_end]);
            if calculated != self.footer.summary_crc {
                return Err(McapError::BadSummaryCrc {
                    saved: self.footer.summary_crc,
                    calculated,
                });
            }
        }

        let summary_end = self.footer_record_start;
        let reader = RecordReader::new(&self.data[self.footer.summary_start as usize..summary_end]);
        for record in reader {
            match record? {
                Record::Schema { header, data } => summary.channels.add_schema(header, data)?,
                Record::Channel(chan) => summary.channels.add_channel(chan)?,
                Record::Statistics(stats) => summary.statistics = Some(stats),
                Record::ChunkIndex(idx) => summary.chunk_indexes.push(idx),
                Record::AttachmentIndex(idx) => summary.attachment_indexes.push(idx),
                Record::MetadataIndex(idx) => summary.metadata_indexes.push(idx),
                Record::SummaryOffset(_) => {}
                other => return Err(McapError::InvalidOpCode(other.opcode())),
            }
        }
        Ok(summary)
    }

    /// Reconstructs a Summary by walking the entire data section record by
    /// record: Chunk envelopes become synthesized ChunkIndexes (with an
    /// empty per-channel `message_index_offsets`, since that index is only
    /// ever written alongside the real one), and every Schema/Channel/
    /// Message seen — including inside chunks — feeds the schema/channel
    /// registry and `Statistics`. AttachmentIndex/MetadataIndex are left
    /// empty; nothing about an Attachment or Metadata record's position is
    /// recoverable beyond its presence.
    fn scan_summary(&self) -> McapResult<Summary<'a>> {
        let mut summary = Summary::default();
        let mut stats = records::Statistics::default();

        let data_start = self.data_range().start;
        let data_section = &self.data[self.data_range()];
        let mut outer = RecordReader::new(data_section);
        let note_message = |stats: &mut records::Statistics, log_time: u64, channel_id: u16| {
            if stats.message_count == 0 {
                stats.message_start_time = log_time;
                stats.message_end_time = log_time;
            } else {
                stats.message_start_time = stats.message_start_time.min(log_time);
                stats.message_end_time = stats.message_end_time.max(log_time);
            }
            stats.message_count += 1;
            *stats.channel_message_counts.entry(channel_id).or_insert(0) += 1;
        };

        loop {
            let record_start = outer.position();
            let record = match outer.next() {
                Some(r) => r?,
                None => break,
            };
            match record {
                Record::Schema { header, data } => summary.channels.add_schema(header, data)?,
                Record::Channel(chan) => summary.channels.add_channel(chan)?,
                Record::Message { header, .. } => {
                    note_message(&mut stats, header.log_time, header.channel_id)
                }
                Record::Chunk { header, data } => {
                    let decompressed = chunk_buffer::decompress(
                        &header.compression,
                        &data,
                        header.uncompressed_size,
                    )?;
                    for inner in RecordReader::new(&decompressed) {
                        match inner? {
                            Record::Schema { header, data } => {
                                summary.channels.add_schema(header, data)?
                            }
                            Record::Channel(chan) => summary.channels.add_channel(chan)?,
                            Record::Message { header, .. } => {
                                note_message(&mut stats, header.log_time, header.channel_id)
                            }
                            other => return Err(McapError::InvalidOpCode(other.opcode())),
                        }
                    }
                    let record_len = (outer.position() - record_start) as u64;
                    stats.chunk_count += 1;
                    summary.chunk_indexes.push(records::ChunkIndex {
                        message_start_time: header.message_start_time,
                        message_end_time: header.message_end_time,
                        chunk_start_offset: (data_start + record_start) as u64,
                        chunk_length: record_len,
                        message_index_offsets: BTreeMap::new(),
                        message_index_length: 0,
                        compression: header.compression,
                        compressed_size: header.compressed_size,
                        uncompressed_size: header.uncompressed_size,
                    });
                }
                Record::Attachment { .. } => stats.attachment_count += 1,
                Record::Metadata(_) => stats.metadata_count += 1,
                Record::DataEnd(_) => break,
                Record::MessageIndex(_) | Record::Unknown { .. } => {}
                other => return Err(McapError::InvalidOpCode(other.opcode())),
            }
        }

        stats.schema_count = summary.channels.schemas.len() as u16;
        stats.channel_count = summary.channels.channels.len() as u32;
        summary.statistics = Some(stats);
        Ok(summary)
    }

    /// Reads one attachment by its index entry.
    pub fn read_attachment(&self, index: &records::AttachmentIndex) -> McapResult<Attachment<'a>> {
        let start = index.offset as usize;
        let end = start
            .checked_add(index.length as usize)
            .ok_or(McapError::BadIndex)?;
        if end > self.data.len() {
            return Err(McapError::BadIndex);
        }
        let mut reader = RecordReader::new(&self.data[start..end]);
        let record = reader.next().ok_or(McapError::DataTooShort)??;
        let Record::Attachment { header, data, crc } = record else {
            return Err(McapError::BadIndex);
        };
        if crc != 0 {
            // CRC covers the whole record body (log_time, create_time, name,
            // media_type, data) but not the trailing crc field itself: bytes
            // [start+9, end-4) of the on-disk record.
            let calculated = crc32fast::hash(&self.data[start + 9..end - 4]);
            if calculated != crc {
                return Err(McapError::BadAttachmentCrc {
                    saved: crc,
                    calculated,
                });
            }
        }
        Ok(Attachment {
            log_time: header.log_time,
            create_time: header.create_time,
            name: header.name,
            media_type: header.media_type,
            data,
        })
    }

    /// Reads one metadata record by its index entry.
    pub fn read_metadata(&self, index: &records::MetadataIndex) -> McapResult<Metadata> {
        let start = index.offset as usize;
        let end = start
            .checked_add(index.length as usize)
            .ok_or(McapError::BadIndex)?;
        if end > self.data.len() {
            return Err(McapError::BadIndex);
        }
        let mut reader = RecordReader::new(&self.data[start..end]);
        let record = reader.next().ok_or(McapError::DataTooShort)??;
        let Record::Metadata(metadata) = record else {
            return Err(McapError::BadIndex);
        };
        Ok(metadata)
    }

    /// A streaming, schema/channel-accumulating iterator over every message
    /// in the data section, in file order. Works even on files with no
    /// summary section or indexes.
    pub fn messages(&self) -> MessageStream<'a> {
        self.messages_with_options(ReadOptions::new())
    }

    /// Like [`McapReader::messages`], with control over CRC validation and a
    /// callback for recoverable problems encountered along the way.
    pub fn messages_with_options(&self, options: ReadOptions) -> MessageStream<'a> {
        MessageStream::with_header_prefix(
            &self.data[self.data_range()],
            &self.data[MAGIC.len()..self.header_end],
            options,
        )
    }
}

/// Streams messages out of the data section in file order, auto-registering
/// the Schema/Channel records it encounters (including ones repeated inside
/// chunks) along the way.
pub struct MessageStream<'a> {
    reader: TypedRecordReader<'a>,
    channels: ChannelAccumulator<'a>,
}

impl<'a> MessageStream<'a> {
    /// Builds a stream directly from the data-section bytes (after the
    /// leading Magic and Header), with no further context. A DataEnd
    /// `data_section_crc` check against a stream built this way will not
    /// account for the Header's bytes; prefer [`McapReader::messages`].
    pub fn new(data_section: &'a [u8]) -> Self {
        Self::with_options(data_section, ReadOptions::new())
    }

    pub fn with_options(data_section: &'a [u8], options: ReadOptions) -> Self {
        Self::with_header_prefix(data_section, &[], options)
    }

    pub(crate) fn with_header_prefix(
        data_section: &'a [u8],
        header_prefix: &'a [u8],
        options: ReadOptions,
    ) -> Self {
        Self {
            reader: TypedRecordReader::with_header_prefix(data_section, options, header_prefix),
            channels: ChannelAccumulator::default(),
        }
    }
}

impl<'a> Iterator for MessageStream<'a> {
    type Item = McapResult<Message<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let record = match self.reader.next()? {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            match record {
                Record::Schema { header, data } => {
                    if let Err(e) = self.channels.add_schema(header, data) {
                        return Some(Err(e));
                    }
                }
                Record::Channel(chan) => {
                    if let Err(e) = self.channels.add_channel(chan) {
                        return Some(Err(e));
                    }
                }
                Record::Message { header, data } => {
                    let channel = match self.channels.get(header.channel_id) {
                        Some(c) => c,
                        None => return Some(Err(McapError::UnknownChannel(header.channel_id))),
                    };
                    return Some(Ok(Message {
                        channel,
                        sequence: header.sequence,
                        log_time: header.log_time,
                        publish_time: header.publish_time,
                        data: Cow::Owned(data.into_owned()),
                    }));
                }
                Record::DataEnd(_) => return None,
                _ => {}
            }
        }
    }
}
