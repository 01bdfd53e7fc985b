//! Streaming writer: the state machine that sequences Header, chunked or raw
//! data records, DataEnd, an optional Summary section, and a Footer.

use std::collections::{BTreeMap, HashSet};
use std::io::{Seek, Write};

use bimap::BiHashMap;
use byteorder::{WriteBytesExt, LE};
use crc32fast::Hasher;

use crate::chunk_buffer::ChunkBuffer;
use crate::compression::{Compression, CompressionLevel};
use crate::io_utils::CountingWriter;
use crate::records::{self, op};
use crate::{Attachment, Channel, Message, Metadata, McapError, McapResult, Schema, MAGIC};

const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Clone, PartialEq, Eq, Hash)]
struct SchemaContent {
    name: String,
    encoding: String,
    data: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ChannelContent {
    topic: String,
    schema_id: u16,
    message_encoding: String,
    metadata: Vec<(String, String)>,
}

fn schema_content(schema: &Schema) -> SchemaContent {
    SchemaContent {
        name: schema.name.clone(),
        encoding: schema.encoding.clone(),
        data: schema.data.to_vec(),
    }
}

fn channel_content(channel: &Channel, schema_id: u16) -> ChannelContent {
    ChannelContent {
        topic: channel.topic.clone(),
        schema_id,
        message_encoding: channel.message_encoding.clone(),
        metadata: channel
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// Builder for [`Writer`]. Every knob named in the writer options surface.
#[derive(Clone)]
pub struct WriteOptions {
    compression: Option<Compression>,
    compression_level: CompressionLevel,
    force_compression: bool,
    profile: String,
    library: String,
    chunk_size: Option<u64>,
    no_chunking: bool,
    no_chunk_crc: bool,
    no_attachment_crc: bool,
    enable_data_crc: bool,
    no_summary_crc: bool,
    no_message_index: bool,
    no_summary: bool,
    no_repeated_schemas: bool,
    no_repeated_channels: bool,
    no_attachment_index: bool,
    no_metadata_index: bool,
    no_chunk_index: bool,
    no_statistics: bool,
    no_summary_offsets: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: Some(Compression::Zstd),
            compression_level: CompressionLevel::Default,
            force_compression: false,
            profile: String::new(),
            library: format!("mcap-rs/{}", env!("CARGO_PKG_VERSION")),
            chunk_size: Some(DEFAULT_CHUNK_SIZE),
            no_chunking: false,
            no_chunk_crc: false,
            no_attachment_crc: false,
            enable_data_crc: false,
            no_summary_crc: false,
            no_message_index: false,
            no_summary: false,
            no_repeated_schemas: false,
            no_repeated_channels: false,
            no_attachment_index: false,
            no_metadata_index: false,
            no_chunk_index: false,
            no_statistics: false,
            no_summary_offsets: false,
        }
    }
}

macro_rules! bool_opt {
    ($name:ident) => {
        pub fn $name(mut self, value: bool) -> Self {
            self.$name = value;
            self
        }
    };
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn compression_level(mut self, level: CompressionLevel) -> Self {
        self.compression_level = level;
        self
    }

    pub fn profile<S: Into<String>>(mut self, profile: S) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn library<S: Into<String>>(mut self, library: S) -> Self {
        self.library = library.into();
        self
    }

    /// Target uncompressed chunk size in bytes, or `None` to disable chunking.
    pub fn chunk_size(mut self, size: Option<u64>) -> Self {
        match size {
            Some(s) => {
                self.chunk_size = Some(s);
                self.no_chunking = false;
            }
            None => self.no_chunking = true,
        }
        self
    }

    bool_opt!(force_compression);
    bool_opt!(no_chunking);
    bool_opt!(no_chunk_crc);
    bool_opt!(no_attachment_crc);
    bool_opt!(enable_data_crc);
    bool_opt!(no_summary_crc);
    bool_opt!(no_message_index);
    bool_opt!(no_summary);
    bool_opt!(no_repeated_schemas);
    bool_opt!(no_repeated_channels);
    bool_opt!(no_attachment_index);
    bool_opt!(no_metadata_index);
    bool_opt!(no_chunk_index);
    bool_opt!(no_statistics);
    bool_opt!(no_summary_offsets);

    pub fn create<W: Write + Seek>(self, sink: W) -> McapResult<Writer<W>> {
        Writer::new(sink, self)
    }
}

struct ChunkState {
    buffer: ChunkBuffer,
    start_offset: u64,
    message_start_time: Option<u64>,
    message_end_time: u64,
    message_indexes: BTreeMap<u16, Vec<records::MessageIndexEntry>>,
    channels_in_chunk: HashSet<u16>,
    schemas_in_chunk: HashSet<u16>,
}

impl ChunkState {
    fn new(buffer: ChunkBuffer, start_offset: u64) -> Self {
        Self {
            buffer,
            start_offset,
            message_start_time: None,
            message_end_time: 0,
            message_indexes: BTreeMap::new(),
            channels_in_chunk: HashSet::new(),
            schemas_in_chunk: HashSet::new(),
        }
    }
}

/// Streaming MCAP writer. Emits records to `W` immediately (buffered only
/// within the current chunk); [`Writer::finish`] writes the summary and footer.
pub struct Writer<W: Write + Seek> {
    sink: Option<CountingWriter<W>>,
    options: WriteOptions,
    crc: Option<Hasher>,

    schemas: BiHashMap<SchemaContent, u16>,
    channels: BiHashMap<ChannelContent, u16>,
    next_schema_id: u16,
    next_channel_id: u16,
    schemas_written_ever: HashSet<u16>,
    channels_written_ever: HashSet<u16>,

    chunk: Option<ChunkState>,

    chunk_indexes: Vec<records::ChunkIndex>,
    attachment_indexes: Vec<records::AttachmentIndex>,
    metadata_indexes: Vec<records::MetadataIndex>,

    message_count: u64,
    message_bounds: Option<(u64, u64)>,
    channel_message_counts: BTreeMap<u16, u64>,
    attachment_count: u32,
    metadata_count: u32,
    chunk_count: u32,

    finished: bool,
}

impl<W: Write + Seek> Writer<W> {
    fn new(sink: W, options: WriteOptions) -> McapResult<Self> {
        let mut sink = CountingWriter::new(sink);
        sink.write_all(MAGIC)?;

        let mut writer = Self {
            sink: Some(sink),
            crc: options.enable_data_crc.then(Hasher::new),
            options,
            schemas: BiHashMap::new(),
            channels: BiHashMap::new(),
            next_schema_id: 1,
            next_channel_id: 1,
            schemas_written_ever: HashSet::new(),
            channels_written_ever: HashSet::new(),
            chunk: None,
            chunk_indexes: Vec::new(),
            attachment_indexes: Vec::new(),
            metadata_indexes: Vec::new(),
            message_count: 0,
            message_bounds: None,
            channel_message_counts: BTreeMap::new(),
            attachment_count: 0,
            metadata_count: 0,
            chunk_count: 0,
            finished: false,
        };

        let header = records::Header {
            profile: writer.options.profile.clone(),
            library: writer.options.library.clone(),
        };
        let mut body = Vec::new();
        records::write_record(&mut body, &records::Record::Header(header))?;
        writer.emit(&body)?;
        Ok(writer)
    }

    fn sink_mut(&mut self) -> &mut CountingWriter<W> {
        self.sink.as_mut().expect("writer used after finish")
    }

    fn pos(&mut self) -> u64 {
        self.sink_mut().bytes_written()
    }

    /// Writes bytes to the real sink and feeds them to whichever CRC scope
    /// is currently active (data section or summary section).
    fn emit(&mut self, bytes: &[u8]) -> McapResult<()> {
        self.sink_mut().write_all(bytes)?;
        if let Some(h) = self.crc.as_mut() {
            h.update(bytes);
        }
        Ok(())
    }

    // -- schema/channel registration -----------------------------------

    fn resolve_schema(&mut self, schema: &Schema) -> McapResult<u16> {
        let content = schema_content(schema);
        if let Some(id) = self.schemas.get_by_left(&content) {
            return Ok(*id);
        }
        if self.next_schema_id == 0 {
            return Err(McapError::TooManySchemas);
        }
        let id = self.next_schema_id;
        self.next_schema_id = self.next_schema_id.checked_add(1).unwrap_or(0);
        self.schemas.insert(content, id);
        Ok(id)
    }

    fn resolve_channel(&mut self, channel: &Channel, schema_id: u16) -> McapResult<u16> {
        let content = channel_content(channel, schema_id);
        if let Some(id) = self.channels.get_by_left(&content) {
            return Ok(*id);
        }
        if self.next_channel_id == 0 {
            return Err(McapError::TooManyChannels);
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.checked_add(1).unwrap_or(0);
        self.channels.insert(content, id);
        Ok(id)
    }

    /// Pre-registers a schema, returning its assigned id. Does not write
    /// anything; the Schema record is emitted lazily on first use.
    pub fn add_schema(&mut self, schema: &Schema) -> McapResult<u16> {
        self.resolve_schema(schema)
    }

    /// Pre-registers a channel (and its schema, if any), returning its
    /// assigned id.
    pub fn add_channel(&mut self, channel: &Channel) -> McapResult<u16> {
        let schema_id = match &channel.schema {
            Some(s) => self.resolve_schema(s)?,
            None => 0,
        };
        self.resolve_channel(channel, schema_id)
    }

    fn ensure_schema_channel_written(
        &mut self,
        channel: &Channel,
        channel_id: u16,
        schema_id: u16,
    ) -> McapResult<()> {
        let in_chunk = self.chunk.is_some();
        let already_global = self.channels_written_ever.contains(&channel_id);
        let already_in_chunk = in_chunk
            && self.chunk.as_ref().unwrap().channels_in_chunk.contains(&channel_id);

        let need_write = if !already_global {
            true
        } else if in_chunk {
            !already_in_chunk && !self.options.no_repeated_channels
        } else {
            false
        };

        if !need_write {
            return Ok(());
        }

        if schema_id != 0 {
            let schema = channel
                .schema
                .as_ref()
                .expect("schema_id != 0 implies schema present");
            let schema_already_global = self.schemas_written_ever.contains(&schema_id);
            let schema_already_in_chunk = in_chunk
                && self.chunk.as_ref().unwrap().schemas_in_chunk.contains(&schema_id);
            let need_schema = if !schema_already_global {
                true
            } else if in_chunk {
                !schema_already_in_chunk && !self.options.no_repeated_schemas
            } else {
                false
            };
            if need_schema {
                let mut body = Vec::new();
                records::write_record(
                    &mut body,
                    &records::Record::Schema {
                        header: records::SchemaHeader {
                            id: schema_id,
                            name: schema.name.clone(),
                            encoding: schema.encoding.clone(),
                        },
                        data: schema.data.clone(),
                    },
                )?;
                self.write_data_record(&body)?;
                self.schemas_written_ever.insert(schema_id);
                if let Some(chunk) = self.chunk.as_mut() {
                    chunk.schemas_in_chunk.insert(schema_id);
                }
            }
        }

        let mut body = Vec::new();
        records::write_record(
            &mut body,
            &records::Record::Channel(records::Channel {
                id: channel_id,
                schema_id,
                topic: channel.topic.clone(),
                message_encoding: channel.message_encoding.clone(),
                metadata: channel.metadata.clone(),
            }),
        )?;
        self.write_data_record(&body)?;
        self.channels_written_ever.insert(channel_id);
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.channels_in_chunk.insert(channel_id);
        }
        Ok(())
    }

    /// Writes one already-serialized record into the current destination:
    /// the active chunk buffer, or directly to the sink if unchunked.
    fn write_data_record(&mut self, bytes: &[u8]) -> McapResult<()> {
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.buffer.write_record(bytes);
            Ok(())
        } else {
            self.emit(bytes)
        }
    }

    // -- messages ---------------------------------------------------------

    pub fn write(&mut self, message: &Message) -> McapResult<()> {
        if self.finished {
            return Err(McapError::AlreadyClosed);
        }
        let schema_id = match &message.channel.schema {
            Some(s) => self.resolve_schema(s)?,
            None => 0,
        };
        let channel_id = self.resolve_channel(&message.channel, schema_id)?;

        let header = records::MessageHeader {
            channel_id,
            sequence: message.sequence,
            log_time: message.log_time,
            publish_time: message.publish_time,
        };
        let record_len = header.serialized_len() + message.data.len() as u64;

        if !self.options.no_chunking {
            self.roll_chunk_if_needed(record_len)?;
            if self.chunk.is_none() {
                self.open_chunk()?;
            }
        }

        self.ensure_schema_channel_written(&message.channel, channel_id, schema_id)?;

        let offset_in_chunk = self.chunk.as_ref().map(|c| c.buffer.uncompressed_size());

        let mut body = Vec::new();
        records::write_record(
            &mut body,
            &records::Record::Message {
                header,
                data: message.data.clone(),
            },
        )?;
        self.write_data_record(&body)?;

        if let Some(chunk) = self.chunk.as_mut() {
            let start = chunk.message_start_time.get_or_insert(message.log_time);
            *start = (*start).min(message.log_time);
            chunk.message_end_time = chunk.message_end_time.max(message.log_time);
            if !self.options.no_message_index {
                chunk
                    .message_indexes
                    .entry(channel_id)
                    .or_default()
                    .push(records::MessageIndexEntry {
                        log_time: message.log_time,
                        offset: offset_in_chunk.unwrap(),
                    });
            }
        }

        self.message_count += 1;
        *self.channel_message_counts.entry(channel_id).or_insert(0) += 1;
        let bounds = self
            .message_bounds
            .get_or_insert((message.log_time, message.log_time));
        bounds.0 = bounds.0.min(message.log_time);
        bounds.1 = bounds.1.max(message.log_time);

        Ok(())
    }

    fn open_chunk(&mut self) -> McapResult<()> {
        let start_offset = self.pos();
        let buffer = ChunkBuffer::new(
            self.options.compression.map(|c| (c, self.options.compression_level)),
            self.options.force_compression,
            !self.options.no_chunk_crc,
        );
        self.chunk = Some(ChunkState::new(buffer, start_offset));
        Ok(())
    }

    /// Closes the current chunk first if writing `additional_bytes` more
    /// would push it to or past the target chunk size. This runs *before*
    /// the new message is appended, so a single oversized message always
    /// gets its own dedicated chunk rather than one that never fills.
    fn roll_chunk_if_needed(&mut self, additional_bytes: u64) -> McapResult<()> {
        let Some(target) = self.options.chunk_size else {
            return Ok(());
        };
        if let Some(chunk) = &self.chunk {
            if chunk.buffer.uncompressed_size() > 0
                && chunk.buffer.uncompressed_size() + additional_bytes >= target
            {
                self.close_current_chunk()?;
            }
        }
        Ok(())
    }

    fn close_current_chunk(&mut self) -> McapResult<()> {
        let Some(chunk) = self.chunk.take() else {
            return Ok(());
        };
        if chunk.buffer.is_empty() {
            return Ok(());
        }
        let finished = chunk.buffer.finish()?;

        let message_start_time = chunk.message_start_time.unwrap_or(0);
        let message_end_time = chunk.message_end_time;

        let mut chunk_record = Vec::new();
        let body_len = 8 + 8 + 8 + 4
            + (4 + finished.compression.len() as u64)
            + (8 + finished.bytes.len() as u64);
        records::write_record_header(&mut chunk_record, op::CHUNK, body_len)?;
        chunk_record.write_u64::<LE>(message_start_time)?;
        chunk_record.write_u64::<LE>(message_end_time)?;
        chunk_record.write_u64::<LE>(finished.uncompressed_size)?;
        chunk_record.write_u32::<LE>(finished.uncompressed_crc)?;
        records::write_string(&mut chunk_record, finished.compression)?;
        records::write_long_byte_array(&mut chunk_record, &finished.bytes)?;
        self.emit(&chunk_record)?;

        let mut message_index_offsets = BTreeMap::new();
        let message_index_start = self.pos();
        for (channel_id, entries) in &chunk.message_indexes {
            let offset = self.pos();
            message_index_offsets.insert(*channel_id, offset);
            let mut body = Vec::new();
            records::write_message_index(
                &mut body,
                &records::MessageIndex {
                    channel_id: *channel_id,
                    records: entries.clone(),
                },
            )?;
            self.emit(&body)?;
        }
        let message_index_length = self.pos() - message_index_start;

        if !self.options.no_chunk_index {
            self.chunk_indexes.push(records::ChunkIndex {
                message_start_time,
                message_end_time,
                chunk_start_offset: chunk.start_offset,
                chunk_length: chunk_record.len() as u64,
                message_index_offsets,
                message_index_length,
                compression: finished.compression.to_string(),
                compressed_size: finished.bytes.len() as u64,
                uncompressed_size: finished.uncompressed_size,
            });
        }
        self.chunk_count += 1;
        Ok(())
    }

    // -- attachments & metadata --------------------------------------------

    pub fn write_attachment(&mut self, attachment: &Attachment) -> McapResult<()> {
        if self.finished {
            return Err(McapError::AlreadyClosed);
        }
        self.close_current_chunk()?;

        let offset = self.pos();

        let mut body = Vec::new();
        body.write_u64::<LE>(attachment.log_time)?;
        body.write_u64::<LE>(attachment.create_time)?;
        records::write_string(&mut body, &attachment.name)?;
        records::write_string(&mut body, &attachment.media_type)?;
        records::write_long_byte_array(&mut body, &attachment.data)?;

        let crc = if self.options.no_attachment_crc {
            0
        } else {
            crc32fast::hash(&body)
        };
        body.write_u32::<LE>(crc)?;

        let mut record = Vec::new();
        records::write_record_header(&mut record, op::ATTACHMENT, body.len() as u64)?;
        record.extend_from_slice(&body);
        self.emit(&record)?;

        if !self.options.no_attachment_index {
            self.attachment_indexes.push(records::AttachmentIndex {
                offset,
                length: record.len() as u64,
                log_time: attachment.log_time,
                create_time: attachment.create_time,
                data_size: attachment.data.len() as u64,
                name: attachment.name.clone(),
                media_type: attachment.media_type.clone(),
            });
        }
        self.attachment_count += 1;
        Ok(())
    }

    pub fn write_metadata(&mut self, metadata: &Metadata) -> McapResult<()> {
        if self.finished {
            return Err(McapError::AlreadyClosed);
        }
        self.close_current_chunk()?;

        let offset = self.pos();
        let mut body = Vec::new();
        records::write_record(
            &mut body,
            &records::Record::Metadata(records::Metadata {
                name: metadata.name.clone(),
                metadata: metadata.metadata.clone(),
            }),
        )?;
        self.emit(&body)?;

        if !self.options.no_metadata_index {
            self.metadata_indexes.push(records::MetadataIndex {
                offset,
                length: body.len() as u64,
                name: metadata.name.clone(),
            });
        }
        self.metadata_count += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> McapResult<()> {
        self.close_current_chunk()?;
        self.sink_mut().flush()?;
        Ok(())
    }

    /// Runs the full close sequence: finish the last chunk, emit DataEnd,
    /// optionally emit the Summary and SummaryOffset sections, then the
    /// Footer and trailing magic.
    pub fn finish(&mut self) -> McapResult<()> {
        if self.finished {
            return Ok(());
        }
        self.close_current_chunk()?;

        let data_section_crc = if self.options.enable_data_crc {
            self.crc.take().map(|h| h.finalize()).unwrap_or(0)
        } else {
            self.crc = None;
            0
        };
        let mut body = Vec::new();
        records::write_record(
            &mut body,
            &records::Record::DataEnd(records::DataEnd { data_section_crc }),
        )?;
        self.emit(&body)?;

        let mut summary_start = 0u64;
        let mut summary_offset_start = 0u64;

        if !self.options.no_summary {
            self.crc = (!self.options.no_summary_crc).then(Hasher::new);
            let mut offsets = Vec::new();
            let summary_begin = self.pos();

            if !self.schemas_written_ever.is_empty() {
                let group_start = self.pos();
                let mut entries: Vec<(u16, SchemaContent)> = self
                    .schemas
                    .iter()
                    .filter(|(_, id)| self.schemas_written_ever.contains(id))
                    .map(|(content, id)| (*id, content.clone()))
                    .collect();
                entries.sort_by_key(|(id, _)| *id);
                for (id, content) in &entries {
                    let mut rec = Vec::new();
                    records::write_record(
                        &mut rec,
                        &records::Record::Schema {
                            header: records::SchemaHeader {
                                id: *id,
                                name: content.name.clone(),
                                encoding: content.encoding.clone(),
                            },
                            data: std::borrow::Cow::Borrowed(content.data.as_slice()),
                        },
                    )?;
                    self.emit(&rec)?;
                }
                if !entries.is_empty() {
                    offsets.push(records::SummaryOffset {
                        group_opcode: op::SCHEMA,
                        group_start,
                        group_length: self.pos() - group_start,
                    });
                }
            }

            if !self.channels_written_ever.is_empty() {
                let group_start = self.pos();
                let mut entries: Vec<(u16, ChannelContent)> = self
                    .channels
                    .iter()
                    .filter(|(_, id)| self.channels_written_ever.contains(id))
                    .map(|(content, id)| (*id, content.clone()))
                    .collect();
                entries.sort_by_key(|(id, _)| *id);
                for (id, content) in &entries {
                    let mut rec = Vec::new();
                    records::write_record(
                        &mut rec,
                        &records::Record::Channel(records::Channel {
                            id: *id,
                            schema_id: content.schema_id,
                            topic: content.topic.clone(),
                            message_encoding: content.message_encoding.clone(),
                            metadata: content.metadata.iter().cloned().collect(),
                        }),
                    )?;
                    self.emit(&rec)?;
                }
                if !entries.is_empty() {
                    offsets.push(records::SummaryOffset {
                        group_opcode: op::CHANNEL,
                        group_start,
                        group_length: self.pos() - group_start,
                    });
                }
            }

            if !self.options.no_statistics {
                let group_start = self.pos();
                let stats = records::Statistics {
                    message_count: self.message_count,
                    schema_count: self.schemas_written_ever.len() as u16,
                    channel_count: self.channels_written_ever.len() as u32,
                    attachment_count: self.attachment_count,
                    metadata_count: self.metadata_count,
                    chunk_count: self.chunk_count,
                    message_start_time: self.message_bounds.map(|b| b.0).unwrap_or(0),
                    message_end_time: self.message_bounds.map(|b| b.1).unwrap_or(0),
                    channel_message_counts: self.channel_message_counts.clone(),
                };
                let mut rec = Vec::new();
                records::write_record(&mut rec, &records::Record::Statistics(stats))?;
                self.emit(&rec)?;
                offsets.push(records::SummaryOffset {
                    group_opcode: op::STATISTICS,
                    group_start,
                    group_length: self.pos() - group_start,
                });
            }

            if !self.chunk_indexes.is_empty() {
                let group_start = self.pos();
                for idx in self.chunk_indexes.clone() {
                    let mut rec = Vec::new();
                    records::write_record(&mut rec, &records::Record::ChunkIndex(idx))?;
                    self.emit(&rec)?;
                }
                offsets.push(records::SummaryOffset {
                    group_opcode: op::CHUNK_INDEX,
                    group_start,
                    group_length: self.pos() - group_start,
                });
            }

            if !self.attachment_indexes.is_empty() {
                let group_start = self.pos();
                for idx in self.attachment_indexes.clone() {
                    let mut rec = Vec::new();
                    records::write_record(&mut rec, &records::Record::AttachmentIndex(idx))?;
                    self.emit(&rec)?;
                }
                offsets.push(records::SummaryOffset {
                    group_opcode: op::ATTACHMENT_INDEX,
                    group_start,
                    group_length: self.pos() - group_start,
                });
            }

            if !self.metadata_indexes.is_empty() {
                let group_start = self.pos();
                for idx in self.metadata_indexes.clone() {
                    let mut rec = Vec::new();
                    records::write_record(&mut rec, &records::Record::MetadataIndex(idx))?;
                    self.emit(&rec)?;
                }
                offsets.push(records::SummaryOffset {
                    group_opcode: op::METADATA_INDEX,
                    group_start,
                    group_length: self.pos() - group_start,
                });
            }

            if self.pos() > summary_begin {
                summary_start = summary_begin;
            }

            if !self.options.no_summary_offsets && !offsets.is_empty() {
                summary_offset_start = self.pos();
                for offset in &offsets {
                    let mut rec = Vec::new();
                    records::write_record(&mut rec, &records::Record::SummaryOffset(*offset))?;
                    self.emit(&rec)?;
                }
            }
        }

        // The footer's own summary_start/summary_offset_start fields are
        // covered by summary_crc; summary_crc itself is not.
        let mut footer_fields = Vec::new();
        footer_fields.write_u64::<LE>(summary_start)?;
        footer_fields.write_u64::<LE>(summary_offset_start)?;
        if let Some(h) = self.crc.as_mut() {
            h.update(&footer_fields);
        }

        let summary_crc = if self.options.no_summary || self.options.no_summary_crc {
            0
        } else {
            self.crc.take().map(|h| h.finalize()).unwrap_or(0)
        };

        let mut footer_record = Vec::new();
        records::write_record_header(&mut footer_record, op::FOOTER, 8 + 8 + 4)?;
        footer_record.extend_from_slice(&footer_fields);
        footer_record.write_u32::<LE>(summary_crc)?;
        self.crc = None;
        self.emit(&footer_record)?;
        self.emit(MAGIC)?;

        self.finished = true;
        Ok(())
    }
}

impl<W: Write + Seek> Drop for Writer<W> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish().unwrap();
        }
    }
}
