//! Wire-format record types: the 15 MCAP record kinds, their opcodes, and
//! hand-rolled parsing/serialization against byte slices.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use crate::{McapError, McapResult};

/// Record opcode constants.
pub mod op {
    pub const HEADER: u8 = 0x01;
    pub const FOOTER: u8 = 0x02;
    pub const SCHEMA: u8 = 0x03;
    pub const CHANNEL: u8 = 0x04;
    pub const MESSAGE: u8 = 0x05;
    pub const CHUNK: u8 = 0x06;
    pub const MESSAGE_INDEX: u8 = 0x07;
    pub const CHUNK_INDEX: u8 = 0x08;
    pub const ATTACHMENT: u8 = 0x09;
    pub const ATTACHMENT_INDEX: u8 = 0x0A;
    pub const STATISTICS: u8 = 0x0B;
    pub const METADATA: u8 = 0x0C;
    pub const METADATA_INDEX: u8 = 0x0D;
    pub const SUMMARY_OFFSET: u8 = 0x0E;
    pub const DATA_END: u8 = 0x0F;
}

// ---------------------------------------------------------------------
// primitive parsing helpers
// ---------------------------------------------------------------------

fn need(c: &Cursor<&[u8]>, n: usize) -> McapResult<()> {
    let remaining = c.get_ref().len() - c.position() as usize;
    if remaining < n {
        return Err(McapError::DataTooShort);
    }
    Ok(())
}

fn read_u8(c: &mut Cursor<&[u8]>) -> McapResult<u8> {
    need(c, 1)?;
    Ok(c.read_u8().expect("length checked"))
}

fn read_u16(c: &mut Cursor<&[u8]>) -> McapResult<u16> {
    need(c, 2)?;
    Ok(c.read_u16::<LE>().expect("length checked"))
}

fn read_u32(c: &mut Cursor<&[u8]>) -> McapResult<u32> {
    need(c, 4)?;
    Ok(c.read_u32::<LE>().expect("length checked"))
}

fn read_u64(c: &mut Cursor<&[u8]>) -> McapResult<u64> {
    need(c, 8)?;
    Ok(c.read_u64::<LE>().expect("length checked"))
}

fn read_bytes<'a>(c: &mut Cursor<&'a [u8]>, len: usize) -> McapResult<&'a [u8]> {
    need(c, len)?;
    let start = c.position() as usize;
    let buf = *c.get_ref();
    c.set_position((start + len) as u64);
    Ok(&buf[start..start + len])
}

fn read_string<'a>(c: &mut Cursor<&'a [u8]>) -> McapResult<String> {
    let len = read_u32(c)? as usize;
    let bytes = read_bytes(c, len)?;
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

fn read_byte_array<'a>(c: &mut Cursor<&'a [u8]>) -> McapResult<Cow<'a, [u8]>> {
    let len = read_u32(c)? as usize;
    Ok(Cow::Borrowed(read_bytes(c, len)?))
}

fn read_long_byte_array<'a>(c: &mut Cursor<&'a [u8]>) -> McapResult<Cow<'a, [u8]>> {
    let len = read_u64(c)? as usize;
    Ok(Cow::Borrowed(read_bytes(c, len)?))
}

fn read_string_map(c: &mut Cursor<&[u8]>) -> McapResult<BTreeMap<String, String>> {
    let byte_len = read_u32(c)? as usize;
    let end = c.position() as usize + byte_len;
    need(c, byte_len)?;
    let mut map = BTreeMap::new();
    while (c.position() as usize) < end {
        let k = read_string(c)?;
        let v = read_string(c)?;
        map.insert(k, v);
    }
    Ok(map)
}

fn read_u16_u64_map(c: &mut Cursor<&[u8]>) -> McapResult<BTreeMap<u16, u64>> {
    let byte_len = read_u32(c)? as usize;
    let end = c.position() as usize + byte_len;
    need(c, byte_len)?;
    let mut map = BTreeMap::new();
    while (c.position() as usize) < end {
        let k = read_u16(c)?;
        let v = read_u64(c)?;
        map.insert(k, v);
    }
    Ok(map)
}

// ---------------------------------------------------------------------
// primitive write helpers
// ---------------------------------------------------------------------

pub(crate) fn write_string(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    w.write_u32::<LE>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

pub(crate) fn write_byte_array(w: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    w.write_u32::<LE>(data.len() as u32)?;
    w.write_all(data)
}

pub(crate) fn write_long_byte_array(w: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    w.write_u64::<LE>(data.len() as u64)?;
    w.write_all(data)
}

fn string_map_byte_len(map: &BTreeMap<String, String>) -> u32 {
    map.iter()
        .map(|(k, v)| 4 + k.len() + 4 + v.len())
        .sum::<usize>() as u32
}

pub(crate) fn write_string_map(
    w: &mut impl Write,
    map: &BTreeMap<String, String>,
) -> std::io::Result<()> {
    w.write_u32::<LE>(string_map_byte_len(map))?;
    for (k, v) in map {
        write_string(w, k)?;
        write_string(w, v)?;
    }
    Ok(())
}

pub(crate) fn write_u16_u64_map(
    w: &mut impl Write,
    map: &BTreeMap<u16, u64>,
) -> std::io::Result<()> {
    w.write_u32::<LE>((map.len() * 10) as u32)?;
    for (k, v) in map {
        w.write_u16::<LE>(*k)?;
        w.write_u64::<LE>(*v)?;
    }
    Ok(())
}

/// Writes the 9-byte opcode + length envelope that precedes every record's payload.
pub fn write_record_header(w: &mut impl Write, opcode: u8, len: u64) -> std::io::Result<()> {
    w.write_u8(opcode)?;
    w.write_u64::<LE>(len)
}

// ---------------------------------------------------------------------
// record structs
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub profile: String,
    pub library: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Footer {
    pub summary_start: u64,
    pub summary_offset_start: u64,
    pub summary_crc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaHeader {
    pub id: u16,
    pub name: String,
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u16,
    pub schema_id: u16,
    pub topic: String,
    pub message_encoding: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub channel_id: u16,
    pub sequence: u32,
    pub log_time: u64,
    pub publish_time: u64,
}

impl MessageHeader {
    /// Serialized size of the header in bytes: 2 + 4 + 8 + 8.
    pub fn serialized_len(&self) -> u64 {
        22
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub uncompressed_size: u64,
    pub uncompressed_crc: u32,
    pub compression: String,
    pub compressed_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIndexEntry {
    pub log_time: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageIndex {
    pub channel_id: u16,
    pub records: Vec<MessageIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIndex {
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub chunk_start_offset: u64,
    pub chunk_length: u64,
    pub message_index_offsets: BTreeMap<u16, u64>,
    pub message_index_length: u64,
    pub compression: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

impl ChunkIndex {
    /// Absolute offset of the first byte of compressed chunk data.
    pub fn compressed_data_offset(&self) -> McapResult<u64> {
        Ok(self.chunk_start_offset
            + 1 // opcode
            + 8 // record length
            + 8 // message_start_time
            + 8 // message_end_time
            + 8 // uncompressed_size
            + 4 // uncompressed_crc
            + 4 // compression string length prefix
            + self.compression.len() as u64
            + 8) // compressed_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHeader {
    pub log_time: u64,
    pub create_time: u64,
    pub name: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentIndex {
    pub offset: u64,
    pub length: u64,
    pub log_time: u64,
    pub create_time: u64,
    pub data_size: u64,
    pub name: String,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Statistics {
    pub message_count: u64,
    pub schema_count: u16,
    pub channel_count: u32,
    pub attachment_count: u32,
    pub metadata_count: u32,
    pub chunk_count: u32,
    pub message_start_time: u64,
    pub message_end_time: u64,
    pub channel_message_counts: BTreeMap<u16, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataIndex {
    pub offset: u64,
    pub length: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryOffset {
    pub group_opcode: u8,
    pub group_start: u64,
    pub group_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataEnd {
    pub data_section_crc: u32,
}

/// A single MCAP record, parsed or about to be written.
///
/// Variable-length payloads borrow from the input buffer where possible;
/// call [`Record::into_owned`] to detach from that borrow.
#[derive(Debug, Clone, PartialEq)]
pub enum Record<'a> {
    Header(Header),
    Footer(Footer),
    Schema {
        header: SchemaHeader,
        data: Cow<'a, [u8]>,
    },
    Channel(Channel),
    Message {
        header: MessageHeader,
        data: Cow<'a, [u8]>,
    },
    Chunk {
        header: ChunkHeader,
        data: Cow<'a, [u8]>,
    },
    MessageIndex(MessageIndex),
    ChunkIndex(ChunkIndex),
    Attachment {
        header: AttachmentHeader,
        data: Cow<'a, [u8]>,
        crc: u32,
    },
    AttachmentIndex(AttachmentIndex),
    Statistics(Statistics),
    Metadata(Metadata),
    MetadataIndex(MetadataIndex),
    SummaryOffset(SummaryOffset),
    DataEnd(DataEnd),
    Unknown {
        opcode: u8,
        data: Cow<'a, [u8]>,
    },
}

impl<'a> Record<'a> {
    pub fn opcode(&self) -> u8 {
        match self {
            Record::Header(_) => op::HEADER,
            Record::Footer(_) => op::FOOTER,
            Record::Schema { .. } => op::SCHEMA,
            Record::Channel(_) => op::CHANNEL,
            Record::Message { .. } => op::MESSAGE,
            Record::Chunk { .. } => op::CHUNK,
            Record::MessageIndex(_) => op::MESSAGE_INDEX,
            Record::ChunkIndex(_) => op::CHUNK_INDEX,
            Record::Attachment { .. } => op::ATTACHMENT,
            Record::AttachmentIndex(_) => op::ATTACHMENT_INDEX,
            Record::Statistics(_) => op::STATISTICS,
            Record::Metadata(_) => op::METADATA,
            Record::MetadataIndex(_) => op::METADATA_INDEX,
            Record::SummaryOffset(_) => op::SUMMARY_OFFSET,
            Record::DataEnd(_) => op::DATA_END,
            Record::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Detach any borrowed payload from the input buffer, producing a `'static` record.
    pub fn into_owned(self) -> Record<'static> {
        match self {
            Record::Header(h) => Record::Header(h),
            Record::Footer(f) => Record::Footer(f),
            Record::Schema { header, data } => Record::Schema {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Channel(c) => Record::Channel(c),
            Record::Message { header, data } => Record::Message {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::Chunk { header, data } => Record::Chunk {
                header,
                data: Cow::Owned(data.into_owned()),
            },
            Record::MessageIndex(m) => Record::MessageIndex(m),
            Record::ChunkIndex(c) => Record::ChunkIndex(c),
            Record::Attachment { header, data, crc } => Record::Attachment {
                header,
                data: Cow::Owned(data.into_owned()),
                crc,
            },
            Record::AttachmentIndex(a) => Record::AttachmentIndex(a),
            Record::Statistics(s) => Record::Statistics(s),
            Record::Metadata(m) => Record::Metadata(m),
            Record::MetadataIndex(m) => Record::MetadataIndex(m),
            Record::SummaryOffset(s) => Record::SummaryOffset(s),
            Record::DataEnd(d) => Record::DataEnd(d),
            Record::Unknown { opcode, data } => Record::Unknown {
                opcode,
                data: Cow::Owned(data.into_owned()),
            },
        }
    }
}

// ---------------------------------------------------------------------
// per-kind parsing
// ---------------------------------------------------------------------

fn parse_header(data: &[u8]) -> McapResult<Header> {
    let mut c = Cursor::new(data);
    let profile = read_string(&mut c)?;
    let library = read_string(&mut c)?;
    Ok(Header { profile, library })
}

fn parse_footer(data: &[u8]) -> McapResult<Footer> {
    let mut c = Cursor::new(data);
    Ok(Footer {
        summary_start: read_u64(&mut c)?,
        summary_offset_start: read_u64(&mut c)?,
        summary_crc: read_u32(&mut c)?,
    })
}

fn parse_schema(data: &[u8]) -> McapResult<(SchemaHeader, Cow<[u8]>)> {
    let mut c = Cursor::new(data);
    let id = read_u16(&mut c)?;
    if id == 0 {
        return Err(McapError::InvalidSchemaId);
    }
    let name = read_string(&mut c)?;
    let encoding = read_string(&mut c)?;
    let blob = read_byte_array(&mut c)?;
    Ok((SchemaHeader { id, name, encoding }, blob))
}

fn parse_channel(data: &[u8]) -> McapResult<Channel> {
    let mut c = Cursor::new(data);
    let id = read_u16(&mut c)?;
    let schema_id = read_u16(&mut c)?;
    let topic = read_string(&mut c)?;
    let message_encoding = read_string(&mut c)?;
    let metadata = read_string_map(&mut c)?;
    Ok(Channel {
        id,
        schema_id,
        topic,
        message_encoding,
        metadata,
    })
}

fn parse_message(data: &[u8]) -> McapResult<(MessageHeader, Cow<[u8]>)> {
    let mut c = Cursor::new(data);
    let channel_id = read_u16(&mut c)?;
    let sequence = read_u32(&mut c)?;
    let log_time = read_u64(&mut c)?;
    let publish_time = read_u64(&mut c)?;
    let rest = &data[c.position() as usize..];
    Ok((
        MessageHeader {
            channel_id,
            sequence,
            log_time,
            publish_time,
        },
        Cow::Borrowed(rest),
    ))
}

fn parse_chunk(data: &[u8]) -> McapResult<(ChunkHeader, Cow<[u8]>)> {
    let mut c = Cursor::new(data);
    let message_start_time = read_u64(&mut c)?;
    let message_end_time = read_u64(&mut c)?;
    let uncompressed_size = read_u64(&mut c)?;
    let uncompressed_crc = read_u32(&mut c)?;
    let compression = read_string(&mut c)?;
    let records = read_long_byte_array(&mut c)?;
    Ok((
        ChunkHeader {
            message_start_time,
            message_end_time,
            uncompressed_size,
            uncompressed_crc,
            compression,
            compressed_size: records.len() as u64,
        },
        records,
    ))
}

fn parse_message_index(data: &[u8]) -> McapResult<MessageIndex> {
    let mut c = Cursor::new(data);
    let channel_id = read_u16(&mut c)?;
    let byte_len = read_u32(&mut c)? as usize;
    let end = c.position() as usize + byte_len;
    need(&c, byte_len)?;
    let mut records = Vec::new();
    while (c.position() as usize) < end {
        let log_time = read_u64(&mut c)?;
        let offset = read_u64(&mut c)?;
        records.push(MessageIndexEntry { log_time, offset });
    }
    Ok(MessageIndex {
        channel_id,
        records,
    })
}

fn parse_chunk_index(data: &[u8]) -> McapResult<ChunkIndex> {
    let mut c = Cursor::new(data);
    let message_start_time = read_u64(&mut c)?;
    let message_end_time = read_u64(&mut c)?;
    let chunk_start_offset = read_u64(&mut c)?;
    let chunk_length = read_u64(&mut c)?;
    let message_index_offsets = read_u16_u64_map(&mut c)?;
    let message_index_length = read_u64(&mut c)?;
    let compression = read_string(&mut c)?;
    let compressed_size = read_u64(&mut c)?;
    let uncompressed_size = read_u64(&mut c)?;
    Ok(ChunkIndex {
        message_start_time,
        message_end_time,
        chunk_start_offset,
        chunk_length,
        message_index_offsets,
        message_index_length,
        compression,
        compressed_size,
        uncompressed_size,
    })
}

fn parse_attachment(data: &[u8]) -> McapResult<(AttachmentHeader, Cow<[u8]>, u32)> {
    let mut c = Cursor::new(data);
    let log_time = read_u64(&mut c)?;
    let create_time = read_u64(&mut c)?;
    let name = read_string(&mut c)?;
    let media_type = read_string(&mut c)?;
    let blob = read_long_byte_array(&mut c)?;
    let crc = read_u32(&mut c)?;
    Ok((
        AttachmentHeader {
            log_time,
            create_time,
            name,
            media_type,
        },
        blob,
        crc,
    ))
}

/// Parses just the fixed-size + name/media-type header of an attachment,
/// without requiring the (potentially huge) data payload to be in memory.
/// Used by streaming attachment readers.
pub fn parse_attachment_header(data: &[u8]) -> McapResult<AttachmentHeader> {
    let mut c = Cursor::new(data);
    let log_time = read_u64(&mut c)?;
    let create_time = read_u64(&mut c)?;
    let name = read_string(&mut c)?;
    let media_type = read_string(&mut c)?;
    Ok(AttachmentHeader {
        log_time,
        create_time,
        name,
        media_type,
    })
}

fn parse_attachment_index(data: &[u8]) -> McapResult<AttachmentIndex> {
    let mut c = Cursor::new(data);
    Ok(AttachmentIndex {
        offset: read_u64(&mut c)?,
        length: read_u64(&mut c)?,
        log_time: read_u64(&mut c)?,
        create_time: read_u64(&mut c)?,
        data_size: read_u64(&mut c)?,
        name: read_string(&mut c)?,
        media_type: read_string(&mut c)?,
    })
}

fn parse_statistics(data: &[u8]) -> McapResult<Statistics> {
    let mut c = Cursor::new(data);
    let message_count = read_u64(&mut c)?;
    let schema_count = read_u16(&mut c)?;
    let channel_count = read_u32(&mut c)?;
    let attachment_count = read_u32(&mut c)?;
    let metadata_count = read_u32(&mut c)?;
    let chunk_count = read_u32(&mut c)?;
    let message_start_time = read_u64(&mut c)?;
    let message_end_time = read_u64(&mut c)?;
    let channel_message_counts = read_u16_u64_map(&mut c)?;
    Ok(Statistics {
        message_count,
        schema_count,
        channel_count,
        attachment_count,
        metadata_count,
        chunk_count,
        message_start_time,
        message_end_time,
        channel_message_counts,
    })
}

fn parse_metadata(data: &[u8]) -> McapResult<Metadata> {
    let mut c = Cursor::new(data);
    let name = read_string(&mut c)?;
    let metadata = read_string_map(&mut c)?;
    Ok(Metadata { name, metadata })
}

fn parse_metadata_index(data: &[u8]) -> McapResult<MetadataIndex> {
    let mut c = Cursor::new(data);
    Ok(MetadataIndex {
        offset: read_u64(&mut c)?,
        length: read_u64(&mut c)?,
        name: read_string(&mut c)?,
    })
}

fn parse_summary_offset(data: &[u8]) -> McapResult<SummaryOffset> {
    let mut c = Cursor::new(data);
    Ok(SummaryOffset {
        group_opcode: read_u8(&mut c)?,
        group_start: read_u64(&mut c)?,
        group_length: read_u64(&mut c)?,
    })
}

fn parse_data_end(data: &[u8]) -> McapResult<DataEnd> {
    let mut c = Cursor::new(data);
    Ok(DataEnd {
        data_section_crc: read_u32(&mut c)?,
    })
}

/// Parses one record's payload, given its opcode and the bytes of its body
/// (already bounds-checked against the outer TLV length).
pub fn parse_record(opcode: u8, data: &[u8]) -> McapResult<Record<'_>> {
    Ok(match opcode {
        op::HEADER => Record::Header(parse_header(data)?),
        op::FOOTER => Record::Footer(parse_footer(data)?),
        op::SCHEMA => {
            let (header, data) = parse_schema(data)?;
            Record::Schema { header, data }
        }
        op::CHANNEL => Record::Channel(parse_channel(data)?),
        op::MESSAGE => {
            let (header, data) = parse_message(data)?;
            Record::Message { header, data }
        }
        op::CHUNK => {
            let (header, data) = parse_chunk(data)?;
            Record::Chunk { header, data }
        }
        op::MESSAGE_INDEX => Record::MessageIndex(parse_message_index(data)?),
        op::CHUNK_INDEX => Record::ChunkIndex(parse_chunk_index(data)?),
        op::ATTACHMENT => {
            let (header, data, crc) = parse_attachment(data)?;
            Record::Attachment { header, data, crc }
        }
        op::ATTACHMENT_INDEX => Record::AttachmentIndex(parse_attachment_index(data)?),
        op::STATISTICS => Record::Statistics(parse_statistics(data)?),
        op::METADATA => Record::Metadata(parse_metadata(data)?),
        op::METADATA_INDEX => Record::MetadataIndex(parse_metadata_index(data)?),
        op::SUMMARY_OFFSET => Record::SummaryOffset(parse_summary_offset(data)?),
        op::DATA_END => Record::DataEnd(parse_data_end(data)?),
        opcode => Record::Unknown {
            opcode,
            data: Cow::Borrowed(data),
        },
    })
}

// ---------------------------------------------------------------------
// per-kind writing (small, fully in-memory records only)
//
// Footer, Chunk, MessageIndex, and Attachment are emitted by the writer's
// own low-level helpers instead of through `write_record`, because their
// serialization needs streaming CRC accounting or self-referential length
// fields that this generic dispatcher cannot provide.
// ---------------------------------------------------------------------

fn body_header(h: &Header) -> Vec<u8> {
    let mut v = Vec::new();
    write_string(&mut v, &h.profile).unwrap();
    write_string(&mut v, &h.library).unwrap();
    v
}

fn body_schema_header(h: &SchemaHeader, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u16::<LE>(h.id).unwrap();
    write_string(&mut v, &h.name).unwrap();
    write_string(&mut v, &h.encoding).unwrap();
    write_byte_array(&mut v, data).unwrap();
    v
}

fn body_channel(c: &Channel) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u16::<LE>(c.id).unwrap();
    v.write_u16::<LE>(c.schema_id).unwrap();
    write_string(&mut v, &c.topic).unwrap();
    write_string(&mut v, &c.message_encoding).unwrap();
    write_string_map(&mut v, &c.metadata).unwrap();
    v
}

fn body_message_header(h: &MessageHeader) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u16::<LE>(h.channel_id).unwrap();
    v.write_u32::<LE>(h.sequence).unwrap();
    v.write_u64::<LE>(h.log_time).unwrap();
    v.write_u64::<LE>(h.publish_time).unwrap();
    v
}

fn body_chunk_index(i: &ChunkIndex) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LE>(i.message_start_time).unwrap();
    v.write_u64::<LE>(i.message_end_time).unwrap();
    v.write_u64::<LE>(i.chunk_start_offset).unwrap();
    v.write_u64::<LE>(i.chunk_length).unwrap();
    write_u16_u64_map(&mut v, &i.message_index_offsets).unwrap();
    v.write_u64::<LE>(i.message_index_length).unwrap();
    write_string(&mut v, &i.compression).unwrap();
    v.write_u64::<LE>(i.compressed_size).unwrap();
    v.write_u64::<LE>(i.uncompressed_size).unwrap();
    v
}

fn body_attachment_index(i: &AttachmentIndex) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LE>(i.offset).unwrap();
    v.write_u64::<LE>(i.length).unwrap();
    v.write_u64::<LE>(i.log_time).unwrap();
    v.write_u64::<LE>(i.create_time).unwrap();
    v.write_u64::<LE>(i.data_size).unwrap();
    write_string(&mut v, &i.name).unwrap();
    write_string(&mut v, &i.media_type).unwrap();
    v
}

fn body_statistics(s: &Statistics) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LE>(s.message_count).unwrap();
    v.write_u16::<LE>(s.schema_count).unwrap();
    v.write_u32::<LE>(s.channel_count).unwrap();
    v.write_u32::<LE>(s.attachment_count).unwrap();
    v.write_u32::<LE>(s.metadata_count).unwrap();
    v.write_u32::<LE>(s.chunk_count).unwrap();
    v.write_u64::<LE>(s.message_start_time).unwrap();
    v.write_u64::<LE>(s.message_end_time).unwrap();
    write_u16_u64_map(&mut v, &s.channel_message_counts).unwrap();
    v
}

fn body_metadata(m: &Metadata) -> Vec<u8> {
    let mut v = Vec::new();
    write_string(&mut v, &m.name).unwrap();
    write_string_map(&mut v, &m.metadata).unwrap();
    v
}

fn body_metadata_index(m: &MetadataIndex) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u64::<LE>(m.offset).unwrap();
    v.write_u64::<LE>(m.length).unwrap();
    write_string(&mut v, &m.name).unwrap();
    v
}

fn body_summary_offset(s: &SummaryOffset) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u8(s.group_opcode).unwrap();
    v.write_u64::<LE>(s.group_start).unwrap();
    v.write_u64::<LE>(s.group_length).unwrap();
    v
}

fn body_data_end(d: &DataEnd) -> Vec<u8> {
    let mut v = Vec::new();
    v.write_u32::<LE>(d.data_section_crc).unwrap();
    v
}

/// Serializes a non-streamed record (everything except Footer/Chunk/
/// MessageIndex/Attachment) as a full opcode+length+payload record.
pub fn write_record(w: &mut impl Write, record: &Record) -> std::io::Result<()> {
    let (opcode, body) = match record {
        Record::Header(h) => (op::HEADER, body_header(h)),
        Record::Schema { header, data } => (op::SCHEMA, body_schema_header(header, data)),
        Record::Channel(c) => (op::CHANNEL, body_channel(c)),
        Record::Message { header, data } => {
            let mut v = body_message_header(header);
            v.extend_from_slice(data);
            (op::MESSAGE, v)
        }
        Record::ChunkIndex(i) => (op::CHUNK_INDEX, body_chunk_index(i)),
        Record::AttachmentIndex(i) => (op::ATTACHMENT_INDEX, body_attachment_index(i)),
        Record::Statistics(s) => (op::STATISTICS, body_statistics(s)),
        Record::Metadata(m) => (op::METADATA, body_metadata(m)),
        Record::MetadataIndex(m) => (op::METADATA_INDEX, body_metadata_index(m)),
        Record::SummaryOffset(s) => (op::SUMMARY_OFFSET, body_summary_offset(s)),
        Record::DataEnd(d) => (op::DATA_END, body_data_end(d)),
        Record::Footer(_) | Record::Chunk { .. } | Record::MessageIndex(_) => {
            unreachable!("Footer/Chunk/MessageIndex are written via dedicated streaming helpers")
        }
        Record::Attachment { .. } => {
            unreachable!("Attachment is written via AttachmentWriter for CRC streaming")
        }
        Record::Unknown { opcode, data } => (*opcode, data.to_vec()),
    };
    write_record_header(w, opcode, body.len() as u64)?;
    w.write_all(&body)
}

/// Serializes a [`MessageIndex`] record body (used directly by the writer,
/// which emits these immediately after each chunk).
pub fn write_message_index(w: &mut impl Write, index: &MessageIndex) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.write_u16::<LE>(index.channel_id).unwrap();
    body.write_u32::<LE>((index.records.len() * 16) as u32)
        .unwrap();
    for entry in &index.records {
        body.write_u64::<LE>(entry.log_time).unwrap();
        body.write_u64::<LE>(entry.offset).unwrap();
    }
    write_record_header(w, op::MESSAGE_INDEX, body.len() as u64)?;
    w.write_all(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header {
            profile: "x-custom".into(),
            library: "mcap-rs".into(),
        };
        let mut buf = Vec::new();
        write_record(&mut buf, &Record::Header(h.clone())).unwrap();
        assert_eq!(buf[0], op::HEADER);
        let len = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        assert_eq!(len as usize, buf.len() - 9);
        let parsed = parse_record(op::HEADER, &buf[9..]).unwrap();
        assert_eq!(parsed, Record::Header(h));
    }

    #[test]
    fn message_header_len() {
        let h = MessageHeader {
            channel_id: 1,
            sequence: 0,
            log_time: 0,
            publish_time: 0,
        };
        assert_eq!(h.serialized_len(), 22);
    }

    #[test]
    fn string_map_sorted_on_write() {
        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), "1".to_string());
        map.insert("alpha".to_string(), "2".to_string());
        let mut buf = Vec::new();
        write_string_map(&mut buf, &map).unwrap();
        let mut c = Cursor::new(&buf[..]);
        let _len = read_u32(&mut c).unwrap();
        let k1 = read_string(&mut c).unwrap();
        assert_eq!(k1, "alpha");
    }

    #[test]
    fn chunk_index_compressed_data_offset() {
        let idx = ChunkIndex {
            message_start_time: 0,
            message_end_time: 0,
            chunk_start_offset: 100,
            chunk_length: 50,
            message_index_offsets: BTreeMap::new(),
            message_index_length: 0,
            compression: "zstd".into(),
            compressed_size: 10,
            uncompressed_size: 20,
        };
        // 100 + 1 + 8 + 8 + 8 + 8 + 4 + 4 + 4("zstd") + 8
        assert_eq!(idx.compressed_data_offset().unwrap(), 100 + 1 + 8 + 8 + 8 + 8 + 4 + 4 + 4 + 8);
    }

    #[test]
    fn schema_rejects_zero_id() {
        let mut body = Vec::new();
        body.write_u16::<LE>(0).unwrap();
        write_string(&mut body, "name").unwrap();
        write_string(&mut body, "enc").unwrap();
        write_byte_array(&mut body, &[]).unwrap();
        let err = parse_record(op::SCHEMA, &body).unwrap_err();
        assert!(matches!(err, McapError::InvalidSchemaId));
    }
}
