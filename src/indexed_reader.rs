//! Time-ordered, multi-chunk iteration driven by the Summary section's
//! chunk indexes: the random-access counterpart to [`crate::read::MessageStream`].
//!
//! Chunks relevant to the requested time range and topic set are decompressed
//! lazily, one at a time, in whatever order the priority queue below
//! determines is necessary to produce the next message - never more eagerly
//! than that, so a read over a narrow time window against a huge file does
//! not pull every chunk into memory at once. [`ReadOrder::File`] skips the
//! queue altogether and drains chunks strictly in on-disk order.

use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

use crate::channels::ChannelAccumulator;
use crate::read::{ReadOptions, ReadProblem, RecordReader, SummaryReadMethod};
use crate::records::{op, ChunkIndex, Record};
use crate::{chunk_buffer, McapError, McapResult, Message};

/// The order in which [`IndexedReader`] yields messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOrder {
    #[default]
    LogTime,
    ReverseLogTime,
    /// On-disk storage order: chunks in ascending file offset, messages
    /// within a chunk in the order they were written (not re-sorted).
    File,
}

/// Builder for [`IndexedReader`].
#[derive(Default)]
pub struct IndexedReaderOptions {
    start: Option<u64>,
    end: Option<u64>,
    order: ReadOrder,
    include_topics: Option<BTreeSet<String>>,
    read_options: ReadOptions,
}

impl IndexedReaderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to verify each chunk's `uncompressed_crc` as it is
    /// decompressed. Mismatches are reported as recoverable problems (see
    /// [`ReadOptions::on_problem`]) rather than aborting the read.
    pub fn validate_crcs(mut self, validate: bool) -> Self {
        self.read_options = self.read_options.validate_crcs(validate);
        self
    }

    /// Registers a callback invoked for every recoverable problem found
    /// while decompressing chunks (in addition to the standing `log::warn!`).
    pub fn on_problem<F: FnMut(ReadProblem) + 'static>(mut self, callback: F) -> Self {
        self.read_options = self.read_options.on_problem(callback);
        self
    }

    /// Only messages with `log_time >= start` are yielded.
    pub fn start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    /// Only messages with `log_time <= end` are yielded.
    pub fn end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn order(mut self, order: ReadOrder) -> Self {
        self.order = order;
        self
    }

    /// Restricts iteration to messages on these topics. Unset means all topics.
    pub fn include_topics<I: IntoIterator<Item = String>>(mut self, topics: I) -> Self {
        self.include_topics = Some(topics.into_iter().collect());
        self
    }

    pub fn build<'a, 's>(
        self,
        data: &'a [u8],
        channels: &'s ChannelAccumulator<'a>,
        chunk_indexes: &[ChunkIndex],
    ) -> IndexedReader<'a, 's> {
        IndexedReader::new(data, channels, chunk_indexes, self)
    }
}

/// A chunk's decompressed bytes, kept around only while jobs still reference it.
struct ChunkSlot {
    data: Vec<u8>,
    /// Number of outstanding reads that still reference this slot.
    refcount: usize,
}

enum Job {
    /// Decompress the chunk at `chunk_pos` (index into `IndexedReader::chunks`)
    /// and enqueue `Emit` jobs for every message inside that survives filtering.
    Decompress { chunk_pos: usize },
    /// Emit the message at `offset` within the decompressed bytes held in `slot`.
    Emit { slot: usize, offset: usize },
}

fn heap_key(reverse: bool, log_time: u64, tiebreak: u64) -> (i128, i128) {
    if reverse {
        (-(log_time as i128), -(tiebreak as i128))
    } else {
        (log_time as i128, tiebreak as i128)
    }
}

fn resolve_channel_ids(
    channels: &ChannelAccumulator<'_>,
    topics: &BTreeSet<String>,
) -> BTreeSet<u16> {
    channels
        .channels
        .iter()
        .filter(|(_, chan)| topics.contains(&chan.topic))
        .map(|(id, _)| *id)
        .collect()
}

/// A lazy, time-ordered iterator over the messages of an indexed MCAP file.
pub struct IndexedReader<'a, 's> {
    channels: &'s ChannelAccumulator<'a>,
    data: &'a [u8],
    chunks: Vec<ChunkIndex>,
    channel_filter: Option<BTreeSet<u16>>,
    start: u64,
    end: u64,
    order: ReadOrder,
    read_options: ReadOptions,

    slots: Vec<ChunkSlot>,
    free_slots: Vec<usize>,

    // Drive `LogTime`/`ReverseLogTime`: a k-way merge across chunks.
    heap: BinaryHeap<Reverse<(i128, i128, u64)>>,
    jobs: Vec<Job>,
    next_job_id: u64,

    // Drive `File`: chunks drained strictly in ascending file order, no heap.
    file_next_chunk: usize,
    file_current: Option<(usize, Vec<usize>, usize)>,
}

impl<'a, 's> IndexedReader<'a, 's> {
    fn new(
        data: &'a [u8],
        channels: &'s ChannelAccumulator<'a>,
        chunk_indexes: &[ChunkIndex],
        options: IndexedReaderOptions,
    ) -> Self {
        let start = options.start.unwrap_or(0);
        let end = options.end.unwrap_or(u64::MAX);
        let channel_filter = options
            .include_topics
            .map(|topics| resolve_channel_ids(channels, &topics));

        let mut chunks: Vec<ChunkIndex> = chunk_indexes
            .iter()
            .filter(|idx| idx.message_start_time <= end && idx.message_end_time >= start)
            .filter(|idx| match &channel_filter {
                Some(wanted) if !idx.message_index_offsets.is_empty() => idx
                    .message_index_offsets
                    .keys()
                    .any(|id| wanted.contains(id)),
                _ => true,
            })
            .cloned()
            .collect();

        chunks.sort_by_key(|c| c.chunk_start_offset);

        let mut reader = Self {
            channels,
            data,
            chunks,
            channel_filter,
            start,
            end,
            order: options.order,
            read_options: options.read_options,
            slots: Vec::new(),
            free_slots: Vec::new(),
            heap: BinaryHeap::new(),
            jobs: Vec::new(),
            next_job_id: 0,
            file_next_chunk: 0,
            file_current: None,
        };

        if reader.order != ReadOrder::File {
            for chunk_pos in 0..reader.chunks.len() {
                reader.push_decompress_job(chunk_pos);
            }
        }
        reader
    }

    fn push_job(&mut self, key: (i128, i128), job: Job) {
        let id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.push(job);
        debug_assert_eq!(self.jobs.len() as u64 - 1, id);
        self.heap.push(Reverse((key.0, key.1, id)));
    }

    fn push_decompress_job(&mut self, chunk_pos: usize) {
        let reverse = self.order == ReadOrder::ReverseLogTime;
        let idx = &self.chunks[chunk_pos];
        let boundary_time = if reverse {
            idx.message_end_time
        } else {
            idx.message_start_time
        };
        let key = heap_key(reverse, boundary_time, idx.chunk_start_offset);
        self.push_job(key, Job::Decompress { chunk_pos });
    }

    fn find_or_make_chunk_slot(&mut self) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            return slot;
        }
        self.slots.push(ChunkSlot {
            data: Vec::new(),
            refcount: 0,
        });
        self.slots.len() - 1
    }

    /// Decompresses one chunk, verifies its `uncompressed_crc` (reporting a
    /// recoverable problem rather than failing on mismatch), and scans the
    /// decompressed bytes for messages passing the time/channel filter, in
    /// the order they appear on disk.
    fn decompress_and_scan(&mut self, chunk_pos: usize) -> McapResult<(Vec<u8>, Vec<(u64, usize)>)> {
        let idx = self.chunks[chunk_pos].clone();
        let compressed_start = idx.compressed_data_offset()? as usize;
        let compressed_end = compressed_start
            .checked_add(idx.compressed_size as usize)
            .ok_or(McapError::BadIndex)?;
        if compressed_end > self.data.len() {
            return Err(McapError::BadIndex);
        }
        let compressed = &self.data[compressed_start..compressed_end];
        let decompressed =
            chunk_buffer::decompress(&idx.compression, compressed, idx.uncompressed_size)?;

        if self.read_options.validate_crcs {
            // uncompressed_crc sits right after opcode(1) + len(8) +
            // message_start_time(8) + message_end_time(8) + uncompressed_size(8)
            // in the on-disk Chunk record; ChunkIndex itself doesn't carry it.
            let crc_start = idx.chunk_start_offset as usize + 1 + 8 + 8 + 8;
            let crc_end = crc_start + 4;
            if crc_end <= self.data.len() {
                let expected =
                    u32::from_le_bytes(self.data[crc_start..crc_end].try_into().unwrap());
                if expected != 0 {
                    let calculated = crc32fast::hash(&decompressed);
                    if calculated != expected {
                        self.read_options.report(ReadProblem {
                            offset: idx.chunk_start_offset as usize,
                            opcode: op::CHUNK,
                            message: format!(
                                "chunk CRC mismatch: expected {expected}, calculated {calculated}"
                            ),
                        });
                    }
                }
            }
        }

        let mut entries = Vec::new();
        {
            let mut reader = RecordReader::new(&decompressed);
            loop {
                let offset = reader.position();
                let record = match reader.next() {
                    Some(r) => r?,
                    None => break,
                };
                let Record::Message { header, .. } = &record else {
                    continue;
                };
                if header.log_time >= self.start
                    && header.log_time <= self.end
                    && self
                        .channel_filter
                        .as_ref()
                        .map(|f| f.contains(&header.channel_id))
                        .unwrap_or(true)
                {
                    entries.push((header.log_time, offset));
                }
            }
        }
        Ok((decompressed, entries))
    }

    fn decompress_chunk(&mut self, chunk_pos: usize) -> McapResult<()> {
        let (decompressed, mut entries) = self.decompress_and_scan(chunk_pos)?;
        let reverse = self.order == ReadOrder::ReverseLogTime;
        if reverse {
            entries.sort_unstable_by_key(|&(t, o)| Reverse((t, o)));
        } else {
            entries.sort_unstable();
        }

        let slot_idx = self.find_or_make_chunk_slot();
        let slot = &mut self.slots[slot_idx];
        slot.data = decompressed;
        slot.refcount = entries.len();

        if entries.is_empty() {
            self.free_slots.push(slot_idx);
        }

        for (log_time, offset) in entries {
            let tiebreak = if reverse {
                u64::MAX - offset as u64
            } else {
                offset as u64
            };
            let key = heap_key(reverse, log_time, tiebreak);
            self.push_job(
                key,
                Job::Emit {
                    slot: slot_idx,
                    offset,
                },
            );
        }
        Ok(())
    }

    fn emit(&mut self, slot_idx: usize, offset: usize) -> McapResult<Message<'a>> {
        let slot = &mut self.slots[slot_idx];
        let mut reader = RecordReader::new(&slot.data[offset..]);
        let record = reader.next().ok_or(McapError::DataTooShort)??;
        let Record::Message { header, data } = record else {
            return Err(McapError::BadIndex);
        };
        let owned_data = data.into_owned();

        slot.refcount -= 1;
        if slot.refcount == 0 {
            self.free_slots.push(slot_idx);
        }

        let channel = self
            .channels
            .get(header.channel_id)
            .ok_or(McapError::UnknownChannel(header.channel_id))?;

        Ok(Message {
            channel,
            sequence: header.sequence,
            log_time: header.log_time,
            publish_time: header.publish_time,
            data: Cow::Owned(owned_data),
        })
    }

    fn next_heap(&mut self) -> Option<McapResult<Message<'a>>> {
        loop {
            let Reverse((_, _, id)) = self.heap.pop()?;
            let job = std::mem::replace(
                &mut self.jobs[id as usize],
                Job::Decompress {
                    chunk_pos: usize::MAX,
                },
            );
            match job {
                Job::Decompress { chunk_pos } => {
                    if let Err(e) = self.decompress_chunk(chunk_pos) {
                        return Some(Err(e));
                    }
                }
                Job::Emit { slot, offset } => return Some(self.emit(slot, offset)),
            }
        }
    }

    fn next_file(&mut self) -> Option<McapResult<Message<'a>>> {
        loop {
            if let Some((slot, offsets, cursor)) = &mut self.file_current {
                if *cursor < offsets.len() {
                    let offset = offsets[*cursor];
                    *cursor += 1;
                    let slot = *slot;
                    return Some(self.emit(slot, offset));
                }
                self.file_current = None;
            }

            if self.file_next_chunk >= self.chunks.len() {
                return None;
            }
            let chunk_pos = self.file_next_chunk;
            self.file_next_chunk += 1;

            let (decompressed, entries) = match self.decompress_and_scan(chunk_pos) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            if entries.is_empty() {
                continue;
            }
            let offsets: Vec<usize> = entries.into_iter().map(|(_, o)| o).collect();
            let slot_idx = self.find_or_make_chunk_slot();
            let slot = &mut self.slots[slot_idx];
            slot.data = decompressed;
            slot.refcount = offsets.len();
            self.file_current = Some((slot_idx, offsets, 0));
        }
    }
}

impl<'a, 's> Iterator for IndexedReader<'a, 's> {
    type Item = McapResult<Message<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.order == ReadOrder::File {
            self.next_file()
        } else {
            self.next_heap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::WriteOptions;
    use crate::{Channel, Message as Msg};
    use std::io::Cursor;
    use std::sync::Arc;

    fn build_file(messages: &[(u16, u64)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        let mut writer = WriteOptions::new()
            .chunk_size(Some(64))
            .compression(None)
            .create(&mut buf)
            .unwrap();
        let channel = Arc::new(Channel {
            topic: "t".into(),
            schema: None,
            message_encoding: "enc".into(),
            metadata: Default::default(),
        });
        for (seq, log_time) in messages {
            writer
                .write(&Msg {
                    channel: channel.clone(),
                    sequence: *seq as u32,
                    log_time: *log_time,
                    publish_time: *log_time,
                    data: Cow::Borrowed(&[1, 2, 3]),
                })
                .unwrap();
        }
        writer.finish().unwrap();
        buf.into_inner()
    }

    #[test]
    fn reads_messages_in_ascending_log_time_order() {
        let bytes = build_file(&[(0, 30), (1, 10), (2, 20), (3, 5)]);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let indexed =
            IndexedReaderOptions::new().build(&bytes, &summary.channels, &summary.chunk_indexes);
        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        assert_eq!(times, vec![5, 10, 20, 30]);
    }

    #[test]
    fn reverse_order_descends() {
        let bytes = build_file(&[(0, 1), (1, 2), (2, 3)]);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let indexed = IndexedReaderOptions::new()
            .order(ReadOrder::ReverseLogTime)
            .build(&bytes, &summary.channels, &summary.chunk_indexes);
        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        assert_eq!(times, vec![3, 2, 1]);
    }

    #[test]
    fn time_range_filters_messages() {
        let bytes = build_file(&[(0, 1), (1, 2), (2, 3), (3, 4)]);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let indexed = IndexedReaderOptions::new()
            .start(2)
            .end(4)
            .build(&bytes, &summary.channels, &summary.chunk_indexes);
        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        assert_eq!(times, vec![2, 3, 4]);
    }

    #[test]
    fn spans_multiple_chunks_in_order() {
        // chunk_size(64) forces several chunks for enough messages.
        let messages: Vec<(u16, u64)> = (0..40).map(|i| (i as u16, 40 - i as u64)).collect();
        let bytes = build_file(&messages);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        assert!(summary.chunk_indexes.len() > 1);
        let indexed =
            IndexedReaderOptions::new().build(&bytes, &summary.channels, &summary.chunk_indexes);
        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted);
    }

    #[test]
    fn file_order_matches_on_disk_sequence() {
        let messages: Vec<(u16, u64)> = vec![(0, 30), (1, 10), (2, 20)];
        let bytes = build_file(&messages);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let indexed = IndexedReaderOptions::new()
            .order(ReadOrder::File)
            .build(&bytes, &summary.channels, &summary.chunk_indexes);
        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        assert_eq!(times, vec![30, 10, 20]);
    }

    #[test]
    fn chunk_crc_mismatch_is_recoverable() {
        let mut bytes = build_file(&[(0, 1), (1, 2), (2, 3)]);
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let chunk_start = summary.chunk_indexes[0].chunk_start_offset as usize;
        let crc_offset = chunk_start + 1 + 8 + 8 + 8 + 8;
        bytes[crc_offset] ^= 0xFF;

        let problems = std::cell::RefCell::new(Vec::new());
        let reader = crate::read::McapReader::new(&bytes).unwrap();
        let summary = reader.read_summary(SummaryReadMethod::NoFallbackScan).unwrap();
        let indexed = IndexedReaderOptions::new()
            .on_problem(|p| problems.borrow_mut().push(p))
            .build(&bytes, &summary.channels, &summary.chunk_indexes);

        let times: Vec<u64> = indexed.map(|m| m.unwrap().log_time).collect();
        assert_eq!(times, vec![1, 2, 3], "data is still yielded on CRC mismatch");
        assert_eq!(problems.borrow().len(), 1);
        assert_eq!(problems.borrow()[0].opcode, op::CHUNK);
    }
}
