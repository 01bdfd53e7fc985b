mod common;

use common::*;

use anyhow::Result;
use itertools::Itertools;
use mcap::{McapReader, WriteOptions};

#[test]
fn flush_and_cut_chunks() -> Result<()> {
    let messages = demo_messages();

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = WriteOptions::new().create(&mut buf)?;
        for (i, m) in messages.iter().enumerate() {
            writer.write(m)?;
            // Cut a new chunk every other message.
            if i % 2 == 0 {
                writer.flush()?;
            }
        }
        writer.finish()?;
    }
    let bytes = buf.into_inner();

    let reader = McapReader::new(&bytes)?;
    let summary = reader.read_summary(mcap::SummaryReadMethod::NoFallbackScan)?;
    assert!(summary.chunk_indexes.len() > 1);

    // Regardless of the chunk boundaries flush() introduced, the message
    // stream should exactly match what was written, in order.
    for (expected, actual) in messages.iter().zip_eq(reader.messages()) {
        let actual = actual?;
        assert_eq!(expected.sequence, actual.sequence);
        assert_eq!(expected.log_time, actual.log_time);
        assert_eq!(expected.data, actual.data);
    }

    Ok(())
}
