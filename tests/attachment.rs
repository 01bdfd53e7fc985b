mod common;

use common::*;

use std::borrow::Cow;

use anyhow::Result;
use mcap::{Attachment, McapReader, WriteOptions};

#[test]
fn round_trip() -> Result<()> {
    let attachment = Attachment {
        log_time: 2,
        create_time: 1,
        name: String::from("myFile"),
        media_type: String::from("application/octet-stream"),
        data: Cow::Borrowed(&[1, 2, 3]),
    };

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = WriteOptions::new().create(&mut buf)?;
        writer.write_attachment(&attachment)?;
        writer.finish()?;
    }
    let bytes = buf.into_inner();

    let reader = McapReader::new(&bytes)?;
    let summary = reader.read_summary(mcap::SummaryReadMethod::NoFallbackScan)?;

    assert_eq!(summary.attachment_indexes.len(), 1);
    let index = &summary.attachment_indexes[0];
    assert_eq!(index.name, "myFile");
    assert_eq!(index.media_type, "application/octet-stream");
    assert_eq!(index.data_size, 3);
    assert_eq!(
        summary.statistics.as_ref().unwrap().attachment_count,
        1
    );

    let read_back = reader.read_attachment(index)?;
    assert_eq!(read_back, attachment);

    Ok(())
}

#[test]
fn multiple_attachments_interleaved_with_messages() -> Result<()> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = WriteOptions::new().create(&mut buf)?;
        for m in demo_messages().iter().take(5) {
            writer.write(m)?;
        }
        writer.write_attachment(&Attachment {
            log_time: 100,
            create_time: 100,
            name: String::from("calibration.json"),
            media_type: String::from("application/json"),
            data: Cow::Borrowed(b"{\"k\": 1}"),
        })?;
        for m in demo_messages().iter().skip(5).take(5) {
            writer.write(m)?;
        }
        writer.write_attachment(&Attachment {
            log_time: 200,
            create_time: 200,
            name: String::from("notes.txt"),
            media_type: String::from("text/plain"),
            data: Cow::Borrowed(b"hello"),
        })?;
        writer.finish()?;
    }
    let bytes = buf.into_inner();

    let reader = McapReader::new(&bytes)?;
    let summary = reader.read_summary(mcap::SummaryReadMethod::NoFallbackScan)?;
    assert_eq!(summary.attachment_indexes.len(), 2);
    assert_eq!(summary.attachment_indexes[0].name, "calibration.json");
    assert_eq!(summary.attachment_indexes[1].name, "notes.txt");

    // Writing an attachment closes the in-progress chunk, so messages before
    // and after an attachment land in separate chunks.
    assert!(summary.chunk_indexes.len() >= 2);

    let messages = reader.messages().collect::<mcap::McapResult<Vec<_>>>()?;
    assert_eq!(messages.len(), 10);

    Ok(())
}
