use std::borrow::Cow;
use std::sync::Arc;

use mcap::{Channel, Message, Schema, WriteOptions};

/// Synthesizes a small multi-channel, multi-schema MCAP in memory, exercising
/// enough variety (two topics, binary schema payloads, non-zero sequence/time
/// gaps) to be a useful cross-check target for round-trip tests.
pub fn demo_messages() -> Vec<Message<'static>> {
    let accel_schema = Arc::new(Schema {
        name: "Accel".to_string(),
        encoding: "c".to_string(),
        data: Cow::Borrowed(b"struct Accel { float x, y, z; }"),
    });
    let accel_channel = Arc::new(Channel {
        topic: "/accel".to_string(),
        schema: Some(accel_schema),
        message_encoding: "c".to_string(),
        metadata: [("units".to_string(), "m/s^2".to_string())].into(),
    });

    let log_channel = Arc::new(Channel {
        topic: "/log".to_string(),
        schema: None,
        message_encoding: "text/plain".to_string(),
        metadata: Default::default(),
    });

    let mut messages = Vec::new();
    for i in 0..50u32 {
        messages.push(Message {
            channel: accel_channel.clone(),
            sequence: i,
            log_time: (i as u64) * 10,
            publish_time: (i as u64) * 10 + 1,
            data: Cow::Owned(vec![i as u8; 12]),
        });
        if i % 5 == 0 {
            messages.push(Message {
                channel: log_channel.clone(),
                sequence: i,
                log_time: (i as u64) * 10 + 2,
                publish_time: (i as u64) * 10 + 2,
                data: Cow::Owned(format!("tick {i}").into_bytes()),
            });
        }
    }
    messages
}

/// Writes [`demo_messages`] out with the given writer options and returns the
/// resulting file bytes.
pub fn write_demo_mcap(opts: WriteOptions) -> mcap::McapResult<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut writer = opts.create(&mut buf)?;
    for m in demo_messages() {
        writer.write(&m)?;
    }
    writer.finish()?;
    Ok(buf.into_inner())
}
