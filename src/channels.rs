//! Bidirectional id/content registry for schemas and channels, shared by
//! both the streaming record reader and the indexed reader.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use crate::{records, Channel, McapError, McapResult, Schema};

/// Collects raw [`records::Channel`]/[`records::SchemaHeader`] records and
/// wires them together into owned, shared [`Channel`]/[`Schema`] values.
#[derive(Debug, Default)]
pub struct ChannelAccumulator<'a> {
    pub(crate) schemas: HashMap<u16, Arc<Schema<'a>>>,
    pub(crate) channels: HashMap<u16, Arc<Channel<'a>>>,
}

impl<'a> ChannelAccumulator<'a> {
    /// Registers a schema. Must be called before any channel that references it.
    ///
    /// Re-registering an identical schema under the same id is a no-op;
    /// registering a *different* schema under an already-used id is an error.
    pub fn add_schema(
        &mut self,
        header: records::SchemaHeader,
        data: Cow<'a, [u8]>,
    ) -> McapResult<()> {
        if header.id == 0 {
            return Err(McapError::InvalidSchemaId);
        }

        let schema = Schema {
            name: header.name,
            encoding: header.encoding,
            data,
        };

        if let Some(preexisting) = self.schemas.get(&header.id) {
            if **preexisting != schema {
                return Err(McapError::ConflictingSchemas(schema.name));
            }
            return Ok(());
        }

        self.schemas.insert(header.id, Arc::new(schema));
        Ok(())
    }

    /// Registers a channel, resolving its schema reference (0 = schemaless).
    pub fn add_channel(&mut self, chan: records::Channel) -> McapResult<()> {
        let schema = if chan.schema_id == 0 {
            None
        } else {
            match self.schemas.get(&chan.schema_id) {
                Some(s) => Some(s.clone()),
                None => return Err(McapError::UnknownSchema(chan.topic, chan.schema_id)),
            }
        };

        let channel = Channel {
            topic: chan.topic.clone(),
            schema,
            message_encoding: chan.message_encoding,
            metadata: chan.metadata,
        };

        if let Some(preexisting) = self.channels.get(&chan.id) {
            if **preexisting != channel {
                return Err(McapError::ConflictingChannels(chan.topic));
            }
            return Ok(());
        }

        self.channels.insert(chan.id, Arc::new(channel));
        Ok(())
    }

    pub fn get(&self, chan_id: u16) -> Option<Arc<Channel<'a>>> {
        self.channels.get(&chan_id).cloned()
    }

    pub fn get_schema(&self, schema_id: u16) -> Option<Arc<Schema<'a>>> {
        self.schemas.get(&schema_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel<'a>>> {
        self.channels.values()
    }

    pub fn schemas(&self) -> impl Iterator<Item = (&u16, &Arc<Schema<'a>>)> {
        self.schemas.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinserting_identical_schema_keeps_same_arc() {
        let mut accumulator = ChannelAccumulator::default();

        accumulator
            .add_schema(
                records::SchemaHeader {
                    id: 1,
                    name: "great_schema".into(),
                    encoding: "great_encoding".into(),
                },
                Cow::from(vec![]),
            )
            .expect("should insert");

        let first_schema = accumulator.schemas.get(&1).expect("should exist").clone();

        accumulator
            .add_schema(
                records::SchemaHeader {
                    id: 1,
                    name: "great_schema".into(),
                    encoding: "great_encoding".into(),
                },
                Cow::from(vec![]),
            )
            .expect("should insert");

        let second_schema = accumulator.schemas.get(&1).expect("should exist").clone();

        assert!(Arc::ptr_eq(&first_schema, &second_schema));
    }

    #[test]
    fn reinserting_identical_channel_keeps_same_arc() {
        let mut accumulator = ChannelAccumulator::default();

        accumulator
            .add_schema(
                records::SchemaHeader {
                    id: 1,
                    name: "great_schema".into(),
                    encoding: "great_encoding".into(),
                },
                Cow::from(vec![]),
            )
            .expect("should insert");

        accumulator
            .add_channel(records::Channel {
                id: 1,
                schema_id: 1,
                topic: "great_topic".into(),
                metadata: Default::default(),
                message_encoding: "great_encoding".into(),
            })
            .expect("should insert");

        let first_channel = accumulator.get(1).expect("should exist");

        accumulator
            .add_channel(records::Channel {
                id: 1,
                schema_id: 1,
                topic: "great_topic".into(),
                metadata: Default::default(),
                message_encoding: "great_encoding".into(),
            })
            .expect("should insert");

        let second_channel = accumulator.get(1).expect("should exist");

        assert!(Arc::ptr_eq(&first_channel, &second_channel));
    }

    #[test]
    fn conflicting_schema_is_rejected() {
        let mut accumulator = ChannelAccumulator::default();
        accumulator
            .add_schema(
                records::SchemaHeader {
                    id: 1,
                    name: "a".into(),
                    encoding: "enc".into(),
                },
                Cow::from(vec![1]),
            )
            .unwrap();
        let err = accumulator
            .add_schema(
                records::SchemaHeader {
                    id: 1,
                    name: "a".into(),
                    encoding: "enc".into(),
                },
                Cow::from(vec![2]),
            )
            .unwrap_err();
        assert!(matches!(err, McapError::ConflictingSchemas(_)));
    }

    #[test]
    fn unknown_schema_reference_is_rejected() {
        let mut accumulator = ChannelAccumulator::default();
        let err = accumulator
            .add_channel(records::Channel {
                id: 1,
                schema_id: 5,
                topic: "t".into(),
                metadata: Default::default(),
                message_encoding: "enc".into(),
            })
            .unwrap_err();
        assert!(matches!(err, McapError::UnknownSchema(_, 5)));
    }
}
