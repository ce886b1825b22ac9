//! Serializer contract used to tag outgoing bodies and decode incoming ones.
//!
//! Wire codecs live with the transports; the crate only ships a JSON
//! serializer that doubles as the reference implementation.

use crate::ChannelError;
use std::fmt::Debug;
use std::io::{Read, Write};

pub const JSON_CONTENT_FORMAT: &str = "application/json";

/// Converts object graphs to and from message bodies
pub trait Serializer: Send + Sync + Debug {
    /// MIME-style format tag written to outgoing messages
    fn content_format(&self) -> &str;

    /// Encoding tag (compression, encryption), empty when none
    fn content_encoding(&self) -> &str {
        ""
    }

    fn serialize(
        &self,
        writer: &mut dyn Write,
        graph: &serde_json::Value,
    ) -> Result<(), ChannelError>;

    fn deserialize(
        &self,
        reader: &mut dyn Read,
        message_type: &str,
        format: &str,
        encoding: &str,
    ) -> Result<serde_json::Value, ChannelError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_format(&self) -> &str {
        JSON_CONTENT_FORMAT
    }

    fn serialize(
        &self,
        writer: &mut dyn Write,
        graph: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        serde_json::to_writer(writer, graph)?;
        Ok(())
    }

    fn deserialize(
        &self,
        reader: &mut dyn Read,
        message_type: &str,
        format: &str,
        encoding: &str,
    ) -> Result<serde_json::Value, ChannelError> {
        if !format.is_empty() && format != JSON_CONTENT_FORMAT {
            return Err(ChannelError::serialization(
                format,
                format!("cannot decode {} with the JSON serializer", message_type),
            ));
        }
        if !encoding.is_empty() {
            return Err(ChannelError::serialization(
                format,
                format!("unsupported content encoding '{}'", encoding),
            ));
        }

        serde_json::from_reader(reader).map_err(|e| {
            ChannelError::serialization(
                JSON_CONTENT_FORMAT,
                format!("malformed {} body: {}", message_type, e),
            )
        })
    }
}
