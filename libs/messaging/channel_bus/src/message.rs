use crate::serialization::Serializer;
use crate::ChannelError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the retry counter so it survives transport-level requeue
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message as it travels through the channel pipeline
///
/// Identity (`message_id`, `correlation_id`, `return_address`) is fixed at
/// construction. Headers, retry count and the dispatch stamp change while the
/// message is owned by a single in-flight operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    message_id: Uuid,
    correlation_id: Uuid,
    return_address: Option<String>,
    message_type: String,
    content_format: String,
    content_encoding: String,
    body: Bytes,
    headers: HashMap<String, String>,
    retry_count: u32,
    dispatched: Option<DateTime<Utc>>,
    persistent: bool,
    expiration: Option<DateTime<Utc>>,
}

impl ChannelMessage {
    /// Create a message with a fresh identity
    pub fn new(message_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let message_id = Uuid::new_v4();
        Self {
            message_id,
            correlation_id: message_id,
            return_address: None,
            message_type: message_type.into(),
            content_format: String::new(),
            content_encoding: String::new(),
            body: body.into(),
            headers: HashMap::new(),
            retry_count: 0,
            dispatched: None,
            persistent: true,
            expiration: None,
        }
    }

    /// Serialize `value` as the body, tagging format and encoding from the serializer
    pub fn with_payload<T: Serialize>(
        serializer: &dyn Serializer,
        message_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, ChannelError> {
        let graph = serde_json::to_value(value)?;
        let mut body = Vec::new();
        serializer.serialize(&mut body, &graph)?;

        let mut message = Self::new(message_type, body);
        message.content_format = serializer.content_format().to_string();
        message.content_encoding = serializer.content_encoding().to_string();
        Ok(message)
    }

    /// Rebuild a message received from the wire with its original identity
    pub fn from_wire(
        message_id: Uuid,
        correlation_id: Uuid,
        message_type: impl Into<String>,
        body: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> Self {
        let retry_count = headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self {
            message_id,
            correlation_id,
            return_address: None,
            message_type: message_type.into(),
            content_format: String::new(),
            content_encoding: String::new(),
            body: body.into(),
            headers,
            retry_count,
            dispatched: None,
            persistent: true,
            expiration: None,
        }
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_return_address(mut self, address: impl Into<String>) -> Self {
        self.return_address = Some(address.into());
        self
    }

    pub fn with_content_type(
        mut self,
        format: impl Into<String>,
        encoding: impl Into<String>,
    ) -> Self {
        self.content_format = format.into();
        self.content_encoding = encoding.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Decode the body with the given serializer
    pub fn payload<T: DeserializeOwned>(&self, serializer: &dyn Serializer) -> Result<T, ChannelError> {
        let mut reader: &[u8] = &self.body;
        let graph = serializer.deserialize(
            &mut reader,
            &self.message_type,
            &self.content_format,
            &self.content_encoding,
        )?;
        Ok(serde_json::from_value(graph)?)
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn return_address(&self) -> Option<&str> {
        self.return_address.as_deref()
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content_format(&self) -> &str {
        &self.content_format
    }

    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Bump the retry counter and mirror it into the headers
    pub(crate) fn increment_retry_count(&mut self) -> u32 {
        self.retry_count += 1;
        self.headers
            .insert(RETRY_COUNT_HEADER.to_string(), self.retry_count.to_string());
        self.retry_count
    }

    pub fn dispatched(&self) -> Option<DateTime<Utc>> {
        self.dispatched
    }

    /// Stamp the dispatch time; returns false if it was already set
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>) -> bool {
        if self.dispatched.is_some() {
            return false;
        }
        self.dispatched = Some(at);
        true
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |expiration| expiration <= now)
    }
}

/// Opaque correlation context attached to an envelope
pub type EnvelopeState = Arc<dyn Any + Send + Sync>;

/// A message together with the addresses it is dispatched to
#[derive(Clone)]
pub struct ChannelEnvelope {
    message: ChannelMessage,
    recipients: Vec<String>,
    state: Option<EnvelopeState>,
}

impl ChannelEnvelope {
    pub fn new(message: ChannelMessage, recipients: Vec<String>) -> Result<Self, ChannelError> {
        Self::with_state(message, recipients, None)
    }

    pub fn with_state(
        message: ChannelMessage,
        recipients: Vec<String>,
        state: Option<EnvelopeState>,
    ) -> Result<Self, ChannelError> {
        if recipients.is_empty() {
            return Err(ChannelError::invalid_argument(
                "envelope requires at least one recipient",
            ));
        }
        if recipients.iter().any(|r| r.trim().is_empty()) {
            return Err(ChannelError::invalid_argument(
                "envelope recipients must not be blank",
            ));
        }

        Ok(Self {
            message,
            recipients,
            state,
        })
    }

    pub fn message(&self) -> &ChannelMessage {
        &self.message
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn state(&self) -> Option<&EnvelopeState> {
        self.state.as_ref()
    }

    pub fn into_message(self) -> ChannelMessage {
        self.message
    }
}

impl fmt::Debug for ChannelEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEnvelope")
            .field("message_id", &self.message.message_id)
            .field("recipients", &self.recipients)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}
