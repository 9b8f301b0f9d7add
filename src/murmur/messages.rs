//! Chat messages and the append-only, per-channel ordered message store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::murmur::database::{Database, DatabaseError};
use crate::murmur::error::ErrorKind;
use crate::murmur::message_streaming::ChangeNotifier;

#[derive(Error, Debug)]
pub enum MessageStoreError {
    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(#[source] DatabaseError),

    #[error("Message store database error: {0}")]
    Database(#[source] DatabaseError),
}

impl MessageStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessageStoreError::Validation(_) => ErrorKind::Validation,
            MessageStoreError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            MessageStoreError::Database(_) => ErrorKind::Internal,
        }
    }
}

impl From<DatabaseError> for MessageStoreError {
    fn from(err: DatabaseError) -> Self {
        if err.is_unavailable() {
            MessageStoreError::StoreUnavailable(err)
        } else {
            MessageStoreError::Database(err)
        }
    }
}

impl From<sqlx::Error> for MessageStoreError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from(err).into()
    }
}

type Result<T> = std::result::Result<T, MessageStoreError>;

/// A named message partition, e.g. the global chat room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub const GLOBAL: &'static str = "global";
    const MAX_LEN: usize = 64;

    /// Names are 1 to 64 characters of `[a-z0-9_-]`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(MessageStoreError::Validation(format!(
                "channel name must be 1 to {} characters, got {}",
                Self::MAX_LEN,
                name.len()
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
        {
            return Err(MessageStoreError::Validation(format!(
                "channel name {name:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(name))
    }

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Channel {
    type Err = MessageStoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Channel {
    type Error = MessageStoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Per-channel ordering key. The first message in a channel gets 1; an empty
/// channel's head is [`Sequence::ZERO`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    File,
}

impl MessageType {
    pub fn is_attachment(self) -> bool {
        !matches!(self, MessageType::Text)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Text => write!(f, "text"),
            MessageType::Image => write!(f, "image"),
            MessageType::Audio => write!(f, "audio"),
            MessageType::File => write!(f, "file"),
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "audio" => Ok(MessageType::Audio),
            "file" => Ok(MessageType::File),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

/// A message as submitted by a client: no id, sequence or timestamp yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub body: Option<String>,
    pub message_type: MessageType,
    pub attachment_ref: Option<String>,
    pub duration_ms: Option<u64>,
}

impl NewMessage {
    pub fn text(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            sender_avatar_url: None,
            body: Some(body.into()),
            message_type: MessageType::Text,
            attachment_ref: None,
            duration_ms: None,
        }
    }

    pub fn attachment(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        message_type: MessageType,
        attachment_ref: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            sender_avatar_url: None,
            body: None,
            message_type,
            attachment_ref: Some(attachment_ref.into()),
            duration_ms: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.sender_avatar_url = Some(avatar_url.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Store-level checks: the fields every row needs regardless of type.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.sender_id.trim().is_empty() {
            return Err(MessageStoreError::Validation(
                "sender id is required".to_string(),
            ));
        }
        if let Some(duration_ms) = self.duration_ms
            && i64::try_from(duration_ms).is_err()
        {
            return Err(MessageStoreError::Validation(format!(
                "duration {duration_ms}ms is out of range"
            )));
        }
        Ok(())
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel: Channel,
    pub sequence: Sequence,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub body: Option<String>,
    pub message_type: MessageType,
    pub attachment_ref: Option<String>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Result ordering for [`MessageStore::list_recent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// Append-only message table with a per-channel total order.
///
/// Appends on one channel are serialized twice over: an in-process guard per
/// channel, and an atomic increment of the channel's counter inside the
/// insert transaction. Every committed message is handed to the
/// [`ChangeNotifier`] before the guard is released, so the live feed sees
/// messages in sequence order.
#[derive(Clone)]
pub struct MessageStore {
    database: Arc<Database>,
    notifier: ChangeNotifier,
    append_guards: Arc<DashMap<Channel, Arc<Mutex<()>>>>,
}

impl MessageStore {
    pub fn new(database: Arc<Database>, notifier: ChangeNotifier) -> Self {
        Self {
            database,
            notifier,
            append_guards: Arc::new(DashMap::new()),
        }
    }

    /// Persists `new_message` in `channel`, assigning its id, sequence and
    /// creation time, then publishes it to live subscribers.
    ///
    /// # Errors
    ///
    /// - [`MessageStoreError::Validation`] if the sender id is blank.
    /// - [`MessageStoreError::StoreUnavailable`] if the database refuses the write.
    pub async fn append(&self, channel: &Channel, new_message: NewMessage) -> Result<Message> {
        new_message.validate()?;

        let guard = self.append_guard(channel);
        let _lock = guard.lock().await;

        let message = Message::insert(&self.database, channel, &new_message, Utc::now())
            .await
            .map_err(|e| {
                tracing::warn!(
                    target: "murmur::messages::append",
                    "Failed to append message to {}: {}",
                    channel,
                    e
                );
                MessageStoreError::from(e)
            })?;

        tracing::debug!(
            target: "murmur::messages::append",
            "Appended message {} to {} at sequence {}",
            message.id,
            channel,
            message.sequence
        );

        self.notifier.publish(&message);

        Ok(message)
    }

    /// Returns at most `limit` of the channel's most recent messages in the
    /// requested order, read from a single snapshot.
    pub async fn list_recent(
        &self,
        channel: &Channel,
        limit: usize,
        order: Order,
    ) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(Message::find_recent(&self.database, channel, limit, order).await?)
    }

    /// Every message with a sequence strictly greater than `cursor`, oldest first.
    pub async fn list_since(&self, channel: &Channel, cursor: Sequence) -> Result<Vec<Message>> {
        Ok(Message::find_since(&self.database, channel, cursor).await?)
    }

    /// The highest sequence assigned in `channel`, or [`Sequence::ZERO`].
    pub async fn latest_sequence(&self, channel: &Channel) -> Result<Sequence> {
        Ok(Message::latest_sequence(&self.database, channel).await?)
    }

    pub async fn find_by_id(&self, id: &Uuid) -> Result<Option<Message>> {
        Ok(Message::find_by_id(&self.database, id).await?)
    }

    fn append_guard(&self, channel: &Channel) -> Arc<Mutex<()>> {
        self.append_guards
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("database", &"<REDACTED>")
            .field("channels", &self.append_guards.len())
            .finish()
    }
}
