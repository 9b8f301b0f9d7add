use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Database, DatabaseError, utils::column_decode_error, utils::parse_timestamp};
use crate::murmur::messages::{Channel, Message, MessageType, NewMessage, Order, Sequence};

const MESSAGE_COLUMNS: &str = "id, channel, sequence, sender_id, sender_name, sender_avatar_url,
                               body, message_type, attachment_ref, duration_ms, created_at";

/// Internal database row representation for the messages table
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageRow {
    pub id: Uuid,
    pub channel: Channel,
    pub sequence: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar_url: Option<String>,
    pub body: Option<String>,
    pub message_type: MessageType,
    pub attachment_ref: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for MessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id_str: String = row.try_get("id")?;
        let channel_str: String = row.try_get("channel")?;
        let message_type_str: String = row.try_get("message_type")?;

        let id = Uuid::parse_str(&id_str).map_err(|e| sqlx::Error::ColumnDecode {
            index: "id".to_string(),
            source: Box::new(e),
        })?;

        let channel = Channel::new(channel_str)
            .map_err(|e| column_decode_error("channel", &e.to_string()))?;

        let message_type = message_type_str
            .parse::<MessageType>()
            .map_err(|e| column_decode_error("message_type", &e))?;

        let created_at = parse_timestamp(row, "created_at")?;

        Ok(Self {
            id,
            channel,
            sequence: row.try_get("sequence")?,
            sender_id: row.try_get("sender_id")?,
            sender_name: row.try_get("sender_name")?,
            sender_avatar_url: row.try_get("sender_avatar_url")?,
            body: row.try_get("body")?,
            message_type,
            attachment_ref: row.try_get("attachment_ref")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at,
        })
    }
}

impl From<MessageRow> for Message {
    fn from(val: MessageRow) -> Self {
        Self {
            id: val.id,
            channel: val.channel,
            sequence: Sequence::new(val.sequence),
            sender_id: val.sender_id,
            sender_name: val.sender_name,
            sender_avatar_url: val.sender_avatar_url,
            body: val.body,
            message_type: val.message_type,
            attachment_ref: val.attachment_ref,
            duration_ms: val.duration_ms.and_then(|d| u64::try_from(d).ok()),
            created_at: val.created_at,
        }
    }
}

impl Message {
    /// Inserts a message at the tail of `channel`.
    ///
    /// The channel counter is bumped and read back in the same statement, and
    /// the stored timestamp is clamped to never run behind the channel's
    /// previous message, so `(sequence, created_at)` move together even if the
    /// wall clock steps backwards.
    pub(crate) async fn insert(
        database: &Database,
        channel: &Channel,
        new_message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Self, DatabaseError> {
        let now_ms = now.timestamp_millis();
        let duration_ms = new_message
            .duration_ms
            .map(|d| i64::try_from(d).unwrap_or(i64::MAX));

        let mut tx = database.pool.begin().await?;

        sqlx::query(
            "INSERT INTO channels (name, last_sequence, last_created_at, created_at)
             VALUES (?, 0, 0, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(channel.as_str())
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        let (sequence, created_at_ms): (i64, i64) = sqlx::query_as(
            "UPDATE channels
             SET last_sequence = last_sequence + 1,
                 last_created_at = MAX(last_created_at, ?)
             WHERE name = ?
             RETURNING last_sequence, last_created_at",
        )
        .bind(now_ms)
        .bind(channel.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(channel.as_str())
        .bind(sequence)
        .bind(&new_message.sender_id)
        .bind(&new_message.sender_name)
        .bind(new_message.sender_avatar_url.as_deref())
        .bind(new_message.body.as_deref())
        .bind(new_message.message_type.to_string())
        .bind(new_message.attachment_ref.as_deref())
        .bind(duration_ms)
        .bind(created_at_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.into())
    }

    /// The newest `limit` messages in `channel`, in the requested order.
    pub(crate) async fn find_recent(
        database: &Database,
        channel: &Channel,
        limit: i64,
        order: Order,
    ) -> Result<Vec<Self>, DatabaseError> {
        let query = match order {
            Order::Descending => format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE channel = ?
                 ORDER BY sequence DESC
                 LIMIT ?"
            ),
            // Take the newest window, then flip it so the caller reads oldest-first
            Order::Ascending => format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM (
                     SELECT {MESSAGE_COLUMNS}
                     FROM messages
                     WHERE channel = ?
                     ORDER BY sequence DESC
                     LIMIT ?
                 )
                 ORDER BY sequence ASC"
            ),
        };

        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(channel.as_str())
            .bind(limit)
            .fetch_all(&database.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub(crate) async fn find_since(
        database: &Database,
        channel: &Channel,
        cursor: Sequence,
    ) -> Result<Vec<Self>, DatabaseError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE channel = ? AND sequence > ?
             ORDER BY sequence ASC"
        ))
        .bind(channel.as_str())
        .bind(cursor.value())
        .fetch_all(&database.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub(crate) async fn latest_sequence(
        database: &Database,
        channel: &Channel,
    ) -> Result<Sequence, DatabaseError> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM channels WHERE name = ?")
                .bind(channel.as_str())
                .fetch_optional(&database.pool)
                .await?;

        Ok(Sequence::new(latest.unwrap_or(0)))
    }

    pub(crate) async fn find_by_id(
        database: &Database,
        id: &Uuid,
    ) -> Result<Option<Self>, DatabaseError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&database.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::murmur::database::tests::create_test_db;
    use chrono::TimeZone;

    fn text(body: &str) -> NewMessage {
        NewMessage::text("user-1", "Ada", body)
    }

    #[tokio::test]
    async fn test_insert_creates_channel_row() {
        let (db, _dir) = create_test_db().await;
        let channel = Channel::global();

        let message = Message::insert(&db, &channel, &text("hi"), Utc::now())
            .await
            .unwrap();

        let (last_sequence,): (i64,) =
            sqlx::query_as("SELECT last_sequence FROM channels WHERE name = ?")
                .bind("global")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(last_sequence, 1);
        assert_eq!(message.sequence, Sequence::new(1));
    }

    #[tokio::test]
    async fn test_created_at_never_runs_backwards() {
        let (db, _dir) = create_test_db().await;
        let channel = Channel::global();
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 6, 1, 11, 59, 0).unwrap();

        let first = Message::insert(&db, &channel, &text("one"), later)
            .await
            .unwrap();
        let second = Message::insert(&db, &channel, &text("two"), earlier)
            .await
            .unwrap();

        assert_eq!(first.created_at, later);
        assert_eq!(second.created_at, later);
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_rejected_by_schema() {
        let (db, _dir) = create_test_db().await;
        let channel = Channel::global();
        let message = Message::insert(&db, &channel, &text("hi"), Utc::now())
            .await
            .unwrap();

        let result = sqlx::query(
            "INSERT INTO messages (id, channel, sequence, sender_id, sender_name, message_type, created_at)
             VALUES (?, 'global', ?, 'user-1', 'Ada', 'text', 0)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(message.sequence.value())
        .execute(&db.pool)
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_message_type_fails_to_decode() {
        let (db, _dir) = create_test_db().await;
        let channel = Channel::global();
        let message = Message::insert(&db, &channel, &text("hi"), Utc::now())
            .await
            .unwrap();

        sqlx::query("UPDATE messages SET message_type = 'video' WHERE id = ?")
            .bind(message.id.to_string())
            .execute(&db.pool)
            .await
            .unwrap();

        let err = Message::find_by_id(&db, &message.id).await.unwrap_err();
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn test_latest_sequence_for_unknown_channel() {
        let (db, _dir) = create_test_db().await;
        let latest = Message::latest_sequence(&db, &Channel::new("nobody-here").unwrap())
            .await
            .unwrap();
        assert_eq!(latest, Sequence::ZERO);
    }
}
