use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseError, utils::parse_timestamp};

/// Metadata for a stored attachment object. The bytes live in the object
/// backend; this row is what quota accounting and `stat` read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobObject {
    pub bucket: String,
    pub name: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub sha256: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for BlobObject
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let size_bytes: i64 = row.try_get("size_bytes")?;
        let size_bytes = u64::try_from(size_bytes).map_err(|e| sqlx::Error::ColumnDecode {
            index: "size_bytes".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            bucket: row.try_get("bucket")?,
            name: row.try_get("name")?,
            sha256: row.try_get("sha256")?,
            size_bytes,
            mime_type: row.try_get("mime_type")?,
            created_at: parse_timestamp(row, "created_at")?,
            updated_at: parse_timestamp(row, "updated_at")?,
        })
    }
}

impl BlobObject {
    pub(crate) async fn find(
        database: &Database,
        bucket: &str,
        name: &str,
    ) -> Result<Option<Self>, DatabaseError> {
        let row = sqlx::query_as::<_, BlobObject>(
            "SELECT bucket, name, sha256, size_bytes, mime_type, created_at, updated_at
             FROM blobs
             WHERE bucket = ? AND name = ?",
        )
        .bind(bucket)
        .bind(name)
        .fetch_optional(&database.pool)
        .await?;

        Ok(row)
    }

    /// Inserts or replaces the metadata for `bucket/name`, keeping the
    /// original creation time on replace.
    pub(crate) async fn upsert(
        database: &Database,
        bucket: &str,
        name: &str,
        sha256: &str,
        size_bytes: u64,
        mime_type: Option<&str>,
    ) -> Result<Self, DatabaseError> {
        let now_ms = Utc::now().timestamp_millis();
        let size_bytes = i64::try_from(size_bytes).unwrap_or(i64::MAX);

        let row = sqlx::query_as::<_, BlobObject>(
            "INSERT INTO blobs (bucket, name, sha256, size_bytes, mime_type, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, name) DO UPDATE SET
                sha256 = excluded.sha256,
                size_bytes = excluded.size_bytes,
                mime_type = excluded.mime_type,
                updated_at = excluded.updated_at
             RETURNING bucket, name, sha256, size_bytes, mime_type, created_at, updated_at",
        )
        .bind(bucket)
        .bind(name)
        .bind(sha256)
        .bind(size_bytes)
        .bind(mime_type)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&database.pool)
        .await?;

        Ok(row)
    }

    /// Total bytes currently stored in `bucket`.
    pub(crate) async fn bucket_usage(database: &Database, bucket: &str) -> Result<u64, DatabaseError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM blobs WHERE bucket = ?")
                .bind(bucket)
                .fetch_one(&database.pool)
                .await?;

        Ok(u64::try_from(total).unwrap_or(0))
    }
}
