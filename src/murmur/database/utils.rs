use chrono::{DateTime, Utc};
use sqlx::Row;

/// Parses a timestamp column stored as INTEGER milliseconds since the Unix
/// epoch, falling back to an RFC 3339 TEXT value for rows written by hand.
pub(crate) fn parse_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<DateTime<Utc>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    if let Ok(timestamp_ms) = row.try_get::<i64, _>(column_name) {
        return DateTime::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| column_decode_error(column_name, "Invalid timestamp value"));
    }

    if let Ok(datetime_str) = row.try_get::<String, _>(column_name) {
        return DateTime::parse_from_rfc3339(&datetime_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| column_decode_error(column_name, &e.to_string()));
    }

    Err(column_decode_error(
        column_name,
        "Could not parse as INTEGER or RFC 3339 TEXT",
    ))
}

/// Wraps a conversion failure the way sqlx reports column decode errors.
pub(crate) fn column_decode_error(column_name: &str, message: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    }
}
