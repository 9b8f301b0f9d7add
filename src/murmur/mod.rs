use std::fmt;
use std::sync::Arc;

use anyhow::Context;

pub mod blobs;
pub mod config;
pub mod database;
pub mod error;
pub mod media_policy;
pub mod message_streaming;
pub mod messages;
pub mod storage;
pub mod subscriptions;
mod utils;

use crate::init_tracing;
use blobs::{BlobStore, UploadOptions};
use config::MurmurConfig;
use database::Database;
use error::{MurmurError, Result};
use media_policy::MediaPolicy;
use message_streaming::ChangeNotifier;
use messages::{Channel, Message, MessageStore, MessageStoreError, NewMessage, Order, Sequence};
use storage::FilesystemBackend;
use subscriptions::{Subscription, SubscriptionManager};

/// The chat service: one explicitly constructed instance owns the database,
/// the change feed, every live subscription and the attachment store.
pub struct Murmur {
    config: MurmurConfig,
    database: Arc<Database>,
    notifier: ChangeNotifier,
    messages: MessageStore,
    subscriptions: SubscriptionManager,
    blobs: BlobStore,
    media_policy: MediaPolicy,
}

impl fmt::Debug for Murmur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Murmur")
            .field("config", &self.config)
            .field("database", &"<REDACTED>")
            .field("notifier", &self.notifier)
            .field("subscriptions", &self.subscriptions)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl Murmur {
    /// Opens (or creates) the service's storage under `config.data_dir` and
    /// starts logging to `config.logs_dir`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is inconsistent, a directory cannot be
    /// created, or the database cannot be opened and migrated.
    pub async fn new(config: MurmurConfig) -> Result<Self> {
        config.validate()?;

        let data_dir = &config.data_dir;
        let logs_dir = &config.logs_dir;

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        init_tracing(logs_dir)?;

        tracing::debug!(target: "murmur::new", "Logging initialized in directory: {:?}", logs_dir);

        let database = Arc::new(Database::new(data_dir.join("murmur.sqlite")).await?);
        let notifier = ChangeNotifier::with_capacity(config.notifier_capacity);
        let messages = MessageStore::new(database.clone(), notifier.clone());
        let subscriptions = SubscriptionManager::with_buffer(
            messages.clone(),
            notifier.clone(),
            config.subscription_buffer,
        );
        let backend = FilesystemBackend::new(data_dir)?;
        let blobs = BlobStore::new(
            database.clone(),
            Arc::new(backend),
            &config.public_base_url,
            config.blob,
        );
        let media_policy = MediaPolicy::new(config.allow_unrecognized_media);

        tracing::info!(
            target: "murmur::new",
            "Murmur ready, data in {:?}, attachments served from {}",
            data_dir,
            config.public_base_url
        );

        Ok(Self {
            config,
            database,
            notifier,
            messages,
            subscriptions,
            blobs,
            media_policy,
        })
    }

    pub fn config(&self) -> &MurmurConfig {
        &self.config
    }

    /// Appends a message to `channel` and fans it out to live subscribers.
    ///
    /// Text messages need a non-blank body; image, audio and file messages
    /// need an `attachment_ref`, typically a URL from
    /// [`Murmur::upload_attachment`]. Only audio messages carry a duration.
    pub async fn send_message(&self, channel: &str, new_message: NewMessage) -> Result<Message> {
        let channel = parse_channel(channel)?;
        validate_shape(&new_message)?;

        Ok(self.messages.append(&channel, new_message).await?)
    }

    /// The `limit` most recent messages in `channel`, oldest first. Without a
    /// limit, `default_history_limit` applies.
    ///
    /// Transient store failures are retried with backoff.
    pub async fn fetch_history(
        &self,
        channel: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let channel = parse_channel(channel)?;
        let limit = limit.unwrap_or(self.config.default_history_limit);
        if limit == 0 || limit > self.config.max_history_limit {
            return Err(MurmurError::Validation(format!(
                "limit must be in 1..={}, got {}",
                self.config.max_history_limit, limit
            )));
        }

        let store = &self.messages;
        let channel = &channel;
        utils::retry_idempotent(&self.config.read_retry, "fetch_history", move || async move {
            store
                .list_recent(channel, limit, Order::Ascending)
                .await
                .map_err(MurmurError::from)
        })
        .await
    }

    /// Follows `channel` live. With a cursor, every message after it is
    /// delivered first.
    pub async fn subscribe_live(
        &self,
        channel: &str,
        cursor: Option<Sequence>,
    ) -> Result<Subscription> {
        let channel = parse_channel(channel)?;
        Ok(self.subscriptions.subscribe(&channel, cursor).await?)
    }

    /// Stores an image or audio attachment and returns its public URL.
    pub async fn upload_attachment(&self, bucket: &str, name: &str, bytes: &[u8]) -> Result<String> {
        if let Err(rejection) = self.media_policy.check(bytes) {
            tracing::info!(
                target: "murmur::upload_attachment",
                "Rejected upload {}/{}: {:?}",
                bucket,
                name,
                rejection
            );
            return Err(MurmurError::Validation(rejection.to_string()));
        }

        Ok(self
            .blobs
            .upload(bucket, name, bytes, UploadOptions::default())
            .await?)
    }

    /// Ends every subscription and closes the database. Later calls fail with
    /// a store-unavailable error.
    pub async fn shutdown(&self) {
        self.subscriptions.shutdown();
        self.notifier.close_all();
        self.database.close().await;
        tracing::info!(target: "murmur::shutdown", "Murmur shut down");
    }
}

fn parse_channel(channel: &str) -> Result<Channel> {
    Channel::new(channel).map_err(|e| match e {
        MessageStoreError::Validation(message) => MurmurError::Validation(message),
        other => other.into(),
    })
}

fn validate_shape(message: &NewMessage) -> Result<()> {
    use messages::MessageType;

    let has = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

    match message.message_type {
        MessageType::Text => {
            if !has(&message.body) {
                return Err(MurmurError::Validation(
                    "text messages need a non-empty body".to_string(),
                ));
            }
            if message.attachment_ref.is_some() {
                return Err(MurmurError::Validation(
                    "text messages cannot carry an attachment".to_string(),
                ));
            }
        }
        MessageType::Image | MessageType::Audio | MessageType::File => {
            if !has(&message.attachment_ref) {
                return Err(MurmurError::Validation(format!(
                    "{} messages need an attachment reference",
                    message.message_type
                )));
            }
        }
    }

    if message.duration_ms.is_some() && message.message_type != MessageType::Audio {
        return Err(MurmurError::Validation(
            "only audio messages have a duration".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::murmur::error::{Component, ErrorKind};
    use crate::murmur::media_policy::tests::{AVI, GIF, MP3, PNG};
    use crate::murmur::messages::MessageType;
    use crate::murmur::subscriptions::SubscriptionState;

    async fn create_test_murmur() -> (Murmur, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = MurmurConfig::new(&temp_dir.path().join("data"), &temp_dir.path().join("logs"));
        let murmur = Murmur::new(config).await.unwrap();
        (murmur, temp_dir)
    }

    fn text(body: &str) -> NewMessage {
        NewMessage::text("user-1", "Ada", body)
    }

    #[tokio::test]
    async fn test_new_creates_directories_and_database() {
        let (murmur, _dir) = create_test_murmur().await;

        assert!(murmur.config().data_dir.exists());
        assert!(murmur.config().logs_dir.exists());
        assert!(murmur.config().data_dir.join("murmur.sqlite").exists());
        assert!(murmur.config().data_dir.join("blobs").exists());
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let (murmur, _dir) = create_test_murmur().await;

        let m1 = murmur.send_message("global", text("one")).await.unwrap();
        let m2 = murmur.send_message("global", text("two")).await.unwrap();
        let m3 = murmur.send_message("global", text("three")).await.unwrap();

        let history = murmur.fetch_history("global", Some(50)).await.unwrap();
        assert_eq!(history, vec![m1, m2, m3.clone()]);

        let mut live = murmur.subscribe_live("global", None).await.unwrap();
        assert_eq!(live.wait_until_live().await, SubscriptionState::Live);

        let m4 = murmur.send_message("global", text("four")).await.unwrap();
        let event = live.next_event().await.unwrap().unwrap();
        assert_eq!(event.message, m4);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), live.next_event())
                .await
                .is_err()
        );

        // Reconnect from m3 picks up m4 only
        let mut resumed = murmur
            .subscribe_live("global", Some(m3.sequence))
            .await
            .unwrap();
        let event = resumed.next_event().await.unwrap().unwrap();
        assert_eq!(event.message, m4);
    }

    #[tokio::test]
    async fn test_history_window_is_most_recent_oldest_first() {
        let (murmur, _dir) = create_test_murmur().await;
        for n in 1..=5 {
            murmur
                .send_message("global", text(&format!("m{n}")))
                .await
                .unwrap();
        }

        let history = murmur.fetch_history("global", Some(2)).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m4", "m5"]);

        assert!(murmur.fetch_history("empty", Some(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_without_limit_uses_configured_default() {
        let temp_dir = TempDir::new().unwrap();
        let mut config =
            MurmurConfig::new(&temp_dir.path().join("data"), &temp_dir.path().join("logs"));
        config.default_history_limit = 3;
        let murmur = Murmur::new(config).await.unwrap();
        for n in 1..=5 {
            murmur
                .send_message("global", text(&format!("m{n}")))
                .await
                .unwrap();
        }

        let history = murmur.fetch_history("global", None).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn test_fetch_history_rejects_bad_limits() {
        let (murmur, _dir) = create_test_murmur().await;

        for limit in [0, 501] {
            let err = murmur.fetch_history("global", Some(limit)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.component(), Component::Facade);
        }
    }

    #[tokio::test]
    async fn test_bad_channel_names_are_validation_errors() {
        let (murmur, _dir) = create_test_murmur().await;

        let err = murmur
            .send_message("Not A Channel", text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, MurmurError::Validation(_)));

        let err = murmur.subscribe_live("", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_message_shape_is_validated() {
        let (murmur, _dir) = create_test_murmur().await;

        let invalid = [
            NewMessage::text("user-1", "Ada", "   "),
            NewMessage::text("user-1", "Ada", "hi").with_duration_ms(10),
            NewMessage::attachment("user-1", "Ada", MessageType::Image, ""),
            NewMessage {
                attachment_ref: Some("http://localhost:8080/x".to_string()),
                ..NewMessage::text("user-1", "Ada", "hi")
            },
            NewMessage::attachment("user-1", "Ada", MessageType::File, "http://x/y")
                .with_duration_ms(10),
        ];

        for message in invalid {
            let err = murmur.send_message("global", message).await.unwrap_err();
            assert!(matches!(err, MurmurError::Validation(_)), "{err}");
        }

        assert!(murmur.fetch_history("global", Some(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_keep_their_component() {
        let (murmur, _dir) = create_test_murmur().await;

        let err = murmur
            .send_message("global", NewMessage::text("", "Ada", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.component(), Component::MessageStore);
    }

    #[tokio::test]
    async fn test_attachment_flow() {
        let (murmur, _dir) = create_test_murmur().await;

        let image_url = murmur
            .upload_attachment("images", "cat.png", PNG)
            .await
            .unwrap();
        assert!(image_url.ends_with("/storage/v1/object/public/images/cat.png"));
        assert_eq!(murmur.blobs.resolve(&image_url).await.unwrap(), PNG);

        let audio_url = murmur
            .upload_attachment("audios", "note.mp3", MP3)
            .await
            .unwrap();

        let image = murmur
            .send_message(
                "global",
                NewMessage::attachment("user-1", "Ada", MessageType::Image, image_url.clone()),
            )
            .await
            .unwrap();
        let audio = murmur
            .send_message(
                "global",
                NewMessage::attachment("user-1", "Ada", MessageType::Audio, audio_url)
                    .with_duration_ms(2_000),
            )
            .await
            .unwrap();

        assert_eq!(image.attachment_ref.as_deref(), Some(image_url.as_str()));
        assert_eq!(audio.duration_ms, Some(2_000));
    }

    #[tokio::test]
    async fn test_disallowed_attachments_are_rejected() {
        let (murmur, _dir) = create_test_murmur().await;

        let err = murmur
            .upload_attachment("videos", "clip.avi", AVI)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Validation error: Video files are not allowed in this app.");

        let err = murmur
            .upload_attachment("images", "anim.gif", GIF)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = murmur
            .upload_attachment("files", "notes.txt", b"plain text")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_oversized_attachment_is_quota_exceeded() {
        let temp_dir = TempDir::new().unwrap();
        let mut config =
            MurmurConfig::new(&temp_dir.path().join("data"), &temp_dir.path().join("logs"));
        config.blob.max_object_bytes = 8;
        let murmur = Murmur::new(config).await.unwrap();

        let err = murmur
            .upload_attachment("images", "cat.png", PNG)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(err.component(), Component::BlobStore);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions_and_storage() {
        let (murmur, _dir) = create_test_murmur().await;
        let mut live = murmur.subscribe_live("global", None).await.unwrap();

        murmur.shutdown().await;

        assert!(live.next_event().await.is_none());
        assert_eq!(live.state(), SubscriptionState::Disconnected);

        let err = murmur.send_message("global", text("late")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config =
            MurmurConfig::new(&temp_dir.path().join("data"), &temp_dir.path().join("logs"));
        config.default_history_limit = 0;

        let err = Murmur::new(config).await.unwrap_err();
        assert!(matches!(err, MurmurError::Configuration(_)));
    }
}
