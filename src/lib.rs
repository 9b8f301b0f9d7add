//! Murmur is a small real-time chat backend.
//!
//! It persists chat messages with a per-channel total order, fans newly
//! appended messages out to live subscribers, lets subscribers resume from a
//! cursor without losing or repeating messages, and stores attachments behind
//! public references. Everything is reached through an explicitly constructed
//! [`Murmur`] instance.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod murmur;

pub use crate::murmur::blobs::{BlobObject, BlobStore, BlobStoreConfig, BlobStoreError, UploadOptions};
pub use crate::murmur::config::{MurmurConfig, RetryPolicy};
pub use crate::murmur::database::{Database, DatabaseError};
pub use crate::murmur::error::{Component, ErrorKind, MurmurError, Result};
pub use crate::murmur::media_policy::{MediaKind, MediaPolicy, MediaRejection};
pub use crate::murmur::message_streaming::{ChangeEvent, ChangeNotifier};
pub use crate::murmur::messages::{
    Channel, Message, MessageStore, MessageStoreError, MessageType, NewMessage, Order, Sequence,
};
pub use crate::murmur::storage::{FilesystemBackend, ObjectBackend};
pub use crate::murmur::subscriptions::{
    Subscription, SubscriptionError, SubscriptionManager, SubscriptionState,
};
pub use crate::murmur::Murmur;

static TRACING_GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Installs the process-wide tracing subscriber: stdout plus a daily rolling
/// file under `logs_dir`. Later calls are no-ops.
pub(crate) fn init_tracing(logs_dir: &Path) -> Result<()> {
    if TRACING_GUARDS.get().is_some() {
        return Ok(());
    }

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("murmur")
        .filename_suffix("log")
        .build(logs_dir)
        .map_err(|e| MurmurError::LoggingSetup(e.to_string()))?;

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = Layer::new()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(true);

    let file_layer = Layer::new()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    // Another subscriber may already be installed (tests, embedding apps).
    let _ = Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    let _ = TRACING_GUARDS.set((file_guard, stdout_guard));

    Ok(())
}
