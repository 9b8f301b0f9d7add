use std::path::PathBuf;

use clap::Parser;
use murmur::{ErrorKind, MessageType, Murmur, MurmurConfig, MurmurError, NewMessage};

const PNG_HEADER: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
];

/// End-to-end smoke run against a local Murmur instance
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data
    #[clap(long, value_name = "PATH", required = true)]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", required = true)]
    logs_dir: PathBuf,

    /// Channel to exercise
    #[clap(long, default_value = "global")]
    channel: String,
}

#[tokio::main]
async fn main() -> Result<(), MurmurError> {
    let args = Args::parse();

    let config = MurmurConfig::from_env(&args.data_dir, &args.logs_dir)?;
    let murmur = match Murmur::new(config).await {
        Ok(murmur) => murmur,
        Err(err) => {
            eprintln!("Failed to initialize Murmur: {}", err);
            std::process::exit(1);
        }
    };
    let channel = args.channel.as_str();

    tracing::info!("=== Sending and reading back messages ===");
    let before = murmur.fetch_history(channel, Some(500)).await?.len();
    let mut last = None;
    for body in ["hello", "is anyone here?", "testing"] {
        let message = murmur
            .send_message(channel, NewMessage::text("smoke-user", "Smoke Test", body))
            .await?;
        tracing::debug!("Sent {:?}", message);
        last = Some(message);
    }
    let history = murmur.fetch_history(channel, Some(500)).await?;
    assert_eq!(history.len(), (before + 3).min(500));
    assert!(
        history
            .windows(2)
            .all(|pair| pair[0].sequence < pair[1].sequence)
    );
    tracing::info!("History holds {} messages in order", history.len());

    tracing::info!("=== Live subscription ===");
    let mut live = murmur.subscribe_live(channel, None).await?;
    live.wait_until_live().await;
    let sent = murmur
        .send_message(channel, NewMessage::text("smoke-user", "Smoke Test", "live"))
        .await?;
    let event = live
        .next_event()
        .await
        .ok_or_else(|| MurmurError::Validation("live stream ended early".to_string()))??;
    assert_eq!(event.message.id, sent.id);
    tracing::info!("Live event delivered at sequence {}", event.sequence);

    tracing::info!("=== Reconnect from cursor ===");
    if let Some(last) = last {
        let mut resumed = murmur.subscribe_live(channel, Some(last.sequence)).await?;
        let event = resumed
            .next_event()
            .await
            .ok_or_else(|| MurmurError::Validation("resumed stream ended early".to_string()))??;
        assert_eq!(event.message.id, sent.id);
        tracing::info!("Backfill resumed after sequence {}", last.sequence);
    }

    tracing::info!("=== Attachments ===");
    let url = murmur
        .upload_attachment("images", "smoke.png", PNG_HEADER)
        .await?;
    murmur
        .send_message(
            channel,
            NewMessage::attachment("smoke-user", "Smoke Test", MessageType::Image, url.clone()),
        )
        .await?;
    tracing::info!("Image uploaded to {}", url);

    match murmur
        .upload_attachment("videos", "smoke.avi", b"RIFF\x00\x00\x00\x00AVI LIST")
        .await
    {
        Err(err) if err.kind() == ErrorKind::Validation => {
            tracing::info!("Video correctly rejected: {}", err);
        }
        other => panic!("Expected video upload to be rejected, got {:?}", other),
    }

    murmur.shutdown().await;
    tracing::info!("=== Smoke run passed ===");
    Ok(())
}
