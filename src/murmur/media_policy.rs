//! Content checks for attachment uploads.
//!
//! Only JPEG/PNG images and common audio formats are accepted. Types are
//! sniffed from the bytes, never taken from the file name.

use thiserror::Error;

const ALLOWED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png"];
const ALLOWED_AUDIO_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/ogg",
    "audio/aac",
    "audio/x-aac",
    "audio/m4a",
    "audio/mp4",
];
const VIDEO_PREFIX: &str = "video/";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaRejection {
    #[error("Video files are not allowed in this app.")]
    Video { mime_type: String },

    #[error("This file type is not supported. Only images (JPEG/PNG) and audio files are allowed.")]
    Unsupported { mime_type: String },

    #[error("Could not determine the file type. Only images (JPEG/PNG) and audio files are allowed.")]
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Audio,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MediaPolicy {
    allow_unrecognized: bool,
}

impl MediaPolicy {
    pub fn new(allow_unrecognized: bool) -> Self {
        Self { allow_unrecognized }
    }

    /// MIME type sniffed from the leading bytes, if any matcher recognizes them.
    pub fn sniff(data: &[u8]) -> Option<&'static str> {
        infer::get(data).map(|kind| kind.mime_type())
    }

    /// Classifies `mime_type` without looking at any bytes.
    pub fn classify(mime_type: &str) -> Result<MediaKind, MediaRejection> {
        if mime_type.starts_with(VIDEO_PREFIX) {
            return Err(MediaRejection::Video {
                mime_type: mime_type.to_string(),
            });
        }
        if ALLOWED_IMAGE_TYPES.contains(&mime_type) {
            return Ok(MediaKind::Image);
        }
        if ALLOWED_AUDIO_TYPES.contains(&mime_type) {
            return Ok(MediaKind::Audio);
        }
        Err(MediaRejection::Unsupported {
            mime_type: mime_type.to_string(),
        })
    }

    /// Checks attachment bytes. `Ok(None)` means the content was not
    /// recognized and the policy lets it through anyway.
    pub fn check(&self, data: &[u8]) -> Result<Option<MediaKind>, MediaRejection> {
        match Self::sniff(data) {
            Some(mime_type) => Self::classify(mime_type).map(Some),
            None if self.allow_unrecognized => Ok(None),
            None => Err(MediaRejection::Unrecognized),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52,
    ];
    pub(crate) const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46];
    pub(crate) const MP3: &[u8] = b"ID3\x04\x00\x00\x00\x00\x00\x00audio";
    pub(crate) const AVI: &[u8] = b"RIFF\x00\x00\x00\x00AVI LIST";
    pub(crate) const GIF: &[u8] = b"GIF89a\x01\x00\x01\x00";

    #[test]
    fn allows_images_and_audio() {
        let policy = MediaPolicy::default();
        assert_eq!(policy.check(PNG), Ok(Some(MediaKind::Image)));
        assert_eq!(policy.check(JPEG), Ok(Some(MediaKind::Image)));
        assert_eq!(policy.check(MP3), Ok(Some(MediaKind::Audio)));
    }

    #[test]
    fn rejects_video_with_dedicated_message() {
        let err = MediaPolicy::default().check(AVI).unwrap_err();
        assert!(matches!(err, MediaRejection::Video { .. }));
        assert_eq!(err.to_string(), "Video files are not allowed in this app.");
    }

    #[test]
    fn rejects_other_recognized_types() {
        let err = MediaPolicy::default().check(GIF).unwrap_err();
        assert_eq!(
            err,
            MediaRejection::Unsupported {
                mime_type: "image/gif".to_string()
            }
        );
        assert!(err.to_string().starts_with("This file type is not supported."));
    }

    #[test]
    fn unrecognized_content_depends_on_policy() {
        let data = b"just some text";
        assert_eq!(
            MediaPolicy::default().check(data),
            Err(MediaRejection::Unrecognized)
        );
        assert_eq!(MediaPolicy::new(true).check(data), Ok(None));
        assert_eq!(MediaPolicy::sniff(data), None);
    }

    #[test]
    fn classify_by_mime_type() {
        assert_eq!(MediaPolicy::classify("audio/ogg"), Ok(MediaKind::Audio));
        assert_eq!(MediaPolicy::classify("audio/x-wav"), Ok(MediaKind::Audio));
        assert!(matches!(
            MediaPolicy::classify("video/mp4"),
            Err(MediaRejection::Video { .. })
        ));
        assert!(matches!(
            MediaPolicy::classify("image/bmp"),
            Err(MediaRejection::Unsupported { .. })
        ));
    }
}
