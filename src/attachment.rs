use tracing::warn;

use crate::sources::{ChannelSource, MediaRef, SourceError};

/// Image bytes ready for re-upload.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Result of trying to fetch a post's image.
#[derive(Debug, PartialEq, Eq)]
pub enum Fetched {
    Ready(Attachment),
    /// Over the upload ceiling; the post goes out as text.
    TooLarge { size: u64 },
    /// Download failed; the post goes out as text.
    Unavailable,
}

impl Fetched {
    pub fn into_parts(self) -> (Option<Attachment>, bool) {
        match self {
            Self::Ready(attachment) => (Some(attachment), false),
            Self::TooLarge { .. } => (None, true),
            Self::Unavailable => (None, false),
        }
    }
}

/// Download `media` unless it is known to exceed `max_bytes`. Never fails;
/// problems degrade the post to text-only.
pub async fn fetch(source: &dyn ChannelSource, media: &MediaRef, max_bytes: u64) -> Fetched {
    if let Some(size) = media.declared_size.filter(|size| *size > max_bytes) {
        warn!(
            file_id = %media.file_id,
            size,
            limit = max_bytes,
            "SKIP IMAGE (too large)"
        );
        return Fetched::TooLarge { size };
    }

    match source.download(media, max_bytes).await {
        Ok(bytes) => Fetched::Ready(Attachment {
            file_name: media.file_name.clone(),
            bytes,
        }),
        Err(SourceError::TooLarge { size, limit }) => {
            warn!(file_id = %media.file_id, size, limit, "SKIP IMAGE (too large)");
            Fetched::TooLarge { size }
        }
        Err(e) => {
            warn!(file_id = %media.file_id, error = %e, "attachment fetch failed, sending text only");
            Fetched::Unavailable
        }
    }
}
