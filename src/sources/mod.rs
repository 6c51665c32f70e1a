use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channels::{ChannelId, ChannelInfo};

pub mod mtproto;
pub mod telegram;

/// New post seen in one of the watched channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingPost {
    /// The configured channel this post belongs to.
    pub channel: ChannelId,
    /// Used to build the permalink.
    pub message_id: i64,
    /// Post text or media caption. May be empty.
    pub text: String,
    /// First image of the post, if any. Other media is ignored.
    pub image: Option<MediaRef>,
}

/// Handle to an image still living on the source side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    /// Size as announced by the source, before any download.
    pub declared_size: Option<u64>,
    pub file_name: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("telegram api error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("malformed event: {0}")]
    Extraction(String),

    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("mtproto: {0}")]
    Mtproto(String),

    #[error("session not authorized and no TTY available; run tgrelay once in an interactive shell to log in")]
    Unauthorized,
}

/// What the relay needs from the place posts come from.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Check that the transport is reachable and authorised. Returns a
    /// printable name for the account in use.
    async fn connect(&self) -> Result<String, SourceError>;

    /// Push every new post of `channels` into `sink`, in the order the
    /// transport produces them. Runs until `sink` is closed.
    async fn subscribe(
        &self,
        channels: Vec<ChannelId>,
        sink: mpsc::Sender<IncomingPost>,
    ) -> Result<(), SourceError>;

    /// Look up title and public username.
    async fn resolve(&self, channel: &ChannelId) -> Result<ChannelInfo, SourceError>;

    /// Download the file behind `media`, giving up once it grows past
    /// `max_bytes`.
    async fn download(&self, media: &MediaRef, max_bytes: u64) -> Result<Vec<u8>, SourceError>;
}

/// A message as a transport hands it over, before any filtering.
#[derive(Debug)]
pub struct RawPost {
    pub chat_id: i64,
    pub chat_username: Option<String>,
    pub message_id: i64,
    pub text: String,
    /// Album id shared by the posts of one media group.
    pub group: Option<String>,
    pub image: Option<MediaRef>,
}

/// Keeps posts of the watched channels that carry text or an image.
/// Albums arrive as one post per item; only the first is kept.
pub struct PostFilter {
    channels: Vec<ChannelId>,
    /// chat id -> last album id seen
    last_group: HashMap<i64, String>,
}

impl PostFilter {
    pub fn new(channels: Vec<ChannelId>) -> Self {
        Self {
            channels,
            last_group: HashMap::new(),
        }
    }

    pub fn accept(&mut self, raw: RawPost) -> Option<IncomingPost> {
        let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.matches(raw.chat_id, raw.chat_username.as_deref()))
        else {
            debug!(chat_id = raw.chat_id, "post from unwatched chat");
            return None;
        };

        if let Some(group) = raw.group {
            if self.last_group.get(&raw.chat_id) == Some(&group) {
                debug!(chat_id = raw.chat_id, message_id = raw.message_id, "album sibling skipped");
                return None;
            }
            self.last_group.insert(raw.chat_id, group);
        }

        let text = raw.text.trim().to_owned();
        if text.is_empty() && raw.image.is_none() {
            debug!(
                chat_id = raw.chat_id,
                message_id = raw.message_id,
                "ignored non-text/non-image post"
            );
            return None;
        }

        Some(IncomingPost {
            channel: channel.clone(),
            message_id: raw.message_id,
            text,
            image: raw.image,
        })
    }
}

/// File name for an image document: its own name, else one made up
/// from the mime subtype.
pub fn image_file_name(name: Option<&str>, subtype: &str) -> String {
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        return name.to_owned();
    }

    let ext = subtype.to_ascii_lowercase();
    if (1..=5).contains(&ext.len()) {
        format!("image.{ext}")
    } else {
        "image.img".into()
    }
}
