use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use super::{image_file_name, ChannelSource, IncomingPost, MediaRef, PostFilter, RawPost, SourceError};
use crate::channels::{ChannelId, ChannelInfo};

/// Long-poll window passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 50;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
/// Pause after a failed poll before trying again.
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Channel source backed by the Telegram Bot API. The bot has to be a
/// member (admin) of every watched channel to receive its posts.
pub struct BotApiSource {
    client: reqwest::Client,
    api_url: Url,
    token: SecretString,
    poll_error_pause: Duration,
}

#[derive(Deserialize)]
struct BotResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Serialize)]
struct GetUpdates<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Deserialize)]
struct BotUser {
    first_name: String,
    username: Option<String>,
}

#[derive(Deserialize)]
struct BotChat {
    id: i64,
    title: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct BotChannelPost {
    message_id: i64,
    chat: BotChat,
    text: Option<String>,
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<BotPhotoSize>,
    document: Option<BotDocument>,
    media_group_id: Option<String>,
}

#[derive(Deserialize)]
struct BotPhotoSize {
    file_id: String,
    width: u32,
    height: u32,
    file_size: Option<u64>,
}

#[derive(Deserialize)]
struct BotDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<u64>,
}

#[derive(Deserialize)]
struct BotFile {
    file_size: Option<u64>,
    file_path: Option<String>,
}

impl BotApiSource {
    pub fn new(client: reqwest::Client, api_url: Url, token: SecretString) -> Self {
        Self {
            client,
            api_url,
            token,
            poll_error_pause: POLL_ERROR_PAUSE,
        }
    }

    fn base(&self) -> &str {
        self.api_url.as_str().trim_end_matches('/')
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base(), self.token.expose_secret(), method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base(), self.token.expose_secret(), file_path)
    }

    async fn call<T, P>(&self, method: &str, params: &P, timeout: Duration) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let res = self
            .client
            .post(self.method_url(method))
            .json(params)
            .timeout(timeout)
            .send()
            .await
            .map_err(redact)?;

        // Errors come back as JSON with a non-2xx status, so parse either way.
        let body: BotResponse<T> = res.json().await.map_err(redact)?;
        match body {
            BotResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            other => Err(SourceError::Api {
                code: other.error_code.unwrap_or(0),
                description: other
                    .description
                    .unwrap_or_else(|| "(tgrelay) empty response".into()),
            }),
        }
    }
}

/// The bot token is part of every URL; keep it out of error messages.
fn redact(e: reqwest::Error) -> SourceError {
    SourceError::Http(e.without_url())
}

fn chat_id_param(channel: &ChannelId) -> Value {
    match channel {
        ChannelId::Numeric(id) => json!(id),
        ChannelId::Username(name) => json!(format!("@{name}")),
    }
}

#[async_trait]
impl ChannelSource for BotApiSource {
    async fn connect(&self) -> Result<String, SourceError> {
        let params = json!({});
        let call = self.call::<BotUser, _>("getMe", &params, CONNECT_TIMEOUT);
        let me = tokio::time::timeout(CONNECT_TIMEOUT, call)
            .await
            .map_err(|_| SourceError::Timeout(CONNECT_TIMEOUT))??;

        Ok(match me.username {
            Some(username) => format!("@{username}"),
            None => me.first_name,
        })
    }

    async fn subscribe(
        &self,
        channels: Vec<ChannelId>,
        sink: mpsc::Sender<IncomingPost>,
    ) -> Result<(), SourceError> {
        let mut extractor = PostExtractor::new(channels);
        let mut offset = None;

        loop {
            if sink.is_closed() {
                return Ok(());
            }

            let params = GetUpdates {
                offset,
                timeout: POLL_TIMEOUT_SECS,
                allowed_updates: &["channel_post"],
            };
            let poll_timeout = Duration::from_secs(POLL_TIMEOUT_SECS + 10);
            let updates: Vec<Value> = match self.call("getUpdates", &params, poll_timeout).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, retrying");
                    tokio::time::sleep(self.poll_error_pause).await;
                    continue;
                }
            };

            for update in updates {
                if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                    offset = Some(id + 1);
                }

                match extractor.extract(&update) {
                    Ok(Some(post)) => {
                        if sink.send(post).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {},
                    Err(e) => warn!(error = %e, "skipping update"),
                }
            }
        }
    }

    async fn resolve(&self, channel: &ChannelId) -> Result<ChannelInfo, SourceError> {
        let chat: BotChat = self
            .call("getChat", &json!({ "chat_id": chat_id_param(channel) }), REQUEST_TIMEOUT)
            .await?;

        Ok(ChannelInfo {
            title: chat.title,
            username: chat.username,
        })
    }

    async fn download(&self, media: &MediaRef, max_bytes: u64) -> Result<Vec<u8>, SourceError> {
        let file: BotFile = self
            .call("getFile", &json!({ "file_id": media.file_id }), REQUEST_TIMEOUT)
            .await?;

        if let Some(size) = file.file_size.filter(|size| *size > max_bytes) {
            return Err(SourceError::TooLarge {
                size,
                limit: max_bytes,
            });
        }
        let Some(file_path) = file.file_path else {
            return Err(SourceError::Api {
                code: 0,
                description: "getFile returned no file_path".into(),
            });
        };

        let mut res = self
            .client
            .get(self.file_url(&file_path))
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(redact)?;

        let mut bytes = Vec::new();
        while let Some(chunk) = res.chunk().await.map_err(redact)? {
            let size = (bytes.len() + chunk.len()) as u64;
            if size > max_bytes {
                return Err(SourceError::TooLarge {
                    size,
                    limit: max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        info!(file_id = %media.file_id, size = bytes.len(), "downloaded attachment");
        Ok(bytes)
    }
}

/// Turns raw updates into [`IncomingPost`]s for the watched channels.
struct PostExtractor {
    filter: PostFilter,
}

impl PostExtractor {
    fn new(channels: Vec<ChannelId>) -> Self {
        Self {
            filter: PostFilter::new(channels),
        }
    }

    fn extract(&mut self, update: &Value) -> Result<Option<IncomingPost>, SourceError> {
        let Some(raw) = update.get("channel_post") else {
            return Ok(None);
        };
        let post: BotChannelPost = serde_json::from_value(raw.clone())
            .map_err(|e| SourceError::Extraction(e.to_string()))?;

        let image = first_image(&post.photo, post.document.as_ref());
        Ok(self.filter.accept(RawPost {
            chat_id: post.chat.id,
            chat_username: post.chat.username,
            message_id: post.message_id,
            text: post.text.or(post.caption).unwrap_or_default(),
            group: post.media_group_id,
            image,
        }))
    }
}

/// Largest size of the photo, else an image document.
fn first_image(photo: &[BotPhotoSize], document: Option<&BotDocument>) -> Option<MediaRef> {
    if let Some(best) = photo
        .iter()
        .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
    {
        return Some(MediaRef {
            file_id: best.file_id.clone(),
            declared_size: best.file_size,
            file_name: "photo.jpg".into(),
        });
    }

    let doc = document?;
    let mime = doc.mime_type.as_deref().unwrap_or_default();
    let subtype = mime.strip_prefix("image/")?;

    Some(MediaRef {
        file_id: doc.file_id.clone(),
        declared_size: doc.file_size,
        file_name: image_file_name(doc.file_name.as_deref(), subtype),
    })
}
