use std::{
    collections::{HashMap, VecDeque},
    io::{self, BufRead, Write},
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use grammers_client::{
    types::{Chat, Downloadable, Media, Message},
    Client, Config, InitParams, SignInError, Update,
};
use grammers_session::Session;
use secrecy::ExposeSecret;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::{image_file_name, ChannelSource, IncomingPost, MediaRef, PostFilter, RawPost, SourceError};
use crate::{
    channels::{ChannelId, ChannelInfo},
    config::{ProxySettings, TelegramSettings},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Pause after a failed update fetch before trying again.
const UPDATE_ERROR_PAUSE: Duration = Duration::from_secs(5);
/// Media of posts still waiting for the relay to download them.
const PENDING_MEDIA: usize = 64;

/// Channel source logged in as a regular Telegram user over MTProto.
/// Sees every channel the account has joined, no admin rights needed.
pub struct MtprotoSource {
    client: Client,
    session_path: PathBuf,
    pending: Mutex<PendingMedia<Media>>,
}

fn mtproto_error(e: impl std::fmt::Display) -> SourceError {
    SourceError::Mtproto(e.to_string())
}

impl MtprotoSource {
    /// Load (or create) the session file and open the connection.
    pub async fn open(
        settings: &TelegramSettings,
        proxy: Option<&ProxySettings>,
    ) -> Result<Self, SourceError> {
        let session_path = session_path(&settings.session);
        let session = Session::load_file_or_create(&session_path).map_err(mtproto_error)?;

        let config = Config {
            session,
            api_id: settings.api_id,
            api_hash: settings.api_hash.expose_secret().clone(),
            params: InitParams {
                catch_up: false,
                proxy_url: proxy.map(socks_url).transpose()?,
                ..Default::default()
            },
        };

        let client = tokio::time::timeout(CONNECT_TIMEOUT, Client::connect(config))
            .await
            .map_err(|_| SourceError::Timeout(CONNECT_TIMEOUT))?
            .map_err(mtproto_error)?;

        let source = Self {
            client,
            session_path,
            pending: Mutex::new(PendingMedia::new(PENDING_MEDIA)),
        };
        source.save_session();
        Ok(source)
    }

    /// Ask for phone, code and 2FA password on the terminal when the
    /// session is not logged in yet.
    pub async fn login_interactively(&self) -> Result<(), SourceError> {
        if self.client.is_authorized().await.map_err(mtproto_error)? {
            return Ok(());
        }

        let phone = prompt("Phone number (international format): ")?;
        let token = self
            .client
            .request_login_code(&phone)
            .await
            .map_err(mtproto_error)?;
        let code = prompt("Login code: ")?;

        match self.client.sign_in(&token, &code).await {
            Ok(_) => {}
            Err(SignInError::PasswordRequired(password_token)) => {
                let hint = password_token.hint().unwrap_or("none").to_owned();
                let password = prompt(&format!("2FA password (hint: {hint}): "))?;
                self.client
                    .check_password(password_token, password.trim())
                    .await
                    .map_err(mtproto_error)?;
            }
            Err(e) => return Err(mtproto_error(e)),
        }

        self.save_session();
        info!(session = %self.session_path.display(), "logged in");
        Ok(())
    }

    fn save_session(&self) {
        if let Err(e) = self.client.session().save_to_file(&self.session_path) {
            warn!(error = %e, session = %self.session_path.display(), "cannot save session");
        }
    }

    async fn find_chat(&self, channel: &ChannelId) -> Result<Chat, SourceError> {
        match channel {
            ChannelId::Username(name) => self
                .client
                .resolve_username(name)
                .await
                .map_err(mtproto_error)?
                .ok_or_else(|| SourceError::Mtproto(format!("no chat named @{name}"))),
            ChannelId::Numeric(id) => {
                // Numeric ids only resolve through chats the account knows.
                let mut dialogs = self.client.iter_dialogs();
                while let Some(dialog) = dialogs.next().await.map_err(mtproto_error)? {
                    let chat = dialog.chat();
                    if channel.matches(chat.id(), chat.username()) {
                        return Ok(chat.clone());
                    }
                }
                Err(SourceError::Mtproto(format!("chat {id} is not among the account's dialogs")))
            }
        }
    }
}

#[async_trait]
impl ChannelSource for MtprotoSource {
    async fn connect(&self) -> Result<String, SourceError> {
        if !self.client.is_authorized().await.map_err(mtproto_error)? {
            return Err(SourceError::Unauthorized);
        }

        let me = self.client.get_me().await.map_err(mtproto_error)?;
        Ok(match me.username() {
            Some(username) => format!("@{username}"),
            None => me.full_name(),
        })
    }

    async fn subscribe(
        &self,
        channels: Vec<ChannelId>,
        sink: mpsc::Sender<IncomingPost>,
    ) -> Result<(), SourceError> {
        let mut filter = PostFilter::new(channels);

        loop {
            let update = tokio::select! {
                update = self.client.next_update() => update,
                _ = sink.closed() => return Ok(()),
            };

            let message = match update {
                Ok(Update::NewMessage(message)) => message,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "update stream failed, retrying");
                    tokio::time::sleep(UPDATE_ERROR_PAUSE).await;
                    continue;
                }
            };

            let (raw, media) = raw_post(&message);
            let Some(post) = filter.accept(raw) else {
                continue;
            };
            if let (Some(image), Some(media)) = (&post.image, media) {
                self.pending.lock().await.insert(image.file_id.clone(), media);
            }

            if sink.send(post).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn resolve(&self, channel: &ChannelId) -> Result<ChannelInfo, SourceError> {
        let chat = self.find_chat(channel).await?;
        Ok(ChannelInfo {
            title: Some(chat.name().to_owned()).filter(|t| !t.is_empty()),
            username: chat.username().map(str::to_owned),
        })
    }

    async fn download(&self, media: &MediaRef, max_bytes: u64) -> Result<Vec<u8>, SourceError> {
        let Some(item) = self.pending.lock().await.take(&media.file_id) else {
            return Err(SourceError::Mtproto(format!("media {} is no longer available", media.file_id)));
        };

        let mut chunks = self.client.iter_download(&Downloadable::Media(item));
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.next().await.map_err(mtproto_error)? {
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

/// The message in transport-neutral form, plus the media handle needed to
/// download its image later.
fn raw_post(message: &Message) -> (RawPost, Option<Media>) {
    let chat = message.chat();
    let message_id = i64::from(message.id());
    let file_id = format!("{}:{message_id}", chat.id());

    let image = match message.media() {
        Some(media @ Media::Photo(_)) => Some((
            MediaRef {
                file_id,
                declared_size: None,
                file_name: "photo.jpg".into(),
            },
            media,
        )),
        Some(Media::Document(doc)) => {
            let subtype = doc
                .mime_type()
                .and_then(|mime| mime.strip_prefix("image/"))
                .map(str::to_owned);
            subtype.map(|subtype| {
                let media_ref = MediaRef {
                    file_id,
                    declared_size: u64::try_from(doc.size()).ok().filter(|size| *size > 0),
                    file_name: image_file_name(Some(doc.name()), &subtype),
                };
                (media_ref, Media::Document(doc))
            })
        }
        _ => None,
    };
    let (image, media) = image.unzip();

    let raw = RawPost {
        chat_id: chat.id(),
        chat_username: chat.username().map(str::to_owned),
        message_id,
        text: message.text().to_owned(),
        group: message.grouped_id().map(|g| g.to_string()),
        image,
    };
    (raw, media)
}

fn session_path(name: &str) -> PathBuf {
    if name.ends_with(".session") {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("{name}.session"))
    }
}

/// MTProto connections only go through SOCKS5.
fn socks_url(proxy: &ProxySettings) -> Result<String, SourceError> {
    let mut url = proxy
        .authenticated_url()
        .map_err(|e| SourceError::Mtproto(e.to_string()))?;
    if !url.scheme().starts_with("socks5") {
        return Err(SourceError::Mtproto(format!(
            "{} proxies are not supported for MTProto, use SOCKS5",
            url.scheme()
        )));
    }
    url.set_scheme("socks5")
        .map_err(|_| SourceError::Mtproto("cannot rewrite proxy scheme".into()))?;
    Ok(url.to_string())
}

fn prompt(question: &str) -> Result<String, SourceError> {
    let mut stdout = io::stdout();
    stdout
        .write_all(question.as_bytes())
        .and_then(|_| stdout.flush())
        .map_err(mtproto_error)?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map_err(mtproto_error)?;
    Ok(line.trim().to_owned())
}

/// Bounded map of media handles; the oldest entry goes first when full.
struct PendingMedia<M> {
    capacity: usize,
    order: VecDeque<String>,
    items: HashMap<String, M>,
}

impl<M> PendingMedia<M> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            items: HashMap::new(),
        }
    }

    fn insert(&mut self, key: String, item: M) {
        if self.items.insert(key.clone(), item).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.items.remove(&oldest);
            }
        }
    }

    fn take(&mut self, key: &str) -> Option<M> {
        let item = self.items.remove(key)?;
        self.order.retain(|k| k != key);
        Some(item)
    }
}
