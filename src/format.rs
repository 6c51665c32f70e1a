use crate::{
    attachment::Attachment,
    channels::ChannelRef,
    config::DiscordSettings,
    sources::IncomingPost,
};

/// Appended when an image was dropped for exceeding the upload ceiling.
pub const OVERSIZE_NOTE: &str = "(Attachment too large to upload)";
/// Discord rejects longer `content` fields.
pub const DISCORD_MAX_CONTENT_CHARS: usize = 2000;
const ELLIPSIS: char = '…';

/// What gets posted to the webhook. Consumed by a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPayload {
    pub content: String,
    pub attachment: Option<Attachment>,
}

impl OutboundPayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
        }
    }
}

pub struct MessageFormatter {
    prefix: String,
    disable_preview: bool,
}

impl MessageFormatter {
    pub fn new(settings: &DiscordSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            disable_preview: settings.disable_preview,
        }
    }

    /// Title, body and permalink as blank-line separated paragraphs.
    /// Private channels (no username) get no link paragraph.
    pub fn render(&self, channel: &ChannelRef, post: &IncomingPost) -> String {
        self.render_text(channel, post.message_id, &post.text)
    }

    fn render_text(&self, channel: &ChannelRef, message_id: i64, text: &str) -> String {
        let link = channel
            .username
            .as_deref()
            .map(|username| permalink(username, message_id, self.disable_preview));

        let title = format!("{}{}", self.prefix, channel.title);
        let mut paragraphs = vec![title.as_str()];
        if !text.is_empty() {
            paragraphs.push(text);
        }
        if let Some(link) = link.as_deref() {
            paragraphs.push(link);
        }

        paragraphs.join("\n\n")
    }

    /// Like [`render`](Self::render), but shortens the body so the
    /// whole message, link and oversize note included, fits Discord's limit.
    pub fn payload(
        &self,
        channel: &ChannelRef,
        post: &IncomingPost,
        attachment: Option<Attachment>,
        oversize: bool,
    ) -> OutboundPayload {
        let note = if oversize {
            format!("\n{OVERSIZE_NOTE}")
        } else {
            String::new()
        };

        let mut content = self.render(channel, post);
        let note_len = note.chars().count();
        if content.chars().count() + note_len > DISCORD_MAX_CONTENT_CHARS {
            let frame = self.render_text(channel, post.message_id, "").chars().count();
            // blank line before the body, plus the ellipsis
            let budget = DISCORD_MAX_CONTENT_CHARS.saturating_sub(frame + note_len + 3);
            let mut body: String = post.text.chars().take(budget).collect();
            body.push(ELLIPSIS);
            content = self.render_text(channel, post.message_id, &body);
        }
        content.push_str(&note);

        OutboundPayload {
            content,
            attachment,
        }
    }
}

/// `https://t.me/<username>/<id>`, wrapped in `<...>` to stop Discord from
/// rendering an embed.
pub fn permalink(username: &str, message_id: i64, disable_preview: bool) -> String {
    let username = username.trim_start_matches('@');
    let link = format!("https://t.me/{username}/{message_id}");
    if disable_preview {
        format!("<{link}>")
    } else {
        link
    }
}
