use std::{collections::HashMap, fmt};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::sources::ChannelSource;

lazy_static! {
    static ref NUMERIC_ID_RE: Regex = Regex::new(r"^[+-]?[0-9]+$").unwrap();
}

/// Channel identifier as configured.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Public username, stored without the leading `@`.
    Username(String),
    /// Marked numeric id, e.g. `-1001234567890`.
    Numeric(i64),
}

impl ChannelId {
    /// Classify one raw token. Surrounding whitespace and quotes are
    /// dropped; returns `None` for an empty token.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if token.is_empty() {
            return None;
        }

        if NUMERIC_ID_RE.is_match(token) {
            if let Ok(id) = token.parse::<i64>() {
                return Some(Self::Numeric(id));
            }
        }

        let name = token.strip_prefix('@').unwrap_or(token);
        if name.is_empty() {
            return None;
        }
        Some(Self::Username(name.to_owned()))
    }

    /// Whether a chat with this id/username is the channel we mean.
    /// `chat_id` may be marked (Bot API) or bare (MTProto).
    pub fn matches(&self, chat_id: i64, chat_username: Option<&str>) -> bool {
        match self {
            Self::Numeric(id) => *id == chat_id || bare_id(*id) == chat_id,
            Self::Username(name) => {
                chat_username.map_or(false, |u| u.eq_ignore_ascii_case(name))
            }
        }
    }

    /// Usernames are case-insensitive on Telegram.
    fn dedup_key(&self) -> Self {
        match self {
            Self::Username(name) => Self::Username(name.to_ascii_lowercase()),
            Self::Numeric(id) => Self::Numeric(*id),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username(name) => write!(f, "@{name}"),
            Self::Numeric(id) => write!(f, "{id}"),
        }
    }
}

/// Strip the `-100` channel / `-` group marker from a numeric id.
pub fn bare_id(id: i64) -> i64 {
    const CHANNEL_MARK: i64 = -1_000_000_000_000;
    if id <= CHANNEL_MARK {
        CHANNEL_MARK - id
    } else {
        id.saturating_abs()
    }
}

/// Parse a comma-separated channel list, keeping first-seen order and
/// dropping duplicates.
pub fn parse_channel_list(raw: &str) -> Vec<ChannelId> {
    let mut seen = Vec::new();
    let mut out = Vec::new();

    for id in raw.split(',').filter_map(ChannelId::parse) {
        let key = id.dedup_key();
        if !seen.contains(&key) {
            seen.push(key);
            out.push(id);
        }
    }

    out
}

/// Title and public username looked up from the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub title: Option<String>,
    pub username: Option<String>,
}

/// A configured channel plus whatever has been learned about it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub title: String,
    /// Present only for public channels; needed for permalinks.
    pub username: Option<String>,
}

impl ChannelRef {
    fn unresolved(id: &ChannelId) -> Self {
        let username = match id {
            ChannelId::Username(name) => Some(name.clone()),
            ChannelId::Numeric(_) => None,
        };
        Self {
            id: id.clone(),
            title: id.to_string(),
            username,
        }
    }

    fn resolved(id: &ChannelId, info: ChannelInfo) -> Self {
        let fallback = Self::unresolved(id);
        Self {
            id: id.clone(),
            title: info
                .title
                .or_else(|| info.username.clone())
                .unwrap_or(fallback.title),
            username: info.username.or(fallback.username),
        }
    }

    /// `@username`, `[title]` or the bare id, for the startup listing.
    pub fn display(&self) -> String {
        match (&self.username, &self.id) {
            (Some(username), _) => format!("@{username}"),
            (None, ChannelId::Numeric(id)) if self.title != id.to_string() => {
                format!("[{}]", self.title)
            }
            (None, id) => id.to_string(),
        }
    }
}

/// Configured channels with a lazily filled title/username cache.
///
/// The registry is owned by the single relay consumer, so the cache needs
/// no locking.
pub struct ChannelRegistry {
    channels: Vec<ChannelId>,
    resolved: HashMap<ChannelId, ChannelRef>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<ChannelId>) -> Self {
        Self {
            channels,
            resolved: HashMap::new(),
        }
    }

    pub fn ids(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Cached metadata for `id`, looking it up on first use. A failed lookup
    /// is not cached; the identifier stands in as title until one succeeds.
    pub async fn resolve(&mut self, source: &dyn ChannelSource, id: &ChannelId) -> ChannelRef {
        if let Some(found) = self.resolved.get(id) {
            return found.clone();
        }

        match source.resolve(id).await {
            Ok(info) => {
                let channel = ChannelRef::resolved(id, info);
                debug!(channel = %id, title = %channel.title, "channel resolved");
                self.resolved.insert(id.clone(), channel.clone());
                channel
            }
            Err(e) => {
                warn!(channel = %id, error = %e, "failed to resolve channel");
                ChannelRef::unresolved(id)
            }
        }
    }

    /// Resolve every configured channel, in order.
    pub async fn resolve_all(&mut self, source: &dyn ChannelSource) -> Vec<ChannelRef> {
        let ids = self.channels.clone();
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            out.push(self.resolve(source, id).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::FakeSource;

    #[test]
    fn classifies_tokens() {
        assert_eq!(ChannelId::parse("@news"), Some(ChannelId::Username("news".into())));
        assert_eq!(ChannelId::parse("news"), Some(ChannelId::Username("news".into())));
        assert_eq!(ChannelId::parse(" -1001 "), Some(ChannelId::Numeric(-1001)));
        assert_eq!(ChannelId::parse("+42"), Some(ChannelId::Numeric(42)));
        assert_eq!(ChannelId::parse("'@quoted'"), Some(ChannelId::Username("quoted".into())));
        assert_eq!(ChannelId::parse("   "), None);
        assert_eq!(ChannelId::parse("@"), None);
    }

    #[test]
    fn oversized_numbers_stay_usernames() {
        assert_eq!(
            ChannelId::parse("99999999999999999999"),
            Some(ChannelId::Username("99999999999999999999".into()))
        );
    }

    #[test]
    fn list_keeps_order_and_drops_duplicates() {
        let parsed = parse_channel_list(" @b, -100, @a ,@b,-100, @B ,,");
        assert_eq!(
            parsed,
            vec![
                ChannelId::Username("b".into()),
                ChannelId::Numeric(-100),
                ChannelId::Username("a".into()),
            ]
        );
    }

    #[test]
    fn list_parsing_is_idempotent() {
        let first = parse_channel_list("@one, 2 ,@three,@one");
        let rendered = first
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(parse_channel_list(&rendered), first);
    }

    #[test]
    fn matches_by_id_or_username() {
        assert!(ChannelId::Numeric(-5).matches(-5, None));
        assert!(!ChannelId::Numeric(-5).matches(-6, Some("x")));
        assert!(ChannelId::Username("News".into()).matches(1, Some("news")));
        assert!(!ChannelId::Username("news".into()).matches(1, None));
    }

    #[test]
    fn marked_ids_match_bare_chat_ids() {
        let channel = ChannelId::Numeric(-1001234567890);
        assert!(channel.matches(-1001234567890, None));
        assert!(channel.matches(1234567890, None));
        assert!(!channel.matches(1001234567890, None));

        assert_eq!(bare_id(-1001234567890), 1234567890);
        assert_eq!(bare_id(-4242), 4242);
        assert_eq!(bare_id(777), 777);
    }

    #[test]
    fn display_forms() {
        let public = ChannelRef::resolved(
            &ChannelId::Numeric(-1),
            ChannelInfo { title: Some("News".into()), username: Some("news".into()) },
        );
        assert_eq!(public.display(), "@news");

        let private = ChannelRef::resolved(
            &ChannelId::Numeric(-1),
            ChannelInfo { title: Some("Secret".into()), username: None },
        );
        assert_eq!(private.display(), "[Secret]");
        assert_eq!(ChannelRef::unresolved(&ChannelId::Numeric(-1)).display(), "-1");
    }

    #[tokio::test]
    async fn resolves_once_per_channel() {
        let source = FakeSource::default().with_channel(
            ChannelId::Username("news".into()),
            ChannelInfo { title: Some("News".into()), username: Some("news".into()) },
        );
        let id = ChannelId::Username("news".into());
        let mut registry = ChannelRegistry::new(vec![id.clone()]);

        let first = registry.resolve(&source, &id).await;
        let second = registry.resolve(&source, &id).await;

        assert_eq!(first, second);
        assert_eq!(first.title, "News");
        assert_eq!(source.resolve_calls(), 1);
    }

    #[tokio::test]
    async fn failed_lookup_falls_back_and_retries() {
        let source = FakeSource::default();
        let id = ChannelId::Numeric(-77);
        let mut registry = ChannelRegistry::new(vec![id.clone()]);

        let channel = registry.resolve(&source, &id).await;
        assert_eq!(channel.title, "-77");
        assert_eq!(channel.username, None);

        registry.resolve(&source, &id).await;
        assert_eq!(source.resolve_calls(), 2);
    }
}
