use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use crate::channels::{self, ChannelId};

/// Default ceiling for re-uploaded images (Discord's free-tier limit).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_TG_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_TG_SESSION: &str = "forwarder";

lazy_static! {
    static ref API_HASH_RE: Regex = Regex::new(r"^[0-9a-fA-F]{32}$").unwrap();
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("TG_API_HASH must be exactly 32 hexadecimal characters")]
    InvalidCredentialFormat,

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("cannot load env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// Validated, immutable settings. Built once in `main` and handed to
/// every component that needs a piece of it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub telegram: TelegramSettings,
    pub discord: DiscordSettings,
    pub channels: Vec<ChannelId>,
    pub max_upload_bytes: u64,
    pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_id: i32,
    pub api_hash: SecretString,
    /// Session name; the login is kept in `<session>.session`.
    pub session: String,
    /// Switches the source to the Bot API instead of a user login.
    pub bot_token: Option<SecretString>,
    pub api_url: Url,
}

#[derive(Debug, Clone)]
pub struct DiscordSettings {
    pub webhook: Url,
    /// Prepended to the title line. May be empty.
    pub prefix: String,
    /// Wrap permalinks in `<...>` so Discord skips the embed.
    pub disable_preview: bool,
    /// `None` retries rate limits forever.
    pub max_rate_limit_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy address without credentials.
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Setting the credentials came from, for error messages.
    user_key: &'static str,
}

impl ProxySettings {
    /// Proxy address with the credentials filled in.
    pub fn authenticated_url(&self) -> Result<Url, ConfigError> {
        let mut url = self.url.clone();
        let Some(username) = &self.username else {
            return Ok(url);
        };

        let password = self.password.as_ref().map(|p| p.expose_secret().as_str());
        url.set_username(username)
            .and_then(|_| url.set_password(password))
            .map_err(|_| ConfigError::Invalid {
                key: self.user_key,
                reason: format!("{} proxy does not take credentials", self.url.scheme()),
            })?;

        Ok(url)
    }
}

/// Logging knobs. Read separately from [`Settings`] so logging is up
/// before the rest of the configuration is validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<String>,
}

impl LogSettings {
    pub fn from_map(vars: &HashMap<String, String>) -> Self {
        let level = match get(vars, "LOG_LEVEL").map(str::to_ascii_lowercase).as_deref() {
            Some(l @ ("trace" | "debug" | "info" | "warn" | "error" | "off")) => l.to_owned(),
            Some("warning") => "warn".to_owned(),
            Some("critical" | "fatal") => "error".to_owned(),
            _ => "info".to_owned(),
        };

        Self {
            level,
            file: get(vars, "LOG_FILE").map(str::to_owned),
        }
    }
}

impl Settings {
    /// Parse and validate an environment-style mapping. Pure: nothing is
    /// read or written besides `vars`.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let api_id = get(vars, "TG_API_ID");
        let api_hash = get(vars, "TG_API_HASH");
        let webhook = get(vars, "DISCORD_WEBHOOK");

        // TG_CHANNELS wins when both are present.
        let channels = match (get(vars, "TG_CHANNELS"), get(vars, "TG_CHANNEL")) {
            (Some(multi), _) => channels::parse_channel_list(multi),
            (None, Some(single)) => channels::parse_channel_list(single),
            (None, None) => Vec::new(),
        };

        let mut missing = Vec::new();
        if api_id.is_none() {
            missing.push("TG_API_ID");
        }
        if api_hash.is_none() {
            missing.push("TG_API_HASH");
        }
        if webhook.is_none() {
            missing.push("DISCORD_WEBHOOK");
        }
        if channels.is_empty() {
            missing.push("TG_CHANNELS or TG_CHANNEL");
        }

        let (Some(api_id), Some(api_hash), Some(webhook), true) =
            (api_id, api_hash, webhook, missing.is_empty())
        else {
            return Err(ConfigError::Missing(missing));
        };

        let api_id = api_id.parse::<i32>().map_err(|e| ConfigError::Invalid {
            key: "TG_API_ID",
            reason: e.to_string(),
        })?;

        if !API_HASH_RE.is_match(api_hash) {
            return Err(ConfigError::InvalidCredentialFormat);
        }

        let webhook = parse_http_url("DISCORD_WEBHOOK", webhook)?;
        let api_url = parse_http_url(
            "TG_API_URL",
            get(vars, "TG_API_URL").unwrap_or(DEFAULT_TG_API_URL),
        )?;

        let max_upload_bytes = match get(vars, "MAX_UPLOAD_BYTES") {
            Some(v) => parse_number("MAX_UPLOAD_BYTES", v)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };
        let max_rate_limit_retries = get(vars, "MAX_RATE_LIMIT_RETRIES")
            .map(|v| parse_number("MAX_RATE_LIMIT_RETRIES", v))
            .transpose()?;

        Ok(Self {
            telegram: TelegramSettings {
                api_id,
                api_hash: SecretString::new(api_hash.to_owned()),
                session: get(vars, "TG_SESSION").unwrap_or(DEFAULT_TG_SESSION).to_owned(),
                bot_token: get(vars, "TG_BOT_TOKEN").map(|t| SecretString::new(t.to_owned())),
                api_url,
            },
            discord: DiscordSettings {
                webhook,
                prefix: vars.get("DISCORD_PREFIX").cloned().unwrap_or_default(),
                disable_preview: get(vars, "DISABLE_PREVIEW").map_or(false, is_truthy),
                max_rate_limit_retries,
            },
            channels,
            max_upload_bytes,
            proxy: parse_proxy(vars)?,
        })
    }

    pub fn api_hash_len(&self) -> usize {
        self.telegram.api_hash.expose_secret().len()
    }
}

/// Non-empty, trimmed value for `key`.
fn get<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

fn parse_http_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

fn parse_proxy(vars: &HashMap<String, String>) -> Result<Option<ProxySettings>, ConfigError> {
    let candidates = [
        ("SOCKS5", "socks5h", "SOCKS5_PORT", "SOCKS5_USER"),
        ("HTTP_PROXY", "http", "HTTP_PROXY_PORT", "HTTP_PROXY_USER"),
    ];

    for (prefix, scheme, port_key, user_key) in candidates {
        let host = get(vars, &format!("{prefix}_HOST"));
        let port = get(vars, port_key);
        let (Some(host), Some(port)) = (host, port) else {
            continue;
        };
        let port: u16 = parse_number(port_key, port)?;
        let url = Url::parse(&format!("{scheme}://{host}:{port}")).map_err(|e| {
            ConfigError::Invalid {
                key: port_key,
                reason: e.to_string(),
            }
        })?;

        return Ok(Some(ProxySettings {
            url,
            username: get(vars, user_key).map(str::to_owned),
            password: get(vars, &format!("{prefix}_PASS"))
                .map(|p| SecretString::new(p.to_owned())),
            user_key,
        }));
    }

    Ok(None)
}
