use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::IsTerminal,
    process::exit,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::{
    config::{ConfigError, LogSettings, ProxySettings, Settings},
    discord::{DeliveryClient, DiscordWebhook},
    relay::Relay,
    sources::{mtproto::MtprotoSource, telegram::BotApiSource, ChannelSource, SourceError},
};

mod attachment;
mod channels;
mod config;
mod discord;
mod format;
mod relay;
mod sources;

/// Posts buffered between the poller and the relay.
const EVENT_QUEUE: usize = 16;

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    /// Env file with settings. `.env` is loaded if present and this is not given.
    #[clap(short, long, value_parser)]
    env_file: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let env_loaded = load_env_file(args.env_file.as_deref());
    let vars = environment();
    init_logging(&LogSettings::from_map(&vars));

    let settings = match env_loaded.and_then(|_| Settings::from_map(&vars)) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(1);
        }
    };

    let targets: Vec<String> = settings.channels.iter().map(ToString::to_string).collect();
    info!(
        api_id = settings.telegram.api_id,
        hash_len = settings.api_hash_len(),
        targets = %targets.join(","),
        proxy = settings.proxy.is_some(),
        bot_api = settings.telegram.bot_token.is_some(),
        "Starting…"
    );

    let proxy_url = match settings.proxy.as_ref().map(ProxySettings::authenticated_url).transpose() {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            exit(1);
        }
    };
    let client = match http_client(proxy_url) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "cannot build HTTP client");
            exit(1);
        }
    };

    let delivery = DeliveryClient::new(
        DiscordWebhook::new(client.clone(), settings.discord.webhook.clone()),
        settings.discord.max_rate_limit_retries,
    );

    let connected = async {
        let source = open_source(&settings, client).await?;
        let account = source.connect().await?;
        Ok::<_, SourceError>((source, account))
    };
    let source = match connected.await {
        Ok((source, account)) => {
            info!(account = %account, "connected to Telegram");
            source
        }
        Err(e) => {
            let msg = format!("Startup error: failed to connect to Telegram: {e}");
            error!("{msg}");
            delivery.notify(&msg).await;
            exit(2);
        }
    };

    let mut relay = Relay::new(&settings, source.clone(), delivery);

    relay.announce().await;

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let channels = relay.registry().ids().to_vec();
    let subscription = tokio::spawn(async move {
        if let Err(e) = source.subscribe(channels, tx).await {
            error!(error = %e, "subscription ended");
        }
    });

    tokio::select! {
        _ = relay.run(rx) => {},
        _ = shutdown_signal() => info!("shutting down"),
    }

    subscription.abort();
}

/// Bot API when a bot token is set, otherwise a user login over MTProto.
async fn open_source(
    settings: &Settings,
    client: reqwest::Client,
) -> Result<Arc<dyn ChannelSource>, SourceError> {
    if let Some(token) = &settings.telegram.bot_token {
        return Ok(Arc::new(BotApiSource::new(
            client,
            settings.telegram.api_url.clone(),
            token.clone(),
        )));
    }

    let source = MtprotoSource::open(&settings.telegram, settings.proxy.as_ref()).await?;
    if std::io::stdin().is_terminal() {
        info!("interactive terminal, logging in if needed");
        source.login_interactively().await?;
    }
    Ok(Arc::new(source))
}

fn load_env_file(path: Option<&str>) -> Result<(), ConfigError> {
    match path {
        Some(path) => dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
            path: path.to_owned(),
            source,
        }),
        None => match dotenvy::dotenv() {
            Ok(_) => Ok(()),
            Err(e) if e.not_found() => Ok(()),
            Err(source) => Err(ConfigError::EnvFile {
                path: ".env".into(),
                source,
            }),
        },
    }
}

/// Process environment, skipping entries that are not valid UTF-8.
fn environment() -> HashMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

fn init_logging(log: &LogSettings) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let file = log
        .file
        .as_deref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path));

    match file {
        Some(Ok(file)) => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Some(Err(e)) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
            warn!(error = %e, "cannot open LOG_FILE, logging to stderr");
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn http_client(proxy: Option<Url>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(8))
        .user_agent(concat!("tgrelay/", env!("CARGO_PKG_VERSION")));

    if let Some(url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }

    builder.build()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
