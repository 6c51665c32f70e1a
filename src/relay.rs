use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    attachment,
    channels::{ChannelRef, ChannelRegistry},
    config::Settings,
    discord::{Delivered, DeliveryClient, DeliveryError, WebhookTransport},
    format::MessageFormatter,
    sources::{ChannelSource, IncomingPost},
};

/// The single consumer of incoming posts. Each post is resolved, fetched,
/// formatted and delivered before the next one is taken, so a slow or
/// rate-limited delivery holds back everything behind it.
pub struct Relay<T> {
    source: Arc<dyn ChannelSource>,
    registry: ChannelRegistry,
    formatter: MessageFormatter,
    delivery: DeliveryClient<T>,
    max_upload_bytes: u64,
}

impl<T: WebhookTransport> Relay<T> {
    pub fn new(settings: &Settings, source: Arc<dyn ChannelSource>, delivery: DeliveryClient<T>) -> Self {
        Self {
            source,
            registry: ChannelRegistry::new(settings.channels.clone()),
            formatter: MessageFormatter::new(&settings.discord),
            delivery,
            max_upload_bytes: settings.max_upload_bytes,
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Log the watched channels and post the startup notice.
    pub async fn announce(&mut self) -> Vec<ChannelRef> {
        let channels = self.registry.resolve_all(self.source.as_ref()).await;
        let displays: Vec<String> = channels.iter().map(ChannelRef::display).collect();

        info!("Running. Listening to channels:");
        for name in &displays {
            info!(" - {name}");
        }

        self.delivery.notify(&format!(
            "Started listening to channels: {}",
            displays.join(", ")
        ))
        .await;

        channels
    }

    /// Handle posts until the sending side goes away.
    pub async fn run(&mut self, mut posts: mpsc::Receiver<IncomingPost>) {
        while let Some(post) = posts.recv().await {
            // Outcome is already logged.
            let _ = self.handle(post).await;
        }
        info!("event stream closed");
    }

    pub async fn handle(&mut self, post: IncomingPost) -> Result<Delivered, DeliveryError> {
        let channel = self.registry.resolve(self.source.as_ref(), &post.channel).await;

        let (attachment, oversize) = match &post.image {
            Some(media) => {
                attachment::fetch(self.source.as_ref(), media, self.max_upload_bytes)
                    .await
                    .into_parts()
            }
            None => (None, false),
        };

        let payload = self.formatter.payload(&channel, &post, attachment, oversize);
        let kind = if payload.attachment.is_some() { "IMAGE" } else { "TEXT" };
        info!(
            channel = %channel.title,
            message_id = post.message_id,
            "{kind} → Discord"
        );

        let result = self.delivery.deliver(&payload).await;
        match &result {
            Ok(delivered) => info!(
                channel = %channel.title,
                message_id = post.message_id,
                attempts = delivered.attempts,
                "delivered"
            ),
            Err(e) => error!(
                channel = %channel.title,
                message_id = post.message_id,
                error = %e,
                "delivery failed, message dropped"
            ),
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use super::*;
    use crate::{
        channels::{ChannelId, ChannelInfo},
        discord::{testing::ScriptedTransport, WebhookResponse},
        format::{OutboundPayload, OVERSIZE_NOTE},
        sources::{testing::FakeSource, MediaRef},
    };

    fn settings(extra: &[(&str, &str)]) -> Settings {
        let mut vars: HashMap<String, String> = [
            ("TG_API_ID", "1"),
            ("TG_API_HASH", "0123456789abcdef0123456789abcdef"),
            ("DISCORD_WEBHOOK", "https://discord.test/hook"),
            ("TG_CHANNELS", "@news,-100200"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        for (k, v) in extra {
            vars.insert((*k).to_owned(), (*v).to_owned());
        }
        Settings::from_map(&vars).unwrap()
    }

    fn news_source() -> FakeSource {
        FakeSource::default()
            .with_channel(
                ChannelId::Username("news".into()),
                ChannelInfo { title: Some("News".into()), username: Some("news".into()) },
            )
            .with_channel(
                ChannelId::Numeric(-100200),
                ChannelInfo { title: Some("Private".into()), username: None },
            )
    }

    fn post(id: i64, text: &str, image: Option<MediaRef>) -> IncomingPost {
        IncomingPost {
            channel: ChannelId::Username("news".into()),
            message_id: id,
            text: text.into(),
            image,
        }
    }

    fn relay(
        settings: &Settings,
        source: Arc<FakeSource>,
        transport: Arc<ScriptedTransport>,
    ) -> Relay<Arc<ScriptedTransport>> {
        Relay::new(settings, source, DeliveryClient::new(transport, None))
    }

    #[tokio::test]
    async fn relays_text_post_end_to_end() {
        let settings = settings(&[("DISCORD_PREFIX", "[ANN] ")]);
        let transport = Arc::new(ScriptedTransport::default());
        let mut relay = relay(&settings, Arc::new(news_source()), transport.clone());

        relay.handle(post(42, "Big update", None)).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            OutboundPayload::text("[ANN] News\n\nBig update\n\nhttps://t.me/news/42")
        );
    }

    #[tokio::test]
    async fn image_within_ceiling_is_uploaded() {
        let settings = settings(&[]);
        let source = Arc::new(news_source().with_file("pic", vec![9, 9, 9]));
        let transport = Arc::new(ScriptedTransport::default());
        let mut relay = relay(&settings, source, transport.clone());

        let media = MediaRef {
            file_id: "pic".into(),
            declared_size: Some(3),
            file_name: "photo.jpg".into(),
        };
        relay.handle(post(1, "", Some(media))).await.unwrap();

        let payload = &transport.sent()[0].1;
        assert_eq!(payload.content, "News\n\nhttps://t.me/news/1");
        assert_eq!(payload.attachment.as_ref().unwrap().bytes, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn oversize_image_goes_out_as_text() {
        let settings = settings(&[("MAX_UPLOAD_BYTES", "10")]);
        let source = Arc::new(news_source().with_file("pic", vec![0; 100]));
        let transport = Arc::new(ScriptedTransport::default());
        let mut relay = relay(&settings, source.clone(), transport.clone());

        let media = MediaRef {
            file_id: "pic".into(),
            declared_size: Some(100),
            file_name: "photo.jpg".into(),
        };
        relay.handle(post(2, "huge", Some(media))).await.unwrap();

        assert_eq!(source.download_calls(), 0);
        let payload = &transport.sent()[0].1;
        assert!(payload.attachment.is_none());
        assert!(payload.content.ends_with(OVERSIZE_NOTE));
    }

    #[tokio::test]
    async fn failed_download_goes_out_as_text() {
        let settings = settings(&[]);
        let transport = Arc::new(ScriptedTransport::default());
        let mut relay = relay(&settings, Arc::new(news_source()), transport.clone());

        let media = MediaRef {
            file_id: "expired".into(),
            declared_size: None,
            file_name: "photo.jpg".into(),
        };
        relay.handle(post(3, "caption", Some(media))).await.unwrap();

        let payload = &transport.sent()[0].1;
        assert!(payload.attachment.is_none());
        assert_eq!(payload.content, "News\n\ncaption\n\nhttps://t.me/news/3");
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_order_and_survives_failures() {
        let settings = settings(&[]);
        let posts = vec![
            post(1, "first", None),
            post(2, "second", None),
            IncomingPost {
                channel: ChannelId::Numeric(-100200),
                message_id: 3,
                text: "third".into(),
                image: None,
            },
            post(4, "fourth", None),
        ];
        let source = Arc::new(news_source().with_posts(posts));
        let transport = Arc::new(ScriptedTransport::new(vec![
            WebhookResponse::RateLimited(Duration::from_secs(3)),
            WebhookResponse::Success,
            WebhookResponse::Error(500, "oops".into()),
        ]));
        let mut relay = relay(&settings, source.clone(), transport.clone());

        let (tx, rx) = mpsc::channel(8);
        source
            .subscribe(relay.registry().ids().to_vec(), tx)
            .await
            .unwrap();
        relay.run(rx).await;

        let contents: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|(_, payload)| payload.content)
            .collect();
        assert_eq!(
            contents,
            vec![
                "News\n\nfirst\n\nhttps://t.me/news/1".to_owned(),
                "News\n\nfirst\n\nhttps://t.me/news/1".to_owned(),
                "News\n\nsecond\n\nhttps://t.me/news/2".to_owned(),
                "Private\n\nthird".to_owned(),
                "News\n\nfourth\n\nhttps://t.me/news/4".to_owned(),
            ]
        );
        // One lookup per channel, however many posts.
        assert_eq!(source.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn announce_lists_channels() {
        let settings = settings(&[]);
        let source = Arc::new(news_source());
        let transport = Arc::new(ScriptedTransport::default());
        let mut relay = relay(&settings, source.clone(), transport.clone());

        let channels = relay.announce().await;

        assert_eq!(channels.len(), 2);
        assert_eq!(
            transport.sent()[0].1.content,
            "Started listening to channels: @news, [Private]"
        );

        relay.handle(post(5, "later", None)).await.unwrap();
        assert_eq!(source.resolve_calls(), 2);
    }
}
