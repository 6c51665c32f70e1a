use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::format::{OutboundPayload, DISCORD_MAX_CONTENT_CHARS};

/// Used when a 429 carries no usable retry-after.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
/// Longest wait honoured for a single 429.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);
/// Network failures (not HTTP errors) are retried this many times in total.
const MAX_TRANSPORT_ATTEMPTS: u32 = 5;
const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    Success,
    RateLimited(Duration),
    Error(u16, String),
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
struct DiscordRateLimit {
    retry_after: f64,
}

/// One HTTP round trip to the webhook. No retrying at this level.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn create_post(&self, payload: &OutboundPayload) -> Result<WebhookResponse, reqwest::Error>;
}

pub struct DiscordWebhook {
    client: reqwest::Client,
    url: Url,
}

impl DiscordWebhook {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl WebhookTransport for DiscordWebhook {
    async fn create_post(&self, payload: &OutboundPayload) -> Result<WebhookResponse, reqwest::Error> {
        let content = discord_content(&payload.content);

        let req = match &payload.attachment {
            None => self
                .client
                .post(self.url.clone())
                .json(&WebhookMessage { content: &content })
                .timeout(TEXT_TIMEOUT),
            Some(attachment) => {
                let file = Part::bytes(attachment.bytes.clone()).file_name(attachment.file_name.clone());
                let form = Form::new().text("content", content).part("file", file);
                self.client
                    .post(self.url.clone())
                    .multipart(form)
                    .timeout(UPLOAD_TIMEOUT)
            }
        };

        // The webhook URL is a secret.
        let res = req.send().await.map_err(reqwest::Error::without_url)?;
        let status = res.status();

        if status.is_success() {
            return Ok(WebhookResponse::Success);
        }

        let header_wait = res
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok());
        let text = res.text().await.map_err(reqwest::Error::without_url)?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = header_wait
                .or_else(|| {
                    serde_json::from_str::<DiscordRateLimit>(&text)
                        .ok()
                        .map(|r| r.retry_after)
                })
                .and_then(seconds)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Ok(WebhookResponse::RateLimited(wait));
        }

        Ok(WebhookResponse::Error(status.as_u16(), text))
    }
}

/// Negative, NaN and out-of-range values are rejected; the rest is capped.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .map(|wait| wait.min(MAX_RETRY_AFTER))
}

/// Trim to Discord's length limit on a char boundary. Empty content is
/// not accepted, so it becomes a single dot.
pub fn discord_content(content: &str) -> String {
    if content.is_empty() {
        return ".".into();
    }
    content.chars().take(DISCORD_MAX_CONTENT_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("still rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("webhook unreachable after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Delivers one payload, sleeping through rate limits.
pub struct DeliveryClient<T> {
    transport: T,
    /// `None` keeps retrying 429s for as long as they come.
    max_rate_limit_retries: Option<u32>,
    /// Unit of the linear pause between network failures.
    retry_pause: Duration,
}

impl<T: WebhookTransport> DeliveryClient<T> {
    pub fn new(transport: T, max_rate_limit_retries: Option<u32>) -> Self {
        Self {
            transport,
            max_rate_limit_retries,
            retry_pause: Duration::from_secs(1),
        }
    }

    pub async fn deliver(&self, payload: &OutboundPayload) -> Result<Delivered, DeliveryError> {
        let mut attempts = 0;
        let mut rate_limited = 0;
        let mut failures = 0;

        loop {
            attempts += 1;

            match self.transport.create_post(payload).await {
                Ok(WebhookResponse::Success) => return Ok(Delivered { attempts }),
                Ok(WebhookResponse::Error(status, body)) => {
                    return Err(DeliveryError::Rejected { status, body });
                }
                Ok(WebhookResponse::RateLimited(wait)) => {
                    if self
                        .max_rate_limit_retries
                        .is_some_and(|max| rate_limited >= max)
                    {
                        return Err(DeliveryError::RateLimitExhausted { attempts });
                    }
                    rate_limited += 1;
                    warn!(
                        retry_after_secs = wait.as_secs_f64(),
                        attempts,
                        "Discord 429 rate limit, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(source) => {
                    failures += 1;
                    if failures >= MAX_TRANSPORT_ATTEMPTS {
                        return Err(DeliveryError::Transport { attempts, source });
                    }
                    let pause = self.retry_pause * failures;
                    warn!(error = %source, attempts, "Discord post failed, retrying in {pause:?}");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Post a plain service message. Failures are only logged.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.deliver(&OutboundPayload::text(text)).await {
            error!(error = %e, "failed to post notice to Discord");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::Matcher;
    use serde_json::json;

    use super::{testing::ScriptedTransport, *};
    use crate::attachment::Attachment;

    fn webhook(server: &mockito::Server) -> DiscordWebhook {
        let url = Url::parse(&format!("{}/api/webhooks/1/secret", server.url())).unwrap();
        DiscordWebhook::new(reqwest::Client::new(), url)
    }

    #[tokio::test]
    async fn text_posts_as_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "content": "[ANN] News\n\nBig update\n\nhttps://t.me/news/42"
            })))
            .with_status(204)
            .create_async()
            .await;

        let res = webhook(&server)
            .create_post(&OutboundPayload::text(
                "[ANN] News\n\nBig update\n\nhttps://t.me/news/42",
            ))
            .await
            .unwrap();

        assert_eq!(res, WebhookResponse::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn images_post_as_multipart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .match_header("content-type", Matcher::Regex("^multipart/form-data".into()))
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="content""#.into()),
                Matcher::Regex("caption".into()),
                Matcher::Regex(r#"name="file"; filename="photo.jpg""#.into()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let payload = OutboundPayload {
            content: "caption".into(),
            attachment: Some(Attachment {
                file_name: "photo.jpg".into(),
                bytes: b"jpegdata".to_vec(),
            }),
        };
        let res = webhook(&server).create_post(&payload).await.unwrap();

        assert_eq!(res, WebhookResponse::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_reads_header() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .with_status(429)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let res = webhook(&server)
            .create_post(&OutboundPayload::text("hi"))
            .await
            .unwrap();

        assert_eq!(res, WebhookResponse::RateLimited(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn rate_limit_reads_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"You are being rate limited.","retry_after":1.5,"global":false}"#)
            .create_async()
            .await;

        let res = webhook(&server)
            .create_post(&OutboundPayload::text("hi"))
            .await
            .unwrap();

        assert_eq!(res, WebhookResponse::RateLimited(Duration::from_millis(1500)));
    }

    #[rstest::rstest]
    #[case("1e30")]
    #[case("1.8e19")]
    #[tokio::test]
    async fn absurd_retry_after_is_capped(#[case] retry_after: &str) {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .with_status(429)
            .with_header("retry-after", retry_after)
            .create_async()
            .await;

        let res = webhook(&server)
            .create_post(&OutboundPayload::text("hi"))
            .await
            .unwrap();

        assert_eq!(res, WebhookResponse::RateLimited(MAX_RETRY_AFTER));
    }

    #[test]
    fn unusable_retry_after_values_are_dropped() {
        assert_eq!(seconds(-1.0), None);
        assert_eq!(seconds(f64::NAN), None);
        assert_eq!(seconds(f64::INFINITY), None);
        assert_eq!(seconds(0.25), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn other_errors_carry_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/webhooks/1/secret")
            .with_status(400)
            .with_body("Cannot send an empty message")
            .create_async()
            .await;

        let res = webhook(&server)
            .create_post(&OutboundPayload::text("hi"))
            .await
            .unwrap();

        assert_eq!(
            res,
            WebhookResponse::Error(400, "Cannot send an empty message".into())
        );
    }

    #[test]
    fn content_is_trimmed_to_discord_limit() {
        let long = "é".repeat(DISCORD_MAX_CONTENT_CHARS + 10);
        assert_eq!(discord_content(&long).chars().count(), DISCORD_MAX_CONTENT_CHARS);
        assert_eq!(discord_content(""), ".");
        assert_eq!(discord_content("short"), "short");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_out_rate_limit_then_delivers() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            WebhookResponse::RateLimited(Duration::from_secs(2)),
            WebhookResponse::Success,
        ]));
        let client = DeliveryClient::new(transport.clone(), None);
        let payload = OutboundPayload::text("hello");

        let delivered = client.deliver(&payload).await.unwrap();

        assert_eq!(delivered, Delivered { attempts: 2 });
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].0 - sent[0].0 >= Duration::from_secs(2));
        assert_eq!(sent[0].1, sent[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_by_default() {
        let mut script = vec![WebhookResponse::RateLimited(Duration::from_millis(100)); 20];
        script.push(WebhookResponse::Success);
        let client = DeliveryClient::new(ScriptedTransport::new(script), None);

        let delivered = client.deliver(&OutboundPayload::text("x")).await.unwrap();
        assert_eq!(delivered.attempts, 21);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_rate_limit_retries_fail() {
        let client = DeliveryClient::new(
            ScriptedTransport::new(vec![
                WebhookResponse::RateLimited(Duration::from_secs(1)),
                WebhookResponse::RateLimited(Duration::from_secs(1)),
                WebhookResponse::Success,
            ]),
            Some(1),
        );

        let err = client.deliver(&OutboundPayload::text("x")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimitExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![WebhookResponse::Error(
            404,
            "Unknown Webhook".into(),
        )]));
        let client = DeliveryClient::new(transport.clone(), None);

        let err = client.deliver(&OutboundPayload::text("x")).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Rejected { status: 404, .. }));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_webhook_gives_up() {
        let url = Url::parse("http://127.0.0.1:1/api/webhooks/1/secret").unwrap();
        let mut client = DeliveryClient::new(DiscordWebhook::new(reqwest::Client::new(), url), None);
        client.retry_pause = Duration::from_millis(1);

        let err = client.deliver(&OutboundPayload::text("x")).await.unwrap_err();

        match err {
            DeliveryError::Transport { attempts, source } => {
                assert_eq!(attempts, MAX_TRANSPORT_ATTEMPTS);
                assert!(!source.to_string().contains("secret"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
