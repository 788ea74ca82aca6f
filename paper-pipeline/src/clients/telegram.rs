use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::TelegramSettings;

/// Chat delivery boundary. Returns `"{chat_id}:{message_id}"`, or `None`
/// when nothing was actually sent.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Sends the draft preview to the owner.
    async fn send_draft(&self, text: &str) -> Result<Option<String>>;

    /// Publishes to the channel.
    async fn send_to_channel(&self, text: &str) -> Result<Option<String>>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Telegram Bot API `sendMessage` client (HTML parse mode).
#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: Client,
    send_message_url: Url,
    owner_chat_id: String,
    channel_chat_id: String,
    dry_run: bool,
}

impl TelegramClient {
    pub fn new(settings: &TelegramSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build Telegram client")?;
        // Tokens contain ':', so the path is formatted rather than joined.
        let send_message_url = Url::parse(&format!(
            "{}/bot{}/sendMessage",
            settings.api_base_url.trim_end_matches('/'),
            settings.bot_token
        ))
        .context("invalid Telegram API base URL")?;
        Ok(Self {
            client,
            send_message_url,
            owner_chat_id: settings.owner_chat_id.clone(),
            channel_chat_id: settings.channel_chat_id.clone(),
            dry_run: settings.dry_run,
        })
    }

    async fn send(&self, chat_id: &str, text: &str, kind: &str) -> Result<Option<String>> {
        if self.dry_run {
            info!(kind, message = %text, "DRY RUN: telegram message prepared");
            return Ok(None);
        }

        let response = self
            .client
            .post(self.send_message_url.clone())
            .json(&SendMessage {
                chat_id,
                text,
                parse_mode: "HTML",
            })
            .send()
            .await
            .context("telegram sendMessage request failed")?;
        let status = response.status();
        let body = response
            .json::<ApiResponse>()
            .await
            .with_context(|| format!("failed to decode telegram response (status {status})"))?;

        if !body.ok {
            return Err(anyhow!(
                "telegram rejected message: {}",
                body.description.unwrap_or_else(|| status.to_string())
            ));
        }
        let sent = body
            .result
            .ok_or_else(|| anyhow!("telegram response missing result"))?;
        Ok(Some(format!("{}:{}", sent.chat.id, sent.message_id)))
    }
}

#[async_trait]
impl DeliveryAdapter for TelegramClient {
    async fn send_draft(&self, text: &str) -> Result<Option<String>> {
        self.send(&self.owner_chat_id, text, "draft").await
    }

    async fn send_to_channel(&self, text: &str) -> Result<Option<String>> {
        self.send(&self.channel_chat_id, text, "channel").await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn settings(base_url: &str, dry_run: bool) -> TelegramSettings {
        TelegramSettings {
            bot_token: "123:abc".into(),
            owner_chat_id: "42".into(),
            channel_chat_id: "-100500".into(),
            api_base_url: format!("{base_url}/"),
            dry_run,
        }
    }

    #[tokio::test]
    async fn channel_message_returns_chat_and_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "-100500", "parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"message_id": 7, "chat": {"id": -100500}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TelegramClient::new(&settings(&server.uri(), false)).expect("client");
        let id = client.send_to_channel("<b>post</b>").await.expect("send");

        assert_eq!(id.as_deref(), Some("-100500:7"));
    }

    #[tokio::test]
    async fn draft_goes_to_owner_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"chat_id": "42"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"message_id": 1, "chat": {"id": 42}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TelegramClient::new(&settings(&server.uri(), false)).expect("client");

        assert_eq!(client.send_draft("draft").await.expect("send").as_deref(), Some("42:1"));
    }

    #[tokio::test]
    async fn api_errors_surface_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let client = TelegramClient::new(&settings(&server.uri(), false)).expect("client");
        let error = client.send_to_channel("post").await.expect_err("should fail");

        assert!(error.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn dry_run_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let client = TelegramClient::new(&settings(&server.uri(), true)).expect("client");

        assert_eq!(client.send_to_channel("post").await.expect("dry run"), None);
    }
}
