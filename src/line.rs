use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::LineConfig;

/// Push-message client for the LINE Messaging API.
#[derive(Clone)]
pub struct LineClient {
    client: Client,
    base_url: String,
    channel_access_token: String,
}

#[derive(Debug, Serialize)]
struct PushReq<'a> {
    to: &'a str,
    messages: Vec<TextMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

impl LineClient {
    pub fn new(config: &LineConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build line http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            channel_access_token: config.channel_access_token.clone(),
        })
    }

    pub async fn push_text(&self, recipient_id: &str, text: &str) -> Result<()> {
        if recipient_id.trim().is_empty() {
            anyhow::bail!("cannot push a message without a recipient");
        }

        let url = format!("{}/v2/bot/message/push", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.channel_access_token)
            .json(&push_body(recipient_id, text))
            .send()
            .await
            .context("failed to call line push endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|json| json.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or(body);
            anyhow::bail!("line push returned {status}: {message}");
        }

        Ok(())
    }
}

fn push_body<'a>(to: &'a str, text: &'a str) -> PushReq<'a> {
    PushReq {
        to,
        messages: vec![TextMessage { kind: "text", text }],
    }
}
