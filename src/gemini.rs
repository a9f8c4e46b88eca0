use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GeminiConfig;

/// Base64 image attached to a generation request.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// A generation reply that was asked to be JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum GeminiReply {
    Json(Value),
    Text(String),
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    text_model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .context("failed to build gemini http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            text_model: config.text_model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    pub async fn embed_content(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            content: Content<'a>,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embedding: Option<EmbeddingValues>,
        }

        #[derive(Deserialize)]
        struct EmbeddingValues {
            #[serde(default)]
            values: Vec<f32>,
        }

        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url, self.embedding_model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&EmbedReq {
                content: Content {
                    parts: vec![Part::Text { text: input }],
                },
            })
            .send()
            .await
            .context("failed to call gemini embedContent endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "gemini embedContent returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let values = response
            .json::<EmbedResp>()
            .await
            .context("failed to decode gemini embedContent response")?
            .embedding
            .map(|e| e.values)
            .unwrap_or_default();

        if values.is_empty() {
            anyhow::bail!("gemini embedContent returned no embedding values");
        }

        Ok(values)
    }

    pub async fn generate(
        &self,
        prompt: &str,
        image: Option<&InlineImage>,
        json_output: bool,
    ) -> Result<String> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerateReq<'a> {
            contents: Vec<Content<'a>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            generation_config: Option<GenerationConfig>,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerationConfig {
            response_mime_type: &'static str,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            #[serde(default)]
            candidates: Vec<Candidate>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            content: Option<CandidateContent>,
        }

        #[derive(Deserialize)]
        struct CandidateContent {
            #[serde(default)]
            parts: Vec<CandidatePart>,
        }

        #[derive(Deserialize)]
        struct CandidatePart {
            text: Option<String>,
        }

        let mut parts = vec![Part::Text { text: prompt }];
        if let Some(image) = image {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: &image.mime_type,
                    data: &image.data,
                },
            });
        }

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.text_model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&GenerateReq {
                contents: vec![Content { parts }],
                generation_config: json_output.then_some(GenerationConfig {
                    response_mime_type: "application/json",
                }),
            })
            .send()
            .await
            .context("failed to call gemini generateContent endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "gemini generateContent returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let reply = response
            .json::<GenerateResp>()
            .await
            .context("failed to decode gemini generateContent response")?
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().find_map(|p| p.text))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        reply.ok_or_else(|| anyhow::anyhow!("gemini returned an empty reply"))
    }

    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        self.generate(prompt, None, false).await
    }

    pub async fn generate_json(
        &self,
        prompt: &str,
        image: Option<&InlineImage>,
    ) -> Result<GeminiReply> {
        let text = self.generate(prompt, image, true).await?;
        Ok(parse_reply(text))
    }
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

pub fn parse_reply(text: String) -> GeminiReply {
    let cleaned = strip_code_fences(&text);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => GeminiReply::Json(value),
        Err(_) => GeminiReply::Text(text),
    }
}

fn strip_code_fences(answer: &str) -> String {
    let text = answer.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }

    Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*)\n\s*```$")
        .ok()
        .and_then(|re| {
            re.captures(text)
                .and_then(|caps| caps.get(1))
                .map(|body| body.as_str().trim().to_string())
        })
        .unwrap_or_else(|| text.replace("```", "").trim().to_string())
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(err) = json.pointer("/error/message").and_then(|v| v.as_str()) {
            return err.to_string();
        }
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
