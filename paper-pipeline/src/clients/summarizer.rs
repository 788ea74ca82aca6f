use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::OpenAiSettings;
use crate::util::text::truncate_chars;

const MAX_OUTPUT_TOKENS: u32 = 800;
const TEMPERATURE: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryInput {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSummary {
    pub text: String,
    /// Set when the model overran the length limit and the text was cut.
    pub needs_review: bool,
    pub created_by: String,
}

/// LLM による要約生成の境界。
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, input: SummaryInput) -> Result<GeneratedSummary>;
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage>,
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl ResponsesResponse {
    fn text(self) -> Option<String> {
        if let Some(text) = self.output_text.filter(|text| !text.trim().is_empty()) {
            return Some(text);
        }
        let joined: String = self
            .output
            .into_iter()
            .flat_map(|item| item.content)
            .filter(|content| content.kind == "output_text")
            .filter_map(|content| content.text)
            .collect();
        (!joined.trim().is_empty()).then_some(joined)
    }
}

/// OpenAI Responses API client.
#[derive(Debug, Clone)]
pub struct OpenAiSummarizer {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_length: usize,
}

impl OpenAiSummarizer {
    pub fn new(settings: &OpenAiSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("failed to build OpenAI client")?;
        let endpoint = Url::parse(&settings.base_url)
            .and_then(|base| base.join("v1/responses"))
            .context("invalid OpenAI base URL")?;
        Ok(Self {
            client,
            endpoint,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            max_length: settings.max_length,
        })
    }

    fn system_prompt(&self) -> String {
        format!(
            "Ты научный редактор. Напиши краткое summary статьи простым языком (до {} символов). \
             Укажи ключевой результат и почему он важен. Избегай жаргона.",
            self.max_length
        )
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, input: SummaryInput) -> Result<GeneratedSummary> {
        let request = ResponsesRequest {
            model: &self.model,
            input: vec![
                InputMessage {
                    role: "system",
                    content: self.system_prompt(),
                },
                InputMessage {
                    role: "user",
                    content: format!("Заголовок: {}\nАннотация: {}", input.title, input.text),
                },
            ],
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("OpenAI responses request failed")?
            .error_for_status()
            .context("OpenAI responses endpoint returned error status")?
            .json::<ResponsesResponse>()
            .await
            .context("failed to deserialize OpenAI response")?;

        let text = response
            .text()
            .ok_or_else(|| anyhow!("OpenAI response contained no output text"))?;
        let text = text.trim();
        let length = text.chars().count();
        let needs_review = length > self.max_length;
        if needs_review {
            warn!(length, max_length = self.max_length, "summary exceeded max length; truncated");
        }
        debug!(length, model = %self.model, "summary generated");

        Ok(GeneratedSummary {
            text: truncate_chars(text, self.max_length).to_string(),
            needs_review,
            created_by: "openai".to_string(),
        })
    }
}
