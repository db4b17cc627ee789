use crate::error::SummaryError;
use crate::models::Chapter;
use crate::utils::truncate_chars;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Chapter text beyond this many characters is not sent to the model.
const MAX_PROMPT_CHARS: usize = 12_000;

/// Condenses one chapter into a short description used as an image prompt.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, book: &str, chapter: &Chapter) -> Result<String, SummaryError>;
}

pub struct LLMClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_chars: usize,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl LLMClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_chars: usize,
    ) -> Self {
        LLMClient {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_chars,
        }
    }

    fn instructions(&self, book: &str, chapter: &Chapter) -> String {
        format!(
            "You summarize chapter {index} of the book '{book}'. Provide a concise summary \
             limited to {limit} characters. Follow the format 'Chapter {index}: summary'. \
             Focus solely on the chapter's key points without additional commentary.",
            index = chapter.index,
            limit = self.max_chars,
        )
    }
}

#[async_trait]
impl Summarizer for LLMClient {
    async fn summarize(&self, book: &str, chapter: &Chapter) -> Result<String, SummaryError> {
        let excerpt: String = chapter.text.chars().take(MAX_PROMPT_CHARS).collect();

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": self.instructions(book, chapter) },
                    { "role": "user", "content": excerpt },
                ],
                "temperature": 0.7
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SummaryError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletion = response.json().await?;
        let summary = extract_summary(completion, self.max_chars)?;
        tracing::info!("Summarized chapter {}: {}", chapter.index, summary);
        Ok(summary)
    }
}

/// The model is asked to stay under the limit but nothing enforces it, so the
/// reply is trimmed here as well.
fn extract_summary(completion: ChatCompletion, max_chars: usize) -> Result<String, SummaryError> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or(SummaryError::EmptyResponse)?;
    let summary = truncate_chars(&content, max_chars);
    if summary.is_empty() {
        return Err(SummaryError::EmptyResponse);
    }
    Ok(summary)
}
