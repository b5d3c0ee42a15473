use crate::models::FlagSuggestion;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

/// AI keyword enhancement. Implementations must be safely callable
/// when unconfigured: no error, empty results.
#[async_trait]
pub trait KeywordEnhancer: Send + Sync {
    fn is_available(&self) -> bool;

    /// Keywords matching a user's free-text flag description, optionally
    /// informed by the message being scored.
    async fn enhance_keywords(&self, prompt: &str, subject: &str, body: &str) -> Vec<String>;

    /// Ranked suggestions of existing flags for one message.
    async fn suggest_flags(&self, content: &str, flag_names: &[String]) -> Vec<FlagSuggestion>;
}

pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>) -> Self {
        if api_key.is_none() {
            warn!("Gemini API key not configured, keyword enhancement disabled");
        }
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .context("Gemini API key not configured")?;

        let response = self
            .client
            .post(format!(
                "{}/models/gemini-pro:generateContent?key={}",
                self.base_url, api_key
            ))
            .json(&serde_json::json!({
                "contents": [{"parts": [{"text": prompt}]}]
            }))
            .send()
            .await
            .context("Gemini request failed")?;

        let result: Value = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;

        let text = result["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(text)
    }
}

#[async_trait]
impl KeywordEnhancer for GeminiClient {
    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn enhance_keywords(&self, prompt: &str, subject: &str, body: &str) -> Vec<String> {
        if !self.is_available() {
            return Vec::new();
        }

        let body_excerpt: String = body.chars().take(500).collect();
        let request = format!(
            "You are an email categorization expert. Given a user's description of \
             emails they want to flag and optionally some email content, generate \
             relevant keywords that would help identify similar emails.\n\n\
             User wants to flag emails about: \"{}\"\n\n\
             Email context (if provided):\n\
             Subject: {}\n\
             Body excerpt: {}\n\n\
             Generate a list of 10-15 relevant keywords, phrases, and synonyms. \
             Return only the keywords, one per line, without numbering or bullets. \
             Focus on terms that would appear in email subjects, sender names, or \
             email content.",
            prompt, subject, body_excerpt
        );

        match self.generate(&request).await {
            Ok(text) => parse_keyword_lines(&text),
            Err(e) => {
                warn!("keyword enhancement failed: {:#}", e);
                Vec::new()
            }
        }
    }

    async fn suggest_flags(&self, content: &str, flag_names: &[String]) -> Vec<FlagSuggestion> {
        if !self.is_available() || flag_names.is_empty() {
            return Vec::new();
        }

        let content_excerpt: String = content.chars().take(1000).collect();
        let request = format!(
            "Analyze this email content and suggest which flags from the available \
             list would be most appropriate:\n\n\
             Available flags: {}\n\n\
             Email content:\n{}\n\n\
             For each relevant flag, provide the flag name (must be from the \
             available list), a confidence score between 0.0 and 1.0, and a brief \
             reason.\n\
             Format as: FLAG_NAME|CONFIDENCE|REASON\n\
             Example: Urgent|0.8|Contains time-sensitive deadline language\n\
             Only suggest flags with confidence > 0.3. Maximum 3 suggestions.",
            flag_names.join(", "),
            content_excerpt
        );

        match self.generate(&request).await {
            Ok(text) => parse_suggestions(&text, flag_names),
            Err(e) => {
                warn!("flag suggestion failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn parse_keyword_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.len() > 1)
        .take(15)
        .map(str::to_string)
        .collect()
}

fn parse_suggestions(text: &str, flag_names: &[String]) -> Vec<FlagSuggestion> {
    let mut suggestions = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 3 {
            continue;
        }
        let flag_name = parts[0].trim();
        let Ok(confidence) = parts[1].trim().parse::<f64>() else {
            continue;
        };
        if confidence > 0.3 && flag_names.iter().any(|f| f == flag_name) {
            suggestions.push(FlagSuggestion {
                flag_name: flag_name.to_string(),
                confidence,
                reason: parts[2].trim().to_string(),
            });
        }
    }
    suggestions.truncate(3);
    suggestions
}
