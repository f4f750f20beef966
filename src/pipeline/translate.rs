use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{HubError, Result};

/// Backend that translates plain text between two language codes
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: Option<String>,
    error: Option<String>,
}

/// Client for a LibreTranslate instance
#[derive(Debug, Clone)]
pub struct LibreTranslate {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl LibreTranslate {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Translator for LibreTranslate {
    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let request = TranslateRequest {
            q: text,
            source,
            target,
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        debug!("Translating {} chars {} -> {}", text.len(), source, target);
        let response = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body: TranslateResponse = response.json().await?;

        match (status.is_success(), body.translated_text, body.error) {
            (true, Some(translated), _) => Ok(translated),
            (_, _, Some(error)) => Err(HubError::Translation(error)),
            _ => Err(HubError::Translation(format!(
                "unexpected response ({}) for {} -> {}",
                status, source, target
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let client = LibreTranslate::new("http://localhost:5000/");
        assert_eq!(client.base_url(), "http://localhost:5000");
    }

    #[test]
    fn test_request_shape() {
        let request = TranslateRequest {
            q: "Bonjour",
            source: "fr",
            target: "en",
            format: "text",
            api_key: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["q"], "Bonjour");
        assert_eq!(json["format"], "text");
        assert!(json.get("api_key").is_none());
    }

    #[test]
    fn test_response_shape() {
        let ok: TranslateResponse = serde_json::from_str(r#"{"translatedText":"Hello"}"#).unwrap();
        assert_eq!(ok.translated_text.as_deref(), Some("Hello"));

        let err: TranslateResponse =
            serde_json::from_str(r#"{"error":"fr is not supported"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("fr is not supported"));
    }
}
