//! HTTP client for the inference server API.

use super::launcher::GenerateParameters;
use benchkit_core::{BackendError, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: &'a GenerateParameters,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generated_text: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
}

/// Talks to a running text-generation or text-embeddings server.
#[derive(Debug, Clone)]
pub struct ServerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_healthy(&self) -> bool {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    /// Send one `/generate` request per prompt concurrently.
    pub async fn generate(
        &self,
        prompts: &[String],
        parameters: &GenerateParameters,
    ) -> Result<Vec<String>> {
        let requests = prompts
            .iter()
            .map(|prompt| self.generate_one(prompt, parameters));
        try_join_all(requests).await
    }

    async fn generate_one(&self, prompt: &str, parameters: &GenerateParameters) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateRequest {
                inputs: prompt,
                parameters,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: GenerateResponse = response.json().await?;
        Ok(body.generated_text)
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { inputs: texts })
            .send()
            .await?
            .error_for_status()?;
        let embeddings: Vec<Vec<f32>> = response.json().await?;
        if embeddings.len() != texts.len() {
            return Err(BackendError::server(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}
