use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::types::{CreatePipeRequest, CreatePipeResponse, Message, PipeRequest, PipeResponse};
use crate::config::{LangbaseConfig, RequestConfig};
use crate::error::{LangbaseError, LangbaseResult};

/// A pipe the pipeline depends on, created or updated at startup.
#[derive(Debug, Clone)]
pub struct PipeDefinition<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub system_prompt: &'a str,
    pub json_output: bool,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Client for interacting with Langbase Pipes API
#[derive(Clone)]
pub struct LangbaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl LangbaseClient {
    /// Create a new Langbase client
    pub fn new(config: &LangbaseConfig, request_config: RequestConfig) -> LangbaseResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LangbaseError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Run a pipe once.
    ///
    /// No retry here: retries and their backoff belong to the caller, which
    /// also accounts for every attempt against the run's budget.
    pub async fn call_pipe(&self, request: PipeRequest) -> LangbaseResult<PipeResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);
        let start = Instant::now();

        match self.execute_request(&url, &request).await {
            Ok(response) => {
                info!(
                    pipe = %request.name,
                    latency_ms = start.elapsed().as_millis(),
                    tokens = ?response.total_tokens(),
                    "Langbase pipe call succeeded"
                );
                Ok(response)
            }
            Err(e) => {
                error!(
                    pipe = %request.name,
                    error = %e,
                    latency_ms = start.elapsed().as_millis(),
                    "Langbase pipe call failed"
                );
                Err(e)
            }
        }
    }

    async fn execute_request(
        &self,
        url: &str,
        request: &PipeRequest,
    ) -> LangbaseResult<PipeResponse> {
        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            max_tokens = ?request.max_tokens,
            "Calling Langbase pipe"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LangbaseError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LangbaseError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LangbaseError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: PipeResponse =
            response
                .json()
                .await
                .map_err(|e| LangbaseError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if !pipe_response.success {
            return Err(LangbaseError::InvalidResponse {
                message: "pipe reported success=false".to_string(),
            });
        }

        Ok(pipe_response)
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a new pipe
    pub async fn create_pipe(
        &self,
        request: CreatePipeRequest,
    ) -> LangbaseResult<CreatePipeResponse> {
        let url = format!("{}/v1/pipes", self.base_url);

        info!(pipe = %request.name, "Creating Langbase pipe");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(LangbaseError::Http)?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LangbaseError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: CreatePipeResponse =
            response
                .json()
                .await
                .map_err(|e| LangbaseError::InvalidResponse {
                    message: format!("Failed to parse create pipe response: {}", e),
                })?;

        info!(pipe = %pipe_response.name, url = %pipe_response.url, "Pipe ready");

        Ok(pipe_response)
    }

    /// Ensure a pipe exists with the given system prompt.
    pub async fn ensure_pipe(&self, definition: &PipeDefinition<'_>) -> LangbaseResult<()> {
        let request = CreatePipeRequest::new(definition.name)
            .with_description(definition.description)
            .with_model("openai:gpt-4o-mini")
            .with_upsert(true)
            .with_json_output(definition.json_output)
            .with_temperature(definition.temperature)
            .with_max_tokens(definition.max_tokens)
            .with_messages(vec![Message::system(definition.system_prompt)]);

        match self.create_pipe(request).await {
            Ok(_) => Ok(()),
            Err(LangbaseError::Api { status: 409, .. }) => {
                info!(pipe = %definition.name, "Pipe already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = LangbaseConfig {
            api_key: "test_key".to_string(),
            base_url: "https://api.langbase.com/".to_string(),
        };

        let client = LangbaseClient::new(&config, RequestConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://api.langbase.com");
    }
}
