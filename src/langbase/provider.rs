use async_trait::async_trait;
use tracing::debug;

use super::client::{LangbaseClient, PipeDefinition};
use super::types::{Message, PipeRequest};
use crate::config::PipeConfig;
use crate::error::{GenerationResult, LangbaseResult};
use crate::generation::{estimate_tokens, CallPurpose, Completion, CompletionRequest, LlmProvider};
use crate::prompts::{ANSWER_PROMPT, DECOMPOSITION_PROMPT, JUDGE_PROMPT};

/// [`LlmProvider`] backed by Langbase pipes, one pipe per call purpose.
#[derive(Clone)]
pub struct LangbaseProvider {
    client: LangbaseClient,
    pipes: PipeConfig,
}

impl LangbaseProvider {
    pub fn new(client: LangbaseClient, pipes: PipeConfig) -> Self {
        Self { client, pipes }
    }

    /// Pipe that serves `purpose`. Rewrite and synthesis share the answer pipe.
    pub fn pipe_for(&self, purpose: CallPurpose) -> &str {
        match purpose {
            CallPurpose::Decompose => &self.pipes.decompose,
            CallPurpose::Judge => &self.pipes.judge,
            CallPurpose::Rewrite | CallPurpose::StepAnswer | CallPurpose::Synthesis => {
                &self.pipes.answer
            }
        }
    }

    /// Create or update every pipe the pipeline calls.
    pub async fn ensure_pipes(&self) -> LangbaseResult<()> {
        let definitions = [
            PipeDefinition {
                name: &self.pipes.answer,
                description: "Evidence-grounded answering and synthesis",
                system_prompt: ANSWER_PROMPT,
                json_output: false,
                temperature: 0.2,
                max_tokens: 1024,
            },
            PipeDefinition {
                name: &self.pipes.decompose,
                description: "Question decomposition into sub-questions",
                system_prompt: DECOMPOSITION_PROMPT,
                json_output: true,
                temperature: 0.2,
                max_tokens: 512,
            },
            PipeDefinition {
                name: &self.pipes.judge,
                description: "Grounding and completeness judge",
                system_prompt: JUDGE_PROMPT,
                json_output: true,
                temperature: 0.0,
                max_tokens: 256,
            },
        ];

        for definition in &definitions {
            self.client.ensure_pipe(definition).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for LangbaseProvider {
    async fn complete(&self, request: CompletionRequest) -> GenerationResult<Completion> {
        let pipe = self.pipe_for(request.purpose);
        let pipe_request = PipeRequest::new(pipe, vec![Message::user(&request.prompt)])
            .with_max_tokens(request.max_tokens)
            .with_variable("purpose", request.purpose.as_str());

        let response = self.client.call_pipe(pipe_request).await?;

        let tokens_used = response.total_tokens().unwrap_or_else(|| {
            estimate_tokens(&request.prompt) + estimate_tokens(&response.completion)
        });
        debug!(
            pipe = %pipe,
            purpose = %request.purpose,
            tokens = tokens_used,
            "Completion received"
        );

        Ok(Completion {
            text: response.completion,
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LangbaseConfig, RequestConfig};

    fn provider() -> LangbaseProvider {
        let client = LangbaseClient::new(
            &LangbaseConfig {
                api_key: "k".to_string(),
                base_url: "http://localhost:1".to_string(),
            },
            RequestConfig::default(),
        )
        .unwrap();
        LangbaseProvider::new(client, PipeConfig::default())
    }

    #[test]
    fn test_purposes_route_to_pipes() {
        let provider = provider();
        assert_eq!(provider.pipe_for(CallPurpose::Decompose), "rag-decompose-v1");
        assert_eq!(provider.pipe_for(CallPurpose::Judge), "rag-judge-v1");
        assert_eq!(provider.pipe_for(CallPurpose::StepAnswer), "rag-answer-v1");
        assert_eq!(provider.pipe_for(CallPurpose::Synthesis), "rag-answer-v1");
        assert_eq!(provider.pipe_for(CallPurpose::Rewrite), "rag-answer-v1");
    }
}
