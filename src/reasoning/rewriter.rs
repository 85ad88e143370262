use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RunContext;
use crate::generation::{AnswerGenerator, CallPurpose, GenerationRequest};
use crate::prompts::hyde_request;
use crate::text::content_terms;

/// How the rewriter derives retrieval queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteMode {
    /// Retrieve with the question as asked.
    #[default]
    None,
    /// Add a stop-word-stripped keyword query.
    Expand,
    /// Add an LLM-written hypothetical answer passage.
    Hyde,
}

impl RewriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteMode::None => "none",
            RewriteMode::Expand => "expand",
            RewriteMode::Hyde => "hyde",
        }
    }
}

impl std::fmt::Display for RewriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RewriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(RewriteMode::None),
            "expand" => Ok(RewriteMode::Expand),
            "hyde" => Ok(RewriteMode::Hyde),
            _ => Err(format!("Unknown rewrite mode: {}", s)),
        }
    }
}

/// Turns a question into one or more retrieval queries.
///
/// The original question is always the first query.
#[derive(Debug, Clone)]
pub struct QueryRewriter {
    mode: RewriteMode,
    max_tokens: u32,
}

impl QueryRewriter {
    pub fn new(mode: RewriteMode, max_tokens: u32) -> Self {
        Self { mode, max_tokens }
    }

    pub fn mode(&self) -> RewriteMode {
        self.mode
    }

    /// Queries for `question`. HyDE failures degrade to the plain question.
    pub async fn rewrite(
        &self,
        question: &str,
        keep_in_reserve: u32,
        generator: &AnswerGenerator,
        ctx: &mut RunContext,
    ) -> Vec<String> {
        let mut queries = vec![question.to_string()];

        match self.mode {
            RewriteMode::None => {}
            RewriteMode::Expand => {
                if let Some(expanded) = keyword_query(question) {
                    queries.push(expanded);
                }
            }
            RewriteMode::Hyde => {
                let request = GenerationRequest::new(
                    CallPurpose::Rewrite,
                    hyde_request(question),
                    self.max_tokens,
                )
                .with_reserve(keep_in_reserve);
                match generator.generate(request, ctx).await {
                    Ok(generation) if !generation.text.is_empty() => {
                        queries.push(generation.text);
                    }
                    Ok(_) => debug!("HyDE returned an empty passage"),
                    Err(e) => warn!(error = %e, "HyDE rewrite failed, using original query"),
                }
            }
        }

        debug!(mode = %self.mode, queries = queries.len(), "Query rewrite completed");
        queries
    }
}

/// Content terms of `question` joined as a keyword query, when that differs
/// from the question itself.
pub fn keyword_query(question: &str) -> Option<String> {
    let terms = content_terms(question);
    if terms.is_empty() {
        return None;
    }
    let expanded = terms.join(" ");
    (expanded != question.trim().to_lowercase()).then_some(expanded)
}
