//! Centralized prompt definitions for the query pipeline
//!
//! System prompts are installed on the Langbase pipes at startup; the
//! `*_request` builders render the per-call user message.

use crate::retrieval::EvidenceChunk;

/// System prompt for the decomposition pipe.
pub const DECOMPOSITION_PROMPT: &str = r#"You break complex questions into simpler sub-questions that can each be answered from a document collection.

Your response MUST be valid JSON in this exact format:
{
  "sub_questions": [
    {"question": "first sub-question", "depends_on": []},
    {"question": "second sub-question", "depends_on": [0]}
  ]
}

Guidelines:
- Each sub-question must be answerable on its own from retrieved documents
- Order sub-questions so that dependencies come first
- depends_on lists the zero-based indices of earlier sub-questions whose answers are needed
- Never exceed the requested maximum number of sub-questions
- Do not answer the question

Always respond with valid JSON only, no other text."#;

/// System prompt for the answer pipe (step answers, synthesis, HyDE passages).
pub const ANSWER_PROMPT: &str = r#"You answer questions using only the evidence provided.

Guidelines:
- Ground every claim in the evidence
- Cite sources inline with their id in square brackets, for example [doc-7]
- Only cite ids that appear in the evidence
- If the evidence does not contain the answer, say so plainly
- Be concise"#;

/// System prompt for the judge pipe.
pub const JUDGE_PROMPT: &str = r#"You grade answers for how well they are supported by the supplied evidence and how completely they address the question.

Your response MUST be valid JSON in this exact format:
{
  "score": 0.8,
  "feedback": "what is missing or unsupported"
}

Guidelines:
- score is between 0.0 (unsupported or off-topic) and 1.0 (fully grounded and complete)
- feedback names concrete gaps so the answer can be improved

Always respond with valid JSON only, no other text."#;

/// A sub-answer passed into synthesis.
pub struct SubAnswer<'a> {
    pub question: &'a str,
    pub answer: &'a str,
}

fn render_evidence<'a, I>(evidence: I) -> String
where
    I: IntoIterator<Item = &'a EvidenceChunk>,
{
    let lines: Vec<String> = evidence
        .into_iter()
        .map(|chunk| format!("[{}] {}", chunk.source_id, chunk.text.trim()))
        .collect();
    if lines.is_empty() {
        "(no evidence retrieved)".to_string()
    } else {
        lines.join("\n")
    }
}

/// Ask for at most `max_depth` sub-questions.
pub fn decomposition_request(question: &str, max_depth: usize) -> String {
    format!(
        "Decompose the question into at most {} sub-questions.\n\nQuestion: {}",
        max_depth, question
    )
}

/// Answer one sub-question from its evidence and the answers it depends on.
pub fn step_request<'a, I>(question: &str, evidence: I, prior: &[SubAnswer<'_>]) -> String
where
    I: IntoIterator<Item = &'a EvidenceChunk>,
{
    let mut prompt = String::new();
    if !prior.is_empty() {
        prompt.push_str("Earlier findings:\n");
        for sub in prior {
            prompt.push_str(&format!("- {} {}\n", sub.question, sub.answer));
        }
        prompt.push('\n');
    }
    prompt.push_str("Evidence:\n");
    prompt.push_str(&render_evidence(evidence));
    prompt.push_str(&format!("\n\nQuestion: {}\nAnswer:", question));
    prompt
}

/// Combine sub-answers into one final answer, optionally addressing feedback
/// from a previous attempt.
pub fn synthesis_request<'a, I>(
    question: &str,
    sub_answers: &[SubAnswer<'_>],
    evidence: I,
    feedback: Option<&str>,
) -> String
where
    I: IntoIterator<Item = &'a EvidenceChunk>,
{
    let mut prompt = String::from("Sub-question findings:\n");
    for (i, sub) in sub_answers.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n   {}\n", i + 1, sub.question, sub.answer));
    }
    prompt.push_str("\nEvidence:\n");
    prompt.push_str(&render_evidence(evidence));
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n\nA previous answer was judged insufficient. Address this feedback: {}",
            feedback
        ));
    }
    prompt.push_str(&format!(
        "\n\nUsing only the findings and evidence above, answer the original question.\nQuestion: {}\nAnswer:",
        question
    ));
    prompt
}

/// Grade an answer against its evidence.
pub fn judge_request<'a, I>(question: &str, answer: &str, evidence: I) -> String
where
    I: IntoIterator<Item = &'a EvidenceChunk>,
{
    format!(
        "Evidence:\n{}\n\nQuestion: {}\n\nAnswer to grade: {}",
        render_evidence(evidence),
        question,
        answer
    )
}

/// Write a short hypothetical passage that would answer the query.
pub fn hyde_request(query: &str) -> String {
    format!(
        "Write a short factual passage, as it might appear in a reference document, that answers the question. Do not add citations.\n\nQuestion: {}\nPassage:",
        query
    )
}
