use serde::{Deserialize, Serialize};

use crate::text::word_count;

const DEFAULT_MARKERS: &[&str] = &[
    "compare",
    "comparison",
    "contrast",
    "versus",
    "vs",
    "difference between",
    "differences between",
    "relationship between",
    "which is more",
    "which is better",
    "which is less",
    "pros and cons",
    "as well as",
    "both",
    "and also",
    "step by step",
];

/// Cheap simple-vs-complex classifier.
///
/// A question is complex when it is longer than `max_simple_words`, asks
/// more than `max_question_marks` questions, or contains any marker phrase.
/// Markers match on whole words, case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityHeuristic {
    pub max_simple_words: usize,
    pub max_question_marks: usize,
    pub markers: Vec<String>,
}

impl Default for ComplexityHeuristic {
    fn default() -> Self {
        Self {
            max_simple_words: 12,
            max_question_marks: 1,
            markers: DEFAULT_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl ComplexityHeuristic {
    pub fn is_complex(&self, question: &str) -> bool {
        if word_count(question) > self.max_simple_words {
            return true;
        }
        if question.matches('?').count() > self.max_question_marks {
            return true;
        }

        let haystack = normalize(question);
        self.markers.iter().any(|marker| {
            let needle = normalize(marker);
            !needle.trim().is_empty() && haystack.contains(&needle)
        })
    }

    pub fn is_simple(&self, question: &str) -> bool {
        !self.is_complex(question)
    }
}

/// Lowercase, punctuation to spaces, single-spaced, padded with one space on
/// each side so `contains` matches whole words.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}
